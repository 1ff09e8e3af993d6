//! Benchmarks for the model diff and the ternary vector hot paths
//!
//! ```bash
//! cargo bench --bench model_diff
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rust_fave_common::{
    model::ModelType, Action, DeviceModel, FieldMapping, HeaderSpace, Rule, RuleField, Vector,
};

const DST: &str = "packet.ipv6.destination";
const PROTO: &str = "packet.ipv6.proto";

/// A packet filter with `n` rules in its single table.
fn filter(n: u32, accept_every: u32) -> DeviceModel {
    let mut model = DeviceModel::new("fw", ModelType::PacketFilter);
    let rules = (0..n)
        .map(|i| {
            let rule = Rule::new("fw", "fw.t1", i).with_match(vec![
                RuleField::new(DST, format!("2001:db8::{:x}/128", i + 1)),
                RuleField::new(PROTO, "6"),
            ]);
            if i % accept_every == 0 {
                rule.with_action(Action::Forward {
                    ports: vec!["fw.t1_accept".to_string()],
                })
            } else {
                rule
            }
        })
        .collect();
    model.tables.insert("fw.t1".into(), rules);
    model.ports.insert("fw.t1_in".into(), "fw.t1".into());
    model.ports.insert("fw.t1_accept".into(), "fw.t1".into());
    model
}

fn bench_model_diff(c: &mut Criterion) {
    let mut group = c.benchmark_group("model_diff");

    for size in [100u32, 1_000, 10_000] {
        let old = filter(size, 2);
        let identical = filter(size, 2);
        let changed = filter(size, 3);

        group.bench_with_input(BenchmarkId::new("identical", size), &size, |b, _| {
            b.iter(|| black_box(&identical - &old).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("changed", size), &size, |b, _| {
            b.iter(|| black_box(&changed - &old).unwrap())
        });
    }

    group.finish();
}

fn bench_vectors(c: &mut Criterion) {
    let mapping = FieldMapping::from_fields([DST, PROTO, "in_port", "out_port"]).unwrap();
    let dst = RuleField::new(DST, "2001:db8::/32").to_vector().unwrap();
    let vector = Vector::new(mapping.length());

    c.bench_function("rule_field_to_vector", |b| {
        b.iter(|| black_box(RuleField::new(DST, "2001:db8::/32")).to_vector().unwrap())
    });

    c.bench_function("field_set", |b| {
        b.iter(|| {
            let mut v = vector.clone();
            v.field_set(&mapping, DST, &dst).unwrap();
            black_box(v)
        })
    });

    let grown = FieldMapping::from_fields(["in_port", DST, "packet.ipv4.destination", PROTO, "out_port"])
        .unwrap();
    let mut space = HeaderSpace::new(mapping.length());
    for _ in 0..64 {
        space.include(vector.clone()).unwrap();
    }
    c.bench_function("header_space_align", |b| {
        b.iter(|| black_box(space.align(&mapping, &grown)).unwrap())
    });
}

criterion_group!(benches, bench_model_diff, bench_vectors);
criterion_main!(benches);
