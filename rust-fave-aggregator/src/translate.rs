//! Translation of rule records into engine vectors.
//!
//! Every function here lays bits out by the global mapping. Port names in
//! port fields are resolved through a caller-supplied function so this
//! module does not depend on the aggregator's bookkeeping.

use rust_fave_common::{
    field::{encode_port, is_port_name},
    types::{engine_rule_index, PortId, TableId, NEGATION_INDEX_BITS},
    vector::Bit,
    Error, FieldMapping, HeaderSpace, Result, Rule, RuleField, Vector,
};
use rust_fave_rpc::RuleRequest;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Maps `(field, port_name)` to a global port ID.
pub trait PortResolver: Fn(&str, &str) -> Result<PortId> {}

impl<F: Fn(&str, &str) -> Result<PortId>> PortResolver for F {}

/// Bits of a single field value, resolving port names.
pub fn field_bits<R: PortResolver>(field: &RuleField, resolve: &R) -> Result<Vector> {
    if is_port_name(&field.name, &field.value) {
        let port = resolve(&field.name, &field.value)?;
        encode_port(&field.name, port)
    } else {
        field.to_vector()
    }
}

/// Global vector with every non-negated field of `fields` set.
pub fn project<R: PortResolver>(
    mapping: &FieldMapping,
    fields: &[RuleField],
    resolve: &R,
) -> Result<Vector> {
    let mut vector = Vector::new(mapping.length());
    for field in fields.iter().filter(|f| !f.negated) {
        vector.field_set(mapping, &field.name, &field_bits(field, resolve)?)?;
    }
    Ok(vector)
}

/// Match vectors of a field list.
///
/// Negated fields turn one vector into one vector per fixed bit of the
/// negated value, with that bit flipped. A negated wildcard matches nothing
/// and yields no vectors.
pub fn match_vectors<R: PortResolver>(
    mapping: &FieldMapping,
    fields: &[RuleField],
    resolve: &R,
) -> Result<Vec<Vector>> {
    let negated = fields
        .iter()
        .filter(|f| f.negated)
        .map(|field| Ok((mapping.offset_of(&field.name)?, field_bits(field, resolve)?)))
        .collect::<Result<Vec<_>>>()?;

    let limit = 1usize << NEGATION_INDEX_BITS;
    let total = negated.iter().try_fold(1usize, |acc, (_, bits)| {
        acc.checked_mul(bits.fixed_positions().count())
            .filter(|n| *n <= limit)
    });
    if total.is_none() {
        return Err(Error::invalid_value(
            "match",
            format!("negation expands to more than {} vectors", limit),
        ));
    }

    let mut vectors = vec![project(mapping, fields, resolve)?];
    for (offset, bits) in &negated {
        let mut expanded = Vec::with_capacity(vectors.len() * bits.len());
        for vector in &vectors {
            for position in bits.fixed_positions() {
                let flipped = Vector::from_bits(vec![bits.bits()[position].flipped()]);
                let mut next = vector.clone();
                next.slice_set(offset + position, offset + position + 1, &flipped)?;
                expanded.push(next);
            }
        }
        vectors = expanded;
    }
    Ok(vectors)
}

/// `(mask, rewrite)` for a set of rewritten fields.
///
/// The mask holds `1` on rewritten bits and `0` elsewhere; the rewrite
/// vector carries the new values and `x` elsewhere.
pub fn rewrite_vectors<'a, R: PortResolver>(
    mapping: &FieldMapping,
    fields: impl IntoIterator<Item = &'a RuleField>,
    resolve: &R,
) -> Result<Option<(Vector, Vector)>> {
    let mut fields = fields.into_iter().peekable();
    if fields.peek().is_none() {
        return Ok(None);
    }

    let mut mask = Vector::filled(mapping.length(), Bit::Zero);
    let mut rewrite = Vector::new(mapping.length());
    for field in fields {
        let width = mapping.width_of(&field.name)?;
        mask.field_set(mapping, &field.name, &Vector::filled(width, Bit::One))?;
        rewrite.field_set(mapping, &field.name, &field_bits(field, resolve)?)?;
    }
    Ok(Some((mask, rewrite)))
}

/// Header space spanned by alternative field assignments.
pub fn header_space<R: PortResolver>(
    mapping: &FieldMapping,
    included: &[Vec<RuleField>],
    excluded: &[Vec<RuleField>],
    resolve: &R,
) -> Result<HeaderSpace> {
    let mut space = HeaderSpace::new(mapping.length());
    for fields in included {
        space.include(project(mapping, fields, resolve)?)?;
    }
    for fields in excluded {
        space.exclude(project(mapping, fields, resolve)?)?;
    }
    Ok(space)
}

/// Cartesian product of per-field alternatives, in field-name order.
pub fn alternatives(fields: &BTreeMap<String, Vec<RuleField>>) -> Vec<Vec<RuleField>> {
    fields.values().fold(vec![Vec::new()], |acc, choices| {
        acc.iter()
            .flat_map(|prefix| {
                choices.iter().map(move |choice| {
                    let mut next = prefix.clone();
                    next.push(choice.clone());
                    next
                })
            })
            .collect()
    })
}

/// Header expression operand: a bare vector when the space is a single
/// vector, `{hs_list, hs_diff}` otherwise.
pub fn header_operand(space: &HeaderSpace) -> Value {
    match (space.included(), space.excluded()) {
        ([single], []) => json!(single),
        (list, []) => json!({ "hs_list": list, "hs_diff": null }),
        (list, diff) => json!({ "hs_list": list, "hs_diff": diff }),
    }
}

/// Engine requests installing `rule` into `table`, one per match vector.
pub fn rule_requests<R: PortResolver>(
    table: TableId,
    rule: &Rule,
    mapping: &FieldMapping,
    resolve: &R,
) -> Result<Vec<RuleRequest>> {
    let in_ports = rule
        .in_ports
        .iter()
        .map(|p| resolve("in_port", p.as_str()))
        .collect::<Result<Vec<_>>>()?;
    let out_ports = rule
        .forward_ports()
        .map(|p| resolve("out_port", p))
        .collect::<Result<Vec<_>>>()?;
    let (mask, rewrite) = match rewrite_vectors(mapping, rule.rewrites(), resolve)? {
        Some((mask, rewrite)) => (Some(mask), Some(rewrite)),
        None => (None, None),
    };

    let requests = match_vectors(mapping, &rule.r#match.fields, resolve)?
        .into_iter()
        .enumerate()
        .map(|(n, r#match)| RuleRequest {
            table,
            index: engine_rule_index(rule.idx, n as u32),
            in_ports: in_ports.clone(),
            out_ports: out_ports.clone(),
            r#match,
            mask: mask.clone(),
            rewrite: rewrite.clone(),
        })
        .collect();
    Ok(requests)
}

/// Every field a rule needs in the global mapping.
pub fn rule_fields(rule: &Rule) -> impl Iterator<Item = &str> + '_ {
    rule.field_names()
        .chain(rule.mapping.iter().flat_map(|m| m.fields().map(|(f, _, _)| f)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_fave_common::Action;

    fn no_ports(_: &str, port: &str) -> Result<PortId> {
        Err(Error::UnknownReference(port.to_string()))
    }

    fn mapping() -> FieldMapping {
        FieldMapping::from_fields(["packet.ipv6.proto", "packet.upper.dport", "out_port"]).unwrap()
    }

    #[test]
    fn test_project_sets_fields() {
        let mapping = mapping();
        let vector = project(
            &mapping,
            &[RuleField::new("packet.ipv6.proto", "tcp")],
            &no_ports,
        )
        .unwrap();
        assert_eq!(vector.len(), 56);
        assert_eq!(
            vector.field_get(&mapping, "packet.ipv6.proto").unwrap().to_string(),
            "00000110"
        );
        assert!(vector.field_get(&mapping, "packet.upper.dport").unwrap().is_wildcard());
    }

    #[test]
    fn test_negation_expands_per_fixed_bit() {
        let mapping = mapping();
        let fields = vec![
            RuleField::new("packet.ipv6.proto", "tcp"),
            RuleField::negated("packet.upper.dport", "xxxxxxxxxxxxxx10"),
        ];
        let vectors = match_vectors(&mapping, &fields, &no_ports).unwrap();
        assert_eq!(vectors.len(), 2);

        let dports: Vec<String> = vectors
            .iter()
            .map(|v| v.field_get(&mapping, "packet.upper.dport").unwrap().to_string())
            .collect();
        assert_eq!(dports, vec!["xxxxxxxxxxxxxx0x", "xxxxxxxxxxxxxxx1"]);
        for v in &vectors {
            assert_eq!(
                v.field_get(&mapping, "packet.ipv6.proto").unwrap().to_string(),
                "00000110"
            );
        }
    }

    #[test]
    fn test_negated_wildcard_matches_nothing() {
        let mapping = mapping();
        let fields = vec![RuleField::negated("packet.upper.dport", "x".repeat(16))];
        assert!(match_vectors(&mapping, &fields, &no_ports).unwrap().is_empty());
    }

    #[test]
    fn test_negation_rejected_before_expansion() {
        let mapping = FieldMapping::from_fields([
            "packet.ipv6.source",
            "packet.ipv6.destination",
            "packet.ether.source",
        ])
        .unwrap();
        // 128 * 128 * 48 alternatives, far above the index space
        let fields = vec![
            RuleField::negated("packet.ipv6.source", "2001:db8::1/128"),
            RuleField::negated("packet.ipv6.destination", "2001:db8::2/128"),
            RuleField::negated("packet.ether.source", "00:11:22:33:44:55"),
        ];
        let err = match_vectors(&mapping, &fields, &no_ports).unwrap_err();
        assert!(matches!(err, Error::InvalidValue { .. }));
        assert!(err.to_string().contains("more than 4096"));
    }

    #[test]
    fn test_negation_at_the_limit() {
        let mapping = FieldMapping::from_fields(["packet.ipv6.source", "packet.ipv6.proto"]).unwrap();
        // 128 * 8 = 1024 vectors
        let fields = vec![
            RuleField::negated("packet.ipv6.source", "2001:db8::1/128"),
            RuleField::negated("packet.ipv6.proto", "tcp"),
        ];
        assert_eq!(match_vectors(&mapping, &fields, &no_ports).unwrap().len(), 1024);
    }

    #[test]
    fn test_rule_requests_resolve_ports() {
        let mapping = mapping();
        let resolve = |field: &str, port: &str| -> Result<PortId> {
            match (field, port) {
                ("out_port", "fw.eth0_egress") => Ok(PortId(0x20003)),
                ("in_port", "fw.post_routing_in") => Ok(PortId(0x20001)),
                _ => Err(Error::UnknownReference(port.to_string())),
            }
        };
        let rule = Rule::new("fw", "fw.post_routing", 3)
            .with_in_ports(vec!["fw.post_routing_in".into()])
            .with_match(vec![RuleField::new("out_port", "fw.eth0_egress")])
            .with_action(Action::Rewrite {
                rw: vec![RuleField::new("out_port", "x".repeat(32))],
            })
            .with_action(Action::Forward {
                ports: vec!["fw.eth0_egress".into()],
            });

        let requests = rule_requests(TableId(2), &rule, &mapping, &resolve).unwrap();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.index, 3 << 12);
        assert_eq!(request.in_ports, vec![PortId(0x20001)]);
        assert_eq!(request.out_ports, vec![PortId(0x20003)]);
        assert_eq!(
            request.r#match.field_get(&mapping, "out_port").unwrap(),
            encode_port("out_port", PortId(0x20003)).unwrap()
        );

        let mask = request.mask.as_ref().unwrap();
        assert_eq!(mask.field_get(&mapping, "out_port").unwrap().to_string(), "1".repeat(32));
        assert_eq!(mask.field_get(&mapping, "packet.ipv6.proto").unwrap().to_string(), "0".repeat(8));
        assert!(request.rewrite.as_ref().unwrap().is_wildcard());
    }

    #[test]
    fn test_unknown_port_is_skippable() {
        let mapping = mapping();
        let rule = Rule::new("sw", "sw.1", 0).with_action(Action::Forward {
            ports: vec!["sw.9".into()],
        });
        let err = rule_requests(TableId(1), &rule, &mapping, &no_ports).unwrap_err();
        assert!(err.is_skippable());
    }

    #[test]
    fn test_header_space_alternatives() {
        let mapping = mapping();
        let space = header_space(
            &mapping,
            &[
                vec![RuleField::new("packet.ipv6.proto", "tcp")],
                vec![RuleField::new("packet.ipv6.proto", "udp")],
            ],
            &[vec![RuleField::new("packet.upper.dport", "22")]],
            &no_ports,
        )
        .unwrap();
        assert_eq!(space.included().len(), 2);
        assert_eq!(space.excluded().len(), 1);
        assert_eq!(space.length(), 56);
    }

    #[test]
    fn test_alternatives_and_operand() {
        let mapping = mapping();
        let mut fields = BTreeMap::new();
        fields.insert(
            "packet.ipv6.proto".to_string(),
            vec![RuleField::new("packet.ipv6.proto", "tcp"), RuleField::new("packet.ipv6.proto", "udp")],
        );
        fields.insert(
            "packet.upper.dport".to_string(),
            vec![RuleField::new("packet.upper.dport", "80")],
        );
        let combos = alternatives(&fields);
        assert_eq!(combos.len(), 2);
        assert_eq!(combos[1][0].value, "udp");
        assert_eq!(combos[1][1].value, "80");

        assert_eq!(alternatives(&BTreeMap::new()), vec![Vec::<RuleField>::new()]);

        let single = header_space(&mapping, &combos[..1], &[], &no_ports).unwrap();
        assert!(header_operand(&single).is_string());
        let both = header_space(&mapping, &combos, &[], &no_ports).unwrap();
        assert_eq!(header_operand(&both)["hs_list"].as_array().unwrap().len(), 2);
        assert!(header_operand(&both)["hs_diff"].is_null());
    }
}
