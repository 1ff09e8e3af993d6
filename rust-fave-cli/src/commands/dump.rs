//! Requesting and inspecting aggregator dumps

use crate::commands::send::send_message;
use crate::utils::{format_bytes, format_duration, print_header, Target};
use anyhow::{bail, Context, Result};
use log::{debug, info};
use rust_fave_common::Message;
use serde_json::Value;
use std::path::Path;
use std::time::{Duration, Instant};

/// File the aggregator writes on a dump request
const DUMP_FILE_NAME: &str = "fave.json";

/// Poll interval while waiting for a dump
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub async fn request_dump(target: &Target, dir: &Path, wait: Option<u64>) -> Result<()> {
    let dir = if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        std::env::current_dir()?.join(dir)
    };
    let file = dir.join(DUMP_FILE_NAME);

    // A stale dump would satisfy the wait below
    if file.exists() {
        std::fs::remove_file(&file)
            .with_context(|| format!("Failed to remove old dump {}", file.display()))?;
    }

    let message = Message::Dump {
        dir: dir.to_string_lossy().into_owned(),
    };
    send_message(target, &message).await?;
    info!("Requested dump to {}", dir.display());

    let Some(secs) = wait else {
        return Ok(());
    };

    let start = Instant::now();
    let deadline = Duration::from_secs(secs);
    while !file.exists() {
        if start.elapsed() >= deadline {
            bail!("No dump appeared in {} after {}s", dir.display(), secs);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    info!("Dump written after {}", format_duration(start.elapsed()));
    Ok(())
}

fn count(value: &Value, key: &str) -> usize {
    match value.get(key) {
        Some(Value::Object(map)) => map.len(),
        Some(Value::Array(items)) => items.len(),
        _ => 0,
    }
}

/// Print a summary of `<dir>/fave.json`.
pub fn show_dump(dir: &Path) -> Result<()> {
    let file = dir.join(DUMP_FILE_NAME);
    let raw = std::fs::read(&file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let dump: Value = serde_json::from_slice(&raw)
        .with_context(|| format!("{} is not valid JSON", file.display()))?;
    debug!("Loaded {} from {}", format_bytes(raw.len()), file.display());

    print_header(&format!("FaVe state in {}", dir.display()));

    let length = dump
        .get("mapping")
        .and_then(|m| m.get("length"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    println!("Header length:  {} bits", length);
    println!("Tables:         {}", count(&dump, "id_to_table"));
    println!("Ports:          {}", count(&dump, "id_to_port"));
    println!("Rules:          {}", count(&dump, "id_to_rule"));
    println!("Generators:     {}", count(&dump, "id_to_generator"));
    println!("Probes:         {}", count(&dump, "id_to_probe"));
    println!("Links:          {}", count(&dump, "links"));
    println!("Slices:         {}", count(&dump, "slices"));

    if let Some(Value::Object(tables)) = dump.get("id_to_table") {
        print_header("Tables");
        for (id, name) in tables {
            println!("{:>8}  {}", id, name.as_str().unwrap_or_default());
        }
    }

    Ok(())
}
