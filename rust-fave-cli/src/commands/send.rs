//! Sending producer messages to the aggregator

use crate::utils::Target;
use anyhow::{Context, Result};
use log::info;
use rust_fave_common::message::{Message, TopologyAction, TopologyCommand, TopologyTarget};
use rust_fave_common::ModelRegistry;
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Read the messages stored in `path`: a single object or an array of them.
pub fn read_messages(path: &Path) -> Result<Vec<Value>> {
    let raw = std::fs::read(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value: Value = serde_json::from_slice(&raw)
        .with_context(|| format!("{} is not valid JSON", path.display()))?;

    Ok(match value {
        Value::Array(items) => items,
        other => vec![other],
    })
}

/// Send every message found in `files`, in order, over one connection.
pub async fn send_files(target: &Target, files: &[PathBuf], validate: bool) -> Result<()> {
    let registry = ModelRegistry::new();
    let mut payloads = Vec::new();

    for path in files {
        for (i, value) in read_messages(path)?.into_iter().enumerate() {
            if validate {
                registry
                    .decode_value(value.clone())
                    .with_context(|| format!("{}: message {} is invalid", path.display(), i))?;
            }
            payloads.push(serde_json::to_vec(&value)?);
        }
    }

    target.send(&payloads).await?;
    info!("Sent {} messages from {} files", payloads.len(), files.len());
    Ok(())
}

/// Send a single typed message.
pub async fn send_message(target: &Target, message: &Message) -> Result<()> {
    let payload = message
        .to_bytes()
        .with_context(|| format!("Failed to encode {} message", message.tag()))?;
    target.send(&[payload]).await
}

pub async fn send_link(target: &Target, add: bool, from: String, to: String) -> Result<()> {
    let action = if add { TopologyAction::Add } else { TopologyAction::Del };
    let message = Message::Topology(TopologyCommand {
        action,
        target: TopologyTarget::Links(vec![(from.clone(), to.clone())]),
    });

    send_message(target, &message).await?;
    info!("Requested link {:?} {} -> {}", action, from, to);
    Ok(())
}

pub async fn send_stop(target: &Target) -> Result<()> {
    send_message(target, &Message::Stop).await?;
    info!("Requested aggregator stop");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_messages_single_and_array() {
        let mut single = tempfile::NamedTempFile::new().unwrap();
        write!(single, r#"{{"type": "stop"}}"#).unwrap();
        assert_eq!(read_messages(single.path()).unwrap().len(), 1);

        let mut many = tempfile::NamedTempFile::new().unwrap();
        write!(many, r#"[{{"type": "dump", "dir": "/tmp"}}, {{"type": "stop"}}]"#).unwrap();
        let values = read_messages(many.path()).unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[1]["type"], "stop");
    }

    #[test]
    fn test_read_messages_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(read_messages(file.path()).is_err());
    }
}
