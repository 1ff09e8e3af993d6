//! Utility functions for the FaVe CLI

use anyhow::{Context, Result};
use bytes::BytesMut;
use log::{debug, warn};
use rust_fave_common::frame::encode_frame;
use std::{path::PathBuf, time::Duration};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    net::{TcpStream, UnixStream},
    time::sleep,
};

/// Delay between connection attempts
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Where the aggregator listens
#[derive(Debug, Clone)]
pub struct Target {
    socket: PathBuf,
    tcp: Option<String>,
    retries: u32,
}

impl Target {
    pub fn new(socket: PathBuf, tcp: Option<String>, retries: u32) -> Self {
        Self {
            socket,
            tcp,
            retries: retries.max(1),
        }
    }

    fn describe(&self) -> String {
        match &self.tcp {
            Some(addr) => format!("tcp:{}", addr),
            None => format!("unix:{}", self.socket.display()),
        }
    }

    async fn open(&self) -> std::io::Result<Box<dyn AsyncWrite + Unpin + Send>> {
        let stream: Box<dyn AsyncWrite + Unpin + Send> = match &self.tcp {
            Some(addr) => Box::new(TcpStream::connect(addr).await?),
            None => Box::new(UnixStream::connect(&self.socket).await?),
        };
        Ok(stream)
    }

    /// Connect, retrying like the aggregator's producers do.
    async fn connect(&self) -> Result<Box<dyn AsyncWrite + Unpin + Send>> {
        let mut attempt = 1;
        loop {
            match self.open().await {
                Ok(stream) => {
                    debug!("Connected to {}", self.describe());
                    return Ok(stream);
                }
                Err(err) if attempt < self.retries => {
                    warn!(
                        "Connecting to {} failed ({}), retrying ({}/{})",
                        self.describe(),
                        err,
                        attempt,
                        self.retries
                    );
                    sleep(RETRY_DELAY).await;
                    attempt += 1;
                }
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("could not connect to the aggregator at {}", self.describe())
                    })
                }
            }
        }
    }

    /// Frame every payload and send them on one connection.
    pub async fn send(&self, payloads: &[Vec<u8>]) -> Result<()> {
        let mut buf = BytesMut::new();
        for payload in payloads {
            encode_frame(payload, &mut buf)?;
        }

        let mut stream = self.connect().await?;
        stream
            .write_all(&buf)
            .await
            .context("Failed to send messages")?;
        stream.shutdown().await.context("Failed to close connection")?;
        debug!("Sent {} messages ({})", payloads.len(), format_bytes(buf.len()));
        Ok(())
    }
}

/// Format a duration as a human-readable string
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();

    if total_secs < 60 {
        format!("{}.{:03}s", total_secs, duration.subsec_millis())
    } else {
        format!("{}m {}s", total_secs / 60, total_secs % 60)
    }
}

/// Format a byte size as a human-readable string
pub fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;

    if bytes < KB {
        format!("{} B", bytes)
    } else if bytes < MB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    }
}

/// Print a section header in the CLI output
pub fn print_header(title: &str) {
    let separator = "=".repeat(title.len());
    println!("\n{}", title);
    println!("{}", separator);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.500s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MB");
    }
}
