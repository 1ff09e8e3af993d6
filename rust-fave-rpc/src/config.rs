//! Configuration for engine connections.

use rust_fave_common::Error;
use serde::{Deserialize, Deserializer};
use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

/// Where a verification engine shard listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Unix domain socket path
    Unix(PathBuf),
    /// `host:port`
    Tcp(String),
}

impl FromStr for Endpoint {
    type Err = Error;

    /// Anything containing a `/` or lacking a `:port` suffix is a socket path.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::invalid_value("endpoint", s));
        }
        match s.rsplit_once(':') {
            Some((host, port)) if !s.contains('/') && !host.is_empty() => {
                port.parse::<u16>()
                    .map_err(|_| Error::invalid_value("endpoint", s))?;
                Ok(Endpoint::Tcp(s.to_string()))
            }
            _ => Ok(Endpoint::Unix(PathBuf::from(s))),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp:{}", addr),
        }
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Engine client configuration options
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// One endpoint per shard; every call is sent to all of them
    pub endpoints: Vec<Endpoint>,

    /// Connection attempts per shard
    pub connect_retries: u32,

    /// Delay between connection attempts (in milliseconds)
    pub retry_delay_ms: u64,

    /// Maximum time to wait for one reply (in milliseconds)
    pub reply_timeout_ms: Option<u64>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            endpoints: vec![Endpoint::Tcp("127.0.0.1:44001".to_string())],
            connect_retries: 5,
            retry_delay_ms: 1000,
            reply_timeout_ms: None,
        }
    }
}

impl EngineOptions {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn reply_timeout(&self) -> Option<Duration> {
        self.reply_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parsing() {
        assert_eq!(
            "127.0.0.1:44001".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp("127.0.0.1:44001".into())
        );
        assert_eq!(
            "/tmp/np1.socket".parse::<Endpoint>().unwrap(),
            Endpoint::Unix("/tmp/np1.socket".into())
        );
        assert_eq!(
            "np.socket".parse::<Endpoint>().unwrap(),
            Endpoint::Unix("np.socket".into())
        );
        assert!("localhost:notaport".parse::<Endpoint>().is_err());
        assert!("".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_defaults() {
        let options = EngineOptions::default();
        assert_eq!(options.connect_retries, 5);
        assert_eq!(options.retry_delay(), Duration::from_secs(1));
        assert!(options.reply_timeout().is_none());
    }
}
