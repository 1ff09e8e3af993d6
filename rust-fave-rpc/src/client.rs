//! JSON-RPC client for NetPlumber.
//!
//! A client holds one connection per engine shard. Every call is written to
//! all shards concurrently and the first shard's reply is returned.

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use futures::future::try_join_all;
use log::{debug, info, trace, warn};
use rust_fave_common::{Error, Result};
use serde_json::Value;
use std::{fmt, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpStream, UnixStream},
    time::{sleep, timeout},
};

use crate::{
    config::{Endpoint, EngineOptions},
    protocol::{EngineCall, Response},
    VerificationEngine,
};

const READ_CHUNK: usize = 4096;

trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// Connection to a single engine instance
struct Shard {
    endpoint: Endpoint,
    stream: Box<dyn Transport>,
    buf: BytesMut,
}

impl fmt::Debug for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shard")
            .field("endpoint", &self.endpoint)
            .field("buffered", &self.buf.len())
            .finish()
    }
}

impl Shard {
    async fn open(endpoint: &Endpoint) -> std::io::Result<Box<dyn Transport>> {
        match endpoint {
            Endpoint::Unix(path) => Ok(Box::new(UnixStream::connect(path).await?)),
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str()).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
        }
    }

    async fn connect(endpoint: Endpoint, options: &EngineOptions) -> Result<Self> {
        let attempts = options.connect_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match Self::open(&endpoint).await {
                Ok(stream) => {
                    info!("Connected to engine at {}", endpoint);
                    return Ok(Self {
                        endpoint,
                        stream,
                        buf: BytesMut::with_capacity(READ_CHUNK),
                    });
                }
                Err(err) if attempt < attempts => {
                    warn!(
                        "Engine at {} not reachable ({}), retrying in {:?} [{}/{}]",
                        endpoint,
                        err,
                        options.retry_delay(),
                        attempt,
                        attempts
                    );
                    sleep(options.retry_delay()).await;
                }
                Err(err) => {
                    return Err(Error::Rpc(format!(
                        "could not connect to {} after {} attempts: {}",
                        endpoint, attempts, err
                    )));
                }
            }
        }
    }

    /// Parse one complete reply from the buffer, if there is one.
    fn take_response(&mut self) -> Result<Option<Response>> {
        let skip = self
            .buf
            .iter()
            .take_while(|b| b.is_ascii_whitespace())
            .count();
        self.buf.advance(skip);
        if self.buf.is_empty() {
            return Ok(None);
        }

        let (parsed, consumed) = {
            let mut stream = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Response>();
            let parsed = stream.next();
            (parsed, stream.byte_offset())
        };
        match parsed {
            Some(Ok(response)) => {
                self.buf.advance(consumed);
                Ok(Some(response))
            }
            Some(Err(err)) if err.is_eof() => Ok(None),
            Some(Err(err)) => {
                self.buf.clear();
                Err(err.into())
            }
            None => Ok(None),
        }
    }

    async fn read_response(&mut self) -> Result<Response> {
        loop {
            if let Some(response) = self.take_response()? {
                return Ok(response);
            }
            self.buf.reserve(READ_CHUNK);
            if self.stream.read_buf(&mut self.buf).await? == 0 {
                return Err(Error::Rpc(format!("{} closed the connection", self.endpoint)));
            }
        }
    }

    async fn call(
        &mut self,
        method: &str,
        payload: &[u8],
        reply_timeout: Option<Duration>,
    ) -> Result<Value> {
        self.stream.write_all(payload).await?;
        self.stream.flush().await?;

        let response = match reply_timeout {
            Some(limit) => timeout(limit, self.read_response()).await.map_err(|_| {
                Error::Rpc(format!("{} timed out after {:?} on {}", method, limit, self.endpoint))
            })??,
            None => self.read_response().await?,
        };
        response.into_result(method)
    }

    /// Send `stop`; the engine may close the connection without replying.
    async fn stop(&mut self, payload: &[u8]) -> Result<()> {
        self.stream.write_all(payload).await?;
        self.stream.flush().await?;
        match self.read_response().await {
            Ok(response) => response.into_result("stop").map(drop),
            Err(Error::Rpc(_)) | Err(Error::Io(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Client connected to every configured engine shard.
#[derive(Debug)]
pub struct NetPlumberClient {
    shards: Vec<Shard>,
    reply_timeout: Option<Duration>,
}

impl NetPlumberClient {
    /// Connect to all endpoints in `options`, retrying each one.
    pub async fn connect(options: EngineOptions) -> Result<Self> {
        if options.endpoints.is_empty() {
            return Err(Error::Rpc("no engine endpoints configured".to_string()));
        }

        let connects = options
            .endpoints
            .iter()
            .cloned()
            .map(|endpoint| Shard::connect(endpoint, &options));
        let shards = try_join_all(connects).await?;

        Ok(Self {
            shards,
            reply_timeout: options.reply_timeout(),
        })
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

#[async_trait]
impl VerificationEngine for NetPlumberClient {
    async fn execute(&mut self, call: EngineCall) -> Result<Value> {
        let method = call.method();
        let payload = serde_json::to_vec(&call.request())?;
        trace!("-> {}", String::from_utf8_lossy(&payload));

        if let EngineCall::Stop = call {
            let stops = self.shards.iter_mut().map(|shard| shard.stop(&payload));
            try_join_all(stops).await?;
            debug!("Stopped {} engine shard(s)", self.shards.len());
            return Ok(Value::Null);
        }

        let reply_timeout = self.reply_timeout;
        let calls = self
            .shards
            .iter_mut()
            .map(|shard| shard.call(method, &payload, reply_timeout));
        let mut results = try_join_all(calls).await?;
        trace!("<- {} {:?}", method, results.first());

        if results.is_empty() {
            return Err(Error::Rpc(format!("{} has no shard to run on", method)));
        }
        Ok(results.swap_remove(0))
    }
}
