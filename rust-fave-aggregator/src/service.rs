//! Socket front end of the aggregator.
//!
//! One acceptor task per listening socket reads length-prefixed frames and
//! pushes the raw payloads into a bounded queue. A single worker drains the
//! queue in order and owns the [`Aggregator`]. A `stop` message or ctrl-c
//! closes the listeners; the worker then applies everything still queued and
//! stops the engine.

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use log::{debug, error, info, warn};
use rust_fave_common::{frame::decode_frame, metrics::AggregatorMetrics};
use rust_fave_rpc::VerificationEngine;
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    net::{TcpListener, UnixListener},
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::{
    config::AggregatorConfig,
    sync::{Aggregator, Outcome},
};

/// Everything a connection needs to feed the worker.
#[derive(Clone)]
struct Ingress {
    queue: mpsc::Sender<Bytes>,
    metrics: Arc<AggregatorMetrics>,
    max_frame_size: usize,
    shutdown: watch::Receiver<bool>,
}

impl Ingress {
    fn spawn_connection<S>(&self, stream: S, peer: String)
    where
        S: AsyncRead + Unpin + Send + 'static,
    {
        self.metrics.connections_accepted.increment();
        debug!("Connection from {}", peer);

        let ingress = self.clone();
        tokio::spawn(async move {
            if let Err(err) = ingress.serve(stream).await {
                warn!("Closing connection from {}: {}", peer, err);
            }
        });
    }

    /// Read frames until the peer closes the connection or shutdown begins.
    async fn serve<S: AsyncRead + Unpin>(mut self, mut stream: S) -> rust_fave_common::Result<()> {
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            loop {
                let payload = match decode_frame(&mut buf, self.max_frame_size) {
                    Ok(Some(payload)) => payload,
                    Ok(None) => break,
                    Err(err) => {
                        self.metrics.frames_rejected.increment();
                        return Err(err);
                    }
                };
                self.metrics.frames_received.increment();
                self.metrics.queue_depth.increment();
                if self.queue.send(payload).await.is_err() {
                    // Worker is gone.
                    self.metrics.queue_depth.decrement();
                    return Ok(());
                }
            }

            if *self.shutdown.borrow() {
                return Ok(());
            }
            tokio::select! {
                read = stream.read_buf(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        if !buf.is_empty() {
                            warn!("Dropping {} bytes of an incomplete frame", buf.len());
                        }
                        return Ok(());
                    }
                    self.metrics.bytes_received.add(n as u64);
                }
                _ = self.shutdown.changed() => return Ok(()),
            }
        }
    }
}

/// Listening sockets of one aggregator instance.
#[derive(Debug)]
pub struct AggregatorService {
    unix: Option<(UnixListener, PathBuf)>,
    tcp: Option<TcpListener>,
    queue_capacity: usize,
    max_frame_size: usize,
}

impl AggregatorService {
    /// Bind every socket named in `config`.
    pub async fn bind(config: &AggregatorConfig) -> Result<Self> {
        let unix = match &config.socket {
            Some(path) => Some((bind_unix(path)?, path.clone())),
            None => None,
        };
        let tcp = match &config.listen {
            Some(addr) => {
                let listener = TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("Failed to listen on {}", addr))?;
                info!("Aggregator listening on tcp:{}", listener.local_addr()?);
                Some(listener)
            }
            None => None,
        };

        Ok(Self {
            unix,
            tcp,
            queue_capacity: config.queue_capacity,
            max_frame_size: config.max_frame_size,
        })
    }

    /// Address of the TCP listener, if any.
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Serve until a `stop` message or ctrl-c, then drain the queue and stop
    /// the engine. Returns the aggregator for inspection.
    pub async fn run<E: VerificationEngine>(self, mut aggregator: Aggregator<E>) -> Result<Aggregator<E>> {
        aggregator
            .start()
            .await
            .context("Failed to initialize the verification engine")?;

        let metrics = aggregator.metrics();
        let (queue, mut inbox) = mpsc::channel::<Bytes>(self.queue_capacity);
        let (shutdown_tx, shutdown) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);

        let ingress = Ingress {
            queue,
            metrics: Arc::clone(&metrics),
            max_frame_size: self.max_frame_size,
            shutdown,
        };

        let mut acceptors: Vec<JoinHandle<()>> = Vec::new();
        if let Some((listener, path)) = self.unix {
            acceptors.push(tokio::spawn(accept_unix(listener, path, ingress.clone())));
        }
        if let Some(listener) = self.tcp {
            acceptors.push(tokio::spawn(accept_tcp(listener, ingress.clone())));
        }
        // Acceptors and their connections now hold the only senders.
        drop(ingress);

        let interrupt = {
            let shutdown_tx = Arc::clone(&shutdown_tx);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupted, shutting down");
                    shutdown_tx.send_replace(true);
                }
            })
        };

        while let Some(payload) = inbox.recv().await {
            metrics.queue_depth.decrement();
            match aggregator.handle_payload(&payload).await {
                Ok(Outcome::Applied) => {}
                Ok(Outcome::Stop) => {
                    info!("Stop requested, draining {} queued messages", metrics.queue_depth.value());
                    shutdown_tx.send_replace(true);
                }
                Err(err) => error!("Failed to apply message: {}", err),
            }
        }

        interrupt.abort();
        for acceptor in acceptors {
            if let Err(err) = acceptor.await {
                warn!("Acceptor task failed: {}", err);
            }
        }

        info!("Aggregator metrics: {}", metrics);
        aggregator
            .shutdown()
            .await
            .context("Failed to stop the verification engine")?;
        Ok(aggregator)
    }
}

fn bind_unix(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        debug!("Removing stale socket {}", path.display());
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
    }
    let listener = UnixListener::bind(path)
        .with_context(|| format!("Failed to listen on {}", path.display()))?;
    info!("Aggregator listening on unix:{}", path.display());
    Ok(listener)
}

async fn accept_unix(listener: UnixListener, path: PathBuf, ingress: Ingress) {
    let mut shutdown = ingress.shutdown.clone();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => ingress.spawn_connection(stream, format!("unix:{}", path.display())),
                Err(err) => error!("Failed to accept on {}: {}", path.display(), err),
            },
            _ = shutdown.changed() => break,
        }
    }

    drop(listener);
    if let Err(err) = tokio::fs::remove_file(&path).await {
        warn!("Failed to remove socket {}: {}", path.display(), err);
    }
    info!("Stopped listening on unix:{}", path.display());
}

async fn accept_tcp(listener: TcpListener, ingress: Ingress) {
    let mut shutdown = ingress.shutdown.clone();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY for {}: {}", peer, err);
                    }
                    ingress.spawn_connection(stream, format!("tcp:{}", peer));
                }
                Err(err) => error!("Failed to accept TCP connection: {}", err),
            },
            _ = shutdown.changed() => break,
        }
    }
    info!("Stopped listening on tcp");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_fave_common::{frame::encode_frame, DeviceModel, FieldMapping, Message};
    use rust_fave_rpc::{EngineCall, RecordingEngine};
    use tokio::{io::AsyncWriteExt, net::UnixStream};

    fn config(socket: PathBuf) -> AggregatorConfig {
        AggregatorConfig {
            socket: Some(socket),
            queue_capacity: 4,
            ..AggregatorConfig::default()
        }
    }

    fn frames(messages: &[Message]) -> BytesMut {
        let mut buf = BytesMut::new();
        for message in messages {
            encode_frame(&message.to_bytes().unwrap(), &mut buf).unwrap();
        }
        buf
    }

    #[tokio::test]
    async fn test_serve_until_stop() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("aggregator.socket");
        let dump_dir = dir.path().join("dump");

        let service = AggregatorService::bind(&config(socket.clone())).await.unwrap();
        assert!(socket.exists());

        let engine = RecordingEngine::new();
        let log = engine.log();
        let aggregator = Aggregator::new(engine, FieldMapping::new(), Arc::new(AggregatorMetrics::new()));

        let producer = async {
            let mut stream = UnixStream::connect(&socket).await.unwrap();
            let payload = frames(&[
                Message::Model(DeviceModel::switch("s1", [1, 2], Vec::new())),
                Message::Dump {
                    dir: dump_dir.to_string_lossy().into_owned(),
                },
                Message::Stop,
            ]);
            // Split a frame across writes.
            let (head, tail) = payload.split_at(3);
            stream.write_all(head).await.unwrap();
            stream.flush().await.unwrap();
            stream.write_all(tail).await.unwrap();
            stream.shutdown().await.unwrap();
        };

        let (served, ()) = tokio::join!(service.run(aggregator), producer);
        let aggregator = served.unwrap();

        assert_eq!(log.methods(), vec!["init", "add_table", "stop"]);
        assert_eq!(log.calls()[0], EngineCall::Init { length: 0 });
        assert!(aggregator.state().table_id("s1.1").is_some());
        assert!(dump_dir.join("fave.json").exists());
        assert!(!socket.exists());

        let metrics = aggregator.metrics();
        assert_eq!(metrics.frames_received.value(), 3);
        assert_eq!(metrics.messages_applied.value(), 3);
        assert_eq!(metrics.queue_depth.value(), 0);
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_connection() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("aggregator.socket");
        let config = AggregatorConfig {
            max_frame_size: 16,
            ..config(socket.clone())
        };
        let service = AggregatorService::bind(&config).await.unwrap();

        let engine = RecordingEngine::new();
        let log = engine.log();
        let aggregator = Aggregator::new(engine, FieldMapping::new(), Arc::new(AggregatorMetrics::new()));

        let producer = async {
            let mut big = UnixStream::connect(&socket).await.unwrap();
            big.write_all(&frames(&[Message::Dump { dir: "/nonexistent/far/too/long".into() }]))
                .await
                .unwrap();
            // The aggregator hangs up on the oversized frame.
            let mut byte = [0u8; 1];
            assert_eq!(big.read(&mut byte).await.unwrap(), 0);

            let mut stop = UnixStream::connect(&socket).await.unwrap();
            stop.write_all(&frames(&[Message::Stop])).await.unwrap();
            stop.shutdown().await.unwrap();
        };

        let (served, ()) = tokio::join!(service.run(aggregator), producer);
        let aggregator = served.unwrap();

        assert_eq!(log.methods(), vec!["init", "stop"]);
        assert_eq!(aggregator.metrics().frames_rejected.value(), 1);
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("aggregator.socket");
        std::fs::write(&socket, b"stale").unwrap();

        let service = AggregatorService::bind(&config(socket.clone())).await.unwrap();
        assert!(service.tcp_addr().is_none());
    }
}
