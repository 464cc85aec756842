// Copyright (C) 2025 The Lodestar Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workload-side client for talking to the lodestar core.
//!
//! A workload opens one TCP connection to the core's matcher port and then
//! exchanges framed envelopes over it for as long as it runs.

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, instrument, warn};

use crate::envelope::{CodecError, Envelope, EnvelopeCodec, ProstCodec};
use crate::frame::{DEFAULT_MAX_PAYLOAD_SIZE, FrameError, FramedStream};

/// Errors that can occur in the workload client
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no connection established")]
    NotConnected,

    #[error("failed to connect to {addr} after {attempts} attempts: {source}")]
    ConnectFailed {
        addr: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },
}

/// Configuration for the workload client
#[derive(Debug, Clone)]
pub struct WorkloadClientConfig {
    /// Address of the core's connection matcher (`host:port`)
    pub core_addr: String,
    /// How many times to try connecting before giving up (at least one)
    pub connect_attempts: u32,
    /// Pause between connection attempts
    pub retry_delay: Duration,
    /// Ceiling on payloads accepted from the core
    pub max_payload: usize,
}

impl Default for WorkloadClientConfig {
    fn default() -> Self {
        Self {
            core_addr: "127.0.0.1:5000".to_string(),
            connect_attempts: 10,
            retry_delay: Duration::from_millis(500),
            max_payload: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

/// Connection from a workload to the core
pub struct WorkloadClient {
    stream: Option<FramedStream<TcpStream>>,
    codec: Box<dyn EnvelopeCodec>,
    config: WorkloadClientConfig,
}

impl WorkloadClient {
    /// Connect using the Protobuf codec.
    pub async fn connect(config: WorkloadClientConfig) -> Result<Self, ClientError> {
        Self::connect_with_codec(config, ProstCodec).await
    }

    #[instrument(skip(codec), fields(addr = %config.core_addr))]
    pub async fn connect_with_codec(
        config: WorkloadClientConfig,
        codec: impl EnvelopeCodec + 'static,
    ) -> Result<Self, ClientError> {
        let attempts = config.connect_attempts.max(1);
        let mut attempt = 0;

        let stream = loop {
            attempt += 1;
            match TcpStream::connect(&config.core_addr).await {
                Ok(stream) => break stream,
                Err(e) if attempt < attempts => {
                    debug!(attempt, error = %e, "core not reachable yet, retrying");
                    tokio::time::sleep(config.retry_delay).await;
                }
                Err(e) => {
                    warn!(attempts, error = %e, "giving up connecting to core");
                    return Err(ClientError::ConnectFailed {
                        addr: config.core_addr.clone(),
                        attempts,
                        source: e,
                    });
                }
            }
        };

        stream.set_nodelay(true)?;
        info!(attempt, "connected to lodestar core");

        Ok(Self {
            stream: Some(FramedStream::with_max_payload(stream, config.max_payload)),
            codec: Box::new(codec),
            config,
        })
    }

    pub fn config(&self) -> &WorkloadClientConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Encode and send one envelope.
    pub async fn send(&mut self, envelope: &Envelope) -> Result<(), ClientError> {
        let payload = self.codec.encode(envelope);
        self.send_raw(&payload).await
    }

    /// Receive the next envelope. `None` once the core has closed the connection.
    ///
    /// Empty keep-alive frames are skipped.
    pub async fn recv(&mut self) -> Result<Option<Envelope>, ClientError> {
        loop {
            match self.recv_raw().await? {
                None => return Ok(None),
                Some(payload) if payload.is_empty() => continue,
                Some(payload) => return Ok(Some(self.codec.decode(&payload)?)),
            }
        }
    }

    pub async fn send_raw(&mut self, payload: &[u8]) -> Result<(), ClientError> {
        let stream = self.stream.as_mut().ok_or(ClientError::NotConnected)?;
        stream.write_frame(payload).await?;
        Ok(())
    }

    /// Receive the next frame as-is, including empty frames.
    pub async fn recv_raw(&mut self) -> Result<Option<Bytes>, ClientError> {
        let stream = self.stream.as_mut().ok_or(ClientError::NotConnected)?;
        match stream.read_frame().await {
            Ok(payload) => Ok(Some(payload)),
            Err(FrameError::ConnectionClosed) => {
                debug!("core closed the connection");
                self.stream = None;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Close the connection. Safe to call when already disconnected.
    pub async fn disconnect(&mut self) -> Result<(), ClientError> {
        if let Some(stream) = self.stream.take() {
            let mut socket = stream.into_inner();
            socket.shutdown().await?;
        }
        Ok(())
    }
}
