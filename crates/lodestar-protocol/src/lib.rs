// Copyright (C) 2025 The Lodestar Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lodestar Protocol - TCP framing + Protobuf envelopes
//!
//! This crate provides the wire protocol spoken between the lodestar core and
//! each workload it orchestrates. There is exactly one TCP connection per
//! component; the core accepts it, the workload opens it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    lodestar-protocol                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Client: WorkloadClient (workload side, connect + retry)    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: Envelope via Protobuf (prost)               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Framing: [u32 BE length][payload], payload ceiling         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: TCP (tokio)                                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The framing layer knows nothing about envelopes. The core forwards raw frame
//! payloads and only decodes them as envelopes for diagnostics.
//!
//! # Usage
//!
//! ## Workload Client
//!
//! ```ignore
//! use lodestar_protocol::{Envelope, WorkloadClient, WorkloadClientConfig};
//!
//! let mut client = WorkloadClient::connect(WorkloadClientConfig {
//!     core_addr: "lodestar:5000".to_string(),
//!     ..Default::default()
//! })
//! .await?;
//!
//! client.send(&Envelope::new(1, "svc.worker", &b"hello"[..])).await?;
//! while let Some(envelope) = client.recv().await? {
//!     println!("{} -> {:?}", envelope.address, envelope.payload);
//! }
//! ```

pub mod client;
pub mod envelope;
pub mod frame;

// Re-export main types
pub use client::{ClientError, WorkloadClient, WorkloadClientConfig};
pub use envelope::{CodecError, Envelope, EnvelopeCodec, ProstCodec, Timestamp};
pub use frame::{
    DEFAULT_MAX_PAYLOAD_SIZE, FrameError, FramedStream, HEADER_SIZE, MAX_FRAME_SIZE,
    decode_frame, encode_frame, frame_header, read_frame, write_frame,
};
