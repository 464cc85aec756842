// Copyright (C) 2025 The Lodestar Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Packet envelope exchanged between the core and its workloads.
//!
//! The envelope is a Protobuf message. Field numbers are part of the wire
//! contract with workload SDKs and must not change:
//!
//! | Tag | Field       | Type                                   |
//! |-----|-------------|----------------------------------------|
//! | 1   | `id`        | `int32`                                |
//! | 2   | `address`   | `string`                               |
//! | 3   | `payload`   | `bytes`                                |
//! | 4   | `timestamp` | `google.protobuf.Timestamp`-compatible |

use bytes::Bytes;
use chrono::{DateTime, Utc};
use prost::Message;
use thiserror::Error;

/// Point in time as seconds and nanoseconds since the Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, Message)]
pub struct Timestamp {
    #[prost(int64, tag = "1")]
    pub seconds: i64,
    #[prost(int32, tag = "2")]
    pub nanos: i32,
}

impl Timestamp {
    pub fn now() -> Self {
        Utc::now().into()
    }

    /// Convert to a chrono timestamp. `None` when the value is out of range.
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        let nanos = u32::try_from(self.nanos).ok()?;
        DateTime::from_timestamp(self.seconds, nanos)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(value: DateTime<Utc>) -> Self {
        Self {
            seconds: value.timestamp(),
            nanos: value.timestamp_subsec_nanos() as i32,
        }
    }
}

/// The structured message unit carried inside a frame.
#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    /// Application-defined packet identifier
    #[prost(int32, tag = "1")]
    pub id: i32,
    /// Logical destination or origin of the packet
    #[prost(string, tag = "2")]
    pub address: String,
    #[prost(bytes = "bytes", tag = "3")]
    pub payload: Bytes,
    #[prost(message, optional, tag = "4")]
    pub timestamp: Option<Timestamp>,
}

impl Envelope {
    /// Build an envelope stamped with the current time.
    pub fn new(id: i32, address: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            address: address.into(),
            payload: payload.into(),
            timestamp: Some(Timestamp::now()),
        }
    }

    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp.as_ref().and_then(Timestamp::to_datetime)
    }
}

/// Errors produced while decoding an envelope
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("envelope decode error: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// Serializes envelopes to frame payloads and back.
pub trait EnvelopeCodec: Send + Sync {
    fn encode(&self, envelope: &Envelope) -> Bytes;

    fn decode(&self, bytes: &[u8]) -> Result<Envelope, CodecError>;
}

/// Protobuf codec, the default for every connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProstCodec;

impl EnvelopeCodec for ProstCodec {
    fn encode(&self, envelope: &Envelope) -> Bytes {
        Bytes::from(envelope.encode_to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Envelope, CodecError> {
        Ok(<Envelope as Message>::decode(bytes)?)
    }
}
