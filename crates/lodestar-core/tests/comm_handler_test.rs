// Copyright (C) 2025 The Lodestar Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Communication handler tests over in-memory duplex connections.

mod common;

use std::sync::Arc;

use bytes::Bytes;
use common::*;
use lodestar_core::comm::{CommHandler, HandlerConfig};
use lodestar_protocol::frame::{FrameError, read_frame, write_frame};
use lodestar_protocol::{Envelope, EnvelopeCodec, ProstCodec};
use tokio::io::{AsyncWriteExt, DuplexStream, duplex};

const MAX: usize = 1 << 20;

fn handler_with(config: HandlerConfig) -> CommHandler {
    CommHandler::new("worker", config, Arc::new(ProstCodec))
}

fn handler() -> CommHandler {
    handler_with(HandlerConfig {
        channel_capacity: 16,
        ..Default::default()
    })
}

async fn read_within(peer: &mut DuplexStream) -> Result<Bytes, FrameError> {
    tokio::time::timeout(WAIT, read_frame(peer, MAX))
        .await
        .expect("timed out waiting for a frame")
}

// ========== Traffic Tests ==========

#[tokio::test]
async fn test_workload_frames_reach_core() {
    let handler = handler();
    let mut to_core = handler.take_to_core_receiver().await.unwrap();
    let (stream, mut peer) = duplex(4096);
    handler.attach(stream).await.unwrap();

    write_frame(&mut peer, b"hello core").await.unwrap();

    assert_eq!(&recv_within(&mut to_core).await[..], b"hello core");
}

#[tokio::test]
async fn test_core_frames_reach_workload() {
    let handler = handler();
    let (stream, mut peer) = duplex(4096);
    handler.attach(stream).await.unwrap();

    handler
        .send_to_workload(Bytes::from_static(b"hello workload"))
        .await
        .unwrap();

    assert_eq!(&read_within(&mut peer).await.unwrap()[..], b"hello workload");
}

#[tokio::test]
async fn test_core_sender_reaches_workload() {
    let handler = handler();
    let (stream, mut peer) = duplex(4096);
    handler.attach(stream).await.unwrap();

    let sender = handler.core_sender();
    sender.send(Bytes::from_static(b"via sender")).await.unwrap();

    assert_eq!(&read_within(&mut peer).await.unwrap()[..], b"via sender");
}

#[tokio::test]
async fn test_frames_reach_core_in_wire_order() {
    let handler = handler();
    let mut to_core = handler.take_to_core_receiver().await.unwrap();
    let (stream, mut peer) = duplex(64 * 1024);
    handler.attach(stream).await.unwrap();

    let writer = tokio::spawn(async move {
        for i in 0..100u32 {
            write_frame(&mut peer, &i.to_be_bytes()).await.unwrap();
        }
        peer
    });

    for i in 0..100u32 {
        let frame = recv_within(&mut to_core).await;
        assert_eq!(&frame[..], &i.to_be_bytes());
    }
    drop(writer.await.unwrap());
}

#[tokio::test]
async fn test_envelopes_are_tracked() {
    let handler = handler();
    let mut to_core = handler.take_to_core_receiver().await.unwrap();
    let mut watch = handler.subscribe_envelopes();
    let (stream, mut peer) = duplex(4096);
    handler.attach(stream).await.unwrap();

    let envelope = Envelope::new(7, "svc.worker", Bytes::from_static(b"payload"));
    write_frame(&mut peer, &ProstCodec.encode(&envelope))
        .await
        .unwrap();

    recv_within(&mut to_core).await;
    tokio::time::timeout(WAIT, watch.changed())
        .await
        .unwrap()
        .unwrap();

    let recent = handler.recent_envelope().unwrap();
    assert_eq!(recent, envelope);
    assert_eq!(watch.borrow().as_ref(), Some(&envelope));
}

#[tokio::test]
async fn test_undecodable_frames_still_reach_core() {
    let handler = handler();
    let mut to_core = handler.take_to_core_receiver().await.unwrap();
    let (stream, mut peer) = duplex(4096);
    handler.attach(stream).await.unwrap();

    // Truncated varint key: not a valid envelope.
    write_frame(&mut peer, &[0xff, 0xff, 0xff]).await.unwrap();

    assert_eq!(&recv_within(&mut to_core).await[..], &[0xff, 0xff, 0xff]);
    assert!(handler.recent_envelope().is_none());
    assert!(handler.is_connected());
}

#[tokio::test]
async fn test_empty_frames_are_not_forwarded() {
    let handler = handler();
    let mut to_core = handler.take_to_core_receiver().await.unwrap();
    let (stream, mut peer) = duplex(4096);
    handler.attach(stream).await.unwrap();

    write_frame(&mut peer, b"").await.unwrap();
    write_frame(&mut peer, b"after keepalive").await.unwrap();

    assert_eq!(&recv_within(&mut to_core).await[..], b"after keepalive");
}

#[tokio::test]
async fn test_echo_writes_workload_frames_back() {
    let handler = handler_with(HandlerConfig {
        channel_capacity: 16,
        echo_to_workload: true,
        ..Default::default()
    });
    let mut to_core = handler.take_to_core_receiver().await.unwrap();
    let (stream, mut peer) = duplex(4096);
    handler.attach(stream).await.unwrap();

    write_frame(&mut peer, b"ping").await.unwrap();

    assert_eq!(&recv_within(&mut to_core).await[..], b"ping");
    assert_eq!(&read_within(&mut peer).await.unwrap()[..], b"ping");
}

// ========== Connection Lifecycle Tests ==========

#[tokio::test]
async fn test_frames_queued_before_first_connection_are_delivered() {
    let handler = handler();

    handler
        .send_to_workload(Bytes::from_static(b"early-1"))
        .await
        .unwrap();
    handler
        .try_send_to_workload(Bytes::from_static(b"early-2"))
        .unwrap();

    let (stream, mut peer) = duplex(4096);
    handler.attach(stream).await.unwrap();

    assert_eq!(&read_within(&mut peer).await.unwrap()[..], b"early-1");
    assert_eq!(&read_within(&mut peer).await.unwrap()[..], b"early-2");
}

#[tokio::test]
async fn test_reconnect_preserves_queued_frames() {
    let handler = handler();
    let (first, first_peer) = duplex(4096);
    assert_eq!(handler.attach(first).await.unwrap(), 1);
    assert!(handler.is_connected());

    drop(first_peer);
    let handler_ref = &handler;
    eventually("first connection detected as closed", move || async move {
        !handler_ref.is_connected()
    })
    .await;

    for frame in [&b"queued-1"[..], b"queued-2", b"queued-3"] {
        handler
            .send_to_workload(Bytes::copy_from_slice(frame))
            .await
            .unwrap();
    }

    let (second, mut second_peer) = duplex(4096);
    assert_eq!(handler.attach(second).await.unwrap(), 2);
    assert!(handler.is_connected());

    assert_eq!(&read_within(&mut second_peer).await.unwrap()[..], b"queued-1");
    assert_eq!(&read_within(&mut second_peer).await.unwrap()[..], b"queued-2");
    assert_eq!(&read_within(&mut second_peer).await.unwrap()[..], b"queued-3");
}

#[tokio::test]
async fn test_frame_sent_to_dead_connection_is_redelivered() {
    let handler = handler();
    let (first, first_peer) = duplex(4096);
    handler.attach(first).await.unwrap();
    drop(first_peer);

    handler
        .send_to_workload(Bytes::from_static(b"must arrive"))
        .await
        .unwrap();

    let (second, mut second_peer) = duplex(4096);
    handler.attach(second).await.unwrap();

    assert_eq!(&read_within(&mut second_peer).await.unwrap()[..], b"must arrive");
}

#[tokio::test]
async fn test_replacing_connection_closes_the_old_one() {
    let handler = handler();
    let mut to_core = handler.take_to_core_receiver().await.unwrap();
    let (first, mut first_peer) = duplex(4096);
    handler.attach(first).await.unwrap();

    let (second, mut second_peer) = duplex(4096);
    handler.attach(second).await.unwrap();
    assert_eq!(handler.generation(), 2);

    assert!(matches!(
        read_within(&mut first_peer).await,
        Err(FrameError::ConnectionClosed)
    ));

    write_frame(&mut second_peer, b"from second").await.unwrap();
    assert_eq!(&recv_within(&mut to_core).await[..], b"from second");
}

#[tokio::test]
async fn test_oversize_frame_drops_connection_only() {
    let handler = handler_with(HandlerConfig {
        channel_capacity: 16,
        max_payload: 16,
        ..Default::default()
    });
    let mut to_core = handler.take_to_core_receiver().await.unwrap();
    let (stream, mut peer) = duplex(4096);
    handler.attach(stream).await.unwrap();

    // Header claims 1000 bytes; no payload follows.
    peer.write_all(&1000u32.to_be_bytes()).await.unwrap();

    let handler_ref = &handler;
    eventually("oversize frame drops the connection", move || async move {
        !handler_ref.is_connected()
    })
    .await;
    assert!(!handler.is_shut_down());

    let (stream, mut peer) = duplex(4096);
    handler.attach(stream).await.unwrap();
    write_frame(&mut peer, b"small").await.unwrap();
    assert_eq!(&recv_within(&mut to_core).await[..], b"small");
}

#[tokio::test]
async fn test_shutdown_closes_connection() {
    let handler = handler();
    let (stream, mut peer) = duplex(4096);
    handler.attach(stream).await.unwrap();

    handler.shutdown().await;

    assert!(!handler.is_connected());
    assert!(handler.is_shut_down());
    assert!(matches!(
        read_within(&mut peer).await,
        Err(FrameError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_to_core_back_pressure_does_not_lose_frames() {
    let handler = handler_with(HandlerConfig {
        channel_capacity: 2,
        ..Default::default()
    });
    let mut to_core = handler.take_to_core_receiver().await.unwrap();
    let (stream, mut peer) = duplex(64 * 1024);
    handler.attach(stream).await.unwrap();

    for i in 0..20u8 {
        write_frame(&mut peer, &[i]).await.unwrap();
    }

    for i in 0..20u8 {
        assert_eq!(&recv_within(&mut to_core).await[..], &[i]);
    }
}

#[tokio::test]
async fn test_undrained_core_queue_does_not_block_outbound_traffic() {
    let handler = handler_with(HandlerConfig {
        channel_capacity: 2,
        ..Default::default()
    });
    let (stream, mut peer) = duplex(64 * 1024);
    handler.attach(stream).await.unwrap();

    // Nobody reads `to_core` yet: these back up every workload-to-core queue.
    for i in 0..8u8 {
        write_frame(&mut peer, &[i]).await.unwrap();
    }
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    handler
        .send_to_workload(Bytes::from_static(b"core->workload"))
        .await
        .unwrap();
    assert_eq!(&read_within(&mut peer).await.unwrap()[..], b"core->workload");
    assert!(handler.is_connected());

    // A late consumer still gets every backed-up frame, in order.
    let mut to_core = handler.take_to_core_receiver().await.unwrap();
    for i in 0..8u8 {
        assert_eq!(&recv_within(&mut to_core).await[..], &[i]);
    }
}

#[tokio::test]
async fn test_dropped_core_receiver_discards_workload_frames() {
    let handler = handler_with(HandlerConfig {
        channel_capacity: 2,
        ..Default::default()
    });
    drop(handler.take_to_core_receiver().await.unwrap());
    let (stream, mut peer) = duplex(64 * 1024);
    handler.attach(stream).await.unwrap();

    for i in 0..8u8 {
        write_frame(&mut peer, &[i]).await.unwrap();
    }
    let envelope = Envelope::new(9, "svc.worker", Bytes::from_static(b"last"));
    write_frame(&mut peer, &ProstCodec.encode(&envelope))
        .await
        .unwrap();

    let handler_ref = &handler;
    eventually("every workload frame consumed", move || async move {
        handler_ref.recent_envelope().is_some_and(|e| e.id == 9)
    })
    .await;

    handler
        .send_to_workload(Bytes::from_static(b"still flowing"))
        .await
        .unwrap();
    assert_eq!(&read_within(&mut peer).await.unwrap()[..], b"still flowing");
}
