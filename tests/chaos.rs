//! Chaos tests
//!
//! Drive a server connection with a hand-rolled client that fragments,
//! delays, and cuts off its byte stream.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::time::Duration;

use bytes::BytesMut;
use rand::Rng;
use reborn_protocol::config::ProtocolConfig;
use reborn_protocol::core::frame::FrameCodec;
use reborn_protocol::protocol::pipeline::seal_handshake;
use reborn_protocol::protocol::schema::pli;
use reborn_protocol::protocol::{Handshake, InboundEvent, OutboundPipeline};
use reborn_protocol::service::{Connection, ConnectionState, ProtocolContext};
use reborn_protocol::utils::crypto::Generation;
use reborn_protocol::{FieldValue, Packet, ProtocolError};
use tokio::io::{duplex, AsyncWriteExt};
use tokio::time::sleep;
use tokio_util::codec::Encoder;

fn to_all(message: &[u8]) -> Packet {
    Packet::new(pli::TOALL, vec![FieldValue::RawTail(message.to_vec())])
}

/// Wire bytes a client would send: the handshake frame, then `packets`.
fn client_wire(ctx: &ProtocolContext, packets: &[Packet]) -> Vec<u8> {
    let transport = &ctx.config.transport;
    let handshake = Handshake::new(Generation::Gen5, 99, "GNW03014", Vec::new()).unwrap();

    let mut codec = FrameCodec::new(transport.framing, transport.max_frame_size);
    let mut wire = BytesMut::new();
    let sealed = seal_handshake(&handshake, &transport.compression_policy(), transport.framing)
        .unwrap();
    codec.encode(sealed.body, &mut wire).unwrap();

    let mut pipeline = OutboundPipeline::new(
        handshake.cipher_pair().outbound,
        transport.compression_policy(),
        transport.framing,
        transport.max_frame_size,
    );
    for packet in packets {
        wire.extend_from_slice(&pipeline.encode_packet(packet).unwrap());
    }
    wire.to_vec()
}

#[tokio::test]
async fn test_fragmented_and_delayed_delivery() {
    let ctx = ProtocolContext::new(ProtocolConfig::default());
    let packets: Vec<Packet> = (0..50)
        .map(|i| to_all(format!("fragment {i} {}", "x".repeat(i * 7)).as_bytes()))
        .collect();
    let wire = client_wire(&ctx, &packets);

    let (mut raw, server_io) = duplex(256);
    let writer = tokio::spawn(async move {
        let mut offset = 0;
        while offset < wire.len() {
            let (len, delay) = {
                let mut rng = rand::rng();
                (rng.random_range(1..=17), rng.random_range(0..3))
            };
            let end = (offset + len).min(wire.len());
            raw.write_all(&wire[offset..end]).await.unwrap();
            offset = end;
            if delay > 0 {
                sleep(Duration::from_millis(delay)).await;
            }
        }
        raw
    });

    let mut server = Connection::accept(server_io, &ctx).await.unwrap();
    for packet in &packets {
        let event = server.recv().await.unwrap().unwrap();
        assert_eq!(event, InboundEvent::Packet(packet.clone()));
    }
    drop(writer.await.unwrap());
    assert!(server.recv().await.unwrap().is_none());
}

#[tokio::test]
async fn test_disconnect_mid_frame() {
    let ctx = ProtocolContext::new(ProtocolConfig::default());
    let wire = client_wire(&ctx, &[to_all(b"complete"), to_all(b"never finished")]);
    let cut = wire.len() - 4;

    let (mut raw, server_io) = duplex(4096);
    raw.write_all(&wire[..cut]).await.unwrap();
    drop(raw);

    let mut server = Connection::accept(server_io, &ctx).await.unwrap();
    assert_eq!(
        server.recv().await.unwrap().unwrap(),
        InboundEvent::Packet(to_all(b"complete"))
    );

    let err = server.recv().await.unwrap_err();
    assert!(matches!(err, ProtocolError::Io(_)));
    assert_eq!(server.state(), ConnectionState::Closed);
    assert!(server.recv().await.unwrap().is_none());
}

#[tokio::test]
async fn test_disconnect_during_handshake() {
    let ctx = ProtocolContext::new(ProtocolConfig::default());
    let wire = client_wire(&ctx, &[]);

    let (mut raw, server_io) = duplex(4096);
    raw.write_all(&wire[..wire.len() / 2]).await.unwrap();
    drop(raw);

    assert!(Connection::accept(server_io, &ctx).await.is_err());
    assert_eq!(ctx.metrics.snapshot().handshakes_failed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_handshake_times_out() {
    let ctx = ProtocolContext::new(ProtocolConfig::default());
    let wire = client_wire(&ctx, &[]);

    let (mut raw, server_io) = duplex(4096);
    // Everything but the terminator, then silence.
    raw.write_all(&wire[..wire.len() - 1]).await.unwrap();

    let started = tokio::time::Instant::now();
    let result = Connection::accept(server_io, &ctx).await;
    assert!(matches!(result, Err(ProtocolError::Timeout)));
    assert!(started.elapsed() >= ctx.config.server.handshake_timeout);
    drop(raw);
}

#[tokio::test]
async fn test_corrupted_handshake_rejected() {
    let ctx = ProtocolContext::new(ProtocolConfig::default());
    let mut wire = client_wire(&ctx, &[]);
    // Client type byte below the digit offset.
    wire[1] = 0x05;

    let (mut raw, server_io) = duplex(4096);
    raw.write_all(&wire).await.unwrap();

    assert!(matches!(
        Connection::accept(server_io, &ctx).await,
        Err(ProtocolError::HandshakeError(_))
    ));
    drop(raw);
}
