//! Connection lifecycle tests over in-memory duplex streams.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use reborn_protocol::config::ProtocolConfig;
use reborn_protocol::core::frame::{FrameCodec, Framing};
use reborn_protocol::error::ProtocolError;
use reborn_protocol::protocol::pipeline::{seal_handshake, OutboundPipeline};
use reborn_protocol::protocol::schema::{pli, plo};
use reborn_protocol::protocol::{Capability, Direction, Dispatcher, Handshake, InboundEvent};
use reborn_protocol::service::{Connection, ConnectionState, PendingConnection, ProtocolContext};
use reborn_protocol::utils::crypto::Generation;
use reborn_protocol::{FieldValue, Packet};
use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
use tokio_util::codec::Encoder;

fn context() -> ProtocolContext {
    ProtocolContext::new(ProtocolConfig::default())
}

fn client_handshake() -> Handshake {
    Handshake::new(Generation::Gen5, 77, "G3D0511C", b"alice".to_vec()).unwrap()
}

fn to_all(message: &[u8]) -> Packet {
    Packet::new(pli::TOALL, vec![FieldValue::RawTail(message.to_vec())])
}

async fn pair(
    ctx: &ProtocolContext,
    buffer: usize,
) -> (Connection<DuplexStream>, Connection<DuplexStream>) {
    let (client_io, server_io) = duplex(buffer);
    let server_ctx = ctx.clone();
    let server = tokio::spawn(async move { Connection::accept(server_io, &server_ctx).await });
    let client = Connection::connect(client_io, ctx, client_handshake())
        .await
        .unwrap();
    let server = server.await.unwrap().unwrap();
    (client, server)
}

#[tokio::test]
async fn test_handshake_then_packets_both_ways() {
    let ctx = context();
    let (mut client, mut server) = pair(&ctx, 4096).await;

    assert_eq!(client.state(), ConnectionState::Active);
    assert_eq!(server.state(), ConnectionState::Active);
    assert_eq!(server.handshake().version(), "G3D0511C");
    assert_eq!(server.handshake().seed(), 77);
    assert_eq!(server.handshake().payload(), b"alice");

    client.send(to_all(b"hello everyone")).await.unwrap();
    let event = server.recv().await.unwrap().unwrap();
    assert_eq!(event, InboundEvent::Packet(to_all(b"hello everyone")));

    let reply = Packet::new(
        plo::TOALL,
        vec![
            FieldValue::GShort(12),
            FieldValue::CharString(b"hi".to_vec()),
        ],
    );
    server.send(reply.clone()).await.unwrap();
    assert_eq!(
        client.recv().await.unwrap().unwrap(),
        InboundEvent::Packet(reply)
    );
}

#[tokio::test]
async fn test_many_packets_stay_ordered() {
    let ctx = context();
    let (client, mut server) = pair(&ctx, 1024).await;

    let handle = client.handle();
    let sender = tokio::spawn(async move {
        for i in 0..200u32 {
            handle
                .send(to_all(format!("message {i}").as_bytes()))
                .await
                .unwrap();
        }
    });

    for i in 0..200u32 {
        let event = server.recv().await.unwrap().unwrap();
        assert_eq!(
            event,
            InboundEvent::Packet(to_all(format!("message {i}").as_bytes()))
        );
    }
    sender.await.unwrap();
    drop(client);
}

#[tokio::test]
async fn test_large_packets_compress_transparently() {
    let ctx = context();
    let (mut client, mut server) = pair(&ctx, 64 * 1024).await;

    let text = b"the quick brown fox ".repeat(500);
    client.send(to_all(&text)).await.unwrap();
    assert_eq!(
        server.recv().await.unwrap().unwrap(),
        InboundEvent::Packet(to_all(&text))
    );
    client.close().await.unwrap();

    let snapshot = ctx.metrics.snapshot();
    assert!(snapshot.frames_deflate + snapshot.frames_bzip2 >= 1);
}

#[tokio::test]
async fn test_unknown_packet_is_delivered_not_fatal() {
    let ctx = context();
    let (client, mut server) = pair(&ctx, 4096).await;

    client
        .send(Packet::new(200, vec![FieldValue::RawTail(b"??".to_vec())]))
        .await
        .unwrap();
    client.send(to_all(b"still here")).await.unwrap();

    match server.recv().await.unwrap().unwrap() {
        InboundEvent::Unknown(unknown) => {
            assert_eq!(unknown.id, 200);
            assert_eq!(unknown.payload, b"??");
        }
        other => panic!("expected unknown packet, got {other:?}"),
    }
    assert_eq!(
        server.recv().await.unwrap().unwrap(),
        InboundEvent::Packet(to_all(b"still here"))
    );
    assert_eq!(ctx.metrics.snapshot().unknown_packets, 1);
    assert_eq!(server.state(), ConnectionState::Active);
}

#[tokio::test]
async fn test_try_send_reports_backpressure() {
    let config = ProtocolConfig::default_with_overrides(|c| {
        c.server.backpressure_limit = 2;
        c.transport.compression_enabled = false;
    });
    let ctx = ProtocolContext::new(config);
    // The server never reads, so the writer stalls once the pipe fills.
    let (client, _server) = pair(&ctx, 64).await;

    let mut rejected = false;
    for _ in 0..1000 {
        match client.try_send(to_all(&[b'x'; 40])) {
            Ok(()) => tokio::task::yield_now().await,
            Err(ProtocolError::Backpressure) => {
                rejected = true;
                break;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(rejected, "queue never filled");
    assert!(ctx.metrics.snapshot().backpressure_rejections >= 1);
    assert!(!ProtocolError::Backpressure.is_fatal());
}

#[tokio::test]
async fn test_close_ends_both_sides() {
    let ctx = context();
    let (mut client, mut server) = pair(&ctx, 4096).await;

    client.close().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(client.recv().await.unwrap().is_none());
    assert!(matches!(
        client.send(to_all(b"late")).await,
        Err(ProtocolError::ConnectionClosed)
    ));

    // Peer sees end of stream.
    assert!(server.recv().await.unwrap().is_none());
    assert_eq!(server.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_handle_close_wakes_reader() {
    let ctx = context();
    let (_client, mut server) = pair(&ctx, 4096).await;

    let handle = server.handle();
    let reader = tokio::spawn(async move { server.recv().await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    handle.close();

    assert!(reader.await.unwrap().unwrap().is_none());
    assert!(handle.state().is_closing());
}

#[tokio::test]
async fn test_garbage_after_handshake_is_fatal() {
    let ctx = context();
    let (mut raw, server_io) = duplex(4096);
    let server_ctx = ctx.clone();
    let server = tokio::spawn(async move { Connection::accept(server_io, &server_ctx).await });

    let sealed = seal_handshake(
        &client_handshake(),
        &ctx.config.transport.compression_policy(),
        Framing::Delimited,
    )
    .unwrap();
    let mut codec = FrameCodec::new(Framing::Delimited, 1024);
    let mut wire = BytesMut::new();
    codec.encode(sealed.body, &mut wire).unwrap();
    // Unknown compression marker in the next frame.
    codec
        .encode(Bytes::from_static(&[0x09, 1, 2, 3]), &mut wire)
        .unwrap();
    raw.write_all(&wire).await.unwrap();

    let mut server = server.await.unwrap().unwrap();
    let err = server.recv().await.unwrap_err();
    assert!(matches!(err, ProtocolError::InvalidCompressionMarker(0x09)));
    assert!(err.is_fatal());
    assert_eq!(server.state(), ConnectionState::Closed);
    assert_eq!(ctx.metrics.snapshot().fatal_errors, 1);
}

#[tokio::test]
async fn test_rejected_handshakes() {
    let ctx = context();

    let (client_io, server_io) = duplex(4096);
    let server_ctx = ctx.clone();
    let server = tokio::spawn(async move { Connection::accept(server_io, &server_ctx).await });
    let unknown = Handshake::new(Generation::Gen5, 5, "ZZZ99999", Vec::new()).unwrap();
    let _client = Connection::connect(client_io, &ctx, unknown).await.unwrap();
    assert!(matches!(
        server.await.unwrap(),
        Err(ProtocolError::UnsupportedVersion(_))
    ));

    let (client_io, server_io) = duplex(4096);
    drop(client_io);
    assert!(matches!(
        Connection::accept(server_io, &ctx).await,
        Err(ProtocolError::HandshakeError(_))
    ));

    assert_eq!(ctx.metrics.snapshot().handshakes_failed, 2);
}

#[tokio::test(start_paused = true)]
async fn test_handshake_timeout() {
    let ctx = ProtocolContext::new(ProtocolConfig::default_with_overrides(|c| {
        c.server.handshake_timeout = Duration::from_secs(2);
    }));
    let (_silent, server_io) = duplex(4096);

    let result = Connection::accept(server_io, &ctx).await;
    assert!(matches!(result, Err(ProtocolError::Timeout)));
}

#[tokio::test]
async fn test_serve_replies_through_dispatcher() {
    let ctx = context();
    let (mut client, mut server) = pair(&ctx, 4096).await;

    let dispatcher = Dispatcher::new(Arc::clone(&ctx.schema), Direction::ClientToServer);
    dispatcher
        .register(Capability::Chat, |packet, layout| {
            let message = layout
                .field(packet, "message")
                .and_then(FieldValue::as_bytes)
                .unwrap_or_default()
                .to_vec();
            Ok(vec![Packet::new(
                plo::TOALL,
                vec![FieldValue::GShort(1), FieldValue::CharString(message)],
            )])
        })
        .unwrap();

    let serving = tokio::spawn(async move { server.serve(&dispatcher).await });

    client.send(to_all(b"ping")).await.unwrap();
    assert_eq!(
        client.recv().await.unwrap().unwrap(),
        InboundEvent::Packet(Packet::new(
            plo::TOALL,
            vec![
                FieldValue::GShort(1),
                FieldValue::CharString(b"ping".to_vec())
            ],
        ))
    );

    client.close().await.unwrap();
    serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_on_receive_collects_events() {
    let ctx = context();
    let (client, mut server) = pair(&ctx, 4096).await;

    for word in ["one", "two", "three"] {
        client.send(to_all(word.as_bytes())).await.unwrap();
    }

    let handle = server.handle();
    let mut seen = Vec::new();
    server
        .on_receive(|event| {
            seen.push(event.id());
            if seen.len() == 3 {
                handle.close();
            }
            Ok(())
        })
        .await
        .unwrap();
    assert_eq!(seen, vec![pli::TOALL; 3]);
}

#[tokio::test]
async fn test_legacy_framing_connection() {
    let config = ProtocolConfig::default_with_overrides(|c| {
        c.transport.framing = Framing::LengthPrefixed;
    });
    let ctx = ProtocolContext::new(config);
    let (client, mut server) = pair(&ctx, 4096).await;

    for i in 0..20u8 {
        client.send(to_all(&vec![b'a' + i; 100])).await.unwrap();
    }
    for i in 0..20u8 {
        assert_eq!(
            server.recv().await.unwrap().unwrap(),
            InboundEvent::Packet(to_all(&vec![b'a' + i; 100]))
        );
    }
}

#[tokio::test]
async fn test_metrics_track_lifecycle() {
    let ctx = context();
    let (client, mut server) = pair(&ctx, 4096).await;

    client.send(to_all(b"count me")).await.unwrap();
    server.recv().await.unwrap().unwrap();

    let snapshot = ctx.metrics.snapshot();
    assert_eq!(snapshot.connections_active, 2);
    assert_eq!(snapshot.handshakes_success, 2);
    assert!(snapshot.frames_sent >= 1);
    assert!(snapshot.frames_received >= 2);

    drop(client);
    drop(server);
    assert_eq!(ctx.metrics.snapshot().connections_active, 0);
}

fn small_frames() -> ProtocolContext {
    ProtocolContext::new(ProtocolConfig::default_with_overrides(|c| {
        c.transport.max_frame_size = 256;
        c.transport.compression_enabled = false;
    }))
}

#[tokio::test]
async fn test_unencodable_packet_fails_send_only() {
    let ctx = small_frames();
    let (mut client, server) = pair(&ctx, 4096).await;

    let bad = Packet::new(
        plo::TOALL,
        vec![FieldValue::GChar(250), FieldValue::GChar(1)],
    );
    assert!(matches!(
        server.send(bad).await,
        Err(ProtocolError::FieldOutOfRange { .. })
    ));
    assert!(matches!(
        server.try_send(Packet::new(
            plo::TOALL,
            vec![FieldValue::GShort(1), FieldValue::CharString(vec![b'x'; 400])],
        )),
        Err(ProtocolError::FrameTooLarge { max: 256, .. })
    ));
    assert_eq!(server.state(), ConnectionState::Active);

    let reply = Packet::new(
        plo::TOALL,
        vec![FieldValue::GShort(3), FieldValue::CharString(b"ok".to_vec())],
    );
    server.send(reply.clone()).await.unwrap();
    assert_eq!(
        client.recv().await.unwrap().unwrap(),
        InboundEvent::Packet(reply)
    );
    assert_eq!(ctx.metrics.snapshot().fatal_errors, 0);
}

#[tokio::test]
async fn test_writer_failure_reaches_recv() {
    let ctx = ProtocolContext::new(ProtocolConfig::default_with_overrides(|c| {
        c.transport.max_frame_size = 256;
        c.transport.compression_enabled = false;
        c.transport.encryption_required = false;
    }));
    let (client_io, server_io) = duplex(4096);
    let server_ctx = ctx.clone();
    let server = tokio::spawn(async move { Connection::accept(server_io, &server_ctx).await });
    let plain = Handshake::new(Generation::Disabled, 12, "G3D0511C", Vec::new()).unwrap();
    let mut client = Connection::connect(client_io, &ctx, plain).await.unwrap();
    let _server = server.await.unwrap().unwrap();

    // Fits before byte stuffing, doubles after it.
    client.send(to_all(&[0x0a; 200])).await.unwrap();
    let err = client.recv().await.unwrap_err();
    assert!(matches!(err, ProtocolError::FrameTooLarge { max: 256, .. }));
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(ctx.metrics.snapshot().fatal_errors, 1);
    assert!(client.recv().await.unwrap().is_none());
}

#[tokio::test]
async fn test_unterminated_oversized_frame_is_fatal() {
    let ctx = small_frames();
    let (mut raw, server_io) = duplex(4096);
    let server_ctx = ctx.clone();
    let server = tokio::spawn(async move { Connection::accept(server_io, &server_ctx).await });

    let sealed = seal_handshake(
        &client_handshake(),
        &ctx.config.transport.compression_policy(),
        Framing::Delimited,
    )
    .unwrap();
    let mut codec = FrameCodec::new(Framing::Delimited, 256);
    let mut wire = BytesMut::new();
    codec.encode(sealed.body, &mut wire).unwrap();
    raw.write_all(&wire).await.unwrap();
    let mut server = server.await.unwrap().unwrap();

    raw.write_all(&[b'x'; 600]).await.unwrap();
    let err = server.recv().await.unwrap_err();
    assert!(matches!(err, ProtocolError::FrameTooLarge { max: 256, .. }));
    assert_eq!(server.state(), ConnectionState::Closed);
    assert_eq!(ctx.metrics.snapshot().fatal_errors, 1);
}

#[tokio::test]
async fn test_close_discards_rest_of_bundle() {
    let config = ProtocolConfig::default_with_overrides(|c| {
        c.transport.framing = Framing::LengthPrefixed;
    });
    let ctx = ProtocolContext::new(config);
    let transport = &ctx.config.transport;
    let (mut raw, server_io) = duplex(4096);
    let server_ctx = ctx.clone();
    let server = tokio::spawn(async move { Connection::accept(server_io, &server_ctx).await });

    let handshake = client_handshake();
    let mut codec = FrameCodec::new(Framing::LengthPrefixed, transport.max_frame_size);
    let mut wire = BytesMut::new();
    let sealed = seal_handshake(&handshake, &transport.compression_policy(), Framing::LengthPrefixed)
        .unwrap();
    codec.encode(sealed.body, &mut wire).unwrap();
    let mut pipeline = OutboundPipeline::new(
        handshake.cipher_pair().outbound,
        transport.compression_policy(),
        Framing::LengthPrefixed,
        transport.max_frame_size,
    );
    let bundle = pipeline
        .seal_batch(&[to_all(b"one"), to_all(b"two"), to_all(b"three")])
        .unwrap();
    codec.encode(bundle.body, &mut wire).unwrap();
    raw.write_all(&wire).await.unwrap();

    let mut server = server.await.unwrap().unwrap();
    assert_eq!(
        server.recv().await.unwrap().unwrap(),
        InboundEvent::Packet(to_all(b"one"))
    );
    server.handle().close();
    assert!(server.recv().await.unwrap().is_none());
    assert_eq!(server.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_pending_connection_reports_handshaking() {
    let ctx = context();
    let (client_io, server_io) = duplex(4096);

    let pending = PendingConnection::new(server_io, &ctx);
    let handle = pending.handle();
    assert_eq!(pending.state(), ConnectionState::Handshaking);
    assert_eq!(handle.state(), ConnectionState::Handshaking);
    assert!(!handle.is_active());

    let early = Packet::new(
        plo::TOALL,
        vec![FieldValue::GShort(9), FieldValue::CharString(b"early".to_vec())],
    );
    handle.send(early.clone()).await.unwrap();

    let server = tokio::spawn(pending.accept());
    let mut client = Connection::connect(client_io, &ctx, client_handshake())
        .await
        .unwrap();
    let server = server.await.unwrap().unwrap();
    assert_eq!(server.state(), ConnectionState::Active);
    assert!(handle.is_active());
    assert_eq!(
        client.recv().await.unwrap().unwrap(),
        InboundEvent::Packet(early)
    );
}

#[tokio::test]
async fn test_close_while_handshaking_fails_accept() {
    let ctx = context();
    let (_silent, server_io) = duplex(4096);

    let pending = PendingConnection::new(server_io, &ctx);
    let handle = pending.handle();
    handle.close();

    assert!(matches!(
        pending.accept().await,
        Err(ProtocolError::ConnectionClosed)
    ));
    assert_eq!(handle.state(), ConnectionState::Closed);
    assert_eq!(ctx.metrics.snapshot().handshakes_failed, 1);
}
