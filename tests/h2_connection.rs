//! Connection lifecycle tests: PING, keepalive, graceful shutdown, close and
//! connection-level protocol errors.

use std::time::Duration;

use h2mux::{ConnectionBuilder, Error, ErrorCode, Timeouts};
use tokio::time::timeout;

mod helpers;
use helpers::mock_peer::{self, client_with, get_request, GOAWAY, PING};

#[tokio::test]
async fn test_ping_round_trip() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("trace")
        .try_init();

    let (conn, peer) = client_with(ConnectionBuilder::client(), &[]).await;
    let pinger = conn.clone();
    let ping = tokio::spawn(async move { pinger.ping().await });

    let frame = peer.expect_frame(PING).await;
    assert!(!frame.has_flag(mock_peer::ACK));
    let payload: [u8; 8] = frame.payload[..].try_into().unwrap();
    peer.send_ping(payload, true).await.unwrap();

    let rtt = timeout(Duration::from_secs(5), ping)
        .await
        .expect("ping answered")
        .unwrap()
        .unwrap();
    assert!(rtt < Duration::from_secs(5));
    assert!(!conn.is_closed());
}

#[tokio::test]
async fn test_ping_timeout_force_closes() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("trace")
        .try_init();

    let timeouts = Timeouts::new().ping(Duration::from_millis(150));
    let (conn, peer) = client_with(ConnectionBuilder::client().timeouts(timeouts), &[]).await;
    let stream = conn.open_stream(get_request("/"), false).await.unwrap();
    peer.read_headers().await;

    // Never ACK.
    match conn.ping().await {
        Err(Error::PingTimeout(limit)) => assert_eq!(limit, Duration::from_millis(150)),
        other => panic!("expected ping timeout, got {:?}", other),
    }
    assert!(conn.is_closed());
    assert!(matches!(conn.closed().await, Error::PingTimeout(_)));

    let goaway = peer.expect_frame(GOAWAY).await;
    assert_eq!(goaway.u32_at(4), ErrorCode::NoError.as_u32());

    // Open streams fail instead of hanging.
    assert!(stream.read(16).await.is_err());
    assert!(matches!(
        conn.open_stream(get_request("/"), false).await,
        Err(Error::ConnectionClosed(_))
    ));
}

#[tokio::test]
async fn test_peer_ping_is_acknowledged() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("trace")
        .try_init();

    let (_conn, peer) = client_with(ConnectionBuilder::client(), &[]).await;
    peer.send_ping(*b"12345678", false).await.unwrap();

    loop {
        let frame = peer.expect_frame(PING).await;
        if frame.has_flag(mock_peer::ACK) {
            assert_eq!(&frame.payload[..], b"12345678");
            break;
        }
    }
}

#[tokio::test]
async fn test_unanswered_keepalive_closes_connection() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("trace")
        .try_init();

    let timeouts = Timeouts::new().keepalive(Duration::from_millis(100));
    let (conn, peer) = client_with(ConnectionBuilder::client().timeouts(timeouts), &[]).await;

    // First keepalive goes out; it is never answered.
    let frame = peer.expect_frame(PING).await;
    assert!(!frame.has_flag(mock_peer::ACK));

    let reason = timeout(Duration::from_secs(5), conn.closed())
        .await
        .expect("keepalive closed the connection");
    assert!(matches!(reason, Error::PingTimeout(_)));
}

#[tokio::test]
async fn test_answered_keepalive_keeps_connection() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("trace")
        .try_init();

    let timeouts = Timeouts::new().keepalive(Duration::from_millis(100));
    let (conn, peer) = client_with(ConnectionBuilder::client().timeouts(timeouts), &[]).await;

    for _ in 0..3 {
        let frame = peer.expect_frame(PING).await;
        let payload: [u8; 8] = frame.payload[..].try_into().unwrap();
        peer.send_ping(payload, true).await.unwrap();
    }
    assert!(!conn.is_closed());
}

#[tokio::test]
async fn test_graceful_shutdown_sends_goaway() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("trace")
        .try_init();

    let (conn, peer) = client_with(ConnectionBuilder::client(), &[]).await;
    let stream = conn.open_stream(get_request("/"), false).await.unwrap();
    peer.read_headers().await;

    conn.shutdown(ErrorCode::NoError).await.unwrap();
    let goaway = peer.expect_frame(GOAWAY).await;
    assert_eq!(goaway.u32_at(0), 0);
    assert_eq!(goaway.u32_at(4), ErrorCode::NoError.as_u32());
    assert!(conn.is_shutdown());
    assert!(!conn.is_closed());

    // In-flight stream still completes.
    peer.send_headers(1, &mock_peer::ok_response(), false)
        .await
        .unwrap();
    peer.send_data(1, b"done", true).await.unwrap();
    stream.take_headers().await.unwrap();
    assert_eq!(&stream.read_to_end().await.unwrap()[..], b"done");

    assert!(matches!(
        conn.open_stream(get_request("/"), false).await,
        Err(Error::Shutdown)
    ));
}

#[tokio::test]
async fn test_close_resets_streams_and_closes_transport() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("trace")
        .try_init();

    let (conn, peer) = client_with(ConnectionBuilder::client(), &[]).await;
    let stream = conn.open_stream(get_request("/"), false).await.unwrap();
    peer.read_headers().await;

    let reader = tokio::spawn(async move { stream.read(16).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    conn.close().await;

    match timeout(Duration::from_secs(5), reader).await.unwrap().unwrap() {
        Err(Error::StreamReset {
            code: ErrorCode::Cancel,
            ..
        }) => {}
        other => panic!("expected CANCEL reset, got {:?}", other),
    }
    peer.expect_frame(GOAWAY).await;

    // Transport is shut down after GOAWAY.
    let eof = timeout(Duration::from_secs(5), peer.read_frame())
        .await
        .expect("transport closed");
    assert!(eof.is_err());
    assert_eq!(conn.open_stream_count(), 0);
}

#[tokio::test]
async fn test_peer_eof_closes_connection() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("trace")
        .try_init();

    let (conn, peer) = client_with(ConnectionBuilder::client(), &[]).await;
    let stream = conn.open_stream(get_request("/"), false).await.unwrap();
    peer.read_headers().await;
    drop(peer);

    let reason = timeout(Duration::from_secs(5), conn.closed())
        .await
        .expect("connection closed");
    assert!(matches!(reason, Error::ConnectionClosed(_)));
    assert!(stream.take_headers().await.is_err());
}

#[tokio::test]
async fn test_oversized_frame_is_connection_error() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("trace")
        .try_init();

    let (conn, peer) = client_with(ConnectionBuilder::client(), &[]).await;
    let stream = conn.open_stream(get_request("/"), false).await.unwrap();
    peer.read_headers().await;
    peer.send_headers(1, &mock_peer::ok_response(), false)
        .await
        .unwrap();

    // Our advertised max frame size is the default 16384.
    peer.send_data(1, &[0u8; 16_385], false).await.unwrap();

    let goaway = peer.expect_frame(GOAWAY).await;
    assert_eq!(goaway.u32_at(4), ErrorCode::FrameSizeError.as_u32());
    let reason = timeout(Duration::from_secs(5), conn.closed()).await.unwrap();
    assert_eq!(reason.code(), ErrorCode::FrameSizeError);

    match stream.read(16).await {
        Err(Error::StreamReset {
            code: ErrorCode::ProtocolError,
            ..
        }) => {}
        other => panic!("expected PROTOCOL_ERROR reset, got {:?}", other),
    }
}

#[tokio::test]
async fn test_zero_connection_window_update_is_protocol_error() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("trace")
        .try_init();

    let (conn, peer) = client_with(ConnectionBuilder::client(), &[]).await;
    peer.send_window_update(0, 0).await.unwrap();

    let goaway = peer.expect_frame(GOAWAY).await;
    assert_eq!(goaway.u32_at(4), ErrorCode::ProtocolError.as_u32());
    let reason = timeout(Duration::from_secs(5), conn.closed()).await.unwrap();
    assert_eq!(reason.code(), ErrorCode::ProtocolError);
}

#[tokio::test]
async fn test_interleaved_continuation_is_protocol_error() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("trace")
        .try_init();

    let (conn, peer) = client_with(ConnectionBuilder::client(), &[]).await;
    let _stream = conn.open_stream(get_request("/"), false).await.unwrap();
    peer.read_headers().await;

    // HEADERS without END_HEADERS, then a PING instead of CONTINUATION.
    peer.send_frame(mock_peer::HEADERS, 0, 1, &[0x88])
        .await
        .unwrap();
    peer.send_ping(*b"xxxxxxxx", false).await.unwrap();

    let goaway = peer.expect_frame(GOAWAY).await;
    assert_eq!(goaway.u32_at(4), ErrorCode::ProtocolError.as_u32());
    assert!(timeout(Duration::from_secs(5), conn.closed()).await.is_ok());
}

#[tokio::test]
async fn test_invalid_peer_settings_close_connection() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("trace")
        .try_init();

    let (conn, peer) = client_with(ConnectionBuilder::client(), &[]).await;
    // INITIAL_WINDOW_SIZE above 2^31-1.
    peer.send_settings(&[(0x4, 0x8000_0000)]).await.unwrap();

    let goaway = peer.expect_frame(GOAWAY).await;
    assert_eq!(goaway.u32_at(4), ErrorCode::FlowControlError.as_u32());
    let reason = timeout(Duration::from_secs(5), conn.closed()).await.unwrap();
    assert_eq!(reason.code(), ErrorCode::FlowControlError);
}
