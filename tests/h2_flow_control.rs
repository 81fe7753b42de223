//! HTTP/2 flow control tests.
//!
//! Verifies DATA framing against the peer's max frame size, blocking on
//! exhausted send windows, the half-window WINDOW_UPDATE watermark and
//! FLOW_CONTROL_ERROR on receive-window overflow.

use std::time::Duration;

use h2mux::{ConnectionBuilder, Error, ErrorCode, Initiator};
use tokio::time::timeout;

mod helpers;
use helpers::mock_peer::{
    self, client_with, eventually, ok_response, post_request, DATA, END_STREAM,
};

#[tokio::test]
async fn test_upload_split_at_max_frame_size() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("trace")
        .try_init();

    let (io, peer) = mock_peer::MockPeer::pair();
    let conn = ConnectionBuilder::client()
        .initial_window_size(1_048_576)
        .handshake(io)
        .await
        .unwrap();

    let client_settings = peer.accept_client(&[]).await;
    assert!(client_settings.contains(&(0x4, 1_048_576)));
    assert!(client_settings.contains(&(0x2, 0)));

    // Local window above the default is advertised on the connection too.
    let update = peer.expect_frame(mock_peer::WINDOW_UPDATE).await;
    assert_eq!(update.stream_id, 0);
    assert_eq!(update.u32_at(0), 1_048_576 - 65_535);

    let stream = conn.open_stream(post_request("/upload"), true).await.unwrap();
    assert_eq!(stream.id(), 1);
    let (id, headers, end_stream) = peer.read_headers().await;
    assert_eq!(id, 1);
    assert!(!end_stream);
    assert_eq!(h2mux::h2::find(&headers, ":method"), Some("POST"));

    stream.write(&[7u8; 20_000]).await.unwrap();
    stream.close_write().await.unwrap();

    let first = peer.expect_frame(DATA).await;
    assert_eq!(first.stream_id, 1);
    assert_eq!(first.payload.len(), 16_384);
    assert!(!first.has_flag(END_STREAM));

    let second = peer.expect_frame(DATA).await;
    assert_eq!(second.payload.len(), 3_616);
    assert!(second.has_flag(END_STREAM));

    peer.send_headers(1, &ok_response(), false).await.unwrap();
    peer.send_data(1, b"stored", true).await.unwrap();

    let response = stream.take_headers().await.unwrap();
    assert_eq!(h2mux::h2::status(&response), Some(http::StatusCode::OK));
    assert_eq!(&stream.read_to_end().await.unwrap()[..], b"stored");
    assert!(stream.is_closed());
    assert_eq!(conn.open_stream_count(), 0);
}

#[tokio::test]
async fn test_writer_blocks_on_connection_window() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("trace")
        .try_init();

    // Large stream window; the connection window (65535) is the limit.
    let (conn, peer) = client_with(ConnectionBuilder::client(), &[(0x4, 1_000_000)]).await;

    let stream = conn.open_stream(post_request("/upload"), true).await.unwrap();
    peer.read_headers().await;

    let body_size = 100_000usize;
    let writer = tokio::spawn(async move {
        stream.write(&vec![1u8; body_size]).await?;
        stream.close_write().await?;
        Ok::<_, Error>(stream)
    });

    let mut received = 0usize;
    while received < 65_535 {
        let frame = peer.expect_frame(DATA).await;
        received += frame.payload.len();
    }
    assert_eq!(received, 65_535);

    // Window exhausted: nothing more until credit arrives.
    let extra = peer.drain_for(Duration::from_millis(150)).await;
    assert!(
        extra.iter().all(|f| f.frame_type != DATA),
        "DATA sent with an exhausted connection window"
    );

    peer.send_window_update(0, 40_000).await.unwrap();

    loop {
        let frame = peer.expect_frame(DATA).await;
        received += frame.payload.len();
        if frame.has_flag(END_STREAM) {
            break;
        }
    }
    assert_eq!(received, body_size);

    let stream = timeout(Duration::from_secs(5), writer)
        .await
        .expect("writer finished")
        .unwrap()
        .unwrap();
    assert!(!stream.is_closed());
}

#[tokio::test]
async fn test_half_window_triggers_single_update() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("trace")
        .try_init();

    let (conn, peer) = client_with(ConnectionBuilder::client(), &[]).await;
    let stream = conn
        .open_stream(mock_peer::get_request("/large"), false)
        .await
        .unwrap();
    peer.read_headers().await;

    peer.send_headers(1, &ok_response(), false).await.unwrap();
    stream.take_headers().await.unwrap();

    peer.send_data(1, &[0u8; 16_384], false).await.unwrap();
    let mut read = 0;
    while read < 16_384 {
        read += stream.read(usize::MAX).await.unwrap().unwrap().len();
    }
    let updates: Vec<_> = peer
        .drain_for(Duration::from_millis(100))
        .await
        .into_iter()
        .filter(|f| f.frame_type == mock_peer::WINDOW_UPDATE)
        .collect();
    assert!(updates.is_empty(), "update before half the window: {:?}", updates);

    // 16384 + 16383 = 32767 = 65535 / 2
    peer.send_data(1, &[0u8; 16_383], false).await.unwrap();
    while read < 32_767 {
        read += stream.read(usize::MAX).await.unwrap().unwrap().len();
    }
    let updates: Vec<_> = peer
        .drain_for(Duration::from_millis(150))
        .await
        .into_iter()
        .filter(|f| f.frame_type == mock_peer::WINDOW_UPDATE)
        .collect();

    let stream_updates: Vec<_> = updates.iter().filter(|f| f.stream_id == 1).collect();
    assert_eq!(stream_updates.len(), 1);
    assert_eq!(stream_updates[0].u32_at(0), 32_767);
    let conn_updates: Vec<_> = updates.iter().filter(|f| f.stream_id == 0).collect();
    assert_eq!(conn_updates.len(), 1);
    assert_eq!(conn_updates[0].u32_at(0), 32_767);
}

#[tokio::test]
async fn test_receive_window_overflow_resets_stream() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("trace")
        .try_init();

    let (conn, peer) = client_with(ConnectionBuilder::client(), &[]).await;
    let stream = conn
        .open_stream(mock_peer::get_request("/flood"), false)
        .await
        .unwrap();
    peer.read_headers().await;
    peer.send_headers(1, &ok_response(), false).await.unwrap();
    stream.take_headers().await.unwrap();

    // 4 * 16384 = 65536, one byte past the advertised window.
    for _ in 0..4 {
        peer.send_data(1, &[0u8; 16_384], false).await.unwrap();
    }

    let rst = peer.expect_frame(mock_peer::RST_STREAM).await;
    assert_eq!(rst.stream_id, 1);
    assert_eq!(rst.error_code(), ErrorCode::FlowControlError.as_u32());

    match stream.read(1024).await {
        Err(Error::StreamReset {
            stream_id: 1,
            code: ErrorCode::FlowControlError,
            initiator: Initiator::Local,
        }) => {}
        other => panic!("expected local FLOW_CONTROL_ERROR reset, got {:?}", other),
    }

    // Other streams are unaffected.
    assert!(!conn.is_closed());
    let next = conn
        .open_stream(mock_peer::get_request("/next"), false)
        .await
        .unwrap();
    assert_eq!(next.id(), 3);
}

#[tokio::test]
async fn test_settings_window_change_adjusts_open_streams() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("trace")
        .try_init();

    // Peer starts with a tiny stream window.
    let (conn, peer) = client_with(ConnectionBuilder::client(), &[(0x4, 100)]).await;
    eventually(|| conn.peer_settings().initial_window_size() == 100).await;
    let stream = conn.open_stream(post_request("/small"), true).await.unwrap();
    peer.read_headers().await;

    let writer = tokio::spawn(async move {
        stream.write(&[9u8; 300]).await?;
        stream.close_write().await?;
        Ok::<_, Error>(())
    });

    let frame = peer.expect_frame(DATA).await;
    assert_eq!(frame.payload.len(), 100);
    assert!(!frame.has_flag(END_STREAM));

    // Raising INITIAL_WINDOW_SIZE credits the open stream by the delta.
    peer.send_settings(&[(0x4, 400)]).await.unwrap();

    let frame = peer.expect_frame(DATA).await;
    assert_eq!(frame.payload.len(), 200);
    assert!(frame.has_flag(END_STREAM));

    timeout(Duration::from_secs(5), writer)
        .await
        .expect("writer finished")
        .unwrap()
        .unwrap();
}
