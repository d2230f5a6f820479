//! Tests for per-stream flow control

use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use wsmux::{reset_code, Config, Error, Frame, WriteError};

use crate::support::*;

#[tokio::test]
async fn test_writer_respects_peer_window() {
    let (mut peer, server) = raw_client(Config {
        stream_buffer_size: 1000,
        ..quiet_config()
    })
    .await;
    peer.send(Frame::Open {
        stream_id: 1,
        window: 1000,
    })
    .await;

    let mut stream = within(server.accept()).await.unwrap();
    let data = pattern(5, 5000);
    let expected = data.clone();
    let writer = tokio::spawn(async move {
        stream.write(&data).await.unwrap();
        stream
    });

    let mut received = Vec::new();
    while received.len() < 1000 {
        match peer.recv().await {
            Frame::Data { stream_id, payload } => {
                assert_eq!(stream_id, 1);
                received.extend_from_slice(&payload);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }
    assert_eq!(received.len(), 1000);
    peer.expect_silence(Duration::from_millis(200)).await;
    assert!(!writer.is_finished());

    peer.send(Frame::WindowUpdate {
        stream_id: 1,
        increment: 4000,
    })
    .await;
    while received.len() < 5000 {
        match peer.recv().await {
            Frame::Data { payload, .. } => received.extend_from_slice(&payload),
            other => panic!("unexpected frame {:?}", other),
        }
    }
    within(writer).await.unwrap();
    assert_eq!(received, expected);
}

#[tokio::test]
async fn test_window_update_after_half_buffer_read() {
    let (mut peer, server) = raw_client(Config {
        stream_buffer_size: 1024,
        ..quiet_config()
    })
    .await;
    peer.send(Frame::Open {
        stream_id: 1,
        window: 1024,
    })
    .await;
    peer.send(Frame::Data {
        stream_id: 1,
        payload: Bytes::from(vec![7u8; 1024]),
    })
    .await;

    let mut stream = within(server.accept()).await.unwrap();
    let mut buf = vec![0u8; 400];
    assert_eq!(within(stream.read(&mut buf)).await.unwrap(), 400);
    // Below half the buffer: nothing advertised yet.
    peer.expect_silence(Duration::from_millis(100)).await;

    assert_eq!(within(stream.read(&mut buf)).await.unwrap(), 400);
    assert_eq!(
        peer.recv().await,
        Frame::WindowUpdate {
            stream_id: 1,
            increment: 800
        }
    );
}

#[tokio::test]
async fn test_slow_reader_does_not_block_siblings() {
    let (client, server) = session_pair(Config::with_stream_buffer_size(4096)).await;

    let mut slow = client.open().unwrap();
    let mut fast = client.open().unwrap();

    let bulk = pattern(9, 64 * 1024);
    let expected = bulk.clone();
    let slow_writer = tokio::spawn(async move {
        slow.write(&bulk).await.unwrap();
        slow.close().unwrap();
    });

    fast.write(b"not stuck").await.unwrap();
    fast.close().unwrap();

    let mut slow_in = within(server.accept()).await.unwrap();
    let mut fast_in = within(server.accept()).await.unwrap();

    let mut buf = [0u8; 64];
    let n = within(fast_in.read(&mut buf)).await.unwrap();
    assert_eq!(&buf[..n], b"not stuck");
    assert!(!slow_writer.is_finished());

    let mut received = Vec::new();
    let mut chunk = vec![0u8; 1000];
    loop {
        let n = within(slow_in.read(&mut chunk)).await.unwrap();
        if n == 0 {
            break;
        }
        received.extend_from_slice(&chunk[..n]);
    }
    within(slow_writer).await.unwrap();
    assert_eq!(received, expected);
}

#[tokio::test]
async fn test_dropped_stream_returns_window() {
    let (client, server) = session_pair(Config::with_stream_buffer_size(1024)).await;
    let mut outgoing = client.open().unwrap();
    outgoing.write(b"first").await.unwrap();

    let incoming = within(server.accept()).await.unwrap();
    drop(incoming);

    // Far more than one window: only completes if discarded data is credited back.
    let data = pattern(4, 16 * 1024);
    within(outgoing.write(&data)).await.unwrap();

    let mut buf = [0u8; 8];
    assert_eq!(within(outgoing.read(&mut buf)).await.unwrap(), 0);
    outgoing.close().unwrap();
    eventually(|| server.num_streams() == 0).await;
}

async fn stalled_writer(
    peer: &mut RawPeer,
    server: &wsmux::Session,
) -> tokio::task::JoinHandle<Result<usize, WriteError>> {
    peer.send(Frame::Open {
        stream_id: 1,
        window: 1000,
    })
    .await;
    let mut stream = within(server.accept()).await.unwrap();
    let writer = tokio::spawn(async move { stream.write(&pattern(6, 5000)).await });

    match peer.recv().await {
        Frame::Data { payload, .. } => assert_eq!(payload.len(), 1000),
        other => panic!("unexpected frame {:?}", other),
    }
    peer.expect_silence(Duration::from_millis(100)).await;
    writer
}

#[tokio::test]
async fn test_blocked_write_reports_partial_on_reset() {
    let (mut peer, server) = raw_client(Config {
        stream_buffer_size: 1000,
        ..quiet_config()
    })
    .await;
    let writer = stalled_writer(&mut peer, &server).await;

    peer.send(Frame::Reset {
        stream_id: 1,
        code: reset_code::CANCEL,
    })
    .await;
    let err = within(writer).await.unwrap().unwrap_err();
    assert_eq!(err.written, 1000);
    assert!(matches!(err.source, Error::StreamReset));
}

#[tokio::test]
async fn test_blocked_write_reports_partial_on_teardown() {
    let (mut peer, server) = raw_client(Config {
        stream_buffer_size: 1000,
        ..quiet_config()
    })
    .await;
    let writer = stalled_writer(&mut peer, &server).await;

    server.close().await.unwrap();
    let err = within(writer).await.unwrap().unwrap_err();
    assert_eq!(err.written, 1000);
    assert!(matches!(err.source, Error::SessionClosed));
}

#[tokio::test]
async fn test_larger_acceptor_buffer_is_granted() {
    let (mut peer, _server) = raw_client(Config {
        stream_buffer_size: 4096,
        ..quiet_config()
    })
    .await;
    peer.send(Frame::Open {
        stream_id: 1,
        window: 1024,
    })
    .await;

    assert_eq!(
        peer.recv().await,
        Frame::WindowUpdate {
            stream_id: 1,
            increment: 3072
        }
    );
}

#[tokio::test]
async fn test_unequal_buffer_sizes_do_not_overrun() {
    init_tracing();
    let (a, b) = ws_pair().await;
    let client = wsmux::Session::client(a, Config::with_stream_buffer_size(64 * 1024)).unwrap();
    let server = wsmux::Session::server(b, Config::with_stream_buffer_size(1024)).unwrap();

    // The whole opener window goes out before the acceptor reads anything.
    let data = pattern(8, 64 * 1024);
    let mut outgoing = client.open().unwrap();
    within(outgoing.write(&data)).await.unwrap();
    outgoing.close().unwrap();

    let mut incoming = within(server.accept()).await.unwrap();
    let mut received = Vec::new();
    within(incoming.read_to_end(&mut received)).await.unwrap();
    assert_eq!(received, data);
    assert!(!incoming.is_reset());
}
