//! Shared fixtures: in-memory websocket pairs and a raw frame-level peer.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing_subscriber::EnvFilter;
use wsmux::{Config, Frame, Session};

pub type Ws = WebSocketStream<DuplexStream>;

/// Window raw peers advertise, matching the default buffer size.
pub const WINDOW: u32 = 64 * 1024;

/// Generous bound for anything that should happen promptly.
pub const STEP: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Two connected websocket endpoints over an in-memory pipe.
pub async fn ws_pair() -> (Ws, Ws) {
    let (a, b) = tokio::io::duplex(1 << 20);
    let (client, server) = tokio::join!(
        tokio_tungstenite::client_async("ws://localhost/", a),
        tokio_tungstenite::accept_async(b),
    );
    (client.unwrap().0, server.unwrap())
}

/// Liveness disabled so raw peers only see the frames a test provokes.
pub fn quiet_config() -> Config {
    Config {
        keep_alive_interval: None,
        idle_timeout: None,
        ..Config::default()
    }
}

pub async fn session_pair(config: Config) -> (Session, Session) {
    init_tracing();
    let (a, b) = ws_pair().await;
    let client = Session::client(a, config.clone()).unwrap();
    let server = Session::server(b, config).unwrap();
    (client, server)
}

pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(STEP, fut)
        .await
        .expect("timed out waiting")
}

/// Poll `cond` until it holds or `STEP` elapses.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    within(async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

/// Deterministic test payload.
pub fn pattern(seed: u32, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            (state >> 16) as u8
        })
        .collect()
}

/// A peer speaking frames directly, for provoking protocol edge cases.
pub struct RawPeer {
    ws: Ws,
}

impl RawPeer {
    pub async fn send(&mut self, frame: Frame) {
        self.ws.send(Message::Binary(frame.encode())).await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &'static [u8]) {
        self.ws
            .send(Message::Binary(Bytes::from_static(bytes)))
            .await
            .unwrap();
    }

    /// Write bytes straight onto the connection, bypassing websocket framing.
    pub async fn send_bytes_unframed(&mut self, bytes: &[u8]) {
        let io = self.ws.get_mut();
        io.write_all(bytes).await.unwrap();
        io.flush().await.unwrap();
    }

    /// Next frame, or `None` once the websocket is closed.
    pub async fn try_recv(&mut self) -> Option<Frame> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Binary(data)) => return Some(Frame::decode(data).unwrap()),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    pub async fn recv(&mut self) -> Frame {
        within(self.try_recv()).await.expect("websocket closed")
    }

    /// Assert nothing arrives for `quiet`.
    pub async fn expect_silence(&mut self, quiet: Duration) {
        if let Ok(frame) = tokio::time::timeout(quiet, self.try_recv()).await {
            panic!("expected silence, got {:?}", frame);
        }
    }
}

/// A server session whose client side is driven frame by frame.
pub async fn raw_client(config: Config) -> (RawPeer, Session) {
    init_tracing();
    let (a, b) = ws_pair().await;
    let server = Session::server(b, config).unwrap();
    (RawPeer { ws: a }, server)
}
