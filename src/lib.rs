//! wsmux: many ordered byte streams over one websocket
//!
//! This crate multiplexes independent, bidirectional, flow-controlled byte
//! streams over a single long-lived websocket connection. It lets a machine
//! behind NAT or a firewall carry many logical connections through one
//! outbound connection to a public relay.
//!
//! # Features
//!
//! - **One connection, many streams**: a single demux task reads the
//!   websocket and a single writer task writes it; streams never touch the
//!   transport directly
//! - **Per-stream flow control**: a slow reader only stalls its own stream,
//!   and unread data never exceeds `Config::stream_buffer_size`
//! - **Half-close and reset**: streams close each direction independently
//!   and can be aborted without disturbing their siblings
//! - **tokio I/O**: [`Stream`] implements `AsyncRead` and `AsyncWrite`
//! - **Liveness**: optional keep-alive pings and idle timeout
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use wsmux::{Config, Session};
//! # async fn demo(
//! #     client_ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
//! #     server_ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let client = Session::client(client_ws, Config::default())?;
//! let server = Session::server(server_ws, Config::default())?;
//!
//! let mut outgoing = client.open()?;
//! outgoing.write(b"hello").await?;
//! outgoing.close()?;
//!
//! let mut incoming = server.accept().await?;
//! let mut buf = [0u8; 16];
//! let n = incoming.read(&mut buf).await?;
//! assert_eq!(&buf[..n], b"hello");
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`frame`]: stateless codec, one frame per binary websocket message
//! - [`flow`]: per-stream send credit and receive window
//! - [`Stream`]: buffered, flow-controlled logical stream
//! - [`Session`]: stream table, accept backlog, demux and writer tasks
//!
//! It does NOT provide:
//! - The websocket handshake (hand in an upgraded connection)
//! - Encryption (use `wss://`)
//! - Reconnection (the caller builds a new session)

pub mod config;
pub mod error;
pub mod flow;
pub mod frame;
pub mod session;
pub mod stream;

pub use config::Config;
pub use error::{Error, Result, WriteError};
pub use flow::{FlowError, FlowWindow};
pub use frame::{opcode, reset_code, Frame, FrameError, FrameHeader, HEADER_LEN};
pub use session::{CloseReason, Role, Session, Transport};
pub use stream::Stream;
