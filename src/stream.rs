//! Logical streams.
//!
//! A [`Stream`] is the caller's handle. Its state lives in a [`StreamShared`]
//! that is also referenced from the session's stream table, so the demux
//! task can deliver data and control signals while callers read and write.
//! All mutation happens under the per-stream lock. Blocked readers and
//! writers park a waker that the other side wakes.

use std::collections::VecDeque;
use std::fmt;
use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll, Waker};

use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, trace};

use crate::error::{Error, Result, WriteError};
use crate::flow::{FlowError, FlowWindow};
use crate::frame::{reset_code, Frame};
use crate::session::Shared;

/// Result of handing an inbound DATA payload to a stream.
#[derive(Debug)]
pub(crate) enum Delivery {
    Buffered,
    /// Nobody will read it. Carries the window to hand straight back.
    Discarded(Option<u32>),
    Violation { code: u32, reason: String },
}

#[derive(Debug)]
struct StreamState {
    buffer: VecDeque<Bytes>,
    buffered: usize,
    window: FlowWindow,
    local_closed: bool,
    remote_closed: bool,
    reset: bool,
    /// The handle was dropped; inbound data is discarded.
    detached: bool,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

impl StreamState {
    fn wake_reader(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }

    fn wake_writer(&mut self) {
        if let Some(waker) = self.write_waker.take() {
            waker.wake();
        }
    }

    fn discard_buffer(&mut self) -> usize {
        let discarded = self.buffered;
        self.buffer.clear();
        self.buffered = 0;
        discarded
    }
}

/// Stream state shared between a [`Stream`] handle and the session.
#[derive(Debug)]
pub(crate) struct StreamShared {
    id: u32,
    state: Mutex<StreamState>,
}

impl StreamShared {
    pub(crate) fn new(id: u32, buffer_size: u32, peer_window: u32) -> Self {
        Self {
            id,
            state: Mutex::new(StreamState {
                buffer: VecDeque::new(),
                buffered: 0,
                window: FlowWindow::new(buffer_size, peer_window),
                local_closed: false,
                remote_closed: false,
                reset: false,
                detached: false,
                read_waker: None,
                write_waker: None,
            }),
        }
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn push_data(&self, payload: Bytes) -> Delivery {
        let mut st = self.state.lock();
        if st.reset {
            return Delivery::Discarded(None);
        }
        if st.remote_closed {
            return Delivery::Violation {
                code: reset_code::PROTOCOL_ERROR,
                reason: "data after close".to_string(),
            };
        }

        let len = payload.len() as u32;
        if let Err(err) = st.window.on_receive(len) {
            return Delivery::Violation {
                code: reset_code::FLOW_CONTROL_ERROR,
                reason: err.to_string(),
            };
        }

        if st.detached {
            return Delivery::Discarded(st.window.release(len));
        }
        if !payload.is_empty() {
            st.buffered += payload.len();
            st.buffer.push_back(payload);
            st.wake_reader();
        }
        Delivery::Buffered
    }

    pub(crate) fn add_credit(&self, increment: u32) -> std::result::Result<(), FlowError> {
        let mut st = self.state.lock();
        st.window.replenish(increment)?;
        st.wake_writer();
        Ok(())
    }

    /// Peer finished writing. Returns true when both directions are done.
    pub(crate) fn remote_close(&self) -> bool {
        let mut st = self.state.lock();
        st.remote_closed = true;
        st.wake_reader();
        st.local_closed
    }

    /// Abort the stream: drop buffered data and fail pending calls.
    pub(crate) fn terminate(&self) {
        let mut st = self.state.lock();
        st.reset = true;
        st.discard_buffer();
        st.wake_reader();
        st.wake_writer();
    }
}

/// One logical bidirectional byte stream within a [`Session`](crate::Session).
///
/// Reads and writes take `&mut self`; use [`tokio::io::split`] to drive both
/// directions from different tasks. Dropping the handle half-closes the
/// stream and discards anything the peer still sends.
pub struct Stream {
    inner: Arc<StreamShared>,
    session: Arc<Shared>,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream").field("id", &self.inner.id).finish()
    }
}

impl Stream {
    pub(crate) fn new(inner: Arc<StreamShared>, session: Arc<Shared>) -> Self {
        Self { inner, session }
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// True once the stream was reset by either side or by session teardown.
    pub fn is_reset(&self) -> bool {
        self.inner.state.lock().reset
    }

    /// Read into `buf`, waiting for data if none is buffered.
    ///
    /// Returns `Ok(0)` at end of stream, once the peer closed its side and
    /// everything it sent has been read.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        poll_fn(|cx| self.poll_read_inner(cx, buf)).await
    }

    /// Hand all of `data` to the session, waiting for flow-control credit as
    /// needed. On failure the error reports how many bytes were enqueued.
    pub async fn write(&mut self, data: &[u8]) -> std::result::Result<usize, WriteError> {
        let mut written = 0;
        loop {
            let n = poll_fn(|cx| self.poll_write_inner(cx, &data[written..]))
                .await
                .map_err(|source| WriteError { written, source })?;
            written += n;
            if written == data.len() {
                return Ok(written);
            }
        }
    }

    /// Half-close: no more writes from this side. Buffered inbound data stays
    /// readable. Closing again is a no-op.
    pub fn close(&self) -> Result<()> {
        let retire = {
            let mut st = self.inner.state.lock();
            if st.local_closed {
                return Ok(());
            }
            if self.session.is_closed() {
                return Err(Error::SessionClosed);
            }
            if st.reset {
                return Ok(());
            }
            st.local_closed = true;
            st.wake_writer();
            self.session.send(Frame::Close {
                stream_id: self.inner.id,
            });
            st.remote_closed
        };
        debug!(stream_id = self.inner.id, "stream closed for writing");
        if retire {
            self.session.retire(self.inner.id);
        }
        Ok(())
    }

    /// Abort the stream in both directions and tell the peer.
    pub fn reset(&self) {
        {
            let mut st = self.inner.state.lock();
            if st.reset {
                return;
            }
            st.reset = true;
            st.discard_buffer();
            st.wake_reader();
            st.wake_writer();
        }
        debug!(stream_id = self.inner.id, "stream reset locally");
        self.session.retire(self.inner.id);
        self.session.send(Frame::Reset {
            stream_id: self.inner.id,
            code: reset_code::CANCEL,
        });
    }

    fn poll_read_inner(&self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<Result<usize>> {
        let mut st = self.inner.state.lock();
        if st.reset {
            return Poll::Ready(Err(Error::StreamReset));
        }
        if st.buffered == 0 {
            if st.remote_closed || buf.is_empty() {
                return Poll::Ready(Ok(0));
            }
            st.read_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let mut copied = 0;
        while copied < buf.len() {
            let Some(chunk) = st.buffer.front_mut() else {
                break;
            };
            let n = chunk.len().min(buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&chunk[..n]);
            chunk.advance(n);
            if chunk.is_empty() {
                st.buffer.pop_front();
            }
            copied += n;
        }
        st.buffered -= copied;

        let update = st.window.on_consume(copied as u32);
        if let Some(increment) = update.filter(|_| !st.remote_closed) {
            trace!(stream_id = self.inner.id, increment, "granting window");
            self.session.send(Frame::WindowUpdate {
                stream_id: self.inner.id,
                increment,
            });
        }
        Poll::Ready(Ok(copied))
    }

    fn poll_write_inner(&self, cx: &mut Context<'_>, data: &[u8]) -> Poll<Result<usize>> {
        let mut st = self.inner.state.lock();
        if st.local_closed {
            return Poll::Ready(Err(Error::StreamClosed));
        }
        if self.session.is_closed() {
            return Poll::Ready(Err(Error::SessionClosed));
        }
        if st.reset {
            return Poll::Ready(Err(Error::StreamReset));
        }
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let credit = st.window.send_credit();
        if credit == 0 {
            trace!(stream_id = self.inner.id, "write blocked on window");
            st.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let n = data
            .len()
            .min(credit as usize)
            .min(self.session.max_frame_payload() as usize);
        st.window.consume_send(n as u32);
        // Sent under the lock so frames of one stream keep their order.
        self.session.send(Frame::Data {
            stream_id: self.inner.id,
            payload: Bytes::copy_from_slice(&data[..n]),
        });
        Poll::Ready(Ok(n))
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let (send_close, update, retire) = {
            let mut st = self.inner.state.lock();
            st.detached = true;
            if st.reset {
                return;
            }
            let discarded = st.discard_buffer() as u32;
            let update = if st.remote_closed {
                None
            } else {
                st.window.release(discarded)
            };
            let send_close = !st.local_closed;
            st.local_closed = true;
            (send_close, update, st.remote_closed)
        };

        if self.session.is_closed() {
            return;
        }
        if let Some(increment) = update {
            self.session.send(Frame::WindowUpdate {
                stream_id: self.inner.id,
                increment,
            });
        }
        if send_close {
            self.session.send(Frame::Close {
                stream_id: self.inner.id,
            });
        }
        if retire {
            self.session.retire(self.inner.id);
        }
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match ready!(self.poll_read_inner(cx, buf.initialize_unfilled())) {
            Ok(n) => {
                buf.advance(n);
                Poll::Ready(Ok(()))
            }
            Err(err) => Poll::Ready(Err(err.into())),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.poll_write_inner(cx, data).map_err(Into::into)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Writes are already queued on the session.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.close().map_err(Into::into))
    }
}
