use std::time::Duration;

use crate::error::{Error, Result};

/// Session tunables, fixed for the lifetime of a session.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bytes of inbound buffering per stream, and the initial flow-control
    /// window granted to the peer. When peers differ, a stream buffers up to
    /// the larger of the two sizes on the accepting side.
    /// Default: 64 KiB
    pub stream_buffer_size: u32,

    /// Remote-opened streams that may wait for `accept` before the oldest is
    /// refused.
    /// Default: 128
    pub accept_backlog: usize,

    /// Largest payload carried by one DATA frame.
    /// Default: 16 KiB
    pub max_frame_payload: u32,

    /// Interval between liveness pings. `None` disables them.
    /// Default: 30s
    pub keep_alive_interval: Option<Duration>,

    /// Tear the session down when nothing arrives for this long.
    /// Default: 90s
    pub idle_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stream_buffer_size: 64 * 1024,
            accept_backlog: 128,
            max_frame_payload: 16 * 1024,
            keep_alive_interval: Some(Duration::from_secs(30)),
            idle_timeout: Some(Duration::from_secs(90)),
        }
    }
}

impl Config {
    /// Config with the given per-stream buffer size and defaults elsewhere.
    pub fn with_stream_buffer_size(stream_buffer_size: u32) -> Self {
        Self {
            stream_buffer_size,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.stream_buffer_size == 0 {
            return Err(Error::InvalidConfig("stream_buffer_size must be positive"));
        }
        if self.accept_backlog == 0 {
            return Err(Error::InvalidConfig("accept_backlog must be positive"));
        }
        if self.max_frame_payload == 0 {
            return Err(Error::InvalidConfig("max_frame_payload must be positive"));
        }
        if self.keep_alive_interval.is_some_and(|d| d.is_zero()) {
            return Err(Error::InvalidConfig("keep_alive_interval must be non-zero"));
        }
        if self.idle_timeout.is_some_and(|d| d.is_zero()) {
            return Err(Error::InvalidConfig("idle_timeout must be non-zero"));
        }
        Ok(())
    }

    /// Period of the liveness timer, if any liveness feature is enabled.
    pub(crate) fn liveness_period(&self) -> Option<Duration> {
        match (self.keep_alive_interval, self.idle_timeout) {
            (Some(ping), Some(idle)) => Some(ping.min(idle)),
            (Some(ping), None) => Some(ping),
            (None, Some(idle)) => Some(idle / 2),
            (None, None) => None,
        }
    }
}
