// ABOUTME: Tunable knobs for a Session, builder-style with spec-mandated defaults

use std::time::Duration;

/// Session-wide tunables. Construct with [`Config::new`] (all defaults) and
/// adjust with the chained `with_*` setters, the way the teacher's
/// `KeepAliveConfig` is built.
///
/// ```
/// use yamux_rs::Config;
/// use std::time::Duration;
///
/// let config = Config::new()
///     .with_accept_backlog(64)
///     .with_keep_alive_interval(Duration::from_secs(15));
/// assert_eq!(config.accept_backlog, 64);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Max concurrent remotely-opened streams counted against the accept
    /// semaphore (released on full stream close, not on accept — see
    /// DESIGN.md).
    pub accept_backlog: usize,
    /// Whether the session emits periodic keep-alive pings.
    pub enable_keep_alive: bool,
    /// Period between keep-alive pings.
    pub keep_alive_interval: Duration,
    /// Max time a single frame write may take before the session is
    /// considered dead.
    pub connection_write_timeout: Duration,
    /// Upper bound on per-stream receive credit.
    pub max_stream_window_size: u32,
    /// A stream stuck in `SynSent` longer than this triggers session
    /// shutdown. Zero disables the timeout.
    pub stream_open_timeout: Duration,
    /// A half-closed stream that never sees the peer's FIN is force-reset
    /// after this long. Zero disables the timeout.
    pub stream_close_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            accept_backlog: 256,
            enable_keep_alive: true,
            keep_alive_interval: Duration::from_secs(30),
            connection_write_timeout: Duration::from_secs(10),
            max_stream_window_size: crate::frame::INITIAL_STREAM_WINDOW,
            stream_open_timeout: Duration::from_secs(300),
            stream_close_timeout: Duration::from_secs(70),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Config::default()
    }

    pub fn with_accept_backlog(mut self, backlog: usize) -> Self {
        self.accept_backlog = backlog;
        self
    }

    pub fn with_keep_alive(mut self, enabled: bool) -> Self {
        self.enable_keep_alive = enabled;
        self
    }

    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_connection_write_timeout(mut self, timeout: Duration) -> Self {
        self.connection_write_timeout = timeout;
        self
    }

    pub fn with_max_stream_window_size(mut self, size: u32) -> Self {
        self.max_stream_window_size = size;
        self
    }

    pub fn with_stream_open_timeout(mut self, timeout: Duration) -> Self {
        self.stream_open_timeout = timeout;
        self
    }

    pub fn with_stream_close_timeout(mut self, timeout: Duration) -> Self {
        self.stream_close_timeout = timeout;
        self
    }
}
