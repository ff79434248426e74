/// Default coordinator session timeout in milliseconds.
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 30_000;
/// Default queue-deadline horizon in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;
/// Service deadline disabled by default.
pub const DEFAULT_RESPONSE_GENERATION_TIMEOUT_MS: i64 = -1;
/// Default worker pool shape.
pub const DEFAULT_CORE_POOL_SIZE: usize = 4;
pub const DEFAULT_MAX_POOL_SIZE: usize = 16;
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1_000;
/// Default rolling statistics window in milliseconds.
pub const DEFAULT_STATISTICS_WINDOW_MS: u64 = 60_000;

/// Server configuration.
///
/// Everything a [`NetworkServer`](crate::NetworkServer) needs beyond its
/// collaborators. The defaults are the framework constants; production
/// deployments normally override at least the identity fields and the pool
/// shape.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Service identity used in statistics and logs
    pub service_name: String,
    /// Identity of this process within the service
    pub client_name: String,
    /// Connect string handed to the coordinator implementation
    pub coordinator_connect_string: String,
    /// Coordinator session timeout; also scales the shutdown drain pause
    pub coordinator_session_timeout_ms: u64,
    /// Queue-deadline horizon: requests older than this are shed at
    /// dequeue instead of executed
    pub request_timeout_ms: u64,
    /// Service deadline: a handler running past this is abandoned and the
    /// request completes with a timeout. Disabled when `<= 0`.
    pub response_generation_timeout_ms: i64,
    /// Workers kept alive even when idle
    pub request_thread_core_pool_size: usize,
    /// Upper bound on workers started under load
    pub request_thread_max_pool_size: usize,
    /// Idle time after which a non-core worker exits
    pub request_thread_keep_alive_secs: u64,
    /// Admission queue capacity between core saturation and pool growth
    pub thread_pool_queue_size: usize,
    /// Rolling statistics window in milliseconds
    pub request_statistics_window_ms: u64,
    /// Hand handlers a zero-copy view of the wire payload instead of a
    /// defensive copy
    pub avoid_payload_copy: bool,
    /// Multiplied by the session timeout to produce the pre-close drain
    /// pause on shutdown; `0` disables the pause
    pub shutdown_pause_multiplier: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            service_name: "shardrpc".to_string(),
            client_name: "shardrpc-server".to_string(),
            coordinator_connect_string: String::new(),
            coordinator_session_timeout_ms: DEFAULT_SESSION_TIMEOUT_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            response_generation_timeout_ms: DEFAULT_RESPONSE_GENERATION_TIMEOUT_MS,
            request_thread_core_pool_size: DEFAULT_CORE_POOL_SIZE,
            request_thread_max_pool_size: DEFAULT_MAX_POOL_SIZE,
            request_thread_keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
            thread_pool_queue_size: DEFAULT_QUEUE_CAPACITY,
            request_statistics_window_ms: DEFAULT_STATISTICS_WINDOW_MS,
            avoid_payload_copy: false,
            shutdown_pause_multiplier: 1,
        }
    }
}
