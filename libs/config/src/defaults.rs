//! Default configuration values shared by play nodes

/// Mesh socket defaults
pub mod mesh {
    pub const BIND_ENDPOINT: &str = "127.0.0.1:7100";

    /// Upper bound on one receive call (milliseconds)
    pub const RECEIVE_TIMEOUT_MS: u64 = 100;

    /// Dial attempt timeout (milliseconds)
    pub const CONNECT_TIMEOUT_MS: u64 = 5_000;

    /// Pause between dial attempts (milliseconds)
    pub const RECONNECT_INTERVAL_MS: u64 = 200;

    /// Largest accepted frame part
    pub const MAX_PART_SIZE: usize = 16 * 1024 * 1024;
}

/// Node communicator defaults
pub mod communicator {
    /// Sleep while packets wait for a peer to become ready (milliseconds)
    pub const DEFERRED_BACKOFF_MS: u64 = 1;
}

/// Client session defaults
pub mod session {
    pub const BIND_ENDPOINT: &str = "127.0.0.1:6000";

    /// Largest accepted client frame
    pub const MAX_FRAME_SIZE: usize = 2 * 1024 * 1024;

    /// Message id of the first frame every client must send
    pub const AUTHENTICATE_MSG_ID: &str = "Auth";
}

/// Request/reply defaults
pub mod request {
    /// Deadline for a request without an explicit timeout (milliseconds)
    pub const TIMEOUT_MS: u64 = 30_000;

    /// Interval of the expiry sweep (milliseconds)
    pub const SWEEP_INTERVAL_MS: u64 = 100;
}

/// Node identity defaults
pub mod node {
    pub const SERVER_ID: &str = "play-1";
    pub const SERVICE_ID: u16 = 1;
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub const LOG_LEVEL: &str = "info";
}
