/// Application name
pub const APP_NAME: &str = "Causerie";

/// Path of the broker's WebSocket endpoint
pub const WS_PATH: &str = "/chat-websocket";

/// Default HTTP port of the broker
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Sender name the broker uses for presence snapshots
pub const SYSTEM_SENDER: &str = "System";

/// Maximum file attachment size in bytes (50 MiB)
pub const MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

/// Maximum profile image size in bytes (100 KiB)
pub const MAX_PROFILE_IMAGE_SIZE: usize = 100 * 1024;

/// Maximum display name length in characters
pub const MAX_USER_NAME_LEN: usize = 64;

/// An unanswered incoming call is rejected after this many seconds
pub const RING_TIMEOUT_SECS: u64 = 30;

/// Fixed delay between connection attempts
pub const RECONNECT_DELAY_SECS: u64 = 5;

/// Time allowed for the broker handshake after the socket opens
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Public STUN servers used for ICE gathering
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];
