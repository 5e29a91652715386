use std::time::Duration;

/// Default server port.
pub const DEFAULT_PORT: u16 = 3000;

/// Declared size meaning "unknown": the body runs until the sender half-closes.
pub const UNKNOWN_SIZE: u64 = u64::MAX;

/// Maximum length of a job id on the wire.
pub const MAX_JOB_ID_LEN: usize = 128;

/// Maximum length of a declared file name on the wire.
pub const MAX_FILE_NAME_LEN: usize = 255;

/// Time allowed for a peer to send a complete request header.
pub const HEADER_TIMEOUT: Duration = Duration::from_secs(10);

/// Request kind byte: upload a file body.
pub const REQUEST_UPLOAD: u8 = 0x01;

/// Request kind byte: subscribe to a job's progress stream.
pub const REQUEST_SUBSCRIBE: u8 = 0x02;

/// Body fully persisted.
pub const STATUS_OK: u16 = 200;

/// Malformed header, invalid name or size policy violation.
pub const STATUS_BAD_REQUEST: u16 = 400;

/// Another upload with the same job id is in flight.
pub const STATUS_CONFLICT: u16 = 409;

/// The sender closed the stream before the body was complete.
pub const STATUS_CLIENT_CLOSED: u16 = 499;

/// Write failure or size mismatch on the server.
pub const STATUS_INTERNAL_ERROR: u16 = 500;
