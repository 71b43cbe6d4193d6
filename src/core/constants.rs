//! Wire and session constants.
//!
//! Values in the wire sections are shared with the game server and MUST NOT be
//! changed. Timeouts are expressed in seconds as `f32` because every timer in
//! the crate is advanced by the tick delta.

// =============================================================================
// WIRE FORMAT
// =============================================================================

/// Protocol version carried in the `VER` header.
pub const PROTOCOL_VERSION: u32 = 1;

/// Receive buffer growth step, and the largest datagram we will send.
pub const UNIT_BUFFER_SIZE: usize = 65536;

/// Header line terminator.
pub const HEADER_DELIMITER: u8 = b'\n';

/// Separator between a header field name and its value.
pub const HEADER_FIELD_DELIMITER: char = ':';

/// Version header field.
pub const VERSION_FIELD: &str = "VER";

/// Body length header field.
pub const LENGTH_FIELD: &str = "LEN";

/// Encryption header field.
pub const ENCRYPTION_FIELD: &str = "ENC";

/// Uncompressed body length header field; present only on compressed bodies.
pub const UNCOMPRESSED_LENGTH_FIELD: &str = "C";

/// HTTP header that carries the `ENC` value on request/response channels.
pub const HTTP_ENCRYPTION_FIELD: &str = "X-iFun-Enc";

/// HTTP header that carries the `C` value on request/response channels.
pub const HTTP_UNCOMPRESSED_LENGTH_FIELD: &str = "X-iFun-C";

/// Path appended to the HTTP endpoint.
pub const HTTP_PATH: &str = "/v1/";

// =============================================================================
// ENCRYPTION HANDSHAKE
// =============================================================================

/// Marker announcing the server's cipher list.
pub const HANDSHAKE_BEGIN: &str = "HELLO!";

/// Separates the cipher code from the cipher-specific header.
pub const ENCRYPTION_TYPE_DELIMITER: char = '-';

/// Separates entries of the handshake cipher list.
pub const ENCRYPTION_LIST_DELIMITER: char = ',';

/// X25519 public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// XChaCha20 nonce size.
pub const AEAD_NONCE_SIZE: usize = 24;

/// Poly1305 authentication tag size.
pub const AEAD_TAG_SIZE: usize = 16;

// =============================================================================
// COMPRESSION
// =============================================================================

/// Bodies shorter than this are sent uncompressed.
pub const COMPRESSION_THRESHOLD: usize = 128;

/// zstd level used for outgoing bodies.
pub const ZSTD_COMPRESSION_LEVEL: i32 = 1;

/// Largest uncompressed length accepted from the peer.
pub const MAX_UNCOMPRESSED_SIZE: usize = 16 * 1024 * 1024;

// =============================================================================
// RESERVED BODY FIELDS
// =============================================================================

/// Message type tag.
pub const MSGTYPE_FIELD: &str = "_msgtype";

/// Session id tag.
pub const SESSION_ID_FIELD: &str = "_sid";

/// Sequence number tag.
pub const SEQ_FIELD: &str = "_seq";

/// Acknowledgment number tag.
pub const ACK_FIELD: &str = "_ack";

/// Timestamp field of ping messages.
pub const PING_TIMESTAMP_FIELD: &str = "timestamp";

// =============================================================================
// RESERVED MESSAGE TYPES
// =============================================================================

/// Empty message used to obtain a session id.
pub const EMPTY_MESSAGE_TYPE: &str = "_empty";

/// Server notification that the session was opened.
pub const SESSION_OPENED_TYPE: &str = "_session_opened";

/// Server notification that the session was closed.
pub const SESSION_CLOSED_TYPE: &str = "_session_closed";

/// Server maintenance notice.
pub const MAINTENANCE_TYPE: &str = "_maintenance";

/// Server-initiated redirect command.
pub const REDIRECT_TYPE: &str = "_sc_redirect";

/// Redirect token upload, and its result.
pub const REDIRECT_CONNECT_TYPE: &str = "_cs_redirect_connect";

/// Ping initiated by the server and echoed by the client.
pub const SERVER_PING_TYPE: &str = "_ping_s";

/// Ping initiated by the client and echoed by the server.
pub const CLIENT_PING_TYPE: &str = "_ping_c";

// =============================================================================
// TIMEOUTS (seconds)
// =============================================================================

/// Silence after which the session id is considered stale.
pub const SESSION_TIMEOUT_SECS: f32 = 3600.0;

/// Time allowed for connect plus encryption handshake.
pub const CONNECT_TIMEOUT_SECS: f32 = 10.0;

/// Time allowed for a redirect to reach a connected target.
pub const REDIRECT_TIMEOUT_SECS: f32 = 10.0;

/// Time a graceful stop waits for unsent data.
pub const WAIT_FOR_STOP_TIMEOUT_SECS: f32 = 3.0;

/// Per-request timeout of the HTTP channel.
pub const HTTP_REQUEST_TIMEOUT_SECS: f32 = 30.0;

/// Ping timeout when pinging is enabled.
pub const PING_TIMEOUT_SECS: f32 = 20.0;

// =============================================================================
// RECONNECT
// =============================================================================

/// First reconnect delay.
pub const RECONNECT_INITIAL_DELAY_SECS: f32 = 1.0;

/// Upper bound of the exponential reconnect delay.
pub const RECONNECT_MAX_DELAY_SECS: f32 = 8.0;

/// Reconnect attempts before the transport gives up.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;
