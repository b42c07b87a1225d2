//! Operation codes partitioning messages by type.
//!
//! The low range is reserved for the session protocol itself; application
//! traffic (chat messages, notifications, …) uses producer-chosen codes well
//! above it. Values 10 and 11 are internal sentinels and never appear on the
//! wire.

/// Client handshake: body is the opaque connect token.
pub const OP_AUTH: i32 = 7;
/// Handshake acknowledgement, seq echoed.
pub const OP_AUTH_REPLY: i32 = 8;

/// Client keepalive.
pub const OP_HEARTBEAT: i32 = 2;
/// Keepalive acknowledgement.
pub const OP_HEARTBEAT_REPLY: i32 = 3;

/// Client-originated message, forwarded to Logic.
pub const OP_SEND_MSG: i32 = 4;
/// Acknowledgement for a forwarded message.
pub const OP_SEND_MSG_REPLY: i32 = 5;

/// Server-initiated disconnect notice.
pub const OP_DISCONNECT_REPLY: i32 = 6;

/// The body is pre-encoded final wire payload; forward it byte-for-byte.
pub const OP_RAW: i32 = 9;

/// Internal sentinel: replies are waiting in the inbound ring.
pub const OP_PROTO_READY: i32 = 10;
/// Internal sentinel: the writer should terminate.
pub const OP_PROTO_FINISH: i32 = 11;

/// Join a room (body = room id) or leave all rooms (empty body).
pub const OP_CHANGE_ROOM: i32 = 12;
pub const OP_CHANGE_ROOM_REPLY: i32 = 13;

/// Subscribe to op codes (body = JSON array of i32).
pub const OP_SUB: i32 = 14;
pub const OP_SUB_REPLY: i32 = 15;

/// Unsubscribe from op codes (body = JSON array of i32).
pub const OP_UNSUB: i32 = 16;
pub const OP_UNSUB_REPLY: i32 = 17;
