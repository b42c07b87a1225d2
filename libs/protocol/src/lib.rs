//! Shared wire protocol for the relay push fabric.
//!
//! One crate holds everything both sides of a wire must agree on: the framed
//! client protocol (`proto`), the closed op-code set (`ops`), the queued work
//! item carried on the bus (`push`), and the request/reply messages exchanged
//! between the services over RPC (`rpc`).

pub mod ops;
pub mod proto;
pub mod push;
pub mod rpc;

pub use proto::{Proto, ProtoError, HEADER_SIZE, MAX_BODY_SIZE};
