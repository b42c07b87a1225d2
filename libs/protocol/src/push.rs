//! The queued work item carried on the bus between Logic and Job.
//!
//! The `msg` payload is the final wire body the client will see; nothing
//! downstream re-interprets it.

/// Partition name for room work items.
pub const PARTITION_ROOM: &str = "room";
/// Partition name for broadcast work items.
pub const PARTITION_BROADCAST: &str = "broadcast";

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PushMsg {
    #[prost(enumeration = "PushType", tag = "1")]
    pub r#type: i32,
    #[prost(int32, tag = "2")]
    pub operation: i32,
    /// Global messages-per-second pacing hint, BROADCAST only.
    #[prost(int32, tag = "3")]
    pub speed: i32,
    /// Target gateway, PUSH only.
    #[prost(string, tag = "4")]
    pub server: String,
    /// Target room, ROOM only.
    #[prost(string, tag = "5")]
    pub room: String,
    /// Target session keys, PUSH only.
    #[prost(string, repeated, tag = "6")]
    pub keys: Vec<String>,
    #[prost(bytes = "vec", tag = "7")]
    pub msg: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum PushType {
    Push = 0,
    Room = 1,
    Broadcast = 2,
}

impl PushMsg {
    /// The bus partition this work item is keyed by.
    pub fn partition(&self) -> &str {
        match PushType::try_from(self.r#type) {
            Ok(PushType::Push) => &self.server,
            Ok(PushType::Room) => PARTITION_ROOM,
            _ => PARTITION_BROADCAST,
        }
    }
}
