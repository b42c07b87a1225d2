//! Infrastructure shared by the relay services: the gateway instance registry
//! used for discovery, and the partitioned bus carrying queued push work from
//! Logic to Job.
//!
//! Both come in two flavors behind the same trait: a Redis-backed
//! implementation for production and an in-memory one for tests.

pub mod bus;
pub mod discovery;

pub use bus::{Bus, BusConsumer, BusError, Delivery, MemoryBus, RedisBus, RedisBusConsumer};
pub use discovery::{Instance, MemoryRegistry, RedisRegistry, Registry, RegistryError};
