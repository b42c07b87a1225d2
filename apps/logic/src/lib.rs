pub mod config;
pub mod conn;
pub mod error;
pub mod http;
pub mod push;
pub mod rpc;
pub mod store;

use std::sync::Arc;

use config::Config;
use conn::Logic;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub logic: Arc<Logic>,
    pub config: Arc<Config>,
}
