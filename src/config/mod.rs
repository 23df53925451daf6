#[allow(clippy::module_inception)]
mod api_key;
mod config;
mod defaults;

pub use api_key::ApiKey;
pub use config::*;
