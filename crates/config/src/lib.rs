mod auth;
mod backend;
mod duration;
mod error;
mod loader;
mod sanitizer;
mod server;

use std::path::Path;

use serde::Deserialize;

pub use auth::AuthConfig;
pub use backend::BackendConfig;
pub use error::Error;
pub use sanitizer::SanitizerConfig;
pub use server::{HealthConfig, ProtocolConfig, ProtocolsConfig, ServerConfig};

#[derive(Default, Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub sanitizer: SanitizerConfig,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
        loader::load(path)
    }
}
