//! HTTP server configuration settings.

use std::net::SocketAddr;

use secrecy::SecretString;
use serde::Deserialize;

/// HTTP server configuration settings.
#[derive(Default, Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// The socket address the server should listen on.
    pub listen_address: Option<SocketAddr>,
    /// Key clients must present as `Authorization: Bearer` or `x-api-key`.
    /// Requests are not authenticated when unset.
    pub api_key: Option<SecretString>,
    /// Health endpoint configuration.
    pub health: HealthConfig,
    /// Public dialect endpoints.
    pub protocols: ProtocolsConfig,
}

impl ServerConfig {
    /// Returns whether clients must authenticate with an API key.
    pub fn requires_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfig {
    pub enabled: bool,
    pub path: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/health".to_string(),
        }
    }
}

#[derive(Default, Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProtocolsConfig {
    /// OpenAI-style `/v1/chat/completions` and `/v1/models`.
    pub openai: ProtocolConfig,
    /// Anthropic-style `/v1/messages` and `/v1/messages/count_tokens`.
    pub anthropic: ProtocolConfig,
}

impl ProtocolsConfig {
    pub fn any_enabled(&self) -> bool {
        self.openai.enabled || self.anthropic.enabled
    }

    /// Full paths of every route the enabled dialects serve.
    pub fn routes(&self) -> Vec<String> {
        let dialects = [
            (&self.openai, ["/v1/chat/completions", "/v1/models"]),
            (&self.anthropic, ["/v1/messages", "/v1/messages/count_tokens"]),
        ];

        dialects
            .into_iter()
            .filter(|(protocol, _)| protocol.enabled)
            .flat_map(|(protocol, routes)| {
                let prefix = protocol.path.trim_end_matches('/');
                routes.map(|route| format!("{prefix}{route}"))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProtocolConfig {
    pub enabled: bool,
    /// Prefix the dialect routes are mounted under.
    pub path: String,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/".to_string(),
        }
    }
}
