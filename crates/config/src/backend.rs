//! Backend conversation API settings.

use std::time::Duration;

use duration_str::deserialize_duration;
use indexmap::IndexMap;
use serde::Deserialize;
use url::Url;

use crate::duration::deserialize_duration_list;

/// Settings for the upstream conversation API.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    /// Full URL of the `generateAssistantResponse` operation.
    pub endpoint: Url,
    /// Public model name used when a request leaves `model` empty.
    pub default_model: String,
    /// Public model name to backend model identifier, in listing order.
    pub models: IndexMap<String, String>,
    /// Overrides the profile identifier read from the credential store.
    pub profile_arn: Option<String>,
    #[serde(deserialize_with = "deserialize_duration")]
    pub connect_timeout: Duration,
    /// Upper bound for a single backend response, streaming included.
    #[serde(deserialize_with = "deserialize_duration")]
    pub read_timeout: Duration,
    /// Delay before each retry; the number of entries bounds the retries.
    #[serde(deserialize_with = "deserialize_duration_list")]
    pub retry_delays: Vec<Duration>,
    /// Auto-continuation rounds before a truncated response is returned as is.
    pub max_continuations: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: Url::parse("https://codewhisperer.us-east-1.amazonaws.com/generateAssistantResponse")
                .expect("default URL should be valid"),
            default_model: "claude-sonnet-4-6".to_string(),
            models: IndexMap::new(),
            profile_arn: None,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(300),
            retry_delays: vec![Duration::from_secs(1), Duration::from_secs(3), Duration::from_secs(10)],
            max_continuations: 5,
        }
    }
}

impl BackendConfig {
    /// Resolves a public model name to the backend model identifier.
    ///
    /// An empty name selects the default model. With no configured models every
    /// name is passed through unchanged.
    pub fn resolve_model<'a>(&'a self, requested: &'a str) -> Option<&'a str> {
        let name = if requested.is_empty() {
            self.default_model.as_str()
        } else {
            requested
        };

        if self.models.is_empty() {
            return Some(name);
        }

        self.models.get(name).map(String::as_str)
    }

    /// Public model names exposed by the models listing.
    pub fn public_models(&self) -> Vec<&str> {
        if self.models.is_empty() {
            return vec![self.default_model.as_str()];
        }

        self.models.keys().map(String::as_str).collect()
    }
}
