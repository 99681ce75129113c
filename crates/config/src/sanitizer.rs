use serde::Deserialize;

/// Output scrubbing and identity override settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SanitizerConfig {
    /// Scrub backend identity leakage, backend-only tool names and raw markup from responses.
    pub enabled: bool,
    /// Prepend the identity override prompt and acknowledgement turn to every request.
    pub identity_override: bool,
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            identity_override: true,
        }
    }
}
