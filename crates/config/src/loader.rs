use std::path::Path;

use anyhow::bail;
use indoc::indoc;

use crate::{Config, error::Error};

const MAX_RETRIES: usize = 10;
const MAX_CONTINUATIONS: u32 = 20;

pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref();

    let content = std::fs::read_to_string(path).map_err(|source| Error::ConfigOpen {
        path: path.to_path_buf(),
        source,
    })?;

    let config: Config = toml::from_str(&content).map_err(|source| Error::ConfigParse {
        path: path.to_path_buf(),
        source: Box::new(source),
    })?;

    validate_protocols(&config)?;
    validate_backend(&config)?;

    if config.server.listen_address.is_some_and(|addr| !addr.ip().is_loopback()) && !config.server.requires_api_key() {
        log::warn!("Listening on a non-loopback address without `server.api_key`; any client can use the backend credential");
    }

    Ok(config)
}

pub(crate) fn validate_protocols(config: &Config) -> anyhow::Result<()> {
    let protocols = &config.server.protocols;

    if !protocols.any_enabled() {
        bail!(indoc! {r#"
            No protocol endpoints are enabled. At least one protocol endpoint must be enabled.

            Both protocols are enabled by default. To explicitly enable them in configuration:

              [server.protocols.openai]
              enabled = true
              path = "/"

              [server.protocols.anthropic]
              enabled = true
              path = "/"
        "#});
    }

    for (name, protocol) in [("openai", &protocols.openai), ("anthropic", &protocols.anthropic)] {
        if protocol.enabled && !protocol.path.starts_with('/') {
            bail!("Protocol path for {name} must start with '/', got '{}'", protocol.path);
        }
    }

    let health = &config.server.health;

    if health.enabled && !health.path.starts_with('/') {
        bail!("Health path must start with '/', got '{}'", health.path);
    }

    if health.enabled && (health.path == "/v1/tools" || protocols.routes().contains(&health.path)) {
        bail!("Health path '{}' collides with a gateway route", health.path);
    }

    Ok(())
}

pub(crate) fn validate_backend(config: &Config) -> anyhow::Result<()> {
    let backend = &config.backend;

    if !backend.models.is_empty() && !backend.models.contains_key(&backend.default_model) {
        bail!(
            "Default model '{}' is not listed in [backend.models]. Available models: {}",
            backend.default_model,
            backend.models.keys().map(String::as_str).collect::<Vec<_>>().join(", ")
        );
    }

    if backend.retry_delays.len() > MAX_RETRIES {
        bail!(
            "backend.retry_delays allows at most {MAX_RETRIES} entries, got {}",
            backend.retry_delays.len()
        );
    }

    if backend.max_continuations > MAX_CONTINUATIONS {
        bail!(
            "backend.max_continuations must not exceed {MAX_CONTINUATIONS}, got {}",
            backend.max_continuations
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use indoc::indoc;
    use insta::assert_snapshot;

    use crate::Config;

    #[test]
    fn validation_fails_when_both_protocols_disabled() {
        let config_str = indoc! {r#"
            [server.protocols.openai]
            enabled = false

            [server.protocols.anthropic]
            enabled = false
        "#};

        let config: Config = toml::from_str(config_str).unwrap();
        let error_msg = super::validate_protocols(&config).unwrap_err().to_string();

        assert_snapshot!(error_msg, @r#"
        No protocol endpoints are enabled. At least one protocol endpoint must be enabled.

        Both protocols are enabled by default. To explicitly enable them in configuration:

          [server.protocols.openai]
          enabled = true
          path = "/"

          [server.protocols.anthropic]
          enabled = true
          path = "/"
        "#);
    }

    #[test]
    fn validation_fails_for_relative_protocol_path() {
        let config: Config = toml::from_str("[server.protocols.openai]\npath = \"openai\"\n").unwrap();
        let error_msg = super::validate_protocols(&config).unwrap_err().to_string();

        assert_snapshot!(error_msg, @"Protocol path for openai must start with '/', got 'openai'");
    }

    #[test]
    fn protocols_may_share_a_path() {
        let config_str = indoc! {r#"
            [server.protocols.openai]
            path = "/api"

            [server.protocols.anthropic]
            path = "/api/"
        "#};

        let config: Config = toml::from_str(config_str).unwrap();

        assert!(super::validate_protocols(&config).is_ok());
        assert_eq!(
            config.server.protocols.routes(),
            [
                "/api/v1/chat/completions",
                "/api/v1/models",
                "/api/v1/messages",
                "/api/v1/messages/count_tokens",
            ]
        );
    }

    #[test]
    fn validation_fails_when_health_shadows_a_route() {
        let config_str = indoc! {r#"
            [server.health]
            path = "/v1/models"
        "#};

        let config: Config = toml::from_str(config_str).unwrap();
        let error_msg = super::validate_protocols(&config).unwrap_err().to_string();

        assert_snapshot!(error_msg, @"Health path '/v1/models' collides with a gateway route");
    }

    #[test]
    fn health_may_reuse_a_disabled_dialect_route() {
        let config_str = indoc! {r#"
            [server.health]
            path = "/v1/messages"

            [server.protocols.anthropic]
            enabled = false
        "#};

        let config: Config = toml::from_str(config_str).unwrap();

        assert!(super::validate_protocols(&config).is_ok());
    }

    #[test]
    fn validation_fails_for_unknown_default_model() {
        let config_str = indoc! {r#"
            [backend]
            default_model = "gpt-4"

            [backend.models]
            sonnet = "claude-sonnet-4.6"
            opus = "claude-opus-4.6"
        "#};

        let config: Config = toml::from_str(config_str).unwrap();
        let error_msg = super::validate_backend(&config).unwrap_err().to_string();

        assert_snapshot!(error_msg, @"Default model 'gpt-4' is not listed in [backend.models]. Available models: sonnet, opus");
    }

    #[test]
    fn validation_fails_for_excessive_continuations() {
        let config: Config = toml::from_str("[backend]\nmax_continuations = 50\n").unwrap();
        let error_msg = super::validate_backend(&config).unwrap_err().to_string();

        assert_snapshot!(error_msg, @"backend.max_continuations must not exceed 20, got 50");
    }

    #[test]
    fn validation_passes_with_defaults() {
        let config: Config = toml::from_str("").unwrap();

        assert!(super::validate_protocols(&config).is_ok());
        assert!(super::validate_backend(&config).is_ok());
    }

    #[test]
    fn load_reads_file_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();

        file.write_all(
            indoc! {r#"
                [backend]
                default_model = "sonnet"

                [backend.models]
                sonnet = "claude-sonnet-4.6"
            "#}
            .as_bytes(),
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.backend.resolve_model("sonnet"), Some("claude-sonnet-4.6"));
    }

    #[test]
    fn load_reports_missing_file() {
        let error = Config::load("/definitely/not/here.toml").unwrap_err();

        assert!(error.to_string().starts_with("Failed to open configuration file"));
    }
}
