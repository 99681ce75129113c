//! Credential store and identity provider settings.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use duration_str::deserialize_duration;
use serde::Deserialize;
use url::Url;

use crate::duration::deserialize_optional_duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    /// SQLite database maintained by the vendor CLI. A leading `~/` expands to the home directory.
    pub database_path: PathBuf,
    /// Identity provider token endpoint used for refresh-token exchange.
    pub refresh_url: Url,
    /// A credential expiring within this margin is refreshed before use.
    #[serde(deserialize_with = "deserialize_duration")]
    pub refresh_margin: Duration,
    /// Interval of the proactive background refresh. On-demand refresh only when unset.
    #[serde(deserialize_with = "deserialize_optional_duration")]
    pub refresh_interval: Option<Duration>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("~/.local/share/kiro-cli/data.sqlite3"),
            refresh_url: Url::parse("https://oidc.us-east-1.amazonaws.com/token").expect("default URL should be valid"),
            refresh_margin: Duration::from_secs(300),
            refresh_interval: None,
        }
    }
}

impl AuthConfig {
    /// The database path with `~` expanded.
    pub fn database_path(&self) -> PathBuf {
        expand_home(&self.database_path)
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}
