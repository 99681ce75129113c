use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

/// OpenAI and Anthropic compatible gateway to the Kiro backend.
#[derive(Debug, Parser)]
#[command(name = "kirogate", version)]
pub struct Args {
    /// Path to the TOML configuration file. A missing file means all defaults.
    #[arg(short, long, env = "KIROGATE_CONFIG", default_value = "./kirogate.toml")]
    pub config: PathBuf,

    /// Address to listen on, overrides `server.listen_address`.
    #[arg(short, long, env = "KIROGATE_LISTEN_ADDRESS")]
    pub listen_address: Option<SocketAddr>,

    /// Log filter, e.g. `info` or `gateway=debug,server=debug`.
    #[arg(long, env = "KIROGATE_LOG", default_value = "info")]
    pub log: String,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::Args;

    #[test]
    fn defaults() {
        let args = Args::try_parse_from(["kirogate"]).unwrap();

        insta::assert_debug_snapshot!(args, @r#"
        Args {
            config: "./kirogate.toml",
            listen_address: None,
            log: "info",
        }
        "#);
    }

    #[test]
    fn overrides() {
        let args =
            Args::try_parse_from(["kirogate", "-c", "/etc/kirogate.toml", "-l", "0.0.0.0:9000", "--log", "debug"])
                .unwrap();

        assert_eq!(args.config.to_str(), Some("/etc/kirogate.toml"));
        assert_eq!(args.listen_address, Some("0.0.0.0:9000".parse().unwrap()));
        assert_eq!(args.log, "debug");
    }
}
