use clap::Parser;

use callboard_core::Config;

#[derive(Debug, Parser)]
#[command(
    name = "callboard",
    about = "Signaling client for small multi-party WebRTC calls",
    author,
    version
)]
pub struct Cli {
    /// Relay WebSocket URL (ws, wss, http or https).
    #[arg(long = "relay-url")]
    pub relay_url: Option<String>,

    /// Maximum number of simultaneous remote peers.
    #[arg(long = "max-peers", value_parser = clap::value_parser!(u16).range(1..))]
    pub max_peers: Option<u16>,

    /// STUN server URL; repeat to configure several.
    #[arg(long = "stun")]
    pub stun: Vec<String>,

    /// Stream name announced to the relay once local media is ready.
    #[arg(long)]
    pub name: Option<String>,
}

impl Cli {
    /// Flags win over environment-derived settings.
    pub fn apply(self, mut config: Config) -> Config {
        if let Some(relay_url) = self.relay_url {
            config.relay_url = relay_url;
        }
        if let Some(max_peers) = self.max_peers {
            config.max_peers = usize::from(max_peers);
        }
        if !self.stun.is_empty() {
            config.stun_servers = self.stun;
        }
        if let Some(name) = self.name {
            config.stream_name = Some(name);
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let cli = Cli::parse_from([
            "callboard",
            "--relay-url",
            "ws://relay.test:9000/",
            "--max-peers",
            "3",
            "--stun",
            "stun:one.test",
            "--stun",
            "stun:two.test",
            "--name",
            "studio",
        ]);
        let config = cli.apply(Config::default());
        assert_eq!(config.relay_url, "ws://relay.test:9000/");
        assert_eq!(config.max_peers, 3);
        assert_eq!(config.stun_servers, vec!["stun:one.test", "stun:two.test"]);
        assert_eq!(config.stream_name.as_deref(), Some("studio"));
    }

    #[test]
    fn absent_flags_keep_config() {
        let config = Cli::parse_from(["callboard"]).apply(Config::default());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn zero_peers_rejected() {
        assert!(Cli::try_parse_from(["callboard", "--max-peers", "0"]).is_err());
    }
}
