use std::env;

use crate::media::MediaParams;

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:3000/";
pub const DEFAULT_MAX_PEERS: usize = 2;
pub const DEFAULT_STUN_SERVERS: [&str; 2] = ["stun:23.21.150.121", "stun:stun.l.google.com:19302"];
pub const DEFAULT_LOG_FILTER: &str = "info,callboard_core=debug";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub relay_url: String,
    pub max_peers: usize,
    pub stun_servers: Vec<String>,
    /// Announced to the relay once local media is up; no announcement when unset.
    pub stream_name: Option<String>,
    pub media: MediaParams,
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.into(),
            max_peers: DEFAULT_MAX_PEERS,
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            stream_name: None,
            media: MediaParams::default(),
            log_filter: DEFAULT_LOG_FILTER.into(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable source; unparsable values fall back
    /// to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u32>().ok());

        let relay_url = lookup("CALLBOARD_RELAY_URL")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.relay_url);
        let max_peers = lookup("CALLBOARD_MAX_PEERS")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults.max_peers);
        let stun_servers = lookup("CALLBOARD_STUN_SERVERS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or(defaults.stun_servers);
        let stream_name = lookup("CALLBOARD_STREAM_NAME").filter(|v| !v.trim().is_empty());
        let media = MediaParams {
            video_width: parsed("CALLBOARD_VIDEO_WIDTH").unwrap_or(defaults.media.video_width),
            video_height: parsed("CALLBOARD_VIDEO_HEIGHT").unwrap_or(defaults.media.video_height),
            video_fps: parsed("CALLBOARD_VIDEO_FPS").unwrap_or(defaults.media.video_fps),
            audio: lookup("CALLBOARD_AUDIO")
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "yes" | "on"))
                .unwrap_or(defaults.media.audio),
        };
        let log_filter = lookup("RUST_LOG").unwrap_or(defaults.log_filter);

        Self {
            relay_url,
            max_peers,
            stun_servers,
            stream_name,
            media,
            log_filter,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn empty_environment_yields_defaults() {
        assert_eq!(from_pairs(&[]), Config::default());
        let config = Config::default();
        assert_eq!(config.max_peers, 2);
        assert_eq!(config.stun_servers.len(), 2);
        assert!(config.stream_name.is_none());
    }

    #[test]
    fn variables_override_defaults() {
        let config = from_pairs(&[
            ("CALLBOARD_RELAY_URL", "wss://relay.example.org/socket"),
            ("CALLBOARD_MAX_PEERS", "4"),
            ("CALLBOARD_STUN_SERVERS", "stun:a.example:3478, ,stun:b.example"),
            ("CALLBOARD_STREAM_NAME", "lobby"),
            ("CALLBOARD_VIDEO_FPS", "15"),
            ("CALLBOARD_AUDIO", "off"),
        ]);
        assert_eq!(config.relay_url, "wss://relay.example.org/socket");
        assert_eq!(config.max_peers, 4);
        assert_eq!(config.stun_servers, vec!["stun:a.example:3478", "stun:b.example"]);
        assert_eq!(config.stream_name.as_deref(), Some("lobby"));
        assert_eq!(config.media.video_fps, 15);
        assert_eq!(config.media.video_width, 1280);
        assert!(!config.media.audio);
    }

    #[test]
    fn invalid_values_fall_back() {
        let config = from_pairs(&[
            ("CALLBOARD_MAX_PEERS", "0"),
            ("CALLBOARD_VIDEO_WIDTH", "wide"),
            ("CALLBOARD_STREAM_NAME", "  "),
        ]);
        assert_eq!(config.max_peers, DEFAULT_MAX_PEERS);
        assert_eq!(config.media.video_width, 1280);
        assert!(config.stream_name.is_none());
    }
}
