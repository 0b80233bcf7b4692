//! Settings for the device library and the standalone binary.
//!
//! The binary reads a TOML file and then applies `RTC_EDGE_*` environment
//! overrides on top.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::IceServer;
use crate::signaling::{GET_INFO_ACTION, SIGNALING_ACTION};

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;
pub const DEFAULT_STREAM_CHUNK: usize = 1024;

/// Tunables for signaling sessions and the engines they create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Frames announcing a longer body close the session.
    pub max_frame_len: usize,
    /// Appended after the resolved ICE servers of every connection.
    pub fallback_stun_url: String,
    /// Identifier passed when resolving ICE servers.
    pub ice_identifier: String,
    /// Read size of the `stream-<port>` bridge.
    pub stream_chunk_size: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            fallback_stun_url: DEFAULT_STUN_URL.to_owned(),
            ice_identifier: "rtc-edge".to_owned(),
            stream_chunk_size: DEFAULT_STREAM_CHUNK,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Standalone device settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub bind: IpAddr,
    /// `0` picks an ephemeral port.
    pub v1_port: u16,
    pub v2_port: u16,
    pub info_port: u16,
    /// Returned when sessions resolve ICE servers.
    pub ice_servers: Vec<IceServer>,
    /// Actions granted to every connection.
    pub allow: Vec<String>,
    pub video_codec: String,
    /// Echo messages on application data channels.
    pub echo_channels: bool,
    pub signaling: SignalingConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::from([127, 0, 0, 1]),
            v1_port: 0,
            v2_port: 0,
            info_port: 0,
            ice_servers: Vec::new(),
            allow: vec![SIGNALING_ACTION.to_owned(), GET_INFO_ACTION.to_owned()],
            video_codec: "H264".to_owned(),
            echo_channels: true,
            signaling: SignalingConfig::default(),
        }
    }
}

impl DeviceConfig {
    /// Defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_owned(),
                    source,
                })?;
                toml::from_str(&text)?
            }
            None => DeviceConfig::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(value) = lookup("RTC_EDGE_BIND") {
            self.bind = parse_env("RTC_EDGE_BIND", value)?;
        }
        for (var, port) in [
            ("RTC_EDGE_V1_PORT", &mut self.v1_port),
            ("RTC_EDGE_V2_PORT", &mut self.v2_port),
            ("RTC_EDGE_INFO_PORT", &mut self.info_port),
        ] {
            if let Some(value) = lookup(var) {
                *port = parse_env(var, value)?;
            }
        }
        if let Some(value) = lookup("RTC_EDGE_VIDEO_CODEC") {
            self.video_codec = value;
        }
        if let Some(value) = lookup("RTC_EDGE_FALLBACK_STUN") {
            self.signaling.fallback_stun_url = value;
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { var, value })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SignalingConfig::default();
        assert_eq!(config.fallback_stun_url, "stun:stun.l.google.com:19302");
        assert_eq!(config.stream_chunk_size, 1024);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: SignalingConfig = toml::from_str("max_frame_len = 4096").unwrap();
        assert_eq!(config.max_frame_len, 4096);
        assert_eq!(config.ice_identifier, "rtc-edge");
    }

    #[test]
    fn device_config_from_toml() {
        let config: DeviceConfig = toml::from_str(
            r#"
            v2_port = 4502
            allow = ["Webrtc:Signaling"]

            [[ice_servers]]
            urls = ["turn:turn.example.net:3478"]
            username = "user"
            credential = "secret"

            [signaling]
            max_frame_len = 2048
            "#,
        )
        .unwrap();
        assert_eq!(config.v2_port, 4502);
        assert_eq!(config.v1_port, 0);
        assert_eq!(config.allow, vec!["Webrtc:Signaling"]);
        assert_eq!(config.ice_servers[0].username.as_deref(), Some("user"));
        assert_eq!(config.signaling.max_frame_len, 2048);
        assert_eq!(config.video_codec, "H264");
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut config = DeviceConfig::default();
        config
            .apply_env(|var| match var {
                "RTC_EDGE_V1_PORT" => Some("4501".to_owned()),
                "RTC_EDGE_BIND" => Some("0.0.0.0".to_owned()),
                "RTC_EDGE_VIDEO_CODEC" => Some("VP8".to_owned()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.v1_port, 4501);
        assert_eq!(config.bind, IpAddr::from([0, 0, 0, 0]));
        assert_eq!(config.video_codec, "VP8");
    }

    #[test]
    fn bad_environment_values_are_reported() {
        let mut config = DeviceConfig::default();
        let err = config
            .apply_env(|var| (var == "RTC_EDGE_V2_PORT").then(|| "many".to_owned()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var: "RTC_EDGE_V2_PORT", .. }));
    }
}
