//! Server and media engine settings

use roomcast_protocol::{MediaKind, RtpCodecCapability};
use serde_json::Map;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Settings of the signaling endpoint
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to
    pub listen: SocketAddr,
    /// Request path peers must connect on, e.g. `/streaming`
    pub namespace: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8888)),
            namespace: "/streaming".to_string(),
        }
    }
}

impl ServerConfig {
    /// Whether a WebSocket upgrade request path belongs to this server
    pub fn accepts_path(&self, path: &str) -> bool {
        let namespace = self.namespace.trim_end_matches('/');
        namespace.is_empty() || path.trim_end_matches('/') == namespace
    }
}

/// Settings of the in-process media engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub listen_ip: IpAddr,
    /// Address advertised in ICE candidates instead of `listen_ip`
    pub announced_ip: Option<IpAddr>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    /// Codecs every routing context supports
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            rtc_min_port: 40000,
            rtc_max_port: 49999,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            media_codecs: default_media_codecs(),
        }
    }
}

/// Opus stereo at 48 kHz and VP8
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: Some(2),
            preferred_payload_type: Some(100),
            parameters: Map::new(),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: None,
            preferred_payload_type: Some(101),
            parameters: Map::new(),
        },
    ]
}
