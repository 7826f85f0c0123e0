#![forbid(unsafe_code)]

// Configuration for the mediasoup worker, the world router and WebRTC transports

use mediasoup::prelude::*;
use mediasoup::worker::{WorkerLogLevel, WorkerLogTag};
use std::net::{IpAddr, Ipv4Addr};
use std::num::{NonZeroU32, NonZeroU8};

/// Media relay configuration
#[derive(Debug, Clone, Default)]
pub struct MediaConfig {
    pub worker_config: WorkerConfig,
    pub router_config: RouterConfig,
    pub webrtc_transport_config: WebRtcTransportConfig,
}

impl MediaConfig {
    /// Builds the media configuration from the server-level settings
    pub fn from_server_config(config: &crate::config::ServerConfig) -> Self {
        let mut media = Self::default();
        media.worker_config.rtc_min_port = config.rtc_min_port;
        media.worker_config.rtc_max_port = config.rtc_max_port;
        media.webrtc_transport_config = media
            .webrtc_transport_config
            .with_public_ip(config.announce_ip);
        media
    }
}

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub log_level: WorkerLogLevel,
    pub log_tags: Vec<WorkerLogTag>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            log_level: WorkerLogLevel::Warn,
            log_tags: vec![WorkerLogTag::Info, WorkerLogTag::Ice, WorkerLogTag::Dtls],
            rtc_min_port: 10000,
            rtc_max_port: 59999,
        }
    }
}

impl WorkerConfig {
    /// Converts to mediasoup WorkerSettings
    pub fn to_worker_settings(&self) -> WorkerSettings {
        let mut settings = WorkerSettings::default();
        settings.log_level = self.log_level;
        settings.log_tags = self.log_tags.clone();
        settings.rtc_port_range = self.rtc_min_port..=self.rtc_max_port;
        settings
    }
}

/// Router configuration with codec capabilities
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            media_codecs: Self::default_codecs(),
        }
    }
}

impl RouterConfig {
    /// Opus for voice, VP8 for camera tracks
    pub fn default_codecs() -> Vec<RtpCodecCapability> {
        let (Some(opus_rate), Some(video_rate), Some(stereo)) = (
            NonZeroU32::new(48000),
            NonZeroU32::new(90000),
            NonZeroU8::new(2),
        ) else {
            return Vec::new();
        };

        vec![
            RtpCodecCapability::Audio {
                mime_type: MimeTypeAudio::Opus,
                preferred_payload_type: None,
                clock_rate: opus_rate,
                channels: stereo,
                parameters: RtpCodecParametersParameters::from([
                    ("useinbandfec", 1_u32.into()),
                ]),
                rtcp_feedback: vec![RtcpFeedback::TransportCc],
            },
            RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::Vp8,
                preferred_payload_type: None,
                clock_rate: video_rate,
                parameters: RtpCodecParametersParameters::from([
                    ("x-google-start-bitrate", 1000_u32.into()),
                ]),
                rtcp_feedback: vec![
                    RtcpFeedback::Nack,
                    RtcpFeedback::NackPli,
                    RtcpFeedback::CcmFir,
                    RtcpFeedback::GoogRemb,
                    RtcpFeedback::TransportCc,
                ],
            },
        ]
    }

    /// Converts to RouterOptions for mediasoup
    pub fn to_router_options(&self) -> RouterOptions {
        RouterOptions::new(self.media_codecs.clone())
    }
}

/// WebRTC transport configuration
#[derive(Debug, Clone)]
pub struct WebRtcTransportConfig {
    pub listen_info: ListenInfo,
}

impl Default for WebRtcTransportConfig {
    fn default() -> Self {
        Self {
            listen_info: ListenInfo {
                protocol: Protocol::Udp,
                ip: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
                announced_address: None,
                port: None,
                port_range: None,
                flags: None,
                send_buffer_size: None,
                recv_buffer_size: None,
                expose_internal_ip: false,
            },
        }
    }
}

impl WebRtcTransportConfig {
    /// Sets the public IP address announced in ICE candidates
    pub fn with_public_ip(mut self, public_ip: IpAddr) -> Self {
        self.listen_info.announced_address = Some(public_ip.to_string());
        self
    }

    /// Converts to WebRtcTransportOptions
    pub fn to_transport_options(&self) -> WebRtcTransportOptions {
        WebRtcTransportOptions::new(WebRtcTransportListenInfos::new(self.listen_info.clone()))
    }
}
