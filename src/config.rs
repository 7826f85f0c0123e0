#![forbid(unsafe_code)]

// Server configuration, loaded from environment variables.

use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be a finite, non-negative number (got {value})")]
    InvalidThreshold { name: &'static str, value: f64 },

    #[error("PROXIMITY_EXIT_THRESHOLD ({exit}) must not be below PROXIMITY_THRESHOLD ({enter})")]
    ExitBelowEnter { enter: f64, exit: f64 },

    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),

    #[error("RTC_MIN_PORT ({min}) must not exceed RTC_MAX_PORT ({max})")]
    PortRange { min: u16, max: u16 },
}

/// Process-wide settings
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub port: u16,
    /// Public IP announced in ICE candidates
    pub announce_ip: IpAddr,
    pub proximity_threshold: f64,
    pub proximity_exit_threshold: f64,
    pub reconcile_interval: Duration,
    pub broadcast_interval: Duration,
    pub spawn_x: f64,
    pub spawn_y: f64,
    pub max_connections: usize,
    pub max_consumers_per_participant: usize,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    /// Bearer token guarding /metrics
    pub metrics_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            announce_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            proximity_threshold: 10.0,
            proximity_exit_threshold: 10.0,
            reconcile_interval: Duration::from_millis(100),
            broadcast_interval: Duration::from_millis(100),
            spawn_x: 100.0,
            spawn_y: 100.0,
            max_connections: 10_000,
            max_consumers_per_participant: 64,
            rtc_min_port: 10000,
            rtc_max_port: 59999,
            metrics_token: None,
        }
    }
}

impl ServerConfig {
    /// Load from environment variables; unset or unparsable values keep their defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let proximity_threshold = parse_or(&lookup, "PROXIMITY_THRESHOLD", defaults.proximity_threshold);

        let mut max_connections = parse_or(&lookup, "MAX_CONNECTIONS", defaults.max_connections);
        if max_connections == 0 {
            warn!("MAX_CONNECTIONS=0 would reject all connections, using default {}", defaults.max_connections);
            max_connections = defaults.max_connections;
        }

        Self {
            port: parse_or(&lookup, "PORT", defaults.port),
            announce_ip: parse_or(&lookup, "ANNOUNCE_IP", defaults.announce_ip),
            proximity_threshold,
            proximity_exit_threshold: parse_or(&lookup, "PROXIMITY_EXIT_THRESHOLD", proximity_threshold),
            reconcile_interval: Duration::from_millis(parse_or(
                &lookup,
                "RECONCILE_INTERVAL_MS",
                defaults.reconcile_interval.as_millis() as u64,
            )),
            broadcast_interval: Duration::from_millis(parse_or(
                &lookup,
                "BROADCAST_INTERVAL_MS",
                defaults.broadcast_interval.as_millis() as u64,
            )),
            spawn_x: parse_or(&lookup, "SPAWN_X", defaults.spawn_x),
            spawn_y: parse_or(&lookup, "SPAWN_Y", defaults.spawn_y),
            max_connections,
            max_consumers_per_participant: parse_or(
                &lookup,
                "MAX_CONSUMERS_PER_PARTICIPANT",
                defaults.max_consumers_per_participant,
            ),
            rtc_min_port: parse_or(&lookup, "RTC_MIN_PORT", defaults.rtc_min_port),
            rtc_max_port: parse_or(&lookup, "RTC_MAX_PORT", defaults.rtc_max_port),
            metrics_token: lookup("METRICS_TOKEN").filter(|t| !t.is_empty()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("PROXIMITY_THRESHOLD", self.proximity_threshold),
            ("PROXIMITY_EXIT_THRESHOLD", self.proximity_exit_threshold),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidThreshold { name, value });
            }
        }
        if self.proximity_exit_threshold < self.proximity_threshold {
            return Err(ConfigError::ExitBelowEnter {
                enter: self.proximity_threshold,
                exit: self.proximity_exit_threshold,
            });
        }
        if self.reconcile_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("RECONCILE_INTERVAL_MS"));
        }
        if self.broadcast_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("BROADCAST_INTERVAL_MS"));
        }
        if self.rtc_min_port > self.rtc_max_port {
            return Err(ConfigError::PortRange {
                min: self.rtc_min_port,
                max: self.rtc_max_port,
            });
        }
        Ok(())
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("Ignoring invalid {}={:?}", key, raw);
                default
            }
        },
    }
}
