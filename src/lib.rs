#![forbid(unsafe_code)]

// Proximity chat library - proximity-aware subscription orchestration over a mediasoup SFU

pub mod config;
pub mod media;
pub mod metrics;
pub mod signaling;
pub mod world;
