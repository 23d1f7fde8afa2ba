//! Tunnel filter configuration

use crate::engine::TrafficLayer;
use serde::Deserialize;

/// Tunnel filter configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Context table bucket count (rounded up to a power of two)
    pub bucket_count: usize,
    /// Maximum number of live tunnel contexts
    pub max_contexts: usize,
    /// Datapath ingress port new tunnel flows are redirected to
    pub default_datapath_port: u32,
    /// Traffic layers to install callouts at
    pub monitored_layers: Vec<TrafficLayer>,
    /// Provider display name registered with the engine
    pub provider_name: String,
    /// Provider description registered with the engine
    pub provider_description: String,
    /// Sublayer weight relative to other filters in the system
    pub sublayer_weight: u16,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            bucket_count: 256,
            max_contexts: 65536,
            default_datapath_port: 0,
            monitored_layers: vec![
                TrafficLayer::OutboundTransportV4,
                TrafficLayer::InboundTransportV4,
            ],
            provider_name: "vswitch tunnel filter".to_string(),
            provider_description: "Virtual switch tunnel-traffic interception".to_string(),
            sublayer_weight: 0x100,
        }
    }
}

impl FilterConfig {
    /// Normalize the configuration (bucket count to a power of two,
    /// at least one bucket).
    pub fn normalized(mut self) -> Self {
        self.bucket_count = self.bucket_count.max(1).next_power_of_two();
        self
    }
}
