//! Control and proxy connections
//!
//! Every socket accepted on the control listener starts as a control
//! connection. It either authenticates and stays one, registering tunnels and
//! receiving `ReqProxy` prompts, or registers as a proxy connection for an
//! existing client and turns into a raw byte relay for one browser request.

mod connection;

pub use connection::{ConnectionState, ControlConnection, Role};

use crate::config::ServerConfig;
use crate::policy::{ConfigPolicy, Policy};
use crate::protocol::IDLE_TIMEOUT;
use crate::tunnel::{ProxyCoordinator, TunnelRegistry};
use std::sync::Arc;
use std::time::Duration;

/// Tunables shared by every connection
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// How long a proxy connection waits for a browser request
    pub assignment_timeout: Duration,
    /// Control connections with no inbound traffic for this long are dropped
    pub idle_timeout: Duration,
    /// Bytes requested per socket read
    pub read_buffer_size: usize,
    /// Largest accepted control frame payload
    pub max_frame_size: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for BrokerSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            assignment_timeout: config.assignment_timeout(),
            idle_timeout: IDLE_TIMEOUT,
            read_buffer_size: config.read_buffer_size.max(1),
            max_frame_size: crate::MAX_FRAME_SIZE,
        }
    }
}

/// State shared by all connections and the browser front end
pub struct Broker {
    pub registry: TunnelRegistry,
    pub coordinator: ProxyCoordinator,
    pub policy: Arc<dyn Policy>,
    pub settings: BrokerSettings,
}

impl Broker {
    pub fn new(policy: Arc<dyn Policy>, settings: BrokerSettings) -> Self {
        Self {
            registry: TunnelRegistry::new(),
            coordinator: ProxyCoordinator::new(),
            policy,
            settings,
        }
    }

    /// Broker with the configuration-driven policy
    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(
            Arc::new(ConfigPolicy::new(config)),
            BrokerSettings::from(config),
        )
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("clients", &self.registry.client_count())
            .field("tunnels", &self.registry.tunnel_count())
            .field("channels", &self.coordinator.channel_count())
            .field("settings", &self.settings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_config() {
        let config = ServerConfig {
            assignment_timeout_secs: 5,
            read_buffer_size: 0,
            ..Default::default()
        };
        let settings = BrokerSettings::from(&config);

        assert_eq!(settings.assignment_timeout, Duration::from_secs(5));
        assert_eq!(settings.idle_timeout, IDLE_TIMEOUT);
        assert_eq!(settings.read_buffer_size, 1);
        assert_eq!(settings.max_frame_size, crate::MAX_FRAME_SIZE);
    }

    #[test]
    fn test_broker_starts_empty() {
        let broker = Broker::from_config(&ServerConfig::default());
        assert_eq!(broker.registry.client_count(), 0);
        assert_eq!(broker.registry.tunnel_count(), 0);
        assert_eq!(broker.coordinator.client_count(), 0);
        assert_eq!(broker.coordinator.channel_count(), 0);
    }
}
