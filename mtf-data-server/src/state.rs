use crate::config::ServerConfig;
use mtf_data::{MarketDataHub, bus::EventBus};
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;

/// Shared application state handed to every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    pub hub: Arc<MarketDataHub>,
    pub bus: EventBus,
    pub keepalive: Duration,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            hub: Arc::new(MarketDataHub::new(config.hub.clone())),
            bus: EventBus::new(config.bus_capacity),
            keepalive: config.keepalive,
        }
    }

    /// Start the hub consuming every event published on the bus, without loss.
    pub fn spawn_pipeline(&self) -> JoinHandle<()> {
        tokio::spawn(self.hub.clone().run(self.bus.subscribe_reliable()))
    }
}
