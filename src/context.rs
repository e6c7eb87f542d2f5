//! Process-wide context: every shared component, built once and passed by handle.

use anyhow::Result;
use reqwest::Client;
use std::sync::Arc;
use tracing::warn;

use crate::bus::{create_bus, SharedBus};
use crate::config::Config;
use crate::discovery::{Discoverer, HostDiscoverer};
use crate::dispatch::Dispatcher;
use crate::notify::NotificationProcessor;
use crate::subscription::SubscriptionRegistry;
use crate::timers::TimerTable;
use crate::topology::{StaleFlag, TopologyStore};
use crate::upnp::{DescriptionClient, GenaClient, HostClient, RendererClient};

#[derive(Clone)]
pub struct Context {
    pub config: Arc<Config>,
    pub bus: SharedBus,
    pub store: Arc<TopologyStore>,
    pub stale: Arc<StaleFlag>,
    pub subscriptions: Arc<SubscriptionRegistry>,
    pub notifications: Arc<NotificationProcessor>,
    pub dispatcher: Arc<Dispatcher>,
    pub timers: Arc<TimerTable>,
    pub discoverer: Arc<dyn Discoverer>,
    /// `ip:port` remote devices NOTIFY
    pub callback_address: String,
}

impl Context {
    /// Context with the host-backed discoverer.
    pub fn new(config: Config) -> Result<Self> {
        let http = http_client(&config)?;
        let discoverer = Arc::new(HostDiscoverer::new(
            config.host.clone(),
            HostClient::new(http.clone()),
            DescriptionClient::new(http),
        ));
        Self::with_discoverer(config, discoverer)
    }

    pub fn with_discoverer(config: Config, discoverer: Arc<dyn Discoverer>) -> Result<Self> {
        let http = http_client(&config)?;
        let bus = create_bus();
        let store = Arc::new(TopologyStore::new(bus.clone()));
        let stale = Arc::new(StaleFlag::default());
        let timers = Arc::new(TimerTable::new());
        let subscriptions = Arc::new(SubscriptionRegistry::new(
            GenaClient::new(http.clone()),
            config.subscription_timeout_secs,
            bus.clone(),
        ));
        let notifications = Arc::new(NotificationProcessor::new(
            store.clone(),
            stale.clone(),
            bus.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            stale.clone(),
            subscriptions.clone(),
            timers.clone(),
            RendererClient::new(http.clone()),
            HostClient::new(http),
            bus.clone(),
        ));
        let callback_address = format!("{}:{}", callback_host(&config), config.port);

        Ok(Self {
            config: Arc::new(config),
            bus,
            store,
            stale,
            subscriptions,
            notifications,
            dispatcher,
            timers,
            discoverer,
            callback_address,
        })
    }
}

/// Shared HTTP client; every outbound call inherits its timeout.
pub fn http_client(config: &Config) -> Result<Client> {
    Ok(Client::builder().timeout(config.request_timeout()).build()?)
}

fn callback_host(config: &Config) -> String {
    if let Some(host) = &config.callback_host {
        return host.clone();
    }
    match local_ip_address::local_ip() {
        Ok(ip) => ip.to_string(),
        Err(e) => {
            warn!("Could not detect local address ({}); using 127.0.0.1 for callbacks", e);
            "127.0.0.1".to_string()
        }
    }
}
