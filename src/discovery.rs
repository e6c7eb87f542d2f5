//! Discovery: builds a full topology graph from the Raumfeld host.
//!
//! The host is taken from config or found with one SSDP search for the
//! config device. Its device list and zone configuration are then merged
//! with each device's description to get service endpoints.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use ssdp_client::{SearchTarget, URN};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::topology::{Device, Room, ServiceEndpoint, Topology, Zone};
use crate::upnp::host::host_address;
use crate::upnp::{network_location, DescriptionClient, HostClient, ListedDevice, ZoneConfig};

const CONFIG_DEVICE_URN: &str = "urn:schemas-raumfeld-com:device:ConfigDevice:1";
const SSDP_SEARCH_TIMEOUT: Duration = Duration::from_secs(3);

/// Produces a complete topology graph. Implementations may do network I/O.
#[async_trait]
pub trait Discoverer: Send + Sync {
    async fn discover(&self) -> Result<Topology>;
}

pub struct HostDiscoverer {
    configured_host: Option<String>,
    located_host: RwLock<Option<String>>,
    host: HostClient,
    descriptions: DescriptionClient,
}

impl HostDiscoverer {
    pub fn new(
        configured_host: Option<String>,
        host: HostClient,
        descriptions: DescriptionClient,
    ) -> Self {
        Self {
            configured_host,
            located_host: RwLock::new(None),
            host,
            descriptions,
        }
    }

    async fn locate_host(&self) -> Result<String> {
        if let Some(host) = &self.configured_host {
            return Ok(host_address(host));
        }
        if let Some(host) = self.located_host.read().await.clone() {
            return Ok(host);
        }

        let urn: URN = CONFIG_DEVICE_URN.parse()?;
        let search_target = SearchTarget::URN(urn);
        let responses = ssdp_client::search(&search_target, SSDP_SEARCH_TIMEOUT, 2, None).await?;
        futures::pin_mut!(responses);

        while let Some(response) = responses.next().await {
            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    debug!("SSDP response error: {}", e);
                    continue;
                }
            };
            let url = url::Url::parse(response.location())?;
            if let Some(ip) = url.host_str() {
                let host = host_address(ip);
                info!("Located Raumfeld host at {}", host);
                *self.located_host.write().await = Some(host.clone());
                return Ok(host);
            }
        }
        Err(anyhow!("no Raumfeld host answered the SSDP search"))
    }
}

#[async_trait]
impl Discoverer for HostDiscoverer {
    async fn discover(&self) -> Result<Topology> {
        let host = self.locate_host().await?;
        let listed = match self.host.list_devices(&host).await {
            Ok(listed) => listed,
            Err(e) => {
                // Host may have moved; search again next time
                *self.located_host.write().await = None;
                return Err(e.into());
            }
        };
        let zone_config = self.host.zone_config(&host).await?;

        let fetched = futures::future::join_all(listed.iter().map(|device| async move {
            (device.udn.clone(), self.descriptions.fetch(&device.location).await)
        }))
        .await;

        let mut services = HashMap::new();
        for (udn, result) in fetched {
            match result {
                Ok(desc) => {
                    services.insert(udn, desc.services);
                }
                Err(e) => warn!("Description for {} unavailable: {}", udn, e),
            }
        }

        let topology = build_topology(&host, &listed, &services, &zone_config);
        info!(
            "Discovered {} zones, {} media servers via {}",
            topology.addressable_zones().count(),
            topology.media_servers.len(),
            host
        );
        Ok(topology)
    }
}

/// Merges host data into a graph. Devices with an unparsable location are skipped.
pub fn build_topology(
    host: &str,
    listed: &[ListedDevice],
    services: &HashMap<String, Vec<ServiceEndpoint>>,
    zone_config: &ZoneConfig,
) -> Topology {
    let devices: HashMap<&str, Device> = listed
        .iter()
        .filter_map(|d| match network_location(&d.location) {
            Ok(location) => Some((
                d.udn.as_str(),
                Device {
                    udn: d.udn.clone(),
                    name: d.name.trim().to_string(),
                    device_type: d.device_type.clone(),
                    location,
                    services: services.get(&d.udn).cloned().unwrap_or_default(),
                },
            )),
            Err(e) => {
                warn!("Skipping {} with bad location {}: {}", d.udn, d.location, e);
                None
            }
        })
        .collect();

    let mut topology = Topology {
        host: Some(host_address(host)),
        ..Default::default()
    };

    // Keep host order for stable output
    for d in listed {
        let Some(device) = devices.get(d.udn.as_str()) else {
            continue;
        };
        let kind = device.device_type.to_ascii_lowercase();
        if kind.contains("mediaserver") {
            topology.media_servers.push(device.clone());
        } else if kind.contains("configdevice") {
            topology.config_devices.push(device.clone());
        } else if kind.contains("raumfeld") {
            topology.raumfeld_devices.push(device.clone());
        }
    }

    let room = |configured: &crate::upnp::host::ConfiguredRoom| {
        let mut room = Room::new(configured.udn.clone(), configured.name.clone());
        if let Some(renderer) = configured.renderers.first() {
            room.renderer_udn = Some(renderer.udn.clone());
            if let Some(device) = devices.get(renderer.udn.as_str()) {
                room.location = Some(device.location.clone());
                room.services = device.services.clone();
            }
        }
        room
    };

    for configured in &zone_config.zones {
        let rooms = configured.rooms.iter().map(&room).collect();
        let mut zone = Zone::new(Some(configured.udn.clone()), rooms);
        if let Some(device) = devices.get(configured.udn.as_str()) {
            zone.location = Some(device.location.clone());
            zone.services = device.services.clone();
        }
        topology.zones.push(zone);
    }

    if !zone_config.unassigned_rooms.is_empty() {
        let rooms = zone_config.unassigned_rooms.iter().map(&room).collect();
        let mut zone = Zone::new(None, rooms);
        zone.name = "unassigned rooms".to_string();
        topology.zones.push(zone);
    }

    topology
}
