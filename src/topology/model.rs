//! Zone, room and device model held by the topology store.

use serde::Serialize;
use std::collections::BTreeMap;

/// Playback state as reported by a renderer's `TransportState` variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    Playing,
    Paused,
    Stopped,
    Transitioning,
    NoMedia,
    #[default]
    Unknown,
}

impl TransportState {
    pub fn from_upnp(value: &str) -> Self {
        match value.trim() {
            "PLAYING" => Self::Playing,
            "PAUSED_PLAYBACK" | "PAUSED" => Self::Paused,
            "STOPPED" => Self::Stopped,
            "TRANSITIONING" => Self::Transitioning,
            "NO_MEDIA_PRESENT" => Self::NoMedia,
            _ => Self::Unknown,
        }
    }

    pub fn as_upnp(&self) -> &'static str {
        match self {
            Self::Playing => "PLAYING",
            Self::Paused => "PAUSED_PLAYBACK",
            Self::Stopped => "STOPPED",
            Self::Transitioning => "TRANSITIONING",
            Self::NoMedia => "NO_MEDIA_PRESENT",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// True when a track is loaded and seeking makes sense.
    pub fn has_track(&self) -> bool {
        matches!(self, Self::Playing | Self::Paused)
    }
}

/// One service advertised in a device description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceEndpoint {
    pub service_type: String,
    pub control_url: Option<String>,
    pub event_sub_url: Option<String>,
}

impl ServiceEndpoint {
    /// Matches on the service name part of the URN, e.g. `AVTransport`.
    pub fn is(&self, name: &str) -> bool {
        self.service_type
            .split(':')
            .nth(3)
            .map(|s| s == name)
            .unwrap_or(false)
    }
}

/// Media server, config device or other Raumfeld device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub udn: String,
    pub name: String,
    pub device_type: String,
    /// `host:port` of the device's HTTP server
    pub location: String,
    #[serde(skip)]
    pub services: Vec<ServiceEndpoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Room {
    pub udn: String,
    pub name: String,
    pub renderer_udn: Option<String>,
    pub location: Option<String>,
    pub volume: u8,
    pub muted: bool,
    #[serde(skip)]
    pub services: Vec<ServiceEndpoint>,
}

impl Room {
    pub fn new(udn: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            udn: udn.into(),
            name: name.into(),
            renderer_udn: None,
            location: None,
            volume: 0,
            muted: false,
            services: Vec::new(),
        }
    }

    fn apply(&mut self, name: &str, value: &str) {
        match name {
            "Volume" => {
                if let Some(volume) = parse_volume(value) {
                    self.volume = volume;
                }
            }
            "Mute" => self.muted = matches!(value.trim(), "1" | "true" | "True"),
            _ => {}
        }
    }
}

/// A playback group of rooms behind one virtual renderer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Zone {
    /// None for the unassigned-rooms pseudo zone
    pub udn: Option<String>,
    pub name: String,
    pub rooms: Vec<Room>,
    /// `host:port` of the zone's virtual renderer
    pub location: Option<String>,
    #[serde(skip)]
    pub services: Vec<ServiceEndpoint>,
    pub media: Option<String>,
    pub transport_state: TransportState,
    pub position: Option<String>,
    pub volume: u8,
    #[serde(skip)]
    pub state_variables: BTreeMap<String, String>,
}

impl Zone {
    pub fn new(udn: Option<String>, rooms: Vec<Room>) -> Self {
        let name = if rooms.is_empty() {
            "unassigned room".to_string()
        } else {
            rooms
                .iter()
                .map(|r| r.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };
        Self {
            udn,
            name,
            rooms,
            location: None,
            services: Vec::new(),
            media: None,
            transport_state: TransportState::Unknown,
            position: None,
            volume: 0,
            state_variables: BTreeMap::new(),
        }
    }

    /// Empty zones and the unassigned-rooms pseudo zone cannot be targeted.
    pub fn is_addressable(&self) -> bool {
        self.udn.is_some() && !self.rooms.is_empty()
    }

    pub fn has_room(&self, name: &str) -> bool {
        self.rooms.iter().any(|r| r.name == name)
    }

    fn apply(&mut self, name: &str, value: &str) {
        match name {
            "Volume" => {
                if let Some(volume) = parse_volume(value) {
                    self.volume = volume;
                }
            }
            "TransportState" => self.transport_state = TransportState::from_upnp(value),
            "AVTransportURI" | "CurrentTrackURI" => {
                self.media = (!value.is_empty()).then(|| value.to_string());
            }
            "RelativeTimePosition" | "AbsoluteTimePosition" => {
                self.position = Some(value.to_string());
            }
            _ => {}
        }
        self.state_variables
            .insert(name.to_string(), value.to_string());
    }
}

/// One event source the subscription loop keeps a subscription for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSource {
    pub udn: String,
    pub location: String,
    /// Event subscription path, e.g. `/evt`
    pub event_path: String,
}

impl EventSource {
    pub fn event_url(&self) -> String {
        if self.event_path.starts_with("http://") || self.event_path.starts_with("https://") {
            return self.event_path.clone();
        }
        let sep = if self.event_path.starts_with('/') { "" } else { "/" };
        format!("http://{}{}{}", self.location, sep, self.event_path)
    }
}

/// A complete topology graph. Snapshots of this are immutable once published.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Topology {
    /// Stamped by the store on every replace
    pub generation: u64,
    /// `host:port` of the Raumfeld host serving zone jobs
    pub host: Option<String>,
    pub zones: Vec<Zone>,
    pub media_servers: Vec<Device>,
    pub config_devices: Vec<Device>,
    pub raumfeld_devices: Vec<Device>,
}

impl Topology {
    /// Zones commands can target, in discovery order.
    pub fn addressable_zones(&self) -> impl Iterator<Item = &Zone> {
        self.zones.iter().filter(|z| z.is_addressable())
    }

    pub fn zone_by_index(&self, index: usize) -> Option<&Zone> {
        self.addressable_zones().nth(index)
    }

    pub fn zone_with_room(&self, room_name: &str) -> Option<&Zone> {
        self.addressable_zones().find(|z| z.has_room(room_name))
    }

    pub fn zone_by_udn(&self, udn: &str) -> Option<&Zone> {
        self.zones.iter().find(|z| z.udn.as_deref() == Some(udn))
    }

    pub fn room_by_name(&self, name: &str) -> Option<&Room> {
        self.zones
            .iter()
            .flat_map(|z| z.rooms.iter())
            .find(|r| r.name == name)
    }

    pub fn room_by_udn(&self, udn: &str) -> Option<&Room> {
        self.zones
            .iter()
            .flat_map(|z| z.rooms.iter())
            .find(|r| r.udn == udn)
    }

    /// True if any zone, room, renderer or device carries this udn.
    pub fn contains_device(&self, udn: &str) -> bool {
        self.zones.iter().any(|z| {
            z.udn.as_deref() == Some(udn)
                || z.rooms
                    .iter()
                    .any(|r| r.udn == udn || r.renderer_udn.as_deref() == Some(udn))
        }) || self
            .media_servers
            .iter()
            .chain(self.config_devices.iter())
            .chain(self.raumfeld_devices.iter())
            .any(|d| d.udn == udn)
    }

    /// Every (device, eventing service) pair in the graph.
    ///
    /// Devices come first, then zone renderers, then room renderers. Rooms
    /// are keyed by their renderer udn when they have one.
    pub fn event_sources(&self) -> Vec<EventSource> {
        let mut sources = Vec::new();
        let mut push = |udn: &str, location: &str, services: &[ServiceEndpoint]| {
            for service in services {
                if let Some(path) = service.event_sub_url.as_deref().filter(|p| !p.is_empty()) {
                    let source = EventSource {
                        udn: udn.to_string(),
                        location: location.to_string(),
                        event_path: path.to_string(),
                    };
                    if !sources.contains(&source) {
                        sources.push(source);
                    }
                }
            }
        };

        for device in self
            .media_servers
            .iter()
            .chain(self.config_devices.iter())
            .chain(self.raumfeld_devices.iter())
        {
            push(&device.udn, &device.location, &device.services);
        }
        for zone in &self.zones {
            if let (Some(udn), Some(location)) = (zone.udn.as_deref(), zone.location.as_deref()) {
                push(udn, location, &zone.services);
            }
        }
        for room in self.zones.iter().flat_map(|z| z.rooms.iter()) {
            if let Some(location) = room.location.as_deref() {
                let udn = room.renderer_udn.as_deref().unwrap_or(&room.udn);
                push(udn, location, &room.services);
            }
        }
        sources
    }

    /// Merges one state variable into the zone or room carrying `udn`.
    ///
    /// Returns false when nothing in the graph matches.
    pub fn apply_delta(&mut self, udn: &str, name: &str, value: &str) -> bool {
        for zone in &mut self.zones {
            if zone.udn.as_deref() == Some(udn) {
                zone.apply(name, value);
                return true;
            }
            if let Some(room) = zone
                .rooms
                .iter_mut()
                .find(|r| r.udn == udn || r.renderer_udn.as_deref() == Some(udn))
            {
                room.apply(name, value);
                return true;
            }
        }
        false
    }
}

/// Accepts integer or decimal volumes and clamps them to 0..=100.
pub fn parse_volume(value: &str) -> Option<u8> {
    let value = value.trim();
    let volume = match value.parse::<i64>() {
        Ok(v) => v,
        Err(_) => {
            let f = value.parse::<f64>().ok().filter(|f| f.is_finite())?;
            f.round() as i64
        }
    };
    Some(clamp_volume(volume))
}

pub fn clamp_volume(value: i64) -> u8 {
    value.clamp(0, 100) as u8
}
