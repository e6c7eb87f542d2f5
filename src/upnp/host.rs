//! Raumfeld host (config device) HTTP API.
//!
//! The host serves the device list, the zone configuration and the structural
//! zone jobs on its own port:
//!
//! ```text
//! GET /listDevices
//! GET /getZones
//! GET /connectRoomsToZone?zoneUDN=<udn or empty>&roomUDNs=<udn,udn>
//! GET /dropRoomJob?roomUDN=<udn>
//! ```

use quick_xml::de::from_str as xml_from_str;
use reqwest::Client;
use serde::Deserialize;

use super::{UpnpError, UpnpResult};

pub const HOST_PORT: u16 = 47365;

/// Appends the default host port when `host` has none.
pub fn host_address(host: &str) -> String {
    if host.contains(':') {
        host.to_string()
    } else {
        format!("{}:{}", host, HOST_PORT)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ListedDevice {
    #[serde(rename = "@udn")]
    pub udn: String,
    #[serde(rename = "@location")]
    pub location: String,
    #[serde(rename = "@type", default)]
    pub device_type: String,
    #[serde(rename = "$text", default)]
    pub name: String,
}

#[derive(Deserialize)]
struct DeviceList {
    #[serde(rename = "device", default)]
    devices: Vec<ListedDevice>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConfiguredRenderer {
    #[serde(rename = "@udn")]
    pub udn: String,
    #[serde(rename = "@name", default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConfiguredRoom {
    #[serde(rename = "@udn")]
    pub udn: String,
    #[serde(rename = "@name", default)]
    pub name: String,
    #[serde(rename = "renderer", default)]
    pub renderers: Vec<ConfiguredRenderer>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConfiguredZone {
    #[serde(rename = "@udn")]
    pub udn: String,
    #[serde(rename = "room", default)]
    pub rooms: Vec<ConfiguredRoom>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
struct ZoneList {
    #[serde(rename = "zone", default)]
    zones: Vec<ConfiguredZone>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
struct RoomList {
    #[serde(rename = "room", default)]
    rooms: Vec<ConfiguredRoom>,
}

#[derive(Deserialize)]
struct ZoneConfigDoc {
    #[serde(default)]
    zones: ZoneList,
    #[serde(rename = "unassignedRooms", default)]
    unassigned_rooms: RoomList,
}

/// Zone assignment as the host sees it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZoneConfig {
    pub zones: Vec<ConfiguredZone>,
    pub unassigned_rooms: Vec<ConfiguredRoom>,
}

pub fn parse_device_list(xml: &str) -> UpnpResult<Vec<ListedDevice>> {
    let list: DeviceList = xml_from_str(xml)?;
    Ok(list.devices)
}

pub fn parse_zone_config(xml: &str) -> UpnpResult<ZoneConfig> {
    let doc: ZoneConfigDoc = xml_from_str(xml)?;
    Ok(ZoneConfig {
        zones: doc.zones.zones,
        unassigned_rooms: doc.unassigned_rooms.rooms,
    })
}

#[derive(Clone)]
pub struct HostClient {
    http: Client,
}

impl HostClient {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    pub async fn list_devices(&self, host: &str) -> UpnpResult<Vec<ListedDevice>> {
        let xml = self.get(host, "/listDevices").await?;
        parse_device_list(&xml)
    }

    pub async fn zone_config(&self, host: &str) -> UpnpResult<ZoneConfig> {
        let xml = self.get(host, "/getZones").await?;
        parse_zone_config(&xml)
    }

    /// Puts rooms into a zone. `None` creates a new zone.
    pub async fn connect_rooms_to_zone(
        &self,
        host: &str,
        zone_udn: Option<&str>,
        room_udns: &[String],
    ) -> UpnpResult<()> {
        let path = format!(
            "/connectRoomsToZone?zoneUDN={}&roomUDNs={}",
            urlencoding::encode(zone_udn.unwrap_or("")),
            urlencoding::encode(&room_udns.join(","))
        );
        self.get(host, &path).await?;
        Ok(())
    }

    /// Takes a room out of its zone.
    pub async fn drop_room(&self, host: &str, room_udn: &str) -> UpnpResult<()> {
        let path = format!("/dropRoomJob?roomUDN={}", urlencoding::encode(room_udn));
        self.get(host, &path).await?;
        Ok(())
    }

    async fn get(&self, host: &str, path: &str) -> UpnpResult<String> {
        let url = format!("http://{}{}", host_address(host), path);
        tracing::debug!("Host request {}", url);
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(UpnpError::Status(response.status().as_u16()));
        }
        Ok(response.text().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_address_default_port() {
        assert_eq!(host_address("10.0.0.2"), "10.0.0.2:47365");
        assert_eq!(host_address("10.0.0.2:8080"), "10.0.0.2:8080");
    }

    #[test]
    fn test_parse_device_list() {
        let xml = r#"<devices>
  <device location="http://10.0.0.5:52000/description.xml" udn="uuid:zone-a" type="urn:schemas-upnp-org:device:MediaRenderer:1">Kitchen</device>
  <device location="http://10.0.0.2:52100/description.xml" udn="uuid:media" type="urn:schemas-upnp-org:device:MediaServer:1">Media</device>
</devices>"#;
        let devices = parse_device_list(xml).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].udn, "uuid:zone-a");
        assert_eq!(devices[0].name, "Kitchen");
        assert!(devices[1].device_type.contains("MediaServer"));
    }

    #[test]
    fn test_parse_zone_config() {
        let xml = r#"<zoneConfig numRooms="3">
  <zones>
    <zone udn="uuid:zone-a">
      <room udn="uuid:kitchen" name="Kitchen"><renderer udn="uuid:kitchen-r" name="Speaker"/></room>
      <room udn="uuid:living" name="Living"><renderer udn="uuid:living-r" name="Speaker"/></room>
    </zone>
  </zones>
  <unassignedRooms>
    <room udn="uuid:bath" name="Bath"/>
  </unassignedRooms>
</zoneConfig>"#;
        let config = parse_zone_config(xml).unwrap();
        assert_eq!(config.zones.len(), 1);
        assert_eq!(config.zones[0].rooms.len(), 2);
        assert_eq!(config.zones[0].rooms[1].renderers[0].udn, "uuid:living-r");
        assert_eq!(config.unassigned_rooms[0].name, "Bath");
    }

    #[test]
    fn test_parse_empty_zone_config() {
        let config = parse_zone_config("<zoneConfig/>").unwrap();
        assert!(config.zones.is_empty());
        assert!(config.unassigned_rooms.is_empty());
    }
}
