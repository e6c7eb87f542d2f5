//! Device description fetching (`description.xml`).

use quick_xml::de::from_str as xml_from_str;
use reqwest::Client;
use serde::Deserialize;

use super::{UpnpError, UpnpResult};
use crate::topology::ServiceEndpoint;

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDescription {
    pub udn: Option<String>,
    pub friendly_name: Option<String>,
    pub device_type: Option<String>,
    pub services: Vec<ServiceEndpoint>,
}

#[derive(Deserialize)]
struct Root {
    device: DeviceDesc,
}

#[derive(Deserialize)]
struct DeviceDesc {
    #[serde(rename = "deviceType")]
    device_type: Option<String>,
    #[serde(rename = "friendlyName")]
    friendly_name: Option<String>,
    #[serde(rename = "UDN")]
    udn: Option<String>,
    #[serde(rename = "serviceList")]
    service_list: Option<ServiceList>,
}

#[derive(Deserialize)]
struct ServiceList {
    #[serde(default)]
    service: Vec<ServiceDesc>,
}

#[derive(Deserialize)]
struct ServiceDesc {
    #[serde(rename = "serviceType")]
    service_type: String,
    #[serde(rename = "controlURL")]
    control_url: Option<String>,
    #[serde(rename = "eventSubURL")]
    event_sub_url: Option<String>,
}

pub fn parse_description(xml: &str) -> UpnpResult<DeviceDescription> {
    let root: Root = xml_from_str(xml)?;
    let device = root.device;
    let services = device
        .service_list
        .map(|list| {
            list.service
                .into_iter()
                .map(|s| ServiceEndpoint {
                    service_type: s.service_type.trim().to_string(),
                    control_url: s.control_url.map(|u| u.trim().to_string()),
                    event_sub_url: s.event_sub_url.map(|u| u.trim().to_string()),
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(DeviceDescription {
        udn: device.udn.map(|u| u.trim().to_string()),
        friendly_name: device.friendly_name,
        device_type: device.device_type,
        services,
    })
}

/// `host:port` of a description URL; port 80 when the URL has none.
pub fn network_location(location: &str) -> UpnpResult<String> {
    let url = url::Url::parse(location)?;
    let host = url
        .host_str()
        .ok_or_else(|| UpnpError::Parse(format!("no host in {}", location)))?;
    Ok(format!("{}:{}", host, url.port_or_known_default().unwrap_or(80)))
}

#[derive(Clone)]
pub struct DescriptionClient {
    http: Client,
}

impl DescriptionClient {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    pub async fn fetch(&self, location: &str) -> UpnpResult<DeviceDescription> {
        let response = self.http.get(location).send().await?;
        if !response.status().is_success() {
            return Err(UpnpError::Status(response.status().as_u16()));
        }
        let xml = response.text().await?;
        parse_description(&xml)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RENDERER_XML: &str = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <specVersion><major>1</major><minor>0</minor></specVersion>
  <device>
    <deviceType>urn:schemas-upnp-org:device:MediaRenderer:1</deviceType>
    <friendlyName>Kitchen</friendlyName>
    <UDN>uuid:abc</UDN>
    <serviceList>
      <service>
        <serviceType>urn:schemas-upnp-org:service:AVTransport:1</serviceType>
        <serviceId>urn:upnp-org:serviceId:AVTransport</serviceId>
        <controlURL>/AVTransport/ctrl</controlURL>
        <eventSubURL>/AVTransport/evt</eventSubURL>
      </service>
      <service>
        <serviceType>urn:schemas-upnp-org:service:RenderingControl:1</serviceType>
        <serviceId>urn:upnp-org:serviceId:RenderingControl</serviceId>
        <controlURL>/RenderingControl/ctrl</controlURL>
        <eventSubURL>/RenderingControl/evt</eventSubURL>
      </service>
    </serviceList>
  </device>
</root>"#;

    #[test]
    fn test_parse_renderer_description() {
        let desc = parse_description(RENDERER_XML).unwrap();
        assert_eq!(desc.udn.as_deref(), Some("uuid:abc"));
        assert_eq!(desc.friendly_name.as_deref(), Some("Kitchen"));
        assert_eq!(desc.services.len(), 2);
        assert!(desc.services[0].is("AVTransport"));
        assert_eq!(
            desc.services[1].event_sub_url.as_deref(),
            Some("/RenderingControl/evt")
        );
    }

    #[test]
    fn test_parse_description_without_services() {
        let xml = "<root><device><friendlyName>Host</friendlyName></device></root>";
        let desc = parse_description(xml).unwrap();
        assert!(desc.services.is_empty());
        assert!(desc.udn.is_none());
    }

    #[test]
    fn test_network_location() {
        assert_eq!(
            network_location("http://10.0.0.5:52000/description.xml").unwrap(),
            "10.0.0.5:52000"
        );
        assert_eq!(network_location("http://10.0.0.5/d.xml").unwrap(), "10.0.0.5:80");
        assert!(network_location("not a url").is_err());
    }
}
