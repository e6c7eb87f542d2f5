//! SOAP control of zone renderers (AVTransport and RenderingControl).

use regex::Regex;
use reqwest::Client;
use serde::Serialize;

use super::{UpnpError, UpnpResult};
use crate::topology::{ServiceEndpoint, Zone};

pub const AV_TRANSPORT_URN: &str = "urn:schemas-upnp-org:service:AVTransport:1";
pub const RENDERING_CONTROL_URN: &str = "urn:schemas-upnp-org:service:RenderingControl:1";

const INSTANCE: &str = "<InstanceID>0</InstanceID>";

/// Where to send control requests for one renderer.
#[derive(Debug, Clone)]
pub struct ControlTarget {
    /// `host:port`
    pub location: String,
    pub services: Vec<ServiceEndpoint>,
}

impl ControlTarget {
    /// The zone's virtual renderer, if discovery found one.
    pub fn for_zone(zone: &Zone) -> Option<Self> {
        zone.location.as_ref().map(|location| Self {
            location: location.clone(),
            services: zone.services.clone(),
        })
    }

    fn control_url(&self, service: &'static str) -> UpnpResult<String> {
        let path = self
            .services
            .iter()
            .find(|s| s.is(service))
            .and_then(|s| s.control_url.as_deref())
            .ok_or(UpnpError::MissingService(service))?;
        if path.starts_with("http://") || path.starts_with("https://") {
            return Ok(path.to_string());
        }
        let sep = if path.starts_with('/') { "" } else { "/" };
        Ok(format!("http://{}{}{}", self.location, sep, path))
    }
}

/// Subset of `GetPositionInfo` passed through to clients.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PositionInfo {
    pub track_duration: Option<String>,
    pub abs_time: Option<String>,
    pub rel_time: Option<String>,
    pub track_uri: Option<String>,
    /// DIDL-Lite, untouched
    pub track_metadata: Option<String>,
}

impl PositionInfo {
    /// Best available playback position.
    pub fn position(&self) -> Option<&str> {
        self.rel_time
            .as_deref()
            .filter(|t| !t.is_empty() && *t != "NOT_IMPLEMENTED")
            .or(self.abs_time.as_deref())
    }
}

#[derive(Clone)]
pub struct RendererClient {
    http: Client,
}

impl RendererClient {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    pub async fn play(&self, target: &ControlTarget) -> UpnpResult<()> {
        self.av_transport(target, "Play", &format!("{}<Speed>1</Speed>", INSTANCE))
            .await
    }

    pub async fn pause(&self, target: &ControlTarget) -> UpnpResult<()> {
        self.av_transport(target, "Pause", INSTANCE).await
    }

    pub async fn stop(&self, target: &ControlTarget) -> UpnpResult<()> {
        self.av_transport(target, "Stop", INSTANCE).await
    }

    pub async fn next(&self, target: &ControlTarget) -> UpnpResult<()> {
        self.av_transport(target, "Next", INSTANCE).await
    }

    pub async fn previous(&self, target: &ControlTarget) -> UpnpResult<()> {
        self.av_transport(target, "Previous", INSTANCE).await
    }

    /// Seeks within the current track. `timecode` is `H:MM:SS`.
    pub async fn seek(&self, target: &ControlTarget, timecode: &str) -> UpnpResult<()> {
        let body = format!(
            "{}<Unit>REL_TIME</Unit><Target>{}</Target>",
            INSTANCE,
            quick_xml::escape::escape(timecode)
        );
        self.av_transport(target, "Seek", &body).await
    }

    pub async fn set_av_transport_uri(&self, target: &ControlTarget, uri: &str) -> UpnpResult<()> {
        let body = format!(
            "{}<CurrentURI>{}</CurrentURI><CurrentURIMetaData></CurrentURIMetaData>",
            INSTANCE,
            quick_xml::escape::escape(uri)
        );
        self.av_transport(target, "SetAVTransportURI", &body).await
    }

    pub async fn position_info(&self, target: &ControlTarget) -> UpnpResult<PositionInfo> {
        let url = target.control_url("AVTransport")?;
        let xml = self
            .call(&url, AV_TRANSPORT_URN, "GetPositionInfo", INSTANCE)
            .await?;
        Ok(PositionInfo {
            track_duration: extract_xml_value(&xml, "TrackDuration"),
            abs_time: extract_xml_value(&xml, "AbsTime"),
            rel_time: extract_xml_value(&xml, "RelTime"),
            track_uri: extract_xml_value(&xml, "TrackURI"),
            track_metadata: extract_xml_value(&xml, "TrackMetaData").map(|m| unescape(&m)),
        })
    }

    pub async fn set_volume(&self, target: &ControlTarget, volume: u8) -> UpnpResult<()> {
        let url = target.control_url("RenderingControl")?;
        let body = format!(
            "{}<Channel>Master</Channel><DesiredVolume>{}</DesiredVolume>",
            INSTANCE, volume
        );
        self.call(&url, RENDERING_CONTROL_URN, "SetVolume", &body)
            .await?;
        Ok(())
    }

    async fn av_transport(
        &self,
        target: &ControlTarget,
        action: &str,
        body: &str,
    ) -> UpnpResult<()> {
        let url = target.control_url("AVTransport")?;
        self.call(&url, AV_TRANSPORT_URN, action, body).await?;
        Ok(())
    }

    async fn call(
        &self,
        url: &str,
        service_type: &str,
        action: &str,
        body_content: &str,
    ) -> UpnpResult<String> {
        let soap_body = format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
  <s:Body>
    <u:{action} xmlns:u="{service_type}">{body}</u:{action}>
  </s:Body>
</s:Envelope>"#,
            action = action,
            service_type = service_type,
            body = body_content
        );

        tracing::debug!("SOAP {} -> {}", action, url);
        let response = self
            .http
            .post(url)
            .header("Content-Type", "text/xml; charset=utf-8")
            .header("SOAPAction", format!("\"{}#{}\"", service_type, action))
            .body(soap_body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpnpError::Status(status.as_u16()));
        }
        Ok(response.text().await?)
    }
}

/// Extract XML value, handling optional namespace prefixes (e.g., <u:Volume> or <Volume>)
pub fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let pattern = format!(
        r"<(?:[^:>]+:)?{}\b[^>]*>([^<]*)</(?:[^:>]+:)?{}>",
        regex::escape(tag),
        regex::escape(tag)
    );

    let re = Regex::new(&pattern).ok()?;
    re.captures(xml)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn unescape(value: &str) -> String {
    quick_xml::escape::unescape(value)
        .map(|v| v.into_owned())
        .unwrap_or_else(|_| value.to_string())
}
