//! Clients for the remote side: renderer SOAP control, GENA eventing,
//! device descriptions and the Raumfeld host's zone API.

pub mod description;
pub mod gena;
pub mod host;
pub mod soap;

use thiserror::Error;

pub use description::{network_location, DescriptionClient, DeviceDescription};
pub use gena::{GenaClient, SubscribeResponse};
pub use host::{HostClient, ListedDevice, ZoneConfig, HOST_PORT};
pub use soap::{ControlTarget, PositionInfo, RendererClient};

#[derive(Debug, Error)]
pub enum UpnpError {
    /// Connection refused, timed out, or similar
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("device answered with HTTP {0}")]
    Status(u16),

    #[error("response missing {0} header")]
    MissingHeader(&'static str),

    #[error("device does not advertise {0}")]
    MissingService(&'static str),

    #[error("unexpected response: {0}")]
    Parse(String),
}

impl From<quick_xml::DeError> for UpnpError {
    fn from(e: quick_xml::DeError) -> Self {
        UpnpError::Parse(e.to_string())
    }
}

impl From<url::ParseError> for UpnpError {
    fn from(e: url::ParseError) -> Self {
        UpnpError::Parse(e.to_string())
    }
}

pub type UpnpResult<T> = Result<T, UpnpError>;
