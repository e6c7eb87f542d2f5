//! Mock Raumfeld host and renderer
//!
//! The host serves `/listDevices`, `/getZones` and the zone job endpoints.
//! A device serves its description, SOAP control for AVTransport and
//! RenderingControl, and GENA SUBSCRIBE on its event paths.
//! Note: no SSDP; tests point the control point at the host directly.

use axum::{
    body::Body,
    extract::{RawQuery, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Router,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

async fn serve(app: Router) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, handle)
}

fn xml(body: String) -> Response {
    Response::builder()
        .header(header::CONTENT_TYPE, "text/xml; charset=utf-8")
        .body(Body::from(body))
        .unwrap()
}

// =============================================================================
// Renderer
// =============================================================================

/// Mock renderer state
#[derive(Debug, Clone)]
pub struct MockDeviceState {
    pub udn: String,
    pub transport_state: String,
    pub volume: u32,
    /// SUBSCRIBE requests seen, per event path
    pub subscribes: HashMap<String, usize>,
    /// Every SOAP action received, in order
    pub actions: Vec<String>,
    /// Sent back as the TIMEOUT header; None omits the header
    pub timeout_header: Option<String>,
    next_sid: usize,
}

impl MockDeviceState {
    fn new(udn: &str) -> Self {
        Self {
            udn: udn.to_string(),
            transport_state: "STOPPED".to_string(),
            volume: 30,
            subscribes: HashMap::new(),
            actions: Vec::new(),
            timeout_header: Some("Second-180".to_string()),
            next_sid: 1,
        }
    }
}

type DeviceState = Arc<RwLock<MockDeviceState>>;

pub struct MockRaumfeldDevice {
    addr: SocketAddr,
    state: DeviceState,
    handle: JoinHandle<()>,
}

impl MockRaumfeldDevice {
    /// Start a renderer for `udn` on a random port
    pub async fn start(udn: &str) -> Self {
        let state = Arc::new(RwLock::new(MockDeviceState::new(udn)));

        let app = Router::new()
            .route("/description.xml", get(handle_description))
            .route("/AVTransport/ctrl", post(handle_soap))
            .route("/RenderingControl/ctrl", post(handle_soap))
            .route("/evt", any(handle_subscribe))
            .route("/AVTransport/evt", any(handle_subscribe))
            .route("/RenderingControl/evt", any(handle_subscribe))
            .with_state(state.clone());

        let (addr, handle) = serve(app).await;
        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `host:port`, as the topology stores it
    pub fn location(&self) -> String {
        self.addr.to_string()
    }

    pub fn description_url(&self) -> String {
        format!("http://{}/description.xml", self.addr)
    }

    pub async fn subscribe_count(&self, path: &str) -> usize {
        self.state
            .read()
            .await
            .subscribes
            .get(path)
            .copied()
            .unwrap_or(0)
    }

    pub async fn total_subscribes(&self) -> usize {
        self.state.read().await.subscribes.values().sum()
    }

    pub async fn volume(&self) -> u32 {
        self.state.read().await.volume
    }

    pub async fn transport_state(&self) -> String {
        self.state.read().await.transport_state.clone()
    }

    pub async fn actions(&self) -> Vec<String> {
        self.state.read().await.actions.clone()
    }

    pub async fn set_timeout_header(&self, value: Option<&str>) {
        self.state.write().await.timeout_header = value.map(str::to_string);
    }

    /// Stop the mock server; later requests are refused
    pub async fn stop(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

async fn handle_description(State(state): State<DeviceState>) -> Response {
    let udn = state.read().await.udn.clone();
    xml(format!(
        r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <specVersion><major>1</major><minor>0</minor></specVersion>
  <device>
    <deviceType>urn:schemas-upnp-org:device:MediaRenderer:1</deviceType>
    <friendlyName>Mock Renderer</friendlyName>
    <manufacturer>Raumfeld</manufacturer>
    <UDN>{}</UDN>
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
</root>"#,
        udn
    ))
}

fn soap_response(action: &str, service: &str, inner: &str) -> Response {
    xml(format!(
        r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Body>
    <u:{action}Response xmlns:u="urn:schemas-upnp-org:service:{service}:1">{inner}</u:{action}Response>
  </s:Body>
</s:Envelope>"#
    ))
}

fn element<'a>(body: &'a str, name: &str) -> Option<&'a str> {
    let open = format!("<{}>", name);
    let close = format!("</{}>", name);
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(&body[start..end])
}

async fn handle_soap(
    State(state): State<DeviceState>,
    headers: HeaderMap,
    uri: Uri,
    body: String,
) -> Response {
    let soap_action = headers
        .get("soapaction")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .trim_matches('"')
        .to_string();
    let Some((_, action)) = soap_action.split_once('#') else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let service = if uri.path().starts_with("/RenderingControl") {
        "RenderingControl"
    } else {
        "AVTransport"
    };

    let mut state = state.write().await;
    state.actions.push(action.to_string());

    match action {
        "Play" => state.transport_state = "PLAYING".to_string(),
        "Pause" => state.transport_state = "PAUSED_PLAYBACK".to_string(),
        "Stop" => state.transport_state = "STOPPED".to_string(),
        "SetVolume" => {
            let Some(volume) = element(&body, "DesiredVolume").and_then(|v| v.parse().ok()) else {
                return StatusCode::BAD_REQUEST.into_response();
            };
            state.volume = volume;
        }
        "GetVolume" => {
            let inner = format!("<CurrentVolume>{}</CurrentVolume>", state.volume);
            return soap_response(action, service, &inner);
        }
        "GetPositionInfo" => {
            let inner = "<Track>1</Track><TrackDuration>0:04:00</TrackDuration>\
                         <TrackURI>http://10.0.0.2/track.flac</TrackURI>\
                         <RelTime>0:01:30</RelTime><AbsTime>0:01:30</AbsTime>";
            return soap_response(action, service, inner);
        }
        _ => {}
    }
    soap_response(action, service, "")
}

async fn handle_subscribe(
    State(state): State<DeviceState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    if method.as_str() != "SUBSCRIBE" {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    if headers.get("callback").is_none() || headers.get("nt").is_none() {
        return StatusCode::PRECONDITION_FAILED.into_response();
    }

    let mut state = state.write().await;
    *state.subscribes.entry(uri.path().to_string()).or_insert(0) += 1;
    let sid = format!("uuid:sub-{}", state.next_sid);
    state.next_sid += 1;

    let mut response = Response::builder().status(StatusCode::OK).header("SID", sid);
    if let Some(timeout) = &state.timeout_header {
        response = response.header("TIMEOUT", timeout.as_str());
    }
    response.body(Body::empty()).unwrap()
}

// =============================================================================
// Host
// =============================================================================

/// One `<device>` line of `/listDevices`
#[derive(Debug, Clone)]
pub struct ListedDevice {
    pub udn: String,
    pub location: String,
    pub device_type: String,
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct MockHostState {
    pub devices: Vec<ListedDevice>,
    /// Body of `/getZones`
    pub zone_config: String,
    /// Raw query of every zone job, prefixed with its endpoint
    pub jobs: Vec<String>,
    /// Room udns whose `/dropRoomJob` answers 500
    pub rejected_drops: Vec<String>,
}

type HostState = Arc<RwLock<MockHostState>>;

pub struct MockRaumfeldHost {
    addr: SocketAddr,
    state: HostState,
    handle: JoinHandle<()>,
}

impl MockRaumfeldHost {
    pub async fn start() -> Self {
        let state = Arc::new(RwLock::new(MockHostState {
            zone_config: "<zoneConfig><zones/></zoneConfig>".to_string(),
            ..Default::default()
        }));

        let app = Router::new()
            .route("/listDevices", get(handle_list_devices))
            .route("/getZones", get(handle_get_zones))
            .route("/connectRoomsToZone", get(handle_connect))
            .route("/dropRoomJob", get(handle_drop))
            .with_state(state.clone());

        let (addr, handle) = serve(app).await;
        Self {
            addr,
            state,
            handle,
        }
    }

    /// `ip:port` to configure as the host
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub async fn add_renderer(&self, device: &MockRaumfeldDevice, name: &str) {
        self.state.write().await.devices.push(ListedDevice {
            udn: device.state.read().await.udn.clone(),
            location: device.description_url(),
            device_type: "urn:schemas-upnp-org:device:MediaRenderer:1".to_string(),
            name: name.to_string(),
        });
    }

    pub async fn set_zone_config(&self, xml: &str) {
        self.state.write().await.zone_config = xml.to_string();
    }

    pub async fn reject_drop(&self, room_udn: &str) {
        self.state
            .write()
            .await
            .rejected_drops
            .push(room_udn.to_string());
    }

    pub async fn jobs(&self) -> Vec<String> {
        self.state.read().await.jobs.clone()
    }

    pub async fn stop(self) {
        self.handle.abort();
    }
}

async fn handle_list_devices(State(state): State<HostState>) -> Response {
    let state = state.read().await;
    let devices: String = state
        .devices
        .iter()
        .map(|d| {
            format!(
                r#"<device location="{}" udn="{}" type="{}">{}</device>"#,
                d.location, d.udn, d.device_type, d.name
            )
        })
        .collect();
    xml(format!("<devices>{}</devices>", devices))
}

async fn handle_get_zones(State(state): State<HostState>) -> Response {
    xml(state.read().await.zone_config.clone())
}

async fn handle_connect(State(state): State<HostState>, RawQuery(query): RawQuery) -> StatusCode {
    state
        .write()
        .await
        .jobs
        .push(format!("connectRoomsToZone?{}", query.unwrap_or_default()));
    StatusCode::OK
}

async fn handle_drop(State(state): State<HostState>, RawQuery(query): RawQuery) -> StatusCode {
    let query = query.unwrap_or_default();
    let mut state = state.write().await;
    let rejected = state
        .rejected_drops
        .iter()
        .any(|udn| query == format!("roomUDN={}", urlencoding::encode(udn)));
    state.jobs.push(format!("dropRoomJob?{}", query));
    if rejected {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    }
}

/// `<zoneConfig>` with one zone holding one room whose renderer is `renderer_udn`.
pub fn single_zone_config(zone_udn: &str, room_udn: &str, room: &str, renderer_udn: &str) -> String {
    format!(
        r#"<zoneConfig>
  <zones>
    <zone udn="{zone_udn}">
      <room udn="{room_udn}" name="{room}"><renderer udn="{renderer_udn}" name="{room} Speaker"/></room>
    </zone>
  </zones>
  <unassignedRooms><room udn="uuid:spare-room" name="Spare"/></unassignedRooms>
</zoneConfig>"#
    )
}
