//! Notification processor: turns inbound GENA NOTIFY bodies into state deltas.
//!
//! Only `LastChange`, `Revision`, `SystemUpdateID` and `BufferFilled` are read
//! from the property set. A zone-config change announced through `LastChange`
//! marks the topology stale instead of producing deltas.

use quick_xml::events::attributes::AttrError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::bus::{BusEvent, SharedBus};
use crate::topology::{StaleFlag, TopologyStore};

/// Substring of a config-device `LastChange` that means rooms were regrouped.
pub const ROOMS_CHANGED_MARKER: &str = "/Preferences/ZoneConfig/Rooms";

const RECOGNIZED: &[&str] = &["LastChange", "Revision", "SystemUpdateID", "BufferFilled"];

#[derive(Debug, Error)]
pub enum ParseError {
    #[error(transparent)]
    Xml(#[from] quick_xml::Error),
    #[error(transparent)]
    Attribute(#[from] AttrError),
    #[error("no XML element found")]
    NoDocument,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// Number of deltas the store accepted
    Applied(usize),
    TopologyStale,
    /// Nothing usable (no udn in the path, or no recognized properties)
    Ignored,
    Malformed,
}

/// Recognized `(property, text)` pairs of a `propertyset` document.
pub fn parse_property_set(body: &str) -> Result<Vec<(String, String)>, ParseError> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut properties = Vec::new();
    let mut current: Option<(String, String)> = None;
    let mut saw_root = false;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                saw_root = true;
                let name = local_name(&e);
                if current.is_none() && RECOGNIZED.contains(&name.as_str()) {
                    current = Some((name, String::new()));
                }
            }
            Event::Empty(_) => saw_root = true,
            Event::Text(t) => {
                if let Some((_, text)) = current.as_mut() {
                    text.push_str(&t.unescape()?);
                }
            }
            Event::CData(c) => {
                if let Some((_, text)) = current.as_mut() {
                    text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Event::End(e) => {
                let ended = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if current.as_ref().map(|(name, _)| *name == ended).unwrap_or(false) {
                    if let Some(property) = current.take() {
                        properties.push(property);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        return Err(ParseError::NoDocument);
    }
    Ok(properties)
}

/// `(name, val)` pairs of a `LastChange` `<Event><InstanceID>` document.
///
/// Elements carrying a `channel` other than `Master` are skipped.
pub fn parse_last_change(xml: &str) -> Result<Vec<(String, String)>, ParseError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut pairs = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) => {
                let name = local_name(&e);
                if name == "Event" || name == "InstanceID" {
                    continue;
                }
                let mut val = None;
                let mut master = true;
                for attr in e.attributes() {
                    let attr = attr?;
                    match attr.key.local_name().as_ref() {
                        b"val" => val = Some(attr.unescape_value()?.into_owned()),
                        b"channel" => master = attr.unescape_value()? == "Master",
                        _ => {}
                    }
                }
                if let (Some(val), true) = (val, master) {
                    pairs.push((name, val));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(pairs)
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

/// Device udn for a callback path: `/abc` is `uuid:abc`.
pub fn udn_from_path(path: &str) -> Option<String> {
    let suffix = path.trim_start_matches('/').trim_end_matches('/');
    (!suffix.is_empty()).then(|| format!("uuid:{}", suffix))
}

pub struct NotificationProcessor {
    store: Arc<TopologyStore>,
    stale: Arc<StaleFlag>,
    bus: SharedBus,
}

impl NotificationProcessor {
    pub fn new(store: Arc<TopologyStore>, stale: Arc<StaleFlag>, bus: SharedBus) -> Self {
        Self { store, stale, bus }
    }

    /// Handles one NOTIFY. Never fails; the caller always answers 200.
    pub async fn process(&self, path: &str, body: &str) -> NotifyOutcome {
        let Some(udn) = udn_from_path(path) else {
            debug!("NOTIFY without device path");
            return NotifyOutcome::Ignored;
        };

        let properties = match parse_property_set(body) {
            Ok(p) => p,
            Err(e) => {
                warn!("Dropping malformed NOTIFY for {}: {}", udn, e);
                return NotifyOutcome::Malformed;
            }
        };
        if properties.is_empty() {
            return NotifyOutcome::Ignored;
        }

        let mut deltas = Vec::new();
        for (name, value) in properties {
            if name != "LastChange" {
                deltas.push((name, value));
                continue;
            }
            if value.contains(ROOMS_CHANGED_MARKER) {
                debug!("Zone config changed (reported by {})", udn);
                self.stale.raise();
                self.bus.publish(BusEvent::TopologyStale);
                return NotifyOutcome::TopologyStale;
            }
            match parse_last_change(&value) {
                Ok(pairs) => deltas.extend(pairs),
                Err(e) => {
                    warn!("Dropping malformed LastChange for {}: {}", udn, e);
                    return NotifyOutcome::Malformed;
                }
            }
        }

        let mut applied = 0;
        for (name, value) in deltas {
            if self.store.apply_state_delta(&udn, &name, &value).await {
                applied += 1;
            }
        }
        NotifyOutcome::Applied(applied)
    }
}
