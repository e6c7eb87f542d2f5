//! Command dispatcher
//!
//! Pipeline per request: parse, resolve the target against one snapshot,
//! validate, invoke the remote action, echo the result into the store.
//! No lock is held while a remote call is in flight.

pub mod command;

pub use command::{
    format_timecode, parse_timecode, query_params, Command, Endpoint, QueryParams, RoomRef,
    Target, TransportAction,
};

use chrono::{Datelike, Local, Timelike};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::bus::{BusEvent, SharedBus};
use crate::error::ControlError;
use crate::subscription::SubscriptionRegistry;
use crate::timers::TimerTable;
use crate::topology::{clamp_volume, StaleFlag, Topology, TopologyStore, Zone};
use crate::upnp::{ControlTarget, HostClient, RendererClient};

pub struct Dispatcher {
    store: Arc<TopologyStore>,
    stale: Arc<StaleFlag>,
    subscriptions: Arc<SubscriptionRegistry>,
    timers: Arc<TimerTable>,
    renderer: RendererClient,
    host: HostClient,
    bus: SharedBus,
}

/// Resolves a target within one snapshot.
pub fn resolve<'a>(topology: &'a Topology, target: &Target) -> Result<&'a Zone, ControlError> {
    let zone = match target {
        Target::Index(index) => topology.zone_by_index(*index),
        Target::RoomName(name) => topology.zone_with_room(name),
        Target::ZoneUdn(udn) => topology.zone_by_udn(udn).filter(|z| z.is_addressable()),
    };
    zone.ok_or_else(|| ControlError::NotFound("zone not found".to_string()))
}

/// Zone udn plus where to send its control requests.
fn control_target(zone: &Zone) -> Result<(String, ControlTarget), ControlError> {
    let udn = zone
        .udn
        .clone()
        .ok_or_else(|| ControlError::Unavailable(format!("zone '{}' has no renderer", zone.name)))?;
    let target = ControlTarget::for_zone(zone)
        .ok_or_else(|| ControlError::Unavailable(format!("zone '{}' has no renderer", zone.name)))?;
    Ok((udn, target))
}

pub fn zones_json(topology: &Topology) -> Value {
    let mut index = 0usize;
    let zones: Vec<Value> = topology
        .zones
        .iter()
        .map(|zone| {
            let mut value = serde_json::to_value(zone).unwrap_or(Value::Null);
            if zone.is_addressable() {
                value["index"] = json!(index);
                index += 1;
            } else {
                value["index"] = Value::Null;
            }
            value
        })
        .collect();
    json!({ "generation": topology.generation, "zones": zones })
}

impl Dispatcher {
    pub fn new(
        store: Arc<TopologyStore>,
        stale: Arc<StaleFlag>,
        subscriptions: Arc<SubscriptionRegistry>,
        timers: Arc<TimerTable>,
        renderer: RendererClient,
        host: HostClient,
        bus: SharedBus,
    ) -> Self {
        Self {
            store,
            stale,
            subscriptions,
            timers,
            renderer,
            host,
            bus,
        }
    }

    /// Parses and runs one API request.
    pub async fn handle(
        &self,
        endpoint: Endpoint,
        params: &QueryParams,
    ) -> Result<Value, ControlError> {
        let name = command::first(params, "cmd").ok_or_else(|| ControlError::missing_param("cmd"))?;
        let command = Command::parse(endpoint, name, params)?;
        debug!("Dispatching {:?}", command);
        self.execute(command).await
    }

    pub async fn execute(&self, command: Command) -> Result<Value, ControlError> {
        if command.is_structural() {
            return self.structural(command).await;
        }

        let snapshot = self.store.snapshot().await;
        match command {
            Command::Zones => Ok(zones_json(&snapshot)),
            Command::Info => Ok(json!({
                "generation": snapshot.generation,
                "zones": zones_json(&snapshot)["zones"],
                "media_servers": snapshot.media_servers,
                "config_devices": snapshot.config_devices,
                "raumfeld_devices": snapshot.raumfeld_devices,
                "subscriptions": self.subscriptions.list().await,
            })),
            Command::Alarms => Ok(json!({ "alarms": self.timers.alarms().await })),
            Command::TimeDate => {
                let now = Local::now();
                Ok(json!({
                    "year": now.year(),
                    "month": now.month(),
                    "day": now.day(),
                    "hour": now.hour(),
                    "minute": now.minute(),
                    "second": now.second(),
                }))
            }
            Command::GetVolume(target) => {
                let zone = resolve(&snapshot, &target)?;
                Ok(json!({ "zone": zone.udn, "volume": zone.volume }))
            }
            Command::GetMedia(target) => {
                let zone = resolve(&snapshot, &target)?;
                Ok(json!({
                    "zone": zone.udn,
                    "media": zone.media,
                    "transport": zone.transport_state,
                    "metadata": zone.state_variables.get("CurrentTrackMetaData"),
                }))
            }
            Command::GetPosition(target) => {
                let (udn, control) = control_target(resolve(&snapshot, &target)?)?;
                let info = self.renderer.position_info(&control).await?;
                if let Some(position) = info.position() {
                    self.echo(&udn, "RelativeTimePosition", position).await;
                }
                Ok(json!({
                    "zone": udn,
                    "TrackDuration": info.track_duration,
                    "AbsTime": info.abs_time,
                    "RelTime": info.rel_time,
                    "TrackURI": info.track_uri,
                    "TrackMetaData": info.track_metadata,
                }))
            }
            Command::SetVolume { target, value } => {
                let (udn, control) = control_target(resolve(&snapshot, &target)?)?;
                let volume = clamp_volume(value);
                self.renderer.set_volume(&control, volume).await?;
                self.echo(&udn, "Volume", &volume.to_string()).await;
                Ok(json!({ "zone": udn, "volume": volume }))
            }
            Command::SetMedia { target, uri } => {
                let (udn, control) = control_target(resolve(&snapshot, &target)?)?;
                self.renderer.set_av_transport_uri(&control, &uri).await?;
                self.echo(&udn, "AVTransportURI", &uri).await;
                Ok(json!({ "zone": udn, "media": uri }))
            }
            Command::Sleep {
                target,
                stop_time,
                fade_secs,
            } => {
                let zone = resolve(&snapshot, &target)?;
                let udn = zone_udn(zone)?;
                let sleep = self
                    .timers
                    .set_sleep(&udn, stop_time, fade_secs, Local::now())
                    .await;
                info!("Sleep timer for {} at {}", udn, sleep.stop_at);
                Ok(json!({
                    "zone": udn,
                    "stop_time": stop_time.format("%H:%M").to_string(),
                    "fade_time": fade_secs,
                    "stop_at": sleep.stop_at,
                }))
            }
            Command::AddAlarm { time, room, volume } => {
                if snapshot.zone_with_room(&room).is_none() {
                    return Err(ControlError::NotFound(format!("room '{}' not found", room)));
                }
                let volume = clamp_volume(volume);
                let index = self.timers.add_alarm(time, &room, volume).await;
                Ok(json!({
                    "index": index,
                    "time": time.format("%H:%M").to_string(),
                    "room": room,
                    "volume": volume,
                }))
            }
            Command::Transport { target, action } => {
                let (udn, control) = control_target(resolve(&snapshot, &target)?)?;
                match action {
                    TransportAction::Play => self.renderer.play(&control).await?,
                    TransportAction::Pause => self.renderer.pause(&control).await?,
                    TransportAction::Stop => self.renderer.stop(&control).await?,
                    TransportAction::Next => self.renderer.next(&control).await?,
                    TransportAction::Previous => self.renderer.previous(&control).await?,
                }
                let state = match action {
                    TransportAction::Play => Some("PLAYING"),
                    TransportAction::Pause => Some("PAUSED_PLAYBACK"),
                    TransportAction::Stop => Some("STOPPED"),
                    TransportAction::Next | TransportAction::Previous => None,
                };
                if let Some(state) = state {
                    self.echo(&udn, "TransportState", state).await;
                }
                debug!("{} on {}", action.as_str(), udn);
                Ok(json!({}))
            }
            Command::Seek {
                target,
                position_secs,
            } => {
                let zone = resolve(&snapshot, &target)?;
                require_track(zone)?;
                let (udn, control) = control_target(zone)?;
                let timecode = format_timecode(position_secs);
                self.renderer.seek(&control, &timecode).await?;
                self.echo(&udn, "RelativeTimePosition", &timecode).await;
                Ok(json!({}))
            }
            Command::SeekRelative { target, delta_secs } => {
                let zone = resolve(&snapshot, &target)?;
                require_track(zone)?;
                let (udn, control) = control_target(zone)?;
                let info = self.renderer.position_info(&control).await?;
                let current = info.position().and_then(parse_timecode).unwrap_or(0) as i64;
                let timecode = format_timecode((current + delta_secs).max(0) as u64);
                self.renderer.seek(&control, &timecode).await?;
                self.echo(&udn, "RelativeTimePosition", &timecode).await;
                Ok(json!({ "position": timecode }))
            }
            Command::Fade {
                target,
                secs,
                start,
                end,
            } => {
                let zone = resolve(&snapshot, &target)?;
                let udn = zone_udn(zone)?;
                let fade = self
                    .timers
                    .start_fade(&udn, secs, clamp_volume(start), clamp_volume(end), Local::now())
                    .await;
                Ok(json!({
                    "zone": udn,
                    "time": fade.secs,
                    "start": fade.from,
                    "end": fade.to,
                }))
            }
            Command::RemoveAlarm { index } => match self.timers.remove_alarm(index).await {
                Some(alarm) => Ok(json!({ "removed": alarm })),
                None => Err(ControlError::NotFound(format!("no alarm at index {}", index))),
            },
            Command::RemoveSleep(target) => {
                let zone = resolve(&snapshot, &target)?;
                let udn = zone_udn(zone)?;
                Ok(json!({ "removed": self.timers.cancel_sleep(&udn).await }))
            }
            Command::CreateZone { .. }
            | Command::AddToZone { .. }
            | Command::RemoveRooms { .. }
            | Command::MoveRoom { .. }
            | Command::NewZoneForRoom { .. } => Err(ControlError::Internal(
                "structural command reached the state path".to_string(),
            )),
        }
    }

    /// Zone jobs on the host. Only one may be outstanding until discovery
    /// has rebuilt the topology.
    async fn structural(&self, command: Command) -> Result<Value, ControlError> {
        let snapshot = self.store.snapshot().await;
        let host = snapshot
            .host
            .clone()
            .ok_or_else(|| ControlError::Unavailable("raumfeld host not discovered".to_string()))?;

        // Resolve before claiming the fence so bad input never blocks others
        let plan = plan_structural(&snapshot, command)?;

        if !self.store.try_raise_structural_fence() {
            return Err(ControlError::Conflict(
                "zone change pending; retry after the topology refresh".to_string(),
            ));
        }

        // On failure, the rooms the host already acted on
        let result = match &plan {
            StructuralPlan::Connect { zone, rooms, .. } => self
                .host
                .connect_rooms_to_zone(&host, zone.as_deref(), rooms)
                .await
                .map_err(|e| (e, Vec::new())),
            StructuralPlan::Drop { rooms } => {
                let mut dropped = Vec::new();
                let mut outcome = Ok(());
                for room in rooms {
                    if let Err(e) = self.host.drop_room(&host, room).await {
                        outcome = Err((e, dropped.clone()));
                        break;
                    }
                    dropped.push(room.clone());
                }
                outcome
            }
        };

        if let Err((e, changed)) = result {
            if changed.is_empty() {
                self.store.release_structural_fence();
            } else {
                // The host topology moved; hold the fence until discovery catches up
                warn!(
                    "Zone job {} failed after dropping {:?}: {}",
                    plan.job(),
                    changed,
                    e
                );
                self.stale.raise();
            }
            return Err(e.into());
        }

        self.stale.raise();
        self.bus.publish(BusEvent::ZoneJobAccepted {
            job: plan.job().to_string(),
            rooms: plan.rooms().to_vec(),
        });
        info!("Zone job {} accepted for {:?}", plan.job(), plan.rooms());
        Ok(plan.response())
    }

    async fn echo(&self, udn: &str, variable: &str, value: &str) {
        self.store.apply_state_delta(udn, variable, value).await;
    }
}

fn zone_udn(zone: &Zone) -> Result<String, ControlError> {
    zone.udn
        .clone()
        .ok_or_else(|| ControlError::BadRequest(format!("zone '{}' has no udn yet", zone.name)))
}

fn require_track(zone: &Zone) -> Result<(), ControlError> {
    if zone.transport_state.has_track() {
        Ok(())
    } else {
        Err(ControlError::BadRequest(
            "seek needs a playing or paused track".to_string(),
        ))
    }
}

#[derive(Debug)]
enum StructuralPlan {
    /// `zone` None creates a new zone
    Connect {
        job: &'static str,
        zone: Option<String>,
        rooms: Vec<String>,
    },
    Drop {
        rooms: Vec<String>,
    },
}

impl StructuralPlan {
    fn job(&self) -> &'static str {
        match self {
            StructuralPlan::Connect { job, .. } => *job,
            StructuralPlan::Drop { .. } => "drop",
        }
    }

    fn rooms(&self) -> &[String] {
        match self {
            StructuralPlan::Connect { rooms, .. } | StructuralPlan::Drop { rooms } => rooms,
        }
    }

    fn response(&self) -> Value {
        match self {
            StructuralPlan::Connect { job, zone, rooms } => match *job {
                "createzone" => json!({ "rooms": rooms }),
                "moveroom" => json!({ "room": rooms.first(), "zone": zone }),
                "newzoneforroom" => json!({ "room": rooms.first() }),
                _ => json!({ "zone": zone, "rooms": rooms }),
            },
            StructuralPlan::Drop { rooms } => json!({ "rooms": rooms }),
        }
    }
}

fn room_udns(topology: &Topology, rooms: &[RoomRef]) -> Result<Vec<String>, ControlError> {
    rooms
        .iter()
        .map(|room| {
            let found = match room {
                RoomRef::Name(name) => topology.room_by_name(name),
                RoomRef::Udn(udn) => topology.room_by_udn(udn),
            };
            found.map(|r| r.udn.clone()).ok_or_else(|| {
                let label = match room {
                    RoomRef::Name(name) | RoomRef::Udn(name) => name,
                };
                ControlError::NotFound(format!("room '{}' not found", label))
            })
        })
        .collect()
}

fn plan_structural(topology: &Topology, command: Command) -> Result<StructuralPlan, ControlError> {
    match command {
        Command::CreateZone { rooms } => Ok(StructuralPlan::Connect {
            job: "createzone",
            zone: None,
            rooms: room_udns(topology, &rooms)?,
        }),
        Command::AddToZone { target, rooms } => {
            let zone = zone_udn(resolve(topology, &target)?)?;
            Ok(StructuralPlan::Connect {
                job: "addtozone",
                zone: Some(zone),
                rooms: room_udns(topology, &rooms)?,
            })
        }
        Command::MoveRoom { room_udn, zone_udn } => {
            if topology.zone_by_udn(&zone_udn).is_none() {
                return Err(ControlError::NotFound(format!("zone '{}' not found", zone_udn)));
            }
            Ok(StructuralPlan::Connect {
                job: "moveroom",
                zone: Some(zone_udn),
                rooms: room_udns(topology, &[RoomRef::Udn(room_udn)])?,
            })
        }
        Command::NewZoneForRoom { room_udn } => Ok(StructuralPlan::Connect {
            job: "newzoneforroom",
            zone: None,
            rooms: room_udns(topology, &[RoomRef::Udn(room_udn)])?,
        }),
        Command::RemoveRooms { rooms } => Ok(StructuralPlan::Drop {
            rooms: room_udns(topology, &rooms)?,
        }),
        other => Err(ControlError::Internal(format!(
            "{:?} is not a zone job",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::model::fixtures;

    #[test]
    fn test_resolve_targets() {
        let topology = fixtures::topology();
        assert_eq!(
            resolve(&topology, &Target::Index(1)).unwrap().udn.as_deref(),
            Some("uuid:zone-b")
        );
        assert!(matches!(
            resolve(&topology, &Target::Index(7)),
            Err(ControlError::NotFound(_))
        ));
        assert!(matches!(
            resolve(&topology, &Target::RoomName("Garage".into())),
            Err(ControlError::NotFound(_))
        ));
        assert_eq!(
            resolve(&topology, &Target::ZoneUdn("uuid:zone-a".into()))
                .unwrap()
                .name,
            "Kitchen"
        );
    }

    #[test]
    fn test_zones_json_indexes_addressable_only() {
        let json = zones_json(&fixtures::topology());
        let zones = json["zones"].as_array().unwrap();
        assert_eq!(zones.len(), 3);
        assert_eq!(zones[0]["index"], 0);
        assert!(zones[1]["index"].is_null());
        assert_eq!(zones[2]["index"], 1);
        assert_eq!(zones[2]["rooms"][1]["name"], "Study");
    }

    #[test]
    fn test_plan_create_zone_by_names() {
        let topology = fixtures::topology();
        let plan = plan_structural(
            &topology,
            Command::CreateZone {
                rooms: vec![RoomRef::Name("Kitchen".into()), RoomRef::Name("Study".into())],
            },
        )
        .unwrap();
        assert_eq!(plan.job(), "createzone");
        assert_eq!(plan.rooms(), ["uuid:kitchen".to_string(), "uuid:study".to_string()]);
    }

    #[test]
    fn test_plan_unknown_room() {
        let topology = fixtures::topology();
        assert!(matches!(
            plan_structural(
                &topology,
                Command::RemoveRooms {
                    rooms: vec![RoomRef::Udn("uuid:garage".into())]
                }
            ),
            Err(ControlError::NotFound(_))
        ));
    }

    #[test]
    fn test_require_track() {
        let mut topology = fixtures::topology();
        assert!(require_track(&topology.zones[0]).is_err());
        topology.apply_delta("uuid:zone-a", "TransportState", "PAUSED_PLAYBACK");
        assert!(require_track(&topology.zones[0]).is_ok());
    }
}
