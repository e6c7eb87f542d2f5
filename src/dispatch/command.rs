//! Command parsing: query parameters into a typed `Command`.
//!
//! Each endpoint has a name → parser table. Parsers only check shape; target
//! resolution happens against a topology snapshot in the dispatcher.

use chrono::NaiveTime;
use std::collections::HashMap;

use crate::error::ControlError;

/// Query string as key → all values, in order.
pub type QueryParams = HashMap<String, Vec<String>>;

pub fn query_params<I, K, V>(pairs: I) -> QueryParams
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let mut params = QueryParams::new();
    for (k, v) in pairs {
        params.entry(k.into()).or_default().push(v.into());
    }
    params
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Get,
    Set,
    Do,
    Remove,
}

/// How a command names its zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Position among addressable zones of the current snapshot
    Index(usize),
    RoomName(String),
    ZoneUdn(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomRef {
    Name(String),
    Udn(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportAction {
    Play,
    Pause,
    Stop,
    Next,
    Previous,
}

impl TransportAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Play => "play",
            Self::Pause => "pause",
            Self::Stop => "stop",
            Self::Next => "next",
            Self::Previous => "prev",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Zones,
    Info,
    Alarms,
    TimeDate,
    GetVolume(Target),
    GetMedia(Target),
    GetPosition(Target),
    /// Unclamped; the dispatcher clamps to 0..=100
    SetVolume { target: Target, value: i64 },
    SetMedia { target: Target, uri: String },
    Sleep {
        target: Target,
        stop_time: NaiveTime,
        fade_secs: u32,
    },
    AddAlarm {
        time: NaiveTime,
        room: String,
        volume: i64,
    },
    Transport {
        target: Target,
        action: TransportAction,
    },
    /// Absolute position in seconds
    Seek { target: Target, position_secs: u64 },
    SeekRelative { target: Target, delta_secs: i64 },
    Fade {
        target: Target,
        secs: u32,
        start: i64,
        end: i64,
    },
    CreateZone { rooms: Vec<RoomRef> },
    AddToZone { target: Target, rooms: Vec<RoomRef> },
    RemoveRooms { rooms: Vec<RoomRef> },
    MoveRoom { room_udn: String, zone_udn: String },
    NewZoneForRoom { room_udn: String },
    RemoveAlarm { index: usize },
    RemoveSleep(Target),
}

impl Command {
    /// Looks `name` up in the endpoint's table and parses its parameters.
    pub fn parse(endpoint: Endpoint, name: &str, params: &QueryParams) -> Result<Self, ControlError> {
        let table = match endpoint {
            Endpoint::Get => GET_COMMANDS,
            Endpoint::Set => SET_COMMANDS,
            Endpoint::Do => DO_COMMANDS,
            Endpoint::Remove => REMOVE_COMMANDS,
        };
        let (_, parser) = table
            .iter()
            .find(|(n, _)| *n == name)
            .ok_or_else(ControlError::page_not_found)?;
        parser(params)
    }

    /// Zone jobs that change room assignment on the host.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Command::CreateZone { .. }
                | Command::AddToZone { .. }
                | Command::RemoveRooms { .. }
                | Command::MoveRoom { .. }
                | Command::NewZoneForRoom { .. }
        )
    }
}

type Parser = fn(&QueryParams) -> Result<Command, ControlError>;

const GET_COMMANDS: &[(&str, Parser)] = &[
    ("zones", parse_zones),
    ("info", parse_info),
    ("alarms", parse_alarms),
    ("timedate", parse_timedate),
    ("volume", parse_get_volume),
    ("media", parse_get_media),
    ("position", parse_get_position),
];

const SET_COMMANDS: &[(&str, Parser)] = &[
    ("volume", parse_set_volume),
    ("vol", parse_set_volume),
    ("media", parse_set_media),
    ("sleep", parse_sleep),
    ("alarm", parse_alarm),
];

const DO_COMMANDS: &[(&str, Parser)] = &[
    ("play", parse_play),
    ("pause", parse_pause),
    ("stop", parse_stop),
    ("next", parse_next),
    ("prev", parse_prev),
    ("seek", parse_seek),
    ("seekfwd", parse_seek_forward),
    ("seekback", parse_seek_back),
    ("volume", parse_set_volume),
    ("fade", parse_fade),
    ("createzone", parse_create_zone),
    ("addtozone", parse_add_to_zone),
    ("removeroom", parse_remove_rooms),
    ("drop", parse_remove_rooms),
    ("moveroom", parse_move_room),
    ("newzoneforroom", parse_new_zone_for_room),
];

const REMOVE_COMMANDS: &[(&str, Parser)] = &[
    ("alarm", parse_remove_alarm),
    ("sleep", parse_remove_sleep),
];

pub fn first<'a>(params: &'a QueryParams, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .and_then(|values| values.first())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

fn required<'a>(params: &'a QueryParams, key: &str) -> Result<&'a str, ControlError> {
    first(params, key).ok_or_else(|| ControlError::missing_param(key))
}

fn number(params: &QueryParams, key: &str) -> Result<Option<i64>, ControlError> {
    first(params, key)
        .map(|raw| {
            raw.parse::<i64>()
                .ok()
                .or_else(|| {
                    raw.parse::<f64>()
                        .ok()
                        .filter(|f| f.is_finite())
                        .map(|f| f.round() as i64)
                })
                .ok_or_else(|| ControlError::BadRequest(format!("'{}' must be numeric", key)))
        })
        .transpose()
}

fn required_number(params: &QueryParams, key: &str) -> Result<i64, ControlError> {
    number(params, key)?.ok_or_else(|| ControlError::missing_param(key))
}

fn clock_time(params: &QueryParams, key: &str) -> Result<NaiveTime, ControlError> {
    let raw = required(params, key)?;
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .map_err(|_| ControlError::BadRequest(format!("'{}' must be HH:MM", key)))
}

/// `zoneudn`, then `hasroom`/`room`, then `zone` index (default 0).
pub fn target(params: &QueryParams) -> Result<Target, ControlError> {
    if let Some(udn) = first(params, "zoneudn") {
        return Ok(Target::ZoneUdn(udn.to_string()));
    }
    if let Some(room) = first(params, "hasroom").or_else(|| first(params, "room")) {
        return Ok(Target::RoomName(room.to_string()));
    }
    match first(params, "zone") {
        Some(raw) => raw
            .parse::<usize>()
            .map(Target::Index)
            .map_err(|_| ControlError::BadRequest("'zone' must be a zone index".to_string())),
        None => Ok(Target::Index(0)),
    }
}

/// `roomudn` values, else `rooms` names. Both accept repeats and comma lists.
fn room_refs(params: &QueryParams) -> Result<Vec<RoomRef>, ControlError> {
    let split = |key: &str| -> Vec<String> {
        params
            .get(key)
            .into_iter()
            .flatten()
            .flat_map(|v| v.split(','))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect()
    };
    let udns = split("roomudn");
    if !udns.is_empty() {
        return Ok(udns.into_iter().map(RoomRef::Udn).collect());
    }
    let names = split("rooms");
    if names.is_empty() {
        return Err(ControlError::missing_param("rooms"));
    }
    Ok(names.into_iter().map(RoomRef::Name).collect())
}

/// Seconds from `H:MM:SS`, `MM:SS` or a plain number of seconds.
pub fn parse_timecode(raw: &str) -> Option<u64> {
    let parts: Vec<&str> = raw.trim().split(':').collect();
    if parts.len() > 3 || parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    let mut secs = 0u64;
    for part in &parts {
        let value = match part.split_once('.') {
            Some((whole, _)) => whole.parse::<u64>().ok()?,
            None => part.parse::<u64>().ok()?,
        };
        secs = secs.checked_mul(60)?.checked_add(value)?;
    }
    Some(secs)
}

/// Non-negative and saturating at `u32::MAX`.
fn seconds(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

/// `H:MM:SS`, the shape renderers expect for REL_TIME.
pub fn format_timecode(secs: u64) -> String {
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

fn parse_zones(_: &QueryParams) -> Result<Command, ControlError> {
    Ok(Command::Zones)
}

fn parse_info(_: &QueryParams) -> Result<Command, ControlError> {
    Ok(Command::Info)
}

fn parse_alarms(_: &QueryParams) -> Result<Command, ControlError> {
    Ok(Command::Alarms)
}

fn parse_timedate(_: &QueryParams) -> Result<Command, ControlError> {
    Ok(Command::TimeDate)
}

fn parse_get_volume(params: &QueryParams) -> Result<Command, ControlError> {
    Ok(Command::GetVolume(target(params)?))
}

fn parse_get_media(params: &QueryParams) -> Result<Command, ControlError> {
    Ok(Command::GetMedia(target(params)?))
}

fn parse_get_position(params: &QueryParams) -> Result<Command, ControlError> {
    Ok(Command::GetPosition(target(params)?))
}

fn parse_set_volume(params: &QueryParams) -> Result<Command, ControlError> {
    Ok(Command::SetVolume {
        target: target(params)?,
        value: required_number(params, "value")?,
    })
}

fn parse_set_media(params: &QueryParams) -> Result<Command, ControlError> {
    Ok(Command::SetMedia {
        target: target(params)?,
        uri: required(params, "value")?.to_string(),
    })
}

fn parse_sleep(params: &QueryParams) -> Result<Command, ControlError> {
    let fade_secs = seconds(number(params, "fadetime")?.unwrap_or(0));
    Ok(Command::Sleep {
        target: target(params)?,
        stop_time: clock_time(params, "stoptime")?,
        fade_secs,
    })
}

fn parse_alarm(params: &QueryParams) -> Result<Command, ControlError> {
    Ok(Command::AddAlarm {
        time: clock_time(params, "time")?,
        room: required(params, "hasroom")?.to_string(),
        volume: required_number(params, "volume")?,
    })
}

fn transport(params: &QueryParams, action: TransportAction) -> Result<Command, ControlError> {
    Ok(Command::Transport {
        target: target(params)?,
        action,
    })
}

fn parse_play(params: &QueryParams) -> Result<Command, ControlError> {
    transport(params, TransportAction::Play)
}

fn parse_pause(params: &QueryParams) -> Result<Command, ControlError> {
    transport(params, TransportAction::Pause)
}

fn parse_stop(params: &QueryParams) -> Result<Command, ControlError> {
    transport(params, TransportAction::Stop)
}

fn parse_next(params: &QueryParams) -> Result<Command, ControlError> {
    transport(params, TransportAction::Next)
}

fn parse_prev(params: &QueryParams) -> Result<Command, ControlError> {
    transport(params, TransportAction::Previous)
}

fn parse_seek(params: &QueryParams) -> Result<Command, ControlError> {
    let raw = required(params, "value")?;
    let position_secs = parse_timecode(raw)
        .ok_or_else(|| ControlError::BadRequest("'value' must be HH:MM:SS or seconds".into()))?;
    Ok(Command::Seek {
        target: target(params)?,
        position_secs,
    })
}

fn seek_by(params: &QueryParams, sign: i64) -> Result<Command, ControlError> {
    let secs = number(params, "value")?
        .unwrap_or(10)
        .checked_abs()
        .ok_or_else(|| ControlError::BadRequest("'value' is out of range".into()))?;
    Ok(Command::SeekRelative {
        target: target(params)?,
        delta_secs: sign * secs,
    })
}

fn parse_seek_forward(params: &QueryParams) -> Result<Command, ControlError> {
    seek_by(params, 1)
}

fn parse_seek_back(params: &QueryParams) -> Result<Command, ControlError> {
    seek_by(params, -1)
}

fn parse_fade(params: &QueryParams) -> Result<Command, ControlError> {
    Ok(Command::Fade {
        target: target(params)?,
        secs: seconds(required_number(params, "time")?),
        start: required_number(params, "start")?,
        end: required_number(params, "end")?,
    })
}

fn parse_create_zone(params: &QueryParams) -> Result<Command, ControlError> {
    Ok(Command::CreateZone {
        rooms: room_refs(params)?,
    })
}

fn parse_add_to_zone(params: &QueryParams) -> Result<Command, ControlError> {
    Ok(Command::AddToZone {
        target: target(params)?,
        rooms: room_refs(params)?,
    })
}

fn parse_remove_rooms(params: &QueryParams) -> Result<Command, ControlError> {
    Ok(Command::RemoveRooms {
        rooms: room_refs(params)?,
    })
}

fn parse_move_room(params: &QueryParams) -> Result<Command, ControlError> {
    Ok(Command::MoveRoom {
        room_udn: required(params, "roomudn")?.to_string(),
        zone_udn: required(params, "zoneudn")?.to_string(),
    })
}

fn parse_new_zone_for_room(params: &QueryParams) -> Result<Command, ControlError> {
    Ok(Command::NewZoneForRoom {
        room_udn: required(params, "roomudn")?.to_string(),
    })
}

fn parse_remove_alarm(params: &QueryParams) -> Result<Command, ControlError> {
    let index = required_number(params, "index")?;
    let index = usize::try_from(index)
        .map_err(|_| ControlError::BadRequest("'index' must not be negative".into()))?;
    Ok(Command::RemoveAlarm { index })
}

fn parse_remove_sleep(params: &QueryParams) -> Result<Command, ControlError> {
    Ok(Command::RemoveSleep(target(params)?))
}
