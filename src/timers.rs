//! Fade, sleep and alarm timers evaluated by the tick loop.
//!
//! Evaluation is pure bookkeeping: `due` returns the actions to run and the
//! tick loop executes them through the dispatcher.

use chrono::{DateTime, Duration, Local, NaiveDate, NaiveTime};
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::topology::Topology;

fn hhmm<S: Serializer>(time: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&time.format("%H:%M").to_string())
}

/// Linear volume ramp on one zone.
#[derive(Debug, Clone, Serialize)]
pub struct Fade {
    pub zone_udn: String,
    pub started: DateTime<Local>,
    pub secs: u32,
    pub from: u8,
    pub to: u8,
    #[serde(skip)]
    last_sent: Option<u8>,
}

impl Fade {
    pub fn new(zone_udn: &str, started: DateTime<Local>, secs: u32, from: u8, to: u8) -> Self {
        Self {
            zone_udn: zone_udn.to_string(),
            started,
            secs,
            from,
            to,
            last_sent: None,
        }
    }

    /// Volume at `now` and whether the ramp has finished.
    pub fn volume_at(&self, now: DateTime<Local>) -> (u8, bool) {
        let elapsed = (now - self.started).num_milliseconds().max(0) as f64 / 1000.0;
        if self.secs == 0 || elapsed >= self.secs as f64 {
            return (self.to, true);
        }
        let span = self.to as f64 - self.from as f64;
        let volume = self.from as f64 + span * elapsed / self.secs as f64;
        (volume.round().clamp(0.0, 100.0) as u8, false)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SleepTimer {
    pub zone_udn: String,
    pub stop_at: DateTime<Local>,
    pub fade_secs: u32,
    /// Volume captured when the fade-out began
    pub restore_volume: Option<u8>,
    #[serde(skip)]
    fading: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alarm {
    #[serde(serialize_with = "hhmm")]
    pub time: NaiveTime,
    pub room: String,
    pub volume: u8,
    #[serde(skip)]
    last_fired: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerAction {
    SetVolume { zone_udn: String, volume: u8 },
    Stop { zone_udn: String },
    /// Set the alarm volume on the zone holding `room`, then play
    Wake { room: String, volume: u8 },
}

#[derive(Default)]
struct TimerState {
    fades: HashMap<String, Fade>,
    sleeps: HashMap<String, SleepTimer>,
    alarms: Vec<Alarm>,
}

#[derive(Default)]
pub struct TimerTable {
    state: Mutex<TimerState>,
}

/// Next local time `time` occurs strictly after `now`.
pub fn next_occurrence(time: NaiveTime, now: DateTime<Local>) -> DateTime<Local> {
    let mut day = now.date_naive();
    for _ in 0..3 {
        let candidate = day
            .and_time(time)
            .and_local_timezone(Local)
            .earliest()
            .filter(|t| *t > now);
        if let Some(at) = candidate {
            return at;
        }
        day = day.succ_opt().unwrap_or(day);
    }
    now + Duration::days(1)
}

impl TimerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts (or restarts) a fade on a zone.
    pub async fn start_fade(
        &self,
        zone_udn: &str,
        secs: u32,
        from: u8,
        to: u8,
        now: DateTime<Local>,
    ) -> Fade {
        let fade = Fade::new(zone_udn, now, secs, from, to);
        self.state
            .lock()
            .await
            .fades
            .insert(zone_udn.to_string(), fade.clone());
        fade
    }

    /// Replaces the zone's sleep timer.
    pub async fn set_sleep(
        &self,
        zone_udn: &str,
        stop_time: NaiveTime,
        fade_secs: u32,
        now: DateTime<Local>,
    ) -> SleepTimer {
        let sleep = SleepTimer {
            zone_udn: zone_udn.to_string(),
            stop_at: next_occurrence(stop_time, now),
            fade_secs,
            restore_volume: None,
            fading: false,
        };
        let mut state = self.state.lock().await;
        state.fades.remove(zone_udn);
        state.sleeps.insert(zone_udn.to_string(), sleep.clone());
        sleep
    }

    pub async fn cancel_sleep(&self, zone_udn: &str) -> bool {
        let mut state = self.state.lock().await;
        let removed = state.sleeps.remove(zone_udn);
        if removed.as_ref().map(|s| s.fading).unwrap_or(false) {
            state.fades.remove(zone_udn);
        }
        removed.is_some()
    }

    /// Adds a daily alarm and returns its index.
    pub async fn add_alarm(&self, time: NaiveTime, room: &str, volume: u8) -> usize {
        let mut state = self.state.lock().await;
        state.alarms.push(Alarm {
            time,
            room: room.to_string(),
            volume,
            last_fired: None,
        });
        state.alarms.len() - 1
    }

    pub async fn remove_alarm(&self, index: usize) -> Option<Alarm> {
        let mut state = self.state.lock().await;
        (index < state.alarms.len()).then(|| state.alarms.remove(index))
    }

    pub async fn alarms(&self) -> Vec<Alarm> {
        self.state.lock().await.alarms.clone()
    }

    /// Advances every timer to `now` and returns the actions that fell due.
    pub async fn due(&self, now: DateTime<Local>, topology: &Topology) -> Vec<TimerAction> {
        let mut actions = Vec::new();
        let mut state = self.state.lock().await;
        let TimerState {
            fades,
            sleeps,
            alarms,
        } = &mut *state;

        sleeps.retain(|udn, sleep| {
            if now >= sleep.stop_at {
                fades.remove(udn);
                actions.push(TimerAction::Stop {
                    zone_udn: udn.clone(),
                });
                if let Some(volume) = sleep.restore_volume {
                    actions.push(TimerAction::SetVolume {
                        zone_udn: udn.clone(),
                        volume,
                    });
                }
                return false;
            }
            let fade_start = sleep.stop_at - Duration::seconds(sleep.fade_secs as i64);
            if !sleep.fading && now >= fade_start {
                sleep.fading = true;
                sleep.restore_volume = topology.zone_by_udn(udn).map(|z| z.volume);
                if let Some(from) = sleep.restore_volume {
                    let remaining = (sleep.stop_at - now).num_seconds().max(0) as u32;
                    fades.insert(udn.clone(), Fade::new(udn, now, remaining, from, 0));
                }
            }
            true
        });

        fades.retain(|udn, fade| {
            let (volume, done) = fade.volume_at(now);
            if fade.last_sent != Some(volume) {
                fade.last_sent = Some(volume);
                actions.push(TimerAction::SetVolume {
                    zone_udn: udn.clone(),
                    volume,
                });
            }
            !done
        });

        let today = now.date_naive();
        let time = now.time();
        for alarm in alarms.iter_mut() {
            if alarm.last_fired == Some(today) {
                continue;
            }
            let since = time.signed_duration_since(alarm.time);
            if since >= Duration::zero() && since < Duration::seconds(60) {
                alarm.last_fired = Some(today);
                actions.push(TimerAction::Wake {
                    room: alarm.room.clone(),
                    volume: alarm.volume,
                });
            }
        }

        actions
    }
}
