//! Background loops: discovery refresh, subscription upkeep, timer tick.
//!
//! Each loop is its own task on a `tokio::time::interval` with
//! `MissedTickBehavior::Delay`, so a slow cycle pushes the next one back
//! instead of bursting. Shutdown is observed between cycles.

use anyhow::Result;
use chrono::Local;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::dispatch::{Command, Target, TransportAction};
use crate::subscription::EnsureOutcome;
use crate::timers::TimerAction;

/// How often the discovery loop looks at the stale flag.
pub const STALE_CHECK_INTERVAL: Duration = Duration::from_secs(1);
/// Wait before retrying a failed discovery pass.
pub const DISCOVERY_RETRY: Duration = Duration::from_secs(15);

pub fn spawn(ctx: &Context, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(discovery_loop(ctx.clone(), shutdown.clone())),
        tokio::spawn(subscription_loop(ctx.clone(), shutdown.clone())),
        tokio::spawn(tick_loop(ctx.clone(), shutdown)),
    ]
}

/// One discovery cycle: discover, replace, prune. Returns the new generation.
pub async fn discovery_pass(ctx: &Context) -> Result<u64> {
    let topology = ctx.discoverer.discover().await?;
    let generation = ctx.store.replace(topology).await;
    let snapshot = ctx.store.snapshot().await;
    let pruned = ctx.subscriptions.prune(&snapshot).await;
    if pruned > 0 {
        info!("Pruned {} orphaned subscriptions", pruned);
    }
    Ok(generation)
}

pub async fn discovery_loop(ctx: Context, shutdown: CancellationToken) {
    let mut check = interval(STALE_CHECK_INTERVAL);
    check.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut next_full = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Discovery loop shutting down");
                break;
            }
            _ = check.tick() => {
                let stale = ctx.stale.take();
                if !stale && Instant::now() < next_full {
                    continue;
                }
                if stale {
                    info!("Topology marked stale; refreshing out of cycle");
                }
                match discovery_pass(&ctx).await {
                    Ok(generation) => {
                        debug!("Discovery pass complete (generation {})", generation);
                        next_full = Instant::now() + ctx.config.discovery_interval();
                    }
                    Err(e) => {
                        warn!("Discovery pass failed: {:#}", e);
                        next_full = Instant::now() + DISCOVERY_RETRY.min(ctx.config.discovery_interval());
                    }
                }
            }
        }
    }
}

/// Ensures a subscription for every eventing service in the current snapshot.
/// Returns how many new subscriptions were made.
pub async fn subscription_pass(ctx: &Context) -> usize {
    let snapshot = ctx.store.snapshot().await;
    let mut created = 0;
    for source in snapshot.event_sources() {
        if let EnsureOutcome::Subscribed { .. } = ctx
            .subscriptions
            .ensure_subscribed(&ctx.callback_address, &source)
            .await
        {
            created += 1;
        }
    }
    created
}

pub async fn subscription_loop(ctx: Context, shutdown: CancellationToken) {
    let mut ticker = interval(ctx.config.subscription_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Subscription loop shutting down");
                break;
            }
            _ = ticker.tick() => {
                let created = subscription_pass(&ctx).await;
                if created > 0 {
                    debug!("Subscription pass created {} subscriptions", created);
                }
            }
        }
    }
}

/// Evaluates timers against the wall clock and runs what fell due.
pub async fn tick_pass(ctx: &Context) {
    let snapshot = ctx.store.snapshot().await;
    let actions = ctx.timers.due(Local::now(), &snapshot).await;

    for action in actions {
        let commands = match action {
            TimerAction::SetVolume { zone_udn, volume } => vec![Command::SetVolume {
                target: Target::ZoneUdn(zone_udn),
                value: volume as i64,
            }],
            TimerAction::Stop { zone_udn } => vec![Command::Transport {
                target: Target::ZoneUdn(zone_udn),
                action: TransportAction::Stop,
            }],
            TimerAction::Wake { room, volume } => {
                info!("Alarm for {}", room);
                vec![
                    Command::SetVolume {
                        target: Target::RoomName(room.clone()),
                        value: volume as i64,
                    },
                    Command::Transport {
                        target: Target::RoomName(room),
                        action: TransportAction::Play,
                    },
                ]
            }
        };
        for command in commands {
            if let Err(e) = ctx.dispatcher.execute(command).await {
                warn!("Timer action failed: {}", e);
                break;
            }
        }
    }
}

pub async fn tick_loop(ctx: Context, shutdown: CancellationToken) {
    let mut ticker = interval(ctx.config.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Tick loop shutting down");
                break;
            }
            _ = ticker.tick() => tick_pass(&ctx).await,
        }
    }
}
