//! Raumfeld Control
//!
//! A UPnP control point for Raumfeld multi-room speakers.
//!
//! This library provides:
//! - Zone topology discovery through the Raumfeld host
//! - GENA event subscriptions with renewal and pruning
//! - Event callback processing into a live state store
//! - A command API for transport, volume, grouping and timers
//! - Server-Sent Events for real-time updates

pub mod api;
pub mod bus;
pub mod config;
pub mod context;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod notify;
pub mod scheduler;
pub mod subscription;
pub mod timers;
pub mod topology;
pub mod upnp;
