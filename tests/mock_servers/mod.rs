#![allow(dead_code)]
//! Mock servers for integration testing
//!
//! These simulate a Raumfeld host and its renderers over plain HTTP so the
//! control point can run discovery, subscriptions and commands without hardware.

pub mod raumfeld;

pub use raumfeld::{MockRaumfeldDevice, MockRaumfeldHost};
