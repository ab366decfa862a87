//! Kids Guard: keeps screen brightness, audio volume and screen time at
//! parent-set targets.
//!
//! The [`process::EnforcementProcess`] owns everything and runs on a single
//! event loop; [`ipc`] exposes it over a Unix socket, and [`platform`]
//! abstracts the devices it enforces.

pub mod auth;
pub mod clock;
pub mod config;
pub mod curve;
pub mod error;
pub mod events;
pub mod ipc;
pub mod lock;
pub mod platform;
pub mod process;
pub mod screen_time;
pub mod store;
pub mod target;
pub mod watchdog;
