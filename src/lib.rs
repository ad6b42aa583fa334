//! Examguard - workstation lockdown for monitored exam sessions
//!
//! This crate provides:
//! - Environment validation (virtual machines, extra displays)
//! - Process enforcement: block-list kills, respawn watch, whitelist sweeps
//! - Keyboard/mouse hooks and touchpad gesture control
//! - Window pinning, keep-awake and display hot-plug watch
//! - A lifecycle manager that applies and resets all of the above as one session

pub mod audit;
pub mod cli;
pub mod concurrency;
pub mod config;
pub mod display;
pub mod enforcement;
pub mod environment;
pub mod error;
pub mod input;
pub mod lockdown;
pub mod paths;
pub mod platform;
pub mod policy;
pub mod poller;
pub mod session;

pub use config::Config;
pub use lockdown::LockdownManager;
pub use policy::LockdownPolicy;
