//! Converge agent library.
//!
//! Host-side pieces for the reconciliation engine: the platform interface,
//! the module and configuration tasks acting on it, and the agent
//! configuration.

pub mod config;
pub mod platform;
pub mod tasks;

pub use platform::{LiveModule, MockPlatform, ModuleStatus, Platform};
