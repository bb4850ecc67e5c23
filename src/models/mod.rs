//! Data models for the launch pipeline.
//!
//! - [`LaunchConfig`]: read-only input for one launch attempt, in the front-end's JSON shape
//! - [`LauncherSettings`]: the persisted subset of it, without credentials
//! - [`Secret`], [`SessionTicket`], [`LaunchTicket`]: short-lived credential material, wiped on drop
//! - [`LaunchResult`]: ordered, typed log lines plus the terminal [`Verdict`]
//!
//! All of these are created fresh per launch invocation. None of them is shared
//! between invocations.

pub mod config;
pub mod launch_result;
pub mod session;

pub use config::{
    ClientLanguage, DpiAwareness, ExpansionLevel, GraphicsApi, InjectionMethod, LaunchConfig,
    LaunchPolicy, LauncherSettings, LoaderSettings, Region,
};
pub use launch_result::{LaunchResult, LogKind, LogLine, Verdict};
pub use session::{LaunchTicket, Secret, SessionTicket};
