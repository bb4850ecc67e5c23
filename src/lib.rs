// XIVLoader - launch orchestration core for FINAL FANTASY XIV
//
// This is the library crate containing the launch pipeline and its services.
// The binary crate (main.rs) is a thin command-line front end.

pub mod config;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod services;

// Re-export commonly used types for convenience
pub use config::ConfigManager;
pub use models::{LaunchConfig, LaunchResult, LauncherSettings, LogKind, LogLine, Verdict};
pub use orchestrator::{Orchestrator, PipelineError};

use services::NoOtp;
use tokio::sync::watch;

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

/// Run one launch attempt with the real network and process stack.
///
/// Returns the newline-delimited log on success and the newline-delimited log,
/// ending in the error line, on failure. The one-time password, if needed, must
/// already be in `config.otp`.
pub async fn launch_game(config: LaunchConfig) -> Result<String, String> {
    let orchestrator = Orchestrator::with_defaults()
        .map_err(|e| format!("AuthError: Transport - {}", e))?;

    // Nothing ever cancels this launch; the sender lives until it finishes
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    orchestrator
        .launch(&config, &NoOtp, cancel_rx)
        .await
        .into_output()
}
