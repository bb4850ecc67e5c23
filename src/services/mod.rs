//! Services module - the steps of a launch attempt.
//!
//! Each service is framework-agnostic and owns one concern. The orchestrator wires
//! them together per invocation.
//!
//! # Components
//!
//! - [`integrity`]: SHA-1 verification of the boot files ([`Hasher`]) and of loader files
//! - [`transport`] and [`auth`]: the login handshake ([`AuthClient`]) behind an HTTP seam
//! - [`params`]: validation of a [`crate::models::LaunchConfig`] and the game argument
//!   builder ([`LaunchParameters`])
//! - [`argument_cipher`]: the optional `//**sqex0003...**//` argument encryption
//! - [`launcher`]: process spawning, direct or through Steam ([`ProcessLauncher`])
//! - [`loader`]: loader install resolution and its start info
//! - [`updater`]: loader and asset package downloads ([`LoaderUpdater`])
//! - [`injection`]: the delayed injection state machine ([`InjectionController`])
//! - [`game_install`]: layout of a game directory
//!
//! Every long-running operation takes a `watch::Receiver<bool>` cancel signal and
//! races it against its own I/O with `tokio::select!`.
//!
//! ```ignore
//! use xivloader::services::{Hasher, params};
//!
//! let settings = params::validate(&config)?;
//! let report = Hasher::boot_files().verify(&settings.install.root())?;
//! ```

pub mod argument_cipher;
pub mod auth;
pub mod game_install;
pub mod injection;
pub mod integrity;
pub mod launcher;
pub mod loader;
pub mod params;
#[cfg(windows)]
pub mod remote_thread;
pub mod transport;
pub mod updater;

pub use auth::{AuthClient, AuthError, AuthRequest, AuthSession, AuthState, NoOtp, OtpProvider};
pub use game_install::GameInstall;
pub use injection::{
    InjectionController, InjectionError, InjectionOutcome, InjectionState, InjectionTarget,
    Injector, LoaderProcessInjector,
};
pub use integrity::{Hasher, IntegrityError, IntegrityReport};
pub use launcher::{LaunchVariant, ProcessHandle, ProcessLauncher, ProcessSpec, SpawnError};
pub use loader::{LoaderError, LoaderInstall, LoaderRequest};
pub use params::{LaunchParameters, LaunchSettings, ValidationError};
#[cfg(windows)]
pub use remote_thread::RemoteThreadInjector;
pub use transport::{AuthTransport, ReqwestTransport};
pub use updater::{HttpLoaderSource, LoaderSource, LoaderUpdater, UpdateError, UpdateSummary};

use tokio::sync::watch;

/// Resolves once cancellation has been requested.
///
/// If the sender is dropped without ever requesting cancellation, this never resolves,
/// so it can sit in a `select!` next to real work.
pub async fn wait_for_cancel(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// True if cancellation has already been requested
pub fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow()
}
