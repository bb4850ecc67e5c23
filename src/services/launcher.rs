use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use std::env;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use steamlocate::SteamDir;
use tokio::time::timeout;

use super::game_install::{GameInstall, STEAM_APP_ID};
use super::params::LaunchParameters;
use crate::models::GraphicsApi;

/// How long a freshly spawned game must stay alive to count as launched
pub const DEFAULT_GRACE_WINDOW: Duration = Duration::from_secs(2);

/// Environment variable naming the Steam client to relay through
pub const STEAM_EXE_ENV: &str = "STEAM_EXE";

#[cfg(windows)]
const STEAM_CLIENT: &str = "steam.exe";
#[cfg(not(windows))]
const STEAM_CLIENT: &str = "steam.sh";

/// Errors that occur while starting the game process
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("Executable not found: {0}")]
    NotFound(Utf8PathBuf),

    #[error("Permission denied starting {0}")]
    PermissionDenied(Utf8PathBuf),

    #[error("{program} exited within {grace:?} of starting ({status})")]
    ImmediateExit {
        program: Utf8PathBuf,
        status: ExitStatus,
        grace: Duration,
    },

    #[error("Steam relay unavailable: {0}")]
    SteamUnavailable(String),

    #[error("Failed to start {program}")]
    Os {
        program: Utf8PathBuf,
        #[source]
        source: io::Error,
    },
}

impl SpawnError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NotFound",
            Self::PermissionDenied(_) => "PermissionDenied",
            Self::ImmediateExit { .. } => "ImmediateExit",
            Self::SteamUnavailable(_) => "SteamUnavailable",
            Self::Os { .. } => "SpawnFailed",
        }
    }
}

/// Fully resolved process-creation request
#[derive(Clone)]
pub struct ProcessSpec {
    pub program: Utf8PathBuf,
    pub args: Vec<String>,
    pub env: IndexMap<String, String>,
    pub working_dir: Option<Utf8PathBuf>,
}

// Arguments carry the session value
impl std::fmt::Debug for ProcessSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSpec")
            .field("program", &self.program)
            .field("args", &self.args.len())
            .field("env", &self.env)
            .field("working_dir", &self.working_dir)
            .finish()
    }
}

/// The two ways the game can be started
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchVariant {
    /// Spawn the game executable ourselves
    Direct {
        executable: Utf8PathBuf,
        working_dir: Utf8PathBuf,
    },
    /// Ask the Steam client to start the game (`steam -applaunch 39210 ...`)
    SteamRelay {
        steam: Utf8PathBuf,
        game_image: &'static str,
    },
}

impl LaunchVariant {
    pub fn direct(install: &GameInstall, api: GraphicsApi) -> Self {
        Self::Direct {
            executable: install.executable(api),
            working_dir: install.game_dir(),
        }
    }

    /// Steam relay using the Steam client found on this machine
    pub fn steam(api: GraphicsApi) -> Result<Self, SpawnError> {
        let steam = locate_steam(env::var(STEAM_EXE_ENV).ok())?;
        Ok(Self::steam_at(steam, api))
    }

    pub fn steam_at(steam: Utf8PathBuf, api: GraphicsApi) -> Self {
        Self::SteamRelay {
            steam,
            game_image: api.executable_name(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Direct { .. } => "direct",
            Self::SteamRelay { .. } => "steam",
        }
    }

    /// Image name of the game process this variant ends up running
    pub fn game_image(&self) -> String {
        match self {
            Self::Direct { executable, .. } => executable.file_name().unwrap_or_default().to_string(),
            Self::SteamRelay { game_image, .. } => game_image.to_string(),
        }
    }

    pub fn process_spec(&self, params: &LaunchParameters) -> ProcessSpec {
        match self {
            Self::Direct {
                executable,
                working_dir,
            } => ProcessSpec {
                program: executable.clone(),
                args: params.command_line(),
                env: params.env().clone(),
                working_dir: Some(working_dir.clone()),
            },
            Self::SteamRelay { steam, .. } => {
                let mut args = vec!["-applaunch".to_string(), STEAM_APP_ID.to_string()];
                args.extend(params.command_line());
                ProcessSpec {
                    program: steam.clone(),
                    args,
                    env: params.env().clone(),
                    working_dir: None,
                }
            }
        }
    }
}

/// Find the Steam client to relay through.
///
/// An explicit override wins and is taken as is. Otherwise the Steam install is
/// located with `steamlocate`, and the game must be installed in one of its libraries.
pub fn locate_steam(override_path: Option<String>) -> Result<Utf8PathBuf, SpawnError> {
    if let Some(path) = override_path.filter(|p| !p.trim().is_empty()) {
        let path = Utf8PathBuf::from(path);
        if !path.is_file() {
            return Err(SpawnError::SteamUnavailable(format!(
                "{} points at {}, which does not exist",
                STEAM_EXE_ENV, path
            )));
        }
        tracing::debug!("Using Steam client from {}: {}", STEAM_EXE_ENV, path);
        return Ok(path);
    }

    let steam_dir = SteamDir::locate().map_err(|e| {
        SpawnError::SteamUnavailable(format!("Steam install not found ({}); set {}", e, STEAM_EXE_ENV))
    })?;
    steam_relay(&steam_dir)
}

/// Client executable of a located Steam install, once the game is known to be installed
pub fn steam_relay(steam_dir: &SteamDir) -> Result<Utf8PathBuf, SpawnError> {
    let dir = Utf8PathBuf::try_from(steam_dir.path().to_path_buf())
        .map_err(|e| SpawnError::SteamUnavailable(format!("Steam path is not UTF-8: {}", e)))?;

    let client = dir.join(STEAM_CLIENT);
    if !client.is_file() {
        return Err(SpawnError::SteamUnavailable(format!(
            "no {} in the Steam install at {}",
            STEAM_CLIENT, dir
        )));
    }

    match steam_dir.find_app(STEAM_APP_ID) {
        Ok(Some((app, library))) => {
            tracing::info!(
                "Steam app {} installed at {}",
                STEAM_APP_ID,
                library.resolve_app_dir(&app).display()
            );
            Ok(client)
        }
        Ok(None) => Err(SpawnError::SteamUnavailable(format!(
            "app {} is not installed in any Steam library",
            STEAM_APP_ID
        ))),
        Err(e) => {
            // Unreadable library metadata; Steam itself decides whether the game can start
            tracing::warn!("Could not read Steam libraries at {}: {}", dir, e);
            Ok(client)
        }
    }
}

/// Creates OS processes. Swapped out in tests.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, spec: &ProcessSpec) -> io::Result<Child>;
}

/// [`ProcessSpawner`] backed by `tokio::process::Command`
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandSpawner;

impl ProcessSpawner for CommandSpawner {
    fn spawn(&self, spec: &ProcessSpec) -> io::Result<Child> {
        let mut cmd = Command::new(spec.program.as_std_path());
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            // The game belongs to the user once started
            .kill_on_drop(false);

        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir.as_std_path());
        }

        cmd.spawn()
    }
}

/// A started game (or Steam relay) process
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    child: Option<Child>,
    image_name: String,
    variant: &'static str,
}

impl ProcessHandle {
    pub fn new(pid: Option<u32>, child: Option<Child>, image_name: impl Into<String>, variant: &'static str) -> Self {
        Self {
            pid,
            child,
            image_name: image_name.into(),
            variant,
        }
    }

    /// PID of the game itself; `None` when Steam started it
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn image_name(&self) -> &str {
        &self.image_name
    }

    pub fn variant(&self) -> &'static str {
        self.variant
    }

    /// True while we own a child handle that has not exited.
    ///
    /// Relay launches have no child and report `true`.
    pub fn is_alive(&mut self) -> bool {
        match &mut self.child {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => true,
        }
    }

    /// Resolves when the owned child exits. Never resolves for relay launches.
    pub async fn exited(&mut self) -> Option<ExitStatus> {
        match &mut self.child {
            Some(child) => child.wait().await.ok(),
            None => std::future::pending().await,
        }
    }

    /// Kill the owned child, if any
    pub async fn terminate(&mut self) -> io::Result<()> {
        match &mut self.child {
            Some(child) => child.kill().await,
            None => Ok(()),
        }
    }
}

/// Starts the game and supervises the first moments of its life.
pub struct ProcessLauncher<S = CommandSpawner> {
    spawner: S,
    grace: Duration,
}

impl ProcessLauncher<CommandSpawner> {
    pub fn new() -> Self {
        Self::with_spawner(CommandSpawner)
    }
}

impl Default for ProcessLauncher<CommandSpawner> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: ProcessSpawner> ProcessLauncher<S> {
    pub fn with_spawner(spawner: S) -> Self {
        Self {
            spawner,
            grace: DEFAULT_GRACE_WINDOW,
        }
    }

    pub fn with_grace_window(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn grace_window(&self) -> Duration {
        self.grace
    }

    /// Start the game through the chosen variant.
    pub async fn launch(
        &self,
        variant: &LaunchVariant,
        params: &LaunchParameters,
    ) -> Result<ProcessHandle, SpawnError> {
        let spec = variant.process_spec(params);
        tracing::info!(
            "Starting {} ({} launch): {}",
            spec.program,
            variant.name(),
            params.redacted()
        );

        match variant {
            LaunchVariant::Direct { .. } => self.launch_direct(&spec, variant).await,
            LaunchVariant::SteamRelay { .. } => self.launch_steam(&spec, variant).await,
        }
    }

    async fn launch_direct(
        &self,
        spec: &ProcessSpec,
        variant: &LaunchVariant,
    ) -> Result<ProcessHandle, SpawnError> {
        if !spec.program.is_file() {
            return Err(SpawnError::NotFound(spec.program.clone()));
        }

        let mut child = self
            .spawner
            .spawn(spec)
            .map_err(|e| classify_spawn_error(&spec.program, e))?;
        let pid = child.id();

        match timeout(self.grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::warn!("{} exited immediately with {}", spec.program, status);
                Err(SpawnError::ImmediateExit {
                    program: spec.program.clone(),
                    status,
                    grace: self.grace,
                })
            }
            Ok(Err(e)) => Err(abandon_child(&mut child, &spec.program, e)),
            Err(_) => {
                tracing::info!("Game process running with PID {:?}", pid);
                Ok(ProcessHandle::new(
                    pid,
                    Some(child),
                    variant.game_image(),
                    variant.name(),
                ))
            }
        }
    }

    async fn launch_steam(
        &self,
        spec: &ProcessSpec,
        variant: &LaunchVariant,
    ) -> Result<ProcessHandle, SpawnError> {
        let mut relay = self.spawner.spawn(spec).map_err(|e| {
            SpawnError::SteamUnavailable(format!("could not start {}: {}", spec.program, e))
        })?;

        // The relay hands the request to a running Steam client and usually exits quickly
        match timeout(self.grace, relay.wait()).await {
            Ok(Ok(status)) if status.success() => {
                tracing::info!("Steam accepted the launch request");
                Ok(ProcessHandle::new(None, None, variant.game_image(), variant.name()))
            }
            Ok(Ok(status)) => Err(SpawnError::SteamUnavailable(format!(
                "{} exited with {}",
                spec.program, status
            ))),
            Ok(Err(e)) => Err(SpawnError::SteamUnavailable(e.to_string())),
            Err(_) => {
                tracing::info!("Steam relay still running, continuing");
                Ok(ProcessHandle::new(None, None, variant.game_image(), variant.name()))
            }
        }
    }
}

/// Kill a child whose status can no longer be observed, and report the wait error
fn abandon_child(child: &mut Child, program: &Utf8Path, error: io::Error) -> SpawnError {
    tracing::warn!("Lost track of {} ({}), killing it", program, error);
    if let Err(e) = child.start_kill() {
        tracing::warn!("Failed to kill {}: {}", program, e);
    }
    SpawnError::Os {
        program: program.to_path_buf(),
        source: error,
    }
}

fn classify_spawn_error(program: &Utf8Path, error: io::Error) -> SpawnError {
    match error.kind() {
        io::ErrorKind::NotFound => SpawnError::NotFound(program.to_path_buf()),
        io::ErrorKind::PermissionDenied => SpawnError::PermissionDenied(program.to_path_buf()),
        _ => SpawnError::Os {
            program: program.to_path_buf(),
            source: error,
        },
    }
}
