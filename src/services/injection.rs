use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;

use super::launcher::ProcessHandle;
use super::loader::LoaderRequest;
use super::wait_for_cancel;

/// Upper bound for one run of the loader's injector executable
pub const INJECTOR_TIMEOUT: Duration = Duration::from_secs(30);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Injection failures. None of these mean the game failed to start.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InjectionError {
    #[error("game process exited before the loader could be injected")]
    TargetExited,

    #[error("could not locate the game process: {0}")]
    LocateFailed(String),

    #[error("loader injection failed: {0}")]
    InjectFailed(String),

    #[error("injection was cancelled")]
    Cancelled,
}

impl InjectionError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TargetExited => "TargetExited",
            Self::LocateFailed(_) => "LocateFailed",
            Self::InjectFailed(_) => "InjectFailed",
            Self::Cancelled => "Cancelled",
        }
    }
}

/// States of one injection attempt, reported as they are entered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectionState {
    Scheduled,
    Waiting { delay: Duration },
    Locating,
    Injecting { pid: u32 },
    Succeeded { pid: u32 },
    Failed { kind: &'static str },
}

/// What to look for: the PID we spawned, or an image name for relay launches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionTarget {
    pub pid: Option<u32>,
    pub image_name: String,
}

impl InjectionTarget {
    pub fn from_handle(handle: &ProcessHandle) -> Self {
        Self {
            pid: handle.pid(),
            image_name: handle.image_name().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionOutcome {
    pub pid: u32,
    pub loader_version: String,
    pub elapsed: Duration,
}

/// Mechanism that gets the loader into a running process.
///
/// Both calls are blocking OS operations; the controller runs them on the blocking pool.
#[cfg_attr(test, mockall::automock)]
pub trait Injector: Send + Sync {
    fn locate(&self, target: &InjectionTarget) -> Result<u32, InjectionError>;

    fn inject(&self, pid: u32, request: &LoaderRequest) -> Result<(), InjectionError>;
}

/// Delayed, single-shot injection: `Scheduled → Waiting → Locating → Injecting → done`.
///
/// The target exiting at any point before `Injecting` ends the attempt with
/// [`InjectionError::TargetExited`] and no call to [`Injector::inject`].
pub struct InjectionController {
    injector: Arc<dyn Injector>,
    delay: Duration,
}

impl InjectionController {
    pub fn new(injector: Arc<dyn Injector>, delay: Duration) -> Self {
        Self { injector, delay }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub async fn run<F>(
        &self,
        handle: &mut ProcessHandle,
        request: &LoaderRequest,
        cancel: &mut watch::Receiver<bool>,
        mut on_state: F,
    ) -> Result<InjectionOutcome, InjectionError>
    where
        F: FnMut(&InjectionState) + Send,
    {
        let start = Instant::now();
        on_state(&InjectionState::Scheduled);

        let result = self.attempt(handle, request, cancel, &mut on_state).await;

        match &result {
            Ok(pid) => on_state(&InjectionState::Succeeded { pid: *pid }),
            Err(e) => on_state(&InjectionState::Failed { kind: e.kind() }),
        }

        result.map(|pid| InjectionOutcome {
            pid,
            loader_version: request.install.version().to_string(),
            elapsed: start.elapsed(),
        })
    }

    async fn attempt<F>(
        &self,
        handle: &mut ProcessHandle,
        request: &LoaderRequest,
        cancel: &mut watch::Receiver<bool>,
        on_state: &mut F,
    ) -> Result<u32, InjectionError>
    where
        F: FnMut(&InjectionState) + Send,
    {
        on_state(&InjectionState::Waiting { delay: self.delay });
        tracing::info!("Waiting {:?} before injecting the loader", self.delay);

        tokio::select! {
            biased;
            _ = wait_for_cancel(cancel) => return Err(InjectionError::Cancelled),
            status = handle.exited() => {
                tracing::warn!("Game exited during the injection delay ({:?})", status);
                return Err(InjectionError::TargetExited);
            }
            _ = tokio::time::sleep(self.delay) => {}
        }

        on_state(&InjectionState::Locating);
        let target = InjectionTarget::from_handle(handle);
        let injector = Arc::clone(&self.injector);
        let locate = tokio::task::spawn_blocking(move || injector.locate(&target));

        let pid = tokio::select! {
            biased;
            _ = wait_for_cancel(cancel) => return Err(InjectionError::Cancelled),
            status = handle.exited() => {
                tracing::warn!("Game exited while it was being located ({:?})", status);
                return Err(InjectionError::TargetExited);
            }
            located = locate => located
                .map_err(|e| InjectionError::LocateFailed(format!("locator task failed: {}", e)))??,
        };

        if !handle.is_alive() {
            return Err(InjectionError::TargetExited);
        }

        on_state(&InjectionState::Injecting { pid });
        tracing::info!("Injecting loader {} into PID {}", request.install.version(), pid);

        let injector = Arc::clone(&self.injector);
        let owned = request.clone();
        tokio::task::spawn_blocking(move || {
            owned
                .install
                .verify()
                .map_err(|e| InjectionError::InjectFailed(e.to_string()))?;
            injector.inject(pid, &owned)
        })
        .await
            .map_err(|e| InjectionError::InjectFailed(format!("injector task failed: {}", e)))??;

        Ok(pid)
    }
}

/// Runs the loader's own `Dalamud.Injector.exe inject <pid> ...`.
#[derive(Debug, Clone)]
pub struct LoaderProcessInjector {
    timeout: Duration,
}

impl LoaderProcessInjector {
    pub fn new() -> Self {
        Self {
            timeout: INJECTOR_TIMEOUT,
        }
    }
}

impl Default for LoaderProcessInjector {
    fn default() -> Self {
        Self::new()
    }
}

impl Injector for LoaderProcessInjector {
    fn locate(&self, target: &InjectionTarget) -> Result<u32, InjectionError> {
        locate_process(target)
    }

    fn inject(&self, pid: u32, request: &LoaderRequest) -> Result<(), InjectionError> {
        let injector = request.install.injector_path();
        if !injector.is_file() {
            return Err(InjectionError::InjectFailed(format!(
                "injector not found at {}",
                injector
            )));
        }

        let args = request
            .injector_args(pid)
            .map_err(|e| InjectionError::InjectFailed(e.to_string()))?;

        let mut child = Command::new(injector.as_std_path())
            .args(&args)
            .envs(request.injector_env())
            .current_dir(request.install.version_dir().as_std_path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| InjectionError::InjectFailed(format!("could not run {}: {}", injector, e)))?;

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(InjectionError::InjectFailed(format!(
                        "injector timed out after {:?}",
                        self.timeout
                    )));
                }
                Ok(None) => std::thread::sleep(POLL_INTERVAL),
                Err(e) => return Err(InjectionError::InjectFailed(e.to_string())),
            }
        };

        if status.success() {
            tracing::info!("Loader injector finished for PID {}", pid);
            return Ok(());
        }

        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }
        let detail = stderr.lines().last().unwrap_or_default().trim().to_string();

        Err(InjectionError::InjectFailed(if detail.is_empty() {
            format!("injector exited with {}", status)
        } else {
            format!("injector exited with {}: {}", status, detail)
        }))
    }
}

/// Find the game process: check a known PID, or search by image name.
pub fn locate_process(target: &InjectionTarget) -> Result<u32, InjectionError> {
    match target.pid {
        Some(pid) if process_alive(pid) => Ok(pid),
        Some(_) => Err(InjectionError::TargetExited),
        None => find_process_by_name(&target.image_name)?.ok_or_else(|| {
            InjectionError::LocateFailed(format!("no running process named {}", target.image_name))
        }),
    }
}

#[cfg(windows)]
fn process_alive(pid: u32) -> bool {
    super::remote_thread::process_alive(pid)
}

#[cfg(windows)]
fn find_process_by_name(name: &str) -> Result<Option<u32>, InjectionError> {
    super::remote_thread::find_process_by_name(name)
}

#[cfg(not(windows))]
fn process_alive(pid: u32) -> bool {
    // Zombies have exited; only the parent's wait has not happened yet
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_some_and(|state| state != "Z" && state != "X"),
        Err(_) => false,
    }
}

#[cfg(not(windows))]
fn find_process_by_name(name: &str) -> Result<Option<u32>, InjectionError> {
    let entries = std::fs::read_dir("/proc")
        .map_err(|e| InjectionError::LocateFailed(format!("cannot read /proc: {}", e)))?;
    let wanted = name.to_lowercase();

    for entry in entries.filter_map(|e| e.ok()) {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };

        // Under Wine the image name only shows up in the command line
        let Ok(cmdline) = std::fs::read(entry.path().join("cmdline")) else {
            continue;
        };
        let matches = cmdline
            .split(|b| *b == 0)
            .filter_map(|arg| std::str::from_utf8(arg).ok())
            .take(1)
            .any(|arg| {
                arg.rsplit(['/', '\\'])
                    .next()
                    .is_some_and(|file| file.to_lowercase() == wanted)
            });

        if matches && process_alive(pid) {
            return Ok(Some(pid));
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ClientLanguage, LoaderSettings};
    use crate::services::launcher::ProcessHandle;
    use crate::services::loader::LoaderInstall;
    use tempfile::TempDir;

    fn loader_request() -> (TempDir, LoaderRequest) {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(temp_dir.path().join("addon/Hooks/1.0.0")).unwrap();
        let settings = LoaderSettings {
            enabled: true,
            install_path: temp_dir.path().to_str().unwrap().to_string(),
            ..LoaderSettings::default()
        };
        let install = LoaderInstall::resolve(&settings).unwrap();
        (temp_dir, LoaderRequest::new(install, ClientLanguage::English, "1.0", 0))
    }

    fn spawn_sleeper(seconds: &str) -> ProcessHandle {
        let child = tokio::process::Command::new("sleep")
            .arg(seconds)
            .spawn()
            .unwrap();
        let pid = child.id();
        ProcessHandle::new(pid, Some(child), "sleep", "direct")
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_injection_walks_all_states() {
        let (_temp_dir, request) = loader_request();
        let mut handle = spawn_sleeper("5");
        let pid = handle.pid().unwrap();

        let mut injector = MockInjector::new();
        injector.expect_locate().times(1).returning(move |_| Ok(pid));
        injector
            .expect_inject()
            .withf(move |p, _| *p == pid)
            .times(1)
            .returning(|_, _| Ok(()));

        let controller = InjectionController::new(Arc::new(injector), Duration::ZERO);
        let (_tx, mut cancel) = watch::channel(false);
        let mut states = Vec::new();

        let outcome = controller
            .run(&mut handle, &request, &mut cancel, |s| states.push(s.clone()))
            .await
            .unwrap();

        assert_eq!(outcome.pid, pid);
        assert_eq!(outcome.loader_version, "1.0.0");
        assert_eq!(
            states,
            vec![
                InjectionState::Scheduled,
                InjectionState::Waiting { delay: Duration::ZERO },
                InjectionState::Locating,
                InjectionState::Injecting { pid },
                InjectionState::Succeeded { pid },
            ]
        );

        handle.terminate().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_target_exit_during_wait_skips_injection() {
        let (_temp_dir, request) = loader_request();
        let mut handle = spawn_sleeper("0.05");

        let mut injector = MockInjector::new();
        injector.expect_locate().never();
        injector.expect_inject().never();

        let controller = InjectionController::new(Arc::new(injector), Duration::from_secs(5));
        let (_tx, mut cancel) = watch::channel(false);
        let mut states = Vec::new();

        let err = controller
            .run(&mut handle, &request, &mut cancel, |s| states.push(s.clone()))
            .await
            .unwrap_err();

        assert_eq!(err, InjectionError::TargetExited);
        assert_eq!(states.last(), Some(&InjectionState::Failed { kind: "TargetExited" }));
        assert!(!states.iter().any(|s| matches!(s, InjectionState::Injecting { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_during_wait() {
        let (_temp_dir, request) = loader_request();
        let mut handle = spawn_sleeper("5");

        let mut injector = MockInjector::new();
        injector.expect_inject().never();

        let controller = InjectionController::new(Arc::new(injector), Duration::from_secs(30));
        let (tx, mut cancel) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(true);
        });

        let err = controller
            .run(&mut handle, &request, &mut cancel, |_| {})
            .await
            .unwrap_err();
        assert_eq!(err, InjectionError::Cancelled);

        handle.terminate().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_locate_failure_is_reported() {
        let (_temp_dir, request) = loader_request();
        let mut handle = spawn_sleeper("5");

        let mut injector = MockInjector::new();
        injector
            .expect_locate()
            .returning(|_| Err(InjectionError::LocateFailed("snapshot failed".to_string())));
        injector.expect_inject().never();

        let controller = InjectionController::new(Arc::new(injector), Duration::ZERO);
        let (_tx, mut cancel) = watch::channel(false);

        let err = controller
            .run(&mut handle, &request, &mut cancel, |_| {})
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "LocateFailed");

        handle.terminate().await.unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_locate_process_by_pid() {
        let own = std::process::id();
        let target = InjectionTarget {
            pid: Some(own),
            image_name: String::new(),
        };
        assert_eq!(locate_process(&target), Ok(own));

        let gone = InjectionTarget {
            pid: Some(u32::MAX - 1),
            image_name: String::new(),
        };
        assert_eq!(locate_process(&gone), Err(InjectionError::TargetExited));

        let unknown = InjectionTarget {
            pid: None,
            image_name: "definitely-not-running.exe".to_string(),
        };
        assert_eq!(locate_process(&unknown).unwrap_err().kind(), "LocateFailed");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tampered_loader_is_not_injected() {
        let (temp_dir, request) = loader_request();
        let version_dir = temp_dir.path().join("addon/Hooks/1.0.0");
        std::fs::write(version_dir.join("Dalamud.dll"), "modified").unwrap();
        std::fs::write(
            version_dir.join("hashes.json"),
            r#"{"Dalamud.dll": "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"}"#,
        )
        .unwrap();

        let mut handle = spawn_sleeper("5");
        let pid = handle.pid().unwrap();

        let mut injector = MockInjector::new();
        injector.expect_locate().returning(move |_| Ok(pid));
        injector.expect_inject().never();

        let controller = InjectionController::new(Arc::new(injector), Duration::ZERO);
        let (_tx, mut cancel) = watch::channel(false);

        let err = controller
            .run(&mut handle, &request, &mut cancel, |_| {})
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "InjectFailed");

        handle.terminate().await.unwrap();
    }

    #[test]
    fn test_missing_injector_executable() {
        let (_temp_dir, request) = loader_request();
        let err = LoaderProcessInjector::new().inject(1, &request).unwrap_err();
        assert!(matches!(err, InjectionError::InjectFailed(msg) if msg.contains("not found")));
    }
}
