// Launch orchestrator - sequences one launch attempt
//
// validate → integrity (advisory) → loader update → authenticate → build parameters → spawn → inject
//
// Every step appends to the invocation's LaunchResult before the next one starts.
// All state lives in the invocation; the Orchestrator itself is immutable and can
// serve any number of concurrent launches.

use camino::Utf8PathBuf;
use std::error::Error as _;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;

use crate::metrics::LaunchMetrics;
use crate::models::{InjectionMethod, LaunchConfig, LaunchResult, LoaderSettings, Verdict};
use crate::services::auth::{AuthClient, AuthError, AuthRequest, AuthState, OtpProvider};
use crate::services::injection::{
    InjectionController, InjectionError, InjectionState, Injector, LoaderProcessInjector,
};
use crate::services::integrity::{self, Hasher, IntegrityError, IntegrityReport};
use crate::services::launcher::{
    CommandSpawner, LaunchVariant, ProcessHandle, ProcessLauncher, ProcessSpawner, SpawnError,
};
use crate::services::loader::{LoaderInstall, LoaderRequest};
use crate::services::params::{self, LaunchParameters, LaunchSettings, ValidationError};
use crate::services::transport::{AuthTransport, ReqwestTransport, TransportError};
use crate::services::updater::{HttpLoaderSource, LoaderSource, LoaderUpdater, UpdateError};
use crate::services::is_cancelled;

/// Per-request timeout for the login service
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Any failure of a pipeline step, with the category used in result lines
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Launch(#[from] SpawnError),

    #[error(transparent)]
    Injection(#[from] InjectionError),

    #[error(transparent)]
    Update(#[from] UpdateError),

    #[error("the launch was cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::Integrity(_) => "IntegrityWarning",
            Self::Auth(_) => "AuthError",
            Self::Launch(_) => "LaunchError",
            Self::Injection(_) => "InjectionError",
            Self::Update(_) => "UpdateError",
            Self::Cancelled => "Cancelled",
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(e) => e.kind(),
            Self::Integrity(e) => e.kind(),
            Self::Auth(e) => e.kind(),
            Self::Launch(e) => e.kind(),
            Self::Injection(e) => e.kind(),
            Self::Update(e) => e.kind(),
            Self::Cancelled => "Cancelled",
        }
    }

    /// `Category: Kind - message`, the human-readable result line
    pub fn render(&self) -> String {
        match self {
            Self::Cancelled => format!("Cancelled: {}", self),
            _ => format!("{}: {} - {}", self.category(), self.kind(), self),
        }
    }

    /// Source chain below the primary message, if there is one
    pub fn diagnostic(&self) -> Option<String> {
        let mut chain = Vec::new();
        let mut current = self.source();
        while let Some(err) = current {
            chain.push(err.to_string());
            current = err.source();
        }
        (!chain.is_empty()).then(|| chain.join(": "))
    }

    fn is_cancel(&self) -> bool {
        matches!(
            self,
            Self::Cancelled
                | Self::Auth(AuthError::Cancelled)
                | Self::Injection(InjectionError::Cancelled)
                | Self::Update(UpdateError::Cancelled)
        )
    }
}

/// Runs launch attempts.
///
/// Holds only configuration (the HTTP transport, the process spawner, the injection
/// mechanism, the loader update source); everything an attempt produces lives in
/// that attempt's scope.
pub struct Orchestrator<T, S = CommandSpawner, U = HttpLoaderSource> {
    auth: AuthClient<T>,
    launcher: ProcessLauncher<S>,
    hasher: Hasher,
    injector: Option<Arc<dyn Injector>>,
    updater: Option<LoaderUpdater<U>>,
    steam_path: Option<Utf8PathBuf>,
}

impl Orchestrator<ReqwestTransport> {
    /// Real network, real processes
    pub fn with_defaults() -> Result<Self, TransportError> {
        let transport = ReqwestTransport::new(HTTP_TIMEOUT)?;
        let source = HttpLoaderSource::new(transport.client().clone());
        Ok(Self::new(AuthClient::new(transport), ProcessLauncher::new())
            .with_updater(LoaderUpdater::new(source)))
    }
}

impl<T, S, U> Orchestrator<T, S, U>
where
    T: AuthTransport + Send + Sync,
    S: ProcessSpawner,
    U: LoaderSource + Send + Sync,
{
    pub fn new(auth: AuthClient<T>, launcher: ProcessLauncher<S>) -> Self {
        Self {
            auth,
            launcher,
            hasher: Hasher::boot_files(),
            injector: None,
            updater: None,
            steam_path: None,
        }
    }

    /// Keep the loader current before launches that ask for it
    pub fn with_updater(mut self, updater: LoaderUpdater<U>) -> Self {
        self.updater = Some(updater);
        self
    }

    /// Use this injector regardless of the configured injection method
    pub fn with_injector(mut self, injector: Arc<dyn Injector>) -> Self {
        self.injector = Some(injector);
        self
    }

    pub fn with_hasher(mut self, hasher: Hasher) -> Self {
        self.hasher = hasher;
        self
    }

    /// Use this Steam client instead of searching for one
    pub fn with_steam_path(mut self, steam: Utf8PathBuf) -> Self {
        self.steam_path = Some(steam);
        self
    }

    /// Run one launch attempt and return its result.
    pub async fn launch(
        &self,
        config: &LaunchConfig,
        otp: &(dyn OtpProvider + Sync),
        cancel: watch::Receiver<bool>,
    ) -> LaunchResult {
        self.launch_into(config, otp, cancel, LaunchResult::new()).await
    }

    /// Run one launch attempt, appending to a caller-provided result.
    ///
    /// Pass a result from [`LaunchResult::with_events`] to stream progress.
    pub async fn launch_into(
        &self,
        config: &LaunchConfig,
        otp: &(dyn OtpProvider + Sync),
        mut cancel: watch::Receiver<bool>,
        mut result: LaunchResult,
    ) -> LaunchResult {
        let mut metrics = LaunchMetrics::new();
        result.start("Starting game launch process");
        tracing::info!("Starting game launch process");

        let outcome = self
            .run_pipeline(config, otp, &mut cancel, &mut result, &mut metrics)
            .await;

        let verdict = match outcome {
            Ok(()) => Verdict::Success,
            Err(e) => {
                push_failure(&mut result, &e);
                if e.is_cancel() {
                    Verdict::Cancelled
                } else {
                    Verdict::Failure
                }
            }
        };

        for line in metrics.summary_lines() {
            result.info(line);
        }
        metrics.log_summary();

        tracing::info!("Launch finished: {:?}", verdict);
        result.finish(verdict);
        result
    }

    async fn run_pipeline(
        &self,
        config: &LaunchConfig,
        otp: &(dyn OtpProvider + Sync),
        cancel: &mut watch::Receiver<bool>,
        result: &mut LaunchResult,
        metrics: &mut LaunchMetrics,
    ) -> Result<(), PipelineError> {
        // Validation
        let started = Instant::now();
        let settings = params::validate(config)?;
        metrics.record_since("validation", started);
        result.info(format!(
            "Configuration validated: game version {}, {:?}, region {:?}, language {:?}",
            settings.game_version, settings.graphics_api, settings.region, settings.language
        ));
        check_cancel(cancel)?;

        // Integrity (advisory unless the policy says otherwise)
        let started = Instant::now();
        let report = self.verify_integrity(&settings, result).await?;
        metrics.record_since("integrity", started);
        check_cancel(cancel)?;

        // Loader update; the installed version is kept if this fails
        let mut loader = settings.loader.clone();
        if let Some(loader) = loader.as_mut().filter(|l| l.auto_update) {
            let started = Instant::now();
            match self.update_loader(loader, cancel, result).await {
                Ok(Some(version)) => loader.version = Some(version),
                Ok(None) => {}
                Err(e) if e.is_cancel() => return Err(e),
                Err(e) if settings.policy.fail_on_injection_error => return Err(e),
                Err(e) => {
                    push_failure(result, &e);
                    result.info("Continuing with the installed loader");
                }
            }
            metrics.record_since("loader update", started);
            check_cancel(cancel)?;
        }

        // Authentication
        let started = Instant::now();
        result.info("Authenticating with the login service");
        let version_report = report.map(|r| r.version_report()).unwrap_or_default();
        let request = AuthRequest {
            username: &config.username,
            password: &config.password,
            otp: config.otp.as_ref(),
            language: settings.language,
            region: settings.region,
            is_steam: settings.is_steam,
            game_version: &settings.game_version,
            version_report: &version_report,
        };
        let session = self
            .auth
            .authenticate(&request, otp, cancel, |state| match state {
                AuthState::AwaitingOtp { attempt } => {
                    result.info(format!("One-time password requested (attempt {})", attempt))
                }
                AuthState::SessionEstablished => result.info("Session established"),
                _ => {}
            })
            .await?;
        metrics.record_since("authentication", started);
        result.success("Authentication successful");
        check_cancel(cancel)?;

        // Parameters
        let started = Instant::now();
        let parameters = LaunchParameters::build(
            &settings,
            &session.launch_ticket,
            session.session.max_expansion,
        );
        drop(session);
        if parameters.effective_expansion < settings.expansion.get() {
            result.info(format!(
                "Expansion level capped to {} by account entitlement",
                parameters.effective_expansion
            ));
        }
        result.info(format!("Launch parameters prepared: {}", parameters.redacted()));
        metrics.record_since("parameters", started);
        check_cancel(cancel)?;

        // Spawn
        let started = Instant::now();
        let variant = self.variant_for(&settings)?;
        let mut handle = self.launcher.launch(&variant, &parameters).await?;
        drop(parameters);
        metrics.record_since("spawn", started);
        match handle.pid() {
            Some(pid) => result.success(format!("Game launched successfully (PID {})", pid)),
            None => result.success("Game launched successfully through Steam"),
        }

        // Past this point the game belongs to the user; cancellation only stops automation
        check_cancel(cancel)?;

        if let Some(loader) = &loader {
            let started = Instant::now();
            let injected = self
                .inject(&settings, loader, &mut handle, cancel, result)
                .await;
            metrics.record_since("injection", started);

            match injected {
                Ok(()) => {}
                Err(e) if e.is_cancel() => return Err(e),
                Err(e) if settings.policy.fail_on_injection_error => return Err(e),
                Err(e) => {
                    push_failure(result, &e);
                    result.info("Game is running without the loader");
                }
            }
        }

        Ok(())
    }

    async fn verify_integrity(
        &self,
        settings: &LaunchSettings,
        result: &mut LaunchResult,
    ) -> Result<Option<IntegrityReport>, PipelineError> {
        let hasher = self.hasher.clone();
        let root = settings.install.root().to_path_buf();
        let reference = settings.boot_hashes.clone();

        let verified = tokio::task::spawn_blocking(move || {
            let hasher = match reference {
                Some(path) => hasher.with_expected(integrity::load_expected_hashes(&path)?),
                None => hasher,
            };
            hasher.verify(&root)
        })
        .await
        .unwrap_or_else(|e| {
            Err(IntegrityError::Unreadable {
                path: settings.install.root().to_path_buf(),
                source: std::io::Error::other(e.to_string()),
            })
        });

        match verified {
            Ok(report) if report.passed() => {
                result.info(format!("Integrity check passed: {}", report.summary()));
                Ok(Some(report))
            }
            Ok(report) => {
                let summary = report.summary();
                if settings.policy.block_on_integrity_failure {
                    return Err(ValidationError::IntegrityFailed(summary).into());
                }
                tracing::warn!("Integrity check failed (advisory): {}", summary);
                result.info(format!("IntegrityWarning: Mismatch - {}", summary));
                Ok(Some(report))
            }
            Err(e) => {
                if settings.policy.block_on_integrity_failure {
                    return Err(ValidationError::IntegrityFailed(e.to_string()).into());
                }
                tracing::warn!("Integrity check could not run (advisory): {}", e);
                let warning = PipelineError::from(e);
                result.info(warning.render());
                Ok(None)
            }
        }
    }

    /// Run the updater, returning the version to inject
    async fn update_loader(
        &self,
        loader: &LoaderSettings,
        cancel: &mut watch::Receiver<bool>,
        result: &mut LaunchResult,
    ) -> Result<Option<String>, PipelineError> {
        let Some(updater) = &self.updater else {
            tracing::warn!("Loader auto-update is enabled but no update source is configured");
            return Ok(None);
        };

        result.info("Checking for loader updates");
        let summary = updater.update(loader, cancel).await?;

        if summary.loader_updated {
            result.success(format!("Loader {} installed", summary.version));
        } else {
            result.info(format!("Loader {} is up to date", summary.version));
        }
        if summary.assets_updated {
            result.info(format!("Loader assets updated to version {}", summary.asset_version));
        }
        Ok(Some(summary.version))
    }

    fn variant_for(&self, settings: &LaunchSettings) -> Result<LaunchVariant, SpawnError> {
        if !settings.is_steam {
            return Ok(LaunchVariant::direct(&settings.install, settings.graphics_api));
        }
        match &self.steam_path {
            Some(steam) => Ok(LaunchVariant::steam_at(steam.clone(), settings.graphics_api)),
            None => LaunchVariant::steam(settings.graphics_api),
        }
    }

    async fn inject(
        &self,
        settings: &LaunchSettings,
        loader: &LoaderSettings,
        handle: &mut ProcessHandle,
        cancel: &mut watch::Receiver<bool>,
        result: &mut LaunchResult,
    ) -> Result<(), PipelineError> {
        let delay_ms = loader.injection_delay_ms;
        result.start(format!("Scheduling loader injection in {} ms", delay_ms));

        let install = LoaderInstall::resolve(loader)
            .map_err(|e| InjectionError::InjectFailed(e.to_string()))?;
        let request = LoaderRequest::new(install, settings.language, &settings.game_version, delay_ms);

        let controller = InjectionController::new(self.injector_for(loader.method), Duration::from_millis(delay_ms));
        let outcome = controller
            .run(handle, &request, cancel, |state| match state {
                InjectionState::Locating => result.info("Locating game process"),
                InjectionState::Injecting { pid } => {
                    result.info(format!("Injecting loader into PID {}", pid))
                }
                _ => {}
            })
            .await?;

        result.success(format!(
            "Loader {} injected into PID {}",
            outcome.loader_version, outcome.pid
        ));
        Ok(())
    }

    fn injector_for(&self, method: InjectionMethod) -> Arc<dyn Injector> {
        if let Some(injector) = &self.injector {
            return Arc::clone(injector);
        }

        match method {
            InjectionMethod::LoaderProcess => Arc::new(LoaderProcessInjector::new()),
            #[cfg(windows)]
            InjectionMethod::RemoteThread => {
                Arc::new(crate::services::remote_thread::RemoteThreadInjector::new())
            }
            #[cfg(not(windows))]
            InjectionMethod::RemoteThread => {
                tracing::warn!("Remote-thread injection is only available on Windows, using the loader's injector");
                Arc::new(LoaderProcessInjector::new())
            }
        }
    }
}

fn check_cancel(cancel: &watch::Receiver<bool>) -> Result<(), PipelineError> {
    if is_cancelled(cancel) {
        Err(PipelineError::Cancelled)
    } else {
        Ok(())
    }
}

fn push_failure(result: &mut LaunchResult, error: &PipelineError) {
    tracing::error!("{}", error.render());
    result.error(error.render());
    if let Some(diagnostic) = error.diagnostic() {
        result.info(format!("diagnostic: {}", diagnostic));
    }
}
