use regex::Regex;
use sha1::{Digest, Sha1};
use std::env;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

use super::transport::{AuthTransport, HttpRequest, HttpResponse, RequestBody, TransportError};
use super::wait_for_cancel;
use crate::models::{ClientLanguage, LaunchTicket, Region, Secret, SessionTicket};

/// Submissions of a one-time password before giving up: the configured code plus one retry
pub const MAX_OTP_ATTEMPTS: u32 = 2;

/// Attempts per HTTP request when the network (or the server, 5xx) fails
pub const MAX_TRANSPORT_ATTEMPTS: u32 = 3;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

const USER_AGENT_PREFIX: &str = "SQEXAuthor/2.0.0(Windows 6.2; ja-jp; ";
const PATCH_USER_AGENT: &str = "FFXIV PATCH CLIENT";

/// Errors that end the login handshake. All of them are terminal for the attempt.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("the Square Enix ID or password was rejected")]
    InvalidCredentials,

    #[error("this account requires a one-time password, but none was supplied")]
    OtpRequired,

    #[error("the one-time password was rejected ({attempts} attempts)")]
    OtpInvalid { attempts: u32 },

    #[error("could not reach the login service after {attempts} attempts")]
    Transport {
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("the login service refused the request: {0}")]
    RemoteRejected(String),

    #[error("unexpected response from the login service: {0}")]
    Malformed(String),

    #[error("authentication was cancelled")]
    Cancelled,
}

impl AuthError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "InvalidCredentials",
            Self::OtpRequired => "OtpRequired",
            Self::OtpInvalid { .. } => "OtpInvalid",
            Self::Transport { .. } => "Transport",
            Self::RemoteRejected(_) => "RemoteRejected",
            Self::Malformed(_) => "Malformed",
            Self::Cancelled => "Cancelled",
        }
    }
}

/// States of the login handshake, reported to the observer as they are entered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Idle,
    CredentialsSubmitted,
    AwaitingOtp { attempt: u32 },
    SessionEstablished,
    LaunchParamsFetched,
    Succeeded,
    Failed { kind: &'static str },
}

/// Supplies one-time passwords when the service asks for (another) one.
///
/// `attempt` is the 1-based number of the submission the code will be used for.
/// Returning `None` gives up.
#[cfg_attr(test, mockall::automock)]
pub trait OtpProvider {
    fn next_otp(&self, attempt: u32) -> Option<String>;
}

/// Never has a code to offer
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOtp;

impl OtpProvider for NoOtp {
    fn next_otp(&self, _attempt: u32) -> Option<String> {
        None
    }
}

impl<F> OtpProvider for F
where
    F: Fn(u32) -> Option<String>,
{
    fn next_otp(&self, attempt: u32) -> Option<String> {
        self(attempt)
    }
}

/// Remote endpoints. Region-specific mirrors and tests substitute these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthEndpoints {
    pub login_base: String,
    pub gamever_base: String,
}

impl Default for AuthEndpoints {
    fn default() -> Self {
        Self {
            login_base: "https://ffxiv-login.square-enix.com/oauth/ffxivarr/login".to_string(),
            gamever_base: "https://patch-gamever.ffxiv.com/http/win32/ffxivneo_release_game"
                .to_string(),
        }
    }
}

impl AuthEndpoints {
    pub fn top_url(&self, language: ClientLanguage, region: Region, is_steam: bool) -> String {
        format!(
            "{}/top?lng={}&rgn={}&isft=0&cssmode=1&isnew=1&launchver=3&issteam={}",
            self.login_base,
            language.login_code(),
            region as u32,
            if is_steam { 1 } else { 0 }
        )
    }

    pub fn login_url(&self) -> String {
        format!("{}/login.send", self.login_base)
    }

    pub fn gamever_url(&self, game_version: &str, sid: &str) -> String {
        format!("{}/{}/{}", self.gamever_base, game_version, sid)
    }
}

/// Everything the handshake needs from the launch configuration
#[derive(Debug, Clone, Copy)]
pub struct AuthRequest<'a> {
    pub username: &'a str,
    pub password: &'a Secret,
    pub otp: Option<&'a Secret>,
    pub language: ClientLanguage,
    pub region: Region,
    pub is_steam: bool,
    pub game_version: &'a str,
    /// Boot file hashes, see [`crate::services::integrity::IntegrityReport::version_report`]
    pub version_report: &'a str,
}

/// Output of a successful handshake
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub session: SessionTicket,
    pub launch_ticket: LaunchTicket,
}

enum LoginOutcome {
    Session(SessionTicket),
    CredentialsRejected,
    OtpNeeded,
    Rejected(String),
}

/// Client for the multi-step login handshake.
///
/// `credentials → session id → launch ticket`, with an optional one-time-password
/// branch. The client holds no per-attempt state: each [`authenticate`](Self::authenticate)
/// call runs a full, isolated handshake.
///
/// Patterns are compiled once at construction:
///
/// - `stored_pattern`: hidden `_STORED_` token on the login top page
/// - `sid_pattern`: `sid,<session id>,terms` in a successful login response
/// - `maxex_pattern`: `maxex,<n>`, the account's entitled expansion
/// - `error_pattern`: `login=auth,ng,err,<message>` in a rejected login response
pub struct AuthClient<T> {
    transport: T,
    endpoints: AuthEndpoints,
    user_agent: String,
    backoff: Duration,
    stored_pattern: Regex,
    sid_pattern: Regex,
    maxex_pattern: Regex,
    error_pattern: Regex,
}

impl<T: AuthTransport> AuthClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            endpoints: AuthEndpoints::default(),
            user_agent: user_agent(),
            backoff: INITIAL_BACKOFF,
            stored_pattern: Regex::new(r#"<input.*?name="_STORED_".*?value="([^"]*)""#)
                .expect("Invalid _STORED_ regex"),
            sid_pattern: Regex::new(r"sid,(?P<sid>[^,]+),terms").expect("Invalid sid regex"),
            maxex_pattern: Regex::new(r"maxex,(?P<maxex>\d+)").expect("Invalid maxex regex"),
            error_pattern: Regex::new(r#"login=auth,ng,err,(?P<message>[^"]*)"#)
                .expect("Invalid error regex"),
        }
    }

    pub fn with_endpoints(mut self, endpoints: AuthEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Initial delay between transport retries (doubles per retry)
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn endpoints(&self) -> &AuthEndpoints {
        &self.endpoints
    }

    /// Run the full handshake.
    ///
    /// `on_state` is called with every state as it is entered, ending with either
    /// [`AuthState::Succeeded`] or [`AuthState::Failed`].
    pub async fn authenticate<F>(
        &self,
        request: &AuthRequest<'_>,
        otp: &(dyn OtpProvider + Sync),
        cancel: &mut watch::Receiver<bool>,
        mut on_state: F,
    ) -> Result<AuthSession, AuthError>
    where
        F: FnMut(&AuthState) + Send,
    {
        on_state(&AuthState::Idle);

        let result = self.run(request, otp, cancel, &mut on_state).await;

        match &result {
            Ok(_) => on_state(&AuthState::Succeeded),
            Err(e) => on_state(&AuthState::Failed { kind: e.kind() }),
        }

        result
    }

    async fn run<F>(
        &self,
        request: &AuthRequest<'_>,
        otp: &(dyn OtpProvider + Sync),
        cancel: &mut watch::Receiver<bool>,
        on_state: &mut F,
    ) -> Result<AuthSession, AuthError>
    where
        F: FnMut(&AuthState) + Send,
    {
        if request.username.trim().is_empty() || request.password.is_empty() {
            return Err(AuthError::InvalidCredentials);
        }

        on_state(&AuthState::CredentialsSubmitted);

        let mut otp_code: Option<Secret> = request.otp.filter(|o| !o.is_empty()).cloned();
        let mut otp_attempts = 0;

        let session = loop {
            if otp_code.is_some() {
                otp_attempts += 1;
            }

            // The _STORED_ token is single-use, every submission needs a fresh one
            let stored = self.fetch_stored(request, cancel).await?;
            let body = self
                .submit_login(request, &stored, otp_code.as_ref(), cancel)
                .await?;

            match self.parse_login_response(&body)? {
                LoginOutcome::Session(ticket) => break ticket,
                LoginOutcome::CredentialsRejected => return Err(AuthError::InvalidCredentials),
                LoginOutcome::Rejected(message) => return Err(AuthError::RemoteRejected(message)),
                LoginOutcome::OtpNeeded => {
                    if otp_attempts >= MAX_OTP_ATTEMPTS {
                        return Err(AuthError::OtpInvalid {
                            attempts: otp_attempts,
                        });
                    }

                    let attempt = otp_attempts + 1;
                    on_state(&AuthState::AwaitingOtp { attempt });
                    tracing::info!("Login service requested a one-time password (attempt {})", attempt);

                    match otp.next_otp(attempt).map(Secret::from) {
                        Some(code) if !code.is_empty() => otp_code = Some(code),
                        _ if otp_attempts == 0 => return Err(AuthError::OtpRequired),
                        _ => {
                            return Err(AuthError::OtpInvalid {
                                attempts: otp_attempts,
                            });
                        }
                    }
                }
            }
        };

        on_state(&AuthState::SessionEstablished);
        tracing::info!(
            "Session established (entitled expansion: {:?})",
            session.max_expansion
        );

        let launch_ticket = self.fetch_launch_ticket(request, &session, cancel).await?;
        on_state(&AuthState::LaunchParamsFetched);

        Ok(AuthSession {
            session,
            launch_ticket,
        })
    }

    async fn fetch_stored(
        &self,
        request: &AuthRequest<'_>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Secret, AuthError> {
        let url = self
            .endpoints
            .top_url(request.language, request.region, request.is_steam);
        let http = HttpRequest::get(url).header("User-Agent", self.user_agent.as_str());

        let response = self.send_with_retry(http, cancel).await?;
        if !response.is_success() {
            return Err(AuthError::RemoteRejected(format!(
                "login page returned HTTP {}",
                response.status
            )));
        }

        self.stored_pattern
            .captures(&response.body)
            .and_then(|caps| caps.get(1))
            .map(|m| Secret::new(m.as_str()))
            .ok_or_else(|| {
                AuthError::Malformed("login page did not contain a _STORED_ token".to_string())
            })
    }

    async fn submit_login(
        &self,
        request: &AuthRequest<'_>,
        stored: &Secret,
        otp: Option<&Secret>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<String, AuthError> {
        let form = vec![
            ("_STORED_".to_string(), stored.clone()),
            ("sqexid".to_string(), Secret::new(request.username)),
            ("password".to_string(), request.password.clone()),
            ("otppw".to_string(), otp.cloned().unwrap_or_default()),
        ];

        let referer = self
            .endpoints
            .top_url(request.language, request.region, request.is_steam);
        let http = HttpRequest::post(self.endpoints.login_url(), RequestBody::Form(form))
            .header("User-Agent", self.user_agent.as_str())
            .header("Referer", referer);

        let response = self.send_with_retry(http, cancel).await?;
        if !response.is_success() {
            return Err(AuthError::RemoteRejected(format!(
                "login returned HTTP {}",
                response.status
            )));
        }

        Ok(response.body)
    }

    fn parse_login_response(&self, body: &str) -> Result<LoginOutcome, AuthError> {
        if let Some(caps) = self.sid_pattern.captures(body) {
            let max_expansion = self
                .maxex_pattern
                .captures(body)
                .and_then(|c| c["maxex"].parse().ok());
            return Ok(LoginOutcome::Session(SessionTicket::new(
                &caps["sid"],
                max_expansion,
            )));
        }

        if let Some(caps) = self.error_pattern.captures(body) {
            let message = caps["message"].trim_end_matches(')').trim().to_string();
            return Ok(classify_rejection(message));
        }

        Err(AuthError::Malformed(
            "login response contained neither a session id nor an error".to_string(),
        ))
    }

    async fn fetch_launch_ticket(
        &self,
        request: &AuthRequest<'_>,
        session: &SessionTicket,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<LaunchTicket, AuthError> {
        let url = self
            .endpoints
            .gamever_url(request.game_version, session.sid());
        let http = HttpRequest::post(url, RequestBody::Text(request.version_report.to_string()))
            .header("User-Agent", PATCH_USER_AGENT)
            .header("X-Hash-Check", "enabled")
            .header("Content-Type", "text/plain");

        let response = self.send_with_retry(http, cancel).await?;

        if response.status == 409 {
            return Err(AuthError::RemoteRejected(
                "boot files are outdated; run the official updater".to_string(),
            ));
        }
        if !response.is_success() {
            return Err(AuthError::RemoteRejected(format!(
                "version check returned HTTP {}",
                response.status
            )));
        }
        if !response.body.trim().is_empty() {
            return Err(AuthError::RemoteRejected(
                "game patches are pending; update the game first".to_string(),
            ));
        }

        response
            .header("X-Patch-Unique-Id")
            .filter(|id| !id.trim().is_empty())
            .map(LaunchTicket::new)
            .ok_or_else(|| {
                AuthError::Malformed("version check did not return a launch ticket".to_string())
            })
    }

    /// Send a request, retrying transport failures and 5xx responses with backoff.
    async fn send_with_retry(
        &self,
        request: HttpRequest,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<HttpResponse, AuthError> {
        let mut delay = self.backoff;
        let mut attempt = 1;

        loop {
            let outcome = tokio::select! {
                biased;
                _ = wait_for_cancel(cancel) => return Err(AuthError::Cancelled),
                result = self.transport.send(request.clone()) => result,
            };

            let retryable = match &outcome {
                Ok(response) => response.is_server_error(),
                Err(_) => true,
            };

            if !retryable || attempt >= MAX_TRANSPORT_ATTEMPTS {
                return outcome.map_err(|source| AuthError::Transport {
                    attempts: attempt,
                    source,
                });
            }

            match &outcome {
                Ok(response) => tracing::warn!(
                    "{:?} returned HTTP {}, retrying in {:?}",
                    request,
                    response.status,
                    delay
                ),
                Err(e) => tracing::warn!("{}, retrying in {:?}", e, delay),
            }

            tokio::select! {
                biased;
                _ = wait_for_cancel(cancel) => return Err(AuthError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }

            delay *= 2;
            attempt += 1;
        }
    }
}

fn classify_rejection(message: String) -> LoginOutcome {
    let lower = message.to_lowercase();

    if lower.contains("one-time password") || lower.contains("one time password") {
        LoginOutcome::OtpNeeded
    } else if lower.contains("password") || lower.contains("square enix id") {
        LoginOutcome::CredentialsRejected
    } else {
        LoginOutcome::Rejected(message)
    }
}

/// User agent the official launcher sends, with this machine's computer id
pub fn user_agent() -> String {
    format!("{}{})", USER_AGENT_PREFIX, make_computer_id())
}

/// Checksum-prefixed 4-byte machine fingerprint, hex-encoded (10 characters)
pub fn make_computer_id() -> String {
    let machine_name = env::var("COMPUTERNAME")
        .or_else(|_| env::var("HOSTNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let user_name = env::var("USERNAME")
        .or_else(|_| env::var("USER"))
        .unwrap_or_default();

    computer_id_from(&machine_name, &user_name, "Windows 10.0", num_cpus::get())
}

fn computer_id_from(
    machine_name: &str,
    user_name: &str,
    os_version: &str,
    processor_count: usize,
) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("{}{}{}{}", machine_name, user_name, os_version, processor_count).as_bytes());
    let hash = hasher.finalize();

    let mut bytes = [0u8; 5];
    bytes[1..].copy_from_slice(&hash[0..4]);
    bytes[0] = !(bytes[1]
        .wrapping_add(bytes[2])
        .wrapping_add(bytes[3])
        .wrapping_add(bytes[4]));

    hex::encode(bytes)
}
