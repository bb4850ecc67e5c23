use serde::{Deserialize, Serialize};
use std::fmt;

use super::session::Secret;

/// Input for a single launch attempt.
///
/// This is the value the UI hands to [`crate::launch_game`]. Field names follow the
/// front-end's JSON shape, so loader settings are flattened into the top level
/// (`enable_dalamud`, `dalamud_path`, `injection_delay`, ...).
///
/// Enumerations are carried as raw numbers/strings exactly as the UI sends them and
/// are only checked by [`crate::services::params::validate`]; out-of-range values are
/// rejected there before any I/O happens.
///
/// The persisted form of this struct (see [`crate::config::ConfigManager`]) never
/// contains the password or the one-time password: both are skipped on serialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchConfig {
    pub game_path: String,

    #[serde(default)]
    pub username: String,

    #[serde(default, skip_serializing)]
    pub password: Secret,

    #[serde(default, skip_serializing)]
    pub otp: Option<Secret>,

    #[serde(default = "default_dx11")]
    pub dx11: bool,

    #[serde(default = "default_language")]
    pub language: u32,

    #[serde(default = "default_region")]
    pub region: u32,

    #[serde(default = "default_expansion_level")]
    pub expansion_level: u32,

    #[serde(default)]
    pub is_steam: bool,

    #[serde(default = "default_dpi_awareness")]
    pub dpi_awareness: String,

    #[serde(default)]
    pub additional_launch_args: String,

    #[serde(default)]
    pub encrypt_arguments: bool,

    /// Reference SHA-1 values for the boot files (`hashes.json` shape)
    #[serde(default)]
    pub boot_hashes_path: Option<String>,

    #[serde(flatten)]
    pub loader: LoaderSettings,

    #[serde(default)]
    pub policy: LaunchPolicy,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            game_path: String::new(),
            username: String::new(),
            password: Secret::default(),
            otp: None,
            dx11: default_dx11(),
            language: default_language(),
            region: default_region(),
            expansion_level: default_expansion_level(),
            is_steam: false,
            dpi_awareness: default_dpi_awareness(),
            additional_launch_args: String::new(),
            encrypt_arguments: false,
            boot_hashes_path: None,
            loader: LoaderSettings::default(),
            policy: LaunchPolicy::default(),
        }
    }
}

impl LaunchConfig {
    /// Graphics API implied by the `dx11` flag
    pub fn graphics_api(&self) -> GraphicsApi {
        if self.dx11 {
            GraphicsApi::DirectX11
        } else {
            GraphicsApi::DirectX9
        }
    }
}

/// Persisted launcher settings: a [`LaunchConfig`] without the credentials.
///
/// This is what `Launcher Settings.yaml` holds. Passwords and one-time passwords
/// have no field here, so they can neither be read from nor written to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherSettings {
    #[serde(default)]
    pub game_path: String,

    #[serde(default)]
    pub username: String,

    #[serde(default = "default_dx11")]
    pub dx11: bool,

    #[serde(default = "default_language")]
    pub language: u32,

    #[serde(default = "default_region")]
    pub region: u32,

    #[serde(default = "default_expansion_level")]
    pub expansion_level: u32,

    #[serde(default)]
    pub is_steam: bool,

    #[serde(default = "default_dpi_awareness")]
    pub dpi_awareness: String,

    #[serde(default)]
    pub additional_launch_args: String,

    #[serde(default)]
    pub encrypt_arguments: bool,

    #[serde(default)]
    pub boot_hashes_path: Option<String>,

    #[serde(default)]
    pub loader: LoaderSettings,

    #[serde(default)]
    pub policy: LaunchPolicy,
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self::from(&LaunchConfig::default())
    }
}

impl LauncherSettings {
    /// Combine with credentials supplied at launch time
    pub fn to_launch_config(&self, password: Secret, otp: Option<Secret>) -> LaunchConfig {
        LaunchConfig {
            game_path: self.game_path.clone(),
            username: self.username.clone(),
            password,
            otp,
            dx11: self.dx11,
            language: self.language,
            region: self.region,
            expansion_level: self.expansion_level,
            is_steam: self.is_steam,
            dpi_awareness: self.dpi_awareness.clone(),
            additional_launch_args: self.additional_launch_args.clone(),
            encrypt_arguments: self.encrypt_arguments,
            boot_hashes_path: self.boot_hashes_path.clone(),
            loader: self.loader.clone(),
            policy: self.policy,
        }
    }
}

impl From<&LaunchConfig> for LauncherSettings {
    fn from(config: &LaunchConfig) -> Self {
        Self {
            game_path: config.game_path.clone(),
            username: config.username.clone(),
            dx11: config.dx11,
            language: config.language,
            region: config.region,
            expansion_level: config.expansion_level,
            is_steam: config.is_steam,
            dpi_awareness: config.dpi_awareness.clone(),
            additional_launch_args: config.additional_launch_args.clone(),
            encrypt_arguments: config.encrypt_arguments,
            boot_hashes_path: config.boot_hashes_path.clone(),
            loader: config.loader.clone(),
            policy: config.policy,
        }
    }
}

fn default_dx11() -> bool {
    true
}

fn default_language() -> u32 {
    ClientLanguage::English as u32
}

fn default_region() -> u32 {
    Region::Europe as u32
}

fn default_expansion_level() -> u32 {
    4
}

fn default_dpi_awareness() -> String {
    DpiAwareness::Aware.as_str().to_string()
}

fn default_injection_delay() -> u64 {
    5000
}

/// Settings for the runtime-modification loader ("Dalamud") injected after launch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderSettings {
    #[serde(rename = "enable_dalamud", default)]
    pub enabled: bool,

    /// Loader root directory (the `addon` suffix is optional)
    #[serde(rename = "dalamud_path", default)]
    pub install_path: String,

    /// Delay between process start and injection, in milliseconds
    #[serde(rename = "injection_delay", default = "default_injection_delay")]
    pub injection_delay_ms: u64,

    #[serde(rename = "dalamud_config_path", default)]
    pub config_path: Option<String>,

    #[serde(rename = "dalamud_plugin_path", default)]
    pub plugin_path: Option<String>,

    #[serde(rename = "dalamud_asset_path", default)]
    pub asset_path: Option<String>,

    /// Pin a specific loader version instead of the newest installed one
    #[serde(rename = "dalamud_version", default)]
    pub version: Option<String>,

    #[serde(rename = "injection_method", default)]
    pub method: InjectionMethod,

    /// Install or update the loader and its assets before injecting
    #[serde(rename = "dalamud_auto_update", default)]
    pub auto_update: bool,

    /// Follow the staging track instead of release when updating
    #[serde(rename = "dalamud_staging", default)]
    pub staging: bool,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            install_path: String::new(),
            injection_delay_ms: default_injection_delay(),
            config_path: None,
            plugin_path: None,
            asset_path: None,
            version: None,
            method: InjectionMethod::default(),
            auto_update: false,
            staging: false,
        }
    }
}

/// How the loader gets into the game process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionMethod {
    /// Run the loader's own injector executable against the PID
    #[default]
    LoaderProcess,
    /// Load the boot DLL and call its `Initialize` export (Windows only)
    RemoteThread,
}

/// Policies for the two advisory steps of the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchPolicy {
    /// Treat a failed integrity check as terminal
    #[serde(default)]
    pub block_on_integrity_failure: bool,

    /// Treat a failed injection as a failed launch
    #[serde(default)]
    pub fail_on_injection_error: bool,
}

/// Game client language. The numeric value is what the game expects on its command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientLanguage {
    Japanese = 0,
    English = 1,
    German = 2,
    French = 3,
}

impl ClientLanguage {
    pub fn from_raw(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Japanese),
            1 => Some(Self::English),
            2 => Some(Self::German),
            3 => Some(Self::French),
            _ => None,
        }
    }

    /// Locale code used by the login pages (`lng=` query parameter)
    pub fn login_code(self) -> &'static str {
        match self {
            Self::Japanese => "ja",
            Self::English => "en",
            Self::German => "de",
            Self::French => "fr",
        }
    }
}

/// Account region. Selects the regional login variant (`rgn=`) and `SYS.Region`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    Japan = 1,
    NorthAmerica = 2,
    Europe = 3,
}

impl Region {
    pub fn from_raw(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Japan),
            2 => Some(Self::NorthAmerica),
            3 => Some(Self::Europe),
            _ => None,
        }
    }
}

/// Highest expansion the client should unlock (0 = A Realm Reborn ... 5 = Dawntrail)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExpansionLevel(u32);

impl ExpansionLevel {
    pub const MAX: u32 = 5;

    pub fn new(value: u32) -> Option<Self> {
        (value <= Self::MAX).then_some(Self(value))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphicsApi {
    DirectX9,
    DirectX11,
}

impl GraphicsApi {
    /// Executable name under `<game>/game/`
    pub fn executable_name(self) -> &'static str {
        match self {
            Self::DirectX9 => "ffxiv.exe",
            Self::DirectX11 => "ffxiv_dx11.exe",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpiAwareness {
    Aware,
    Unaware,
}

impl DpiAwareness {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "aware" => Some(Self::Aware),
            "unaware" => Some(Self::Unaware),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aware => "Aware",
            Self::Unaware => "Unaware",
        }
    }
}

impl fmt::Display for DpiAwareness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_front_end() {
        let config = LaunchConfig::default();
        assert!(config.dx11);
        assert_eq!(config.language, 1);
        assert_eq!(config.region, 3);
        assert_eq!(config.expansion_level, 4);
        assert_eq!(config.dpi_awareness, "Aware");
        assert_eq!(config.loader.injection_delay_ms, 5000);
        assert!(!config.loader.enabled);
        assert_eq!(config.policy, LaunchPolicy::default());
    }

    #[test]
    fn test_deserialize_flat_front_end_shape() {
        let json = r#"{
            "game_path": "C:/Games/FFXIV",
            "username": "user",
            "password": "hunter2",
            "otp": "123456",
            "dx11": false,
            "is_steam": true,
            "enable_dalamud": true,
            "dalamud_path": "C:/XIVLOADER",
            "injection_delay": 0
        }"#;

        let config: LaunchConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.password.expose(), "hunter2");
        assert_eq!(config.otp.as_ref().map(|o| o.expose()), Some("123456"));
        assert_eq!(config.graphics_api(), GraphicsApi::DirectX9);
        assert!(config.loader.enabled);
        assert_eq!(config.loader.install_path, "C:/XIVLOADER");
        assert_eq!(config.loader.injection_delay_ms, 0);
        assert_eq!(config.loader.method, InjectionMethod::LoaderProcess);
    }

    #[test]
    fn test_secrets_are_not_serialized() {
        let config = LaunchConfig {
            password: Secret::new("hunter2"),
            otp: Some(Secret::new("000000")),
            ..LaunchConfig::default()
        };

        let yaml = serde_yaml_ng::to_string(&config).unwrap();
        assert!(!yaml.contains("hunter2"));
        assert!(!yaml.contains("000000"));
        assert!(!yaml.contains("password"));
    }

    #[test]
    fn test_enum_ranges() {
        assert_eq!(ClientLanguage::from_raw(3), Some(ClientLanguage::French));
        assert_eq!(ClientLanguage::from_raw(4), None);
        assert_eq!(Region::from_raw(0), None);
        assert_eq!(Region::from_raw(2), Some(Region::NorthAmerica));
        assert!(ExpansionLevel::new(5).is_some());
        assert!(ExpansionLevel::new(6).is_none());
        assert_eq!(DpiAwareness::parse("unaware"), Some(DpiAwareness::Unaware));
        assert_eq!(DpiAwareness::parse("maybe"), None);
    }
}
