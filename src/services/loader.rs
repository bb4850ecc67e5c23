//! Loader ("Dalamud") install resolution and its start info.
//!
//! ```text
//! <root>/
//!   addon/Hooks/<version>/Dalamud.Injector.exe, Dalamud.Boot.dll, hashes.json
//!   config/ installedPlugins/ dalamudAssets/ logs/ runtime/
//! ```
//!
//! The root may also be given as `<root>/addon` directly.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use semver::Version;
use serde::Serialize;
use std::fs;
use thiserror::Error;

use super::integrity::{self, Hasher, IntegrityError, IntegrityReport};
use crate::models::{ClientLanguage, LoaderSettings};

pub const INJECTOR_EXE: &str = "Dalamud.Injector.exe";
pub const BOOT_DLL: &str = "Dalamud.Boot.dll";
pub const HASHES_FILE: &str = "hashes.json";

/// Compatibility flags the injector needs when it runs on the bundled runtime
pub const RUNTIME_COMPAT_LAYER: &str = "RunAsInvoker HighDPIAware";

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("Loader not installed at {0}")]
    NotInstalled(Utf8PathBuf),

    #[error("No loader version found under {0}")]
    NoVersion(Utf8PathBuf),

    #[error("Loader version {version} not found under {hooks}")]
    VersionMissing { version: String, hooks: Utf8PathBuf },

    #[error("Loader file missing: {0}")]
    FileMissing(Utf8PathBuf),

    #[error("Loader files failed verification: {0}")]
    IntegrityFailed(String),

    #[error("Loader files could not be verified")]
    Integrity(#[from] IntegrityError),

    #[error("Failed to encode loader start info")]
    StartInfo(#[from] serde_json::Error),
}

/// Start info handed to the loader, serialized as base64 JSON
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StartInfo {
    pub working_directory: String,
    pub configuration_path: String,
    pub plugin_directory: String,
    pub asset_directory: String,
    pub client_language: u32,
    pub delay_initialize: bool,
    pub game_version: String,
    pub logging_path: String,
    pub delay_initialize_ms: u64,
}

impl StartInfo {
    pub fn to_json(&self) -> Result<String, LoaderError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_base64(&self) -> Result<String, LoaderError> {
        Ok(STANDARD.encode(self.to_json()?.as_bytes()))
    }
}

/// A resolved loader installation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderInstall {
    root: Utf8PathBuf,
    version: String,
    version_dir: Utf8PathBuf,
    config_path: Utf8PathBuf,
    plugin_path: Utf8PathBuf,
    asset_path: Utf8PathBuf,
    log_path: Utf8PathBuf,
    runtime_path: Option<Utf8PathBuf>,
}

impl LoaderInstall {
    /// Resolve the active version directory and data paths.
    pub fn resolve(settings: &LoaderSettings) -> Result<Self, LoaderError> {
        let (root, base) = install_layout(&settings.install_path);

        if !base.is_dir() {
            return Err(LoaderError::NotInstalled(base));
        }

        let hooks = base.join("Hooks");
        let version = match settings.version.as_deref().map(str::trim) {
            Some(pinned) if !pinned.is_empty() => {
                if !hooks.join(pinned).is_dir() {
                    return Err(LoaderError::VersionMissing {
                        version: pinned.to_string(),
                        hooks,
                    });
                }
                pinned.to_string()
            }
            _ => newest_version(&hooks)?,
        };

        let version_dir = hooks.join(&version);
        let override_or = |value: &Option<String>, default: &str| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(Utf8PathBuf::from)
                .unwrap_or_else(|| root.join(default))
        };

        let runtime = root.join("runtime");

        tracing::info!("Using loader version {} at {}", version, version_dir);

        Ok(Self {
            config_path: override_or(&settings.config_path, "config"),
            plugin_path: override_or(&settings.plugin_path, "installedPlugins"),
            asset_path: override_or(&settings.asset_path, "dalamudAssets"),
            log_path: root.join("logs"),
            runtime_path: runtime.is_dir().then_some(runtime),
            root,
            version,
            version_dir,
        })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn version_dir(&self) -> &Utf8Path {
        &self.version_dir
    }

    pub fn injector_path(&self) -> Utf8PathBuf {
        self.version_dir.join(INJECTOR_EXE)
    }

    pub fn boot_dll_path(&self) -> Utf8PathBuf {
        self.version_dir.join(BOOT_DLL)
    }

    pub fn config_path(&self) -> &Utf8Path {
        &self.config_path
    }

    pub fn plugin_path(&self) -> &Utf8Path {
        &self.plugin_path
    }

    pub fn asset_path(&self) -> &Utf8Path {
        &self.asset_path
    }

    pub fn log_path(&self) -> &Utf8Path {
        &self.log_path
    }

    pub fn runtime_path(&self) -> Option<&Utf8Path> {
        self.runtime_path.as_deref()
    }

    /// Verify the version directory against its `hashes.json`, if it ships one.
    pub fn verify(&self) -> Result<Option<IntegrityReport>, LoaderError> {
        let hashes = self.version_dir.join(HASHES_FILE);
        if !hashes.is_file() {
            tracing::debug!("No {} in {}, skipping loader verification", HASHES_FILE, self.version_dir);
            return Ok(None);
        }

        let expected = integrity::load_expected_hashes(&hashes)?;
        let report = Hasher::from_expected(expected).verify(&self.version_dir)?;

        if !report.passed() {
            return Err(LoaderError::IntegrityFailed(report.summary()));
        }
        Ok(Some(report))
    }

    pub fn start_info(&self, language: ClientLanguage, game_version: &str, delay_ms: u64) -> StartInfo {
        StartInfo {
            working_directory: self.version_dir.to_string(),
            configuration_path: self.config_path.to_string(),
            plugin_directory: self.plugin_path.to_string(),
            asset_directory: self.asset_path.to_string(),
            client_language: language as u32,
            delay_initialize: false,
            game_version: game_version.to_string(),
            logging_path: self.log_path.to_string(),
            delay_initialize_ms: delay_ms,
        }
    }
}

/// Everything an [`crate::services::Injector`] needs to load the loader into a process
#[derive(Debug, Clone)]
pub struct LoaderRequest {
    pub install: LoaderInstall,
    pub start_info: StartInfo,
}

impl LoaderRequest {
    pub fn new(install: LoaderInstall, language: ClientLanguage, game_version: &str, delay_ms: u64) -> Self {
        let start_info = install.start_info(language, game_version, delay_ms);
        Self { install, start_info }
    }

    /// Arguments for the loader's own injector executable
    pub fn injector_args(&self, pid: u32) -> Result<Vec<String>, LoaderError> {
        let info = &self.start_info;
        Ok(vec![
            "inject".to_string(),
            pid.to_string(),
            format!("--dalamud-working-directory={}", info.working_directory),
            format!("--dalamud-configuration-path={}", info.configuration_path),
            format!("--dalamud-plugin-directory={}", info.plugin_directory),
            format!("--dalamud-asset-directory={}", info.asset_directory),
            format!("--logpath={}", info.logging_path),
            format!("--dalamud-client-language={}", info.client_language),
            format!("--dalamud-delay-initialize={}", info.delay_initialize_ms),
            format!("--dalamud-tspack-b64={}", info.to_base64()?),
        ])
    }

    pub fn injector_env(&self) -> IndexMap<String, String> {
        let mut env = IndexMap::new();
        if let Some(runtime) = self.install.runtime_path() {
            env.insert("DALAMUD_RUNTIME".to_string(), runtime.to_string());
            env.insert("__COMPAT_LAYER".to_string(), RUNTIME_COMPAT_LAYER.to_string());
        }
        env
    }
}

/// Split a configured install path into the loader root and its `addon` base.
pub fn install_layout(install_path: &str) -> (Utf8PathBuf, Utf8PathBuf) {
    let given = Utf8PathBuf::from(install_path.trim());
    if given.file_name().is_some_and(|n| n.eq_ignore_ascii_case("addon")) {
        let root = given.parent().map(Utf8Path::to_path_buf).unwrap_or_else(|| given.clone());
        (root, given)
    } else {
        let base = given.join("addon");
        (given, base)
    }
}

/// Highest version directory under `Hooks/`.
///
/// Names are semver (`9.1.0`), optionally with a fourth revision component (`9.1.0.12`).
fn newest_version(hooks: &Utf8Path) -> Result<String, LoaderError> {
    let entries = fs::read_dir(hooks).map_err(|_| LoaderError::NoVersion(hooks.to_path_buf()))?;

    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter_map(|name| parse_hook_version(&name).map(|key| (key, name)))
        .max_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(_, name)| name)
        .ok_or_else(|| LoaderError::NoVersion(hooks.to_path_buf()))
}

fn parse_hook_version(name: &str) -> Option<(Version, u64)> {
    if let Ok(version) = Version::parse(name) {
        return Some((version, 0));
    }

    let (head, revision) = name.rsplit_once('.')?;
    let revision = revision.parse().ok()?;
    Version::parse(head).ok().map(|version| (version, revision))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_loader(versions: &[&str]) -> (TempDir, Utf8PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let root = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
        for version in versions {
            fs::create_dir_all(root.join("addon/Hooks").join(version)).unwrap();
        }
        (temp_dir, root)
    }

    fn settings(root: &Utf8Path) -> LoaderSettings {
        LoaderSettings {
            enabled: true,
            install_path: root.to_string(),
            ..LoaderSettings::default()
        }
    }

    #[test]
    fn test_picks_highest_version() {
        let (_temp_dir, root) = create_loader(&["9.0.0.9", "9.0.0.17", "8.9.9", "notes"]);
        let install = LoaderInstall::resolve(&settings(&root)).unwrap();

        assert_eq!(install.version(), "9.0.0.17");
        assert_eq!(install.injector_path(), root.join("addon/Hooks/9.0.0.17/Dalamud.Injector.exe"));
        assert_eq!(install.config_path(), root.join("config").as_path());
        assert_eq!(install.plugin_path(), root.join("installedPlugins").as_path());
        assert!(install.runtime_path().is_none());
    }

    #[test]
    fn test_addon_suffix_and_overrides() {
        let (_temp_dir, root) = create_loader(&["1.2.3"]);
        fs::create_dir_all(root.join("runtime")).unwrap();

        let loader = LoaderSettings {
            install_path: root.join("addon").to_string(),
            plugin_path: Some("/custom/plugins".to_string()),
            version: Some("1.2.3".to_string()),
            ..settings(&root)
        };
        let install = LoaderInstall::resolve(&loader).unwrap();

        assert_eq!(install.root(), root.as_path());
        assert_eq!(install.plugin_path(), Utf8Path::new("/custom/plugins"));
        assert_eq!(install.runtime_path(), Some(root.join("runtime").as_path()));

        let request = LoaderRequest::new(install, ClientLanguage::English, "2024.01.01.0000.0000", 0);
        let env = request.injector_env();
        assert_eq!(env["DALAMUD_RUNTIME"], root.join("runtime").as_str());
        assert_eq!(env["__COMPAT_LAYER"], RUNTIME_COMPAT_LAYER);
    }

    #[test]
    fn test_start_info_json_carries_overrides() {
        let (_temp_dir, root) = create_loader(&["1.0.0"]);
        let loader = LoaderSettings {
            config_path: Some("/custom/config.json".to_string()),
            plugin_path: Some("/custom/plugins".to_string()),
            asset_path: Some("/custom/assets".to_string()),
            ..settings(&root)
        };
        let install = LoaderInstall::resolve(&loader).unwrap();
        let request = LoaderRequest::new(install, ClientLanguage::French, "2024.01.01.0000.0000", 0);

        let json: serde_json::Value =
            serde_json::from_str(&request.start_info.to_json().unwrap()).unwrap();
        assert_eq!(json["ConfigurationPath"], "/custom/config.json");
        assert_eq!(json["PluginDirectory"], "/custom/plugins");
        assert_eq!(json["AssetDirectory"], "/custom/assets");
        assert_eq!(json["WorkingDirectory"], root.join("addon/Hooks/1.0.0").as_str());
        assert_eq!(json["ClientLanguage"], 3);
    }

    #[test]
    fn test_missing_install_and_versions() {
        let temp_dir = TempDir::new().unwrap();
        let root = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
        assert!(matches!(
            LoaderInstall::resolve(&settings(&root)),
            Err(LoaderError::NotInstalled(_))
        ));

        fs::create_dir_all(root.join("addon/Hooks")).unwrap();
        assert!(matches!(
            LoaderInstall::resolve(&settings(&root)),
            Err(LoaderError::NoVersion(_))
        ));

        let pinned = LoaderSettings {
            version: Some("2.0.0".to_string()),
            ..settings(&root)
        };
        assert!(matches!(
            LoaderInstall::resolve(&pinned),
            Err(LoaderError::VersionMissing { .. })
        ));
    }

    #[test]
    fn test_verify_against_hashes_json() {
        let (_temp_dir, root) = create_loader(&["1.0.0"]);
        let version_dir = root.join("addon/Hooks/1.0.0");
        fs::write(version_dir.join(BOOT_DLL), "hello").unwrap();

        let install = LoaderInstall::resolve(&settings(&root)).unwrap();
        assert!(install.verify().unwrap().is_none());

        fs::write(
            version_dir.join(HASHES_FILE),
            r#"{"Dalamud.Boot.dll": "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"}"#,
        )
        .unwrap();
        assert!(install.verify().unwrap().unwrap().passed());

        fs::write(version_dir.join(BOOT_DLL), "tampered").unwrap();
        assert!(matches!(install.verify(), Err(LoaderError::IntegrityFailed(_))));
    }

    #[test]
    fn test_injector_args_and_start_info() {
        let (_temp_dir, root) = create_loader(&["1.0.0"]);
        let install = LoaderInstall::resolve(&settings(&root)).unwrap();
        let request = LoaderRequest::new(install, ClientLanguage::German, "2024.01.01.0000.0000", 250);

        let args = request.injector_args(4242).unwrap();
        assert_eq!(args[0], "inject");
        assert_eq!(args[1], "4242");
        assert!(args.contains(&"--dalamud-client-language=2".to_string()));
        assert!(args.contains(&"--dalamud-delay-initialize=250".to_string()));

        let encoded = args.last().unwrap().trim_start_matches("--dalamud-tspack-b64=");
        let json: serde_json::Value =
            serde_json::from_slice(&STANDARD.decode(encoded).unwrap()).unwrap();
        assert_eq!(json["GameVersion"], "2024.01.01.0000.0000");
        assert_eq!(json["ClientLanguage"], 2);
        assert!(request.injector_env().is_empty());
    }

    #[test]
    fn test_parse_hook_version() {
        assert!(parse_hook_version("9.0.0.17").unwrap() > parse_hook_version("9.0.0.9").unwrap());
        assert!(parse_hook_version("10.0.0").unwrap() > parse_hook_version("9.9.9.99").unwrap());
        assert!(parse_hook_version("latest").is_none());
    }
}
