use crate::models::LauncherSettings;
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;

/// Settings file name inside the config directory
pub const SETTINGS_FILE: &str = "Launcher Settings.yaml";

/// Prefix for environment overrides, e.g. `XIVLOADER__GAME_PATH` or
/// `XIVLOADER__LOADER__ENABLE_DALAMUD`
pub const ENV_PREFIX: &str = "XIVLOADER";

/// Configuration manager for the persisted launcher settings.
///
/// Manages one file, `Launcher Settings.yaml`. Loading layers the file and
/// `XIVLOADER__*` environment variables; saving writes the file only.
/// Credentials are not part of [`LauncherSettings`] and never touch disk.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_dir: Utf8PathBuf,
    settings_path: Utf8PathBuf,
}

impl ConfigManager {
    /// Create a new ConfigManager with the specified configuration directory.
    ///
    /// The directory is created if it doesn't exist.
    pub fn new<P: AsRef<Utf8Path>>(config_dir: P) -> Result<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .with_context(|| format!("Failed to create config directory: {}", config_dir))?;
        }

        Ok(Self {
            settings_path: config_dir.join(SETTINGS_FILE),
            config_dir,
        })
    }

    /// Load the launcher settings.
    ///
    /// A missing file yields defaults. Environment overrides apply either way.
    pub fn load_settings(&self) -> Result<LauncherSettings> {
        if !self.settings_path.exists() {
            tracing::warn!(
                "Settings file not found at {}, using defaults",
                self.settings_path
            );
        }

        let settings: LauncherSettings = config::Config::builder()
            .add_source(
                config::File::from(self.settings_path.as_std_path())
                    .format(config::FileFormat::Yaml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read settings: {}", self.settings_path))?
            .try_deserialize()
            .with_context(|| format!("Failed to parse settings: {}", self.settings_path))?;

        tracing::info!("Loaded settings from {}", self.settings_path);
        Ok(settings)
    }

    /// Save the launcher settings.
    pub fn save_settings(&self, settings: &LauncherSettings) -> Result<()> {
        let yaml_string =
            serde_yaml_ng::to_string(settings).context("Failed to serialize settings to YAML")?;

        fs::write(&self.settings_path, yaml_string)
            .with_context(|| format!("Failed to write settings: {}", self.settings_path))?;

        tracing::info!("Saved settings to {}", self.settings_path);
        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir(&self) -> &Utf8Path {
        &self.config_dir
    }

    pub fn settings_path(&self) -> &Utf8Path {
        &self.settings_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_config_manager() -> (ConfigManager, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config_path = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
        let manager = ConfigManager::new(&config_path).unwrap();
        (manager, temp_dir)
    }

    #[test]
    fn test_create_config_manager() {
        let (manager, _temp_dir) = create_test_config_manager();
        assert!(manager.settings_path().ends_with(SETTINGS_FILE));
    }

    #[test]
    fn test_load_save_settings() {
        let (manager, _temp_dir) = create_test_config_manager();

        let mut settings = LauncherSettings::default();
        settings.game_path = "/games/ffxiv".to_string();
        settings.loader.enabled = true;
        settings.loader.injection_delay_ms = 1500;
        manager.save_settings(&settings).unwrap();

        let loaded = manager.load_settings().unwrap();
        assert_eq!(loaded.game_path, "/games/ffxiv");
        assert!(loaded.loader.enabled);
        assert_eq!(loaded.loader.injection_delay_ms, 1500);
        assert_eq!(loaded.region, 3);
    }

    #[test]
    fn test_saved_file_has_no_credentials() {
        let (manager, _temp_dir) = create_test_config_manager();

        let mut config = crate::models::LaunchConfig::default();
        config.username = "player".to_string();
        config.password = "hunter2".into();
        manager.save_settings(&LauncherSettings::from(&config)).unwrap();

        let written = fs::read_to_string(manager.settings_path()).unwrap();
        assert!(written.contains("player"));
        assert!(!written.contains("hunter2"));
        assert!(!written.contains("password"));
    }
}
