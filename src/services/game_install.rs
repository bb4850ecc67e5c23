//! Game install layout: where the boot files, executables and version file live.
//!
//! A standard install looks like:
//!
//! ```text
//! <root>/
//!   boot/ffxivboot.exe, ffxivlauncher64.exe, ...
//!   game/ffxiv_dx11.exe
//!   game/ffxivgame.ver
//! ```
//!
//! # Examples
//!
//! ```ignore
//! use xivloader::services::game_install::GameInstall;
//! use xivloader::models::GraphicsApi;
//!
//! let install = GameInstall::new("C:/Games/SquareEnix/FINAL FANTASY XIV - A Realm Reborn");
//! let exe = install.executable(GraphicsApi::DirectX11);
//! let version = install.game_version()?;
//! ```

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;

use crate::models::GraphicsApi;

/// Steam app id of the game
pub const STEAM_APP_ID: u32 = 39210;

/// Resolved paths of a game installation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameInstall {
    root: Utf8PathBuf,
}

impl GameInstall {
    pub fn new<P: AsRef<Utf8Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn boot_dir(&self) -> Utf8PathBuf {
        self.root.join("boot")
    }

    pub fn game_dir(&self) -> Utf8PathBuf {
        self.root.join("game")
    }

    /// Executable for the selected graphics API
    pub fn executable(&self, api: GraphicsApi) -> Utf8PathBuf {
        self.game_dir().join(api.executable_name())
    }

    pub fn version_file(&self) -> Utf8PathBuf {
        self.game_dir().join("ffxivgame.ver")
    }

    /// Read the installed game version (e.g. `2024.07.10.0001.0000`)
    pub fn game_version(&self) -> Result<String> {
        let path = self.version_file();
        let version = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read game version: {}", path))?;
        let version = version.trim().to_string();

        if version.is_empty() {
            anyhow::bail!("Game version file is empty: {}", path);
        }

        tracing::debug!("Installed game version: {}", version);
        Ok(version)
    }

    /// True if the root looks like a game install (has both `boot/` and `game/`)
    pub fn looks_valid(&self) -> bool {
        self.boot_dir().is_dir() && self.game_dir().is_dir()
    }
}

/// Detect the graphics API from an executable path, if it is one of the game images.
pub fn detect_graphics_api(executable: &str) -> Option<GraphicsApi> {
    // Paths may come from a Windows front-end, so split on both separators
    let filename = executable.rsplit(['/', '\\']).next()?.to_lowercase();

    match filename.as_str() {
        "ffxiv_dx11.exe" => Some(GraphicsApi::DirectX11),
        "ffxiv.exe" => Some(GraphicsApi::DirectX9),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_install() -> (TempDir, GameInstall) {
        let temp_dir = TempDir::new().unwrap();
        let root = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
        fs::create_dir_all(root.join("boot")).unwrap();
        fs::create_dir_all(root.join("game")).unwrap();
        (temp_dir, GameInstall::new(root))
    }

    #[test]
    fn test_executable_paths() {
        let install = GameInstall::new("C:/Games/FFXIV");
        assert_eq!(
            install.executable(GraphicsApi::DirectX11),
            Utf8PathBuf::from("C:/Games/FFXIV/game/ffxiv_dx11.exe")
        );
        assert_eq!(
            install.executable(GraphicsApi::DirectX9),
            Utf8PathBuf::from("C:/Games/FFXIV/game/ffxiv.exe")
        );
    }

    #[test]
    fn test_game_version_is_trimmed() {
        let (_temp_dir, install) = create_install();
        fs::write(install.version_file(), "2024.07.10.0001.0000\r\n").unwrap();

        assert_eq!(install.game_version().unwrap(), "2024.07.10.0001.0000");
        assert!(install.looks_valid());
    }

    #[test]
    fn test_missing_or_empty_version() {
        let (_temp_dir, install) = create_install();
        assert!(install.game_version().is_err());

        fs::write(install.version_file(), "  \n").unwrap();
        assert!(install.game_version().is_err());
    }

    #[test]
    fn test_detect_graphics_api() {
        assert_eq!(
            detect_graphics_api("C:\\Game\\game\\FFXIV_DX11.EXE"),
            Some(GraphicsApi::DirectX11)
        );
        assert_eq!(detect_graphics_api("ffxiv.exe"), Some(GraphicsApi::DirectX9));
        assert_eq!(detect_graphics_api("ffxivboot.exe"), None);
    }
}
