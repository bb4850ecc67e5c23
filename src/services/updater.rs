//! Loader install and update.
//!
//! Two independent pieces are kept current under the loader root:
//!
//! - the loader itself, `addon/Hooks/<assemblyVersion>/`, from the release track's
//!   version info. A version directory that is missing, has no `hashes.json` or fails
//!   verification against it is downloaded again.
//! - the asset package in `dalamudAssets/`, tracked by the number in `asset.ver`.
//!
//! Network access goes through [`LoaderSource`]; [`HttpLoaderSource`] is the reqwest
//! implementation. Archive extraction and hashing run on the blocking pool.

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::future::Future;
use std::io::{self, Cursor};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use zip::ZipArchive;

use super::integrity::{self, Hasher};
use super::loader::{HASHES_FILE, INJECTOR_EXE, install_layout};
use super::wait_for_cancel;
use crate::models::LoaderSettings;

pub const VERSION_INFO_URL: &str = "https://kamori.goats.dev/Dalamud/Release/VersionInfo";
pub const ASSET_META_URL: &str = "https://kamori.goats.dev/Dalamud/Asset/Meta";

/// Installed asset package number, inside the asset directory
pub const ASSET_VERSION_FILE: &str = "asset.ver";
/// Copy of the version info a loader directory was installed from
pub const VERSION_FILE: &str = "version.json";

/// Data directories created under the loader root on first install
pub const LOADER_DIRECTORIES: [&str; 5] = [
    "dalamudAssets",
    "dalamudAssets/UIRes",
    "installedPlugins",
    "pluginConfigs",
    "logs",
];

const METADATA_TIMEOUT: Duration = Duration::from_secs(30);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("{url} answered with HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("unexpected response from {url}: {message}")]
    Malformed { url: String, message: String },

    #[error("package from {url} is not a usable archive")]
    Archive {
        url: String,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("failed to write {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("loader {version} failed verification after download: {summary}")]
    IntegrityFailed { version: String, summary: String },

    #[error("asset {file} has SHA-1 {actual}, expected {expected}")]
    AssetMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("required file missing after update: {0}")]
    MissingFile(Utf8PathBuf),

    #[error("loader update was cancelled")]
    Cancelled,
}

impl UpdateError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request { .. } => "Request",
            Self::Status { .. } => "Status",
            Self::Malformed { .. } => "Malformed",
            Self::Archive { .. } => "Archive",
            Self::Io { .. } => "Io",
            Self::IntegrityFailed { .. } => "IntegrityFailed",
            Self::AssetMismatch { .. } => "AssetMismatch",
            Self::MissingFile(_) => "MissingFile",
            Self::Cancelled => "Cancelled",
        }
    }

    fn io(path: &Utf8Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Release track entry (`VersionInfo?track=...`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    #[serde(default)]
    pub track: String,
    pub assembly_version: String,
    #[serde(default)]
    pub runtime_version: String,
    #[serde(default)]
    pub runtime_required: bool,
    #[serde(default)]
    pub supported_game_ver: String,
    #[serde(default = "applicable_by_default")]
    pub is_applicable_for_current_game_ver: bool,
    pub download_url: String,
}

fn applicable_by_default() -> bool {
    true
}

/// Asset package description (`Asset/Meta`)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetMeta {
    pub version: u32,
    pub package_url: String,
    #[serde(default)]
    pub assets: Vec<AssetEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetEntry {
    #[serde(default)]
    pub url: String,
    pub file_name: String,
    /// Uppercase SHA-1, when the server publishes one
    pub hash: Option<String>,
}

/// Where loader metadata and packages come from
pub trait LoaderSource {
    fn version_info(
        &self,
        staging: bool,
    ) -> impl Future<Output = Result<VersionInfo, UpdateError>> + Send;

    fn asset_meta(&self) -> impl Future<Output = Result<AssetMeta, UpdateError>> + Send;

    fn download(&self, url: &str) -> impl Future<Output = Result<Vec<u8>, UpdateError>> + Send;
}

/// [`LoaderSource`] backed by `reqwest`
#[derive(Debug, Clone)]
pub struct HttpLoaderSource {
    client: reqwest::Client,
}

impl HttpLoaderSource {
    /// Per-request timeouts are set here and override the client's own.
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn get(&self, url: &str, timeout: Duration) -> Result<reqwest::Response, UpdateError> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| UpdateError::Request {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpdateError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, UpdateError> {
        self.get(url, METADATA_TIMEOUT)
            .await?
            .json::<T>()
            .await
            .map_err(|e| UpdateError::Malformed {
                url: url.to_string(),
                message: e.to_string(),
            })
    }
}

impl LoaderSource for HttpLoaderSource {
    async fn version_info(&self, staging: bool) -> Result<VersionInfo, UpdateError> {
        self.get_json(&format!("{}?track={}", VERSION_INFO_URL, track_name(staging)))
            .await
    }

    async fn asset_meta(&self) -> Result<AssetMeta, UpdateError> {
        self.get_json(ASSET_META_URL).await
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, UpdateError> {
        tracing::info!("Downloading {}", url);
        let bytes = self
            .get(url, DOWNLOAD_TIMEOUT)
            .await?
            .bytes()
            .await
            .map_err(|e| UpdateError::Request {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        tracing::debug!("Downloaded {} bytes from {}", bytes.len(), url);
        Ok(bytes.to_vec())
    }
}

/// What an update run found and changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateSummary {
    /// Loader version that is now installed and should be used
    pub version: String,
    pub loader_updated: bool,
    pub asset_version: u32,
    pub assets_updated: bool,
}

/// Brings a loader root up to the current release and asset package.
pub struct LoaderUpdater<S = HttpLoaderSource> {
    source: S,
}

impl<S> LoaderUpdater<S>
where
    S: LoaderSource + Sync,
{
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Check both pieces and download whatever is missing, outdated or damaged.
    pub async fn update(
        &self,
        settings: &LoaderSettings,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<UpdateSummary, UpdateError> {
        let (root, base) = install_layout(&settings.install_path);
        let asset_dir = asset_dir(settings, &root);

        let info = cancellable(cancel, self.source.version_info(settings.staging)).await?;
        let version = checked_version(&info)?;
        let version_dir = base.join("Hooks").join(&version);
        tracing::info!("Loader release {} ({} track)", version, track_name(settings.staging));

        if !info.is_applicable_for_current_game_ver {
            tracing::warn!(
                "Loader {} targets game version {}; it may not load",
                version,
                info.supported_game_ver
            );
        }

        let intact = {
            let dir = version_dir.clone();
            blocking(&version_dir, move || Ok(installed_intact(&dir))).await?
        };

        let meta = cancellable(cancel, self.source.asset_meta()).await?;
        let current_assets = read_asset_version(&asset_dir);
        let assets_outdated = current_assets < meta.version;

        if !intact || assets_outdated {
            let (dirs_root, dirs_base) = (root.clone(), base.clone());
            blocking(&root, move || create_directories(&dirs_root, &dirs_base)).await?;
        }

        if !intact {
            tracing::info!("Installing loader {} into {}", version, version_dir);
            let package = cancellable(cancel, self.source.download(&info.download_url)).await?;
            let url = info.download_url.clone();
            let dir = version_dir.clone();
            let info = info.clone();
            blocking(&version_dir, move || install_loader(&url, &package, &dir, &info)).await?;
        } else {
            tracing::info!("Loader {} is up to date", version);
        }

        if assets_outdated {
            tracing::info!("Updating assets from {} to {}", current_assets, meta.version);
            let package = cancellable(cancel, self.source.download(&meta.package_url)).await?;
            let dir = asset_dir.clone();
            let meta = meta.clone();
            blocking(&asset_dir, move || install_assets(&package, &dir, &meta)).await?;
        } else {
            tracing::info!("Assets are up to date (version {})", current_assets);
        }

        let injector = version_dir.join(INJECTOR_EXE);
        if !injector.is_file() {
            return Err(UpdateError::MissingFile(injector));
        }

        if info.runtime_required && !root.join("runtime").is_dir() {
            tracing::warn!(
                "Loader {} needs runtime {}, which is not installed under {}",
                version,
                info.runtime_version,
                root
            );
        }

        Ok(UpdateSummary {
            version,
            loader_updated: !intact,
            asset_version: meta.version.max(current_assets),
            assets_updated: assets_outdated,
        })
    }
}

fn track_name(staging: bool) -> &'static str {
    if staging { "staging" } else { "release" }
}

async fn cancellable<T>(
    cancel: &mut watch::Receiver<bool>,
    work: impl Future<Output = Result<T, UpdateError>>,
) -> Result<T, UpdateError> {
    tokio::select! {
        biased;
        _ = wait_for_cancel(cancel) => Err(UpdateError::Cancelled),
        result = work => result,
    }
}

async fn blocking<T, F>(path: &Utf8Path, work: F) -> Result<T, UpdateError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, UpdateError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| UpdateError::io(path, io::Error::other(e.to_string())))?
}

/// The version string becomes a directory name
fn checked_version(info: &VersionInfo) -> Result<String, UpdateError> {
    let version = info.assembly_version.trim();
    match relative_path(version) {
        Some(path) if path.components().count() == 1 => Ok(version.to_string()),
        _ => Err(UpdateError::Malformed {
            url: VERSION_INFO_URL.to_string(),
            message: format!("unusable assembly version {:?}", info.assembly_version),
        }),
    }
}

/// `name` as a path that stays below the directory it is joined to
fn relative_path(name: &str) -> Option<Utf8PathBuf> {
    let path = Utf8PathBuf::from(name.replace('\\', "/"));
    let mut components = path.components().peekable();
    components.peek()?;
    components
        .all(|c| matches!(c, Utf8Component::Normal(_)))
        .then_some(path)
}

fn asset_dir(settings: &LoaderSettings, root: &Utf8Path) -> Utf8PathBuf {
    settings
        .asset_path
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(Utf8PathBuf::from)
        .unwrap_or_else(|| root.join("dalamudAssets"))
}

/// Installed asset package number; 0 when absent or unreadable
pub fn read_asset_version(asset_dir: &Utf8Path) -> u32 {
    fs::read_to_string(asset_dir.join(ASSET_VERSION_FILE))
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

/// True if the version directory has a `hashes.json` and every listed file matches it
pub fn installed_intact(version_dir: &Utf8Path) -> bool {
    if !version_dir.is_dir() {
        tracing::info!("No loader installed at {}", version_dir);
        return false;
    }

    let hashes = version_dir.join(HASHES_FILE);
    let expected = match integrity::load_expected_hashes(&hashes) {
        Ok(expected) => expected,
        Err(e) => {
            tracing::warn!("Loader at {} cannot be verified: {}", version_dir, e);
            return false;
        }
    };

    match Hasher::from_expected(expected).verify(version_dir) {
        Ok(report) if report.passed() => true,
        Ok(report) => {
            tracing::warn!("Loader at {} is damaged: {}", version_dir, report.summary());
            false
        }
        Err(e) => {
            tracing::warn!("Loader at {} could not be hashed: {}", version_dir, e);
            false
        }
    }
}

fn create_directories(root: &Utf8Path, base: &Utf8Path) -> Result<(), UpdateError> {
    let hooks = base.join("Hooks");
    fs::create_dir_all(&hooks).map_err(|e| UpdateError::io(&hooks, e))?;

    for dir in LOADER_DIRECTORIES {
        let path = root.join(dir);
        if !path.is_dir() {
            fs::create_dir_all(&path).map_err(|e| UpdateError::io(&path, e))?;
            tracing::debug!("Created {}", path);
        }
    }
    Ok(())
}

/// Unpack a zip archive held in memory into `dir`
pub fn extract_zip(url: &str, package: &[u8], dir: &Utf8Path) -> Result<(), UpdateError> {
    let archive_error = |source| UpdateError::Archive {
        url: url.to_string(),
        source,
    };

    let mut archive = ZipArchive::new(Cursor::new(package)).map_err(archive_error)?;
    fs::create_dir_all(dir).map_err(|e| UpdateError::io(dir, e))?;
    archive.extract(dir.as_std_path()).map_err(archive_error)?;

    tracing::debug!("Extracted {} entries into {}", archive.len(), dir);
    Ok(())
}

fn install_loader(
    url: &str,
    package: &[u8],
    version_dir: &Utf8Path,
    info: &VersionInfo,
) -> Result<(), UpdateError> {
    if version_dir.exists() {
        fs::remove_dir_all(version_dir).map_err(|e| UpdateError::io(version_dir, e))?;
    }
    extract_zip(url, package, version_dir)?;

    let version_file = version_dir.join(VERSION_FILE);
    let json = serde_json::to_string_pretty(info).map_err(|e| UpdateError::Malformed {
        url: url.to_string(),
        message: e.to_string(),
    })?;
    fs::write(&version_file, json).map_err(|e| UpdateError::io(&version_file, e))?;

    if version_dir.join(HASHES_FILE).is_file() && !installed_intact(version_dir) {
        let expected = integrity::load_expected_hashes(&version_dir.join(HASHES_FILE))
            .map_err(|e| UpdateError::Malformed {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        let summary = Hasher::from_expected(expected)
            .verify(version_dir)
            .map(|report| report.summary())
            .unwrap_or_else(|e| e.to_string());
        return Err(UpdateError::IntegrityFailed {
            version: info.assembly_version.clone(),
            summary,
        });
    }

    tracing::info!("Loader {} installed", info.assembly_version);
    Ok(())
}

fn install_assets(package: &[u8], asset_dir: &Utf8Path, meta: &AssetMeta) -> Result<(), UpdateError> {
    extract_zip(&meta.package_url, package, asset_dir)?;

    for asset in &meta.assets {
        let relative = relative_path(&asset.file_name).ok_or_else(|| UpdateError::Malformed {
            url: ASSET_META_URL.to_string(),
            message: format!("unusable asset file name {:?}", asset.file_name),
        })?;
        let path = asset_dir.join(relative);
        if !path.is_file() {
            return Err(UpdateError::MissingFile(path));
        }

        let Some(expected) = &asset.hash else { continue };
        let (actual, _) = integrity::hash_file(&path).map_err(|e| UpdateError::io(&path, e))?;
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(UpdateError::AssetMismatch {
                file: asset.file_name.clone(),
                expected: expected.clone(),
                actual: actual.to_uppercase(),
            });
        }
    }

    let version_file = asset_dir.join(ASSET_VERSION_FILE);
    fs::write(&version_file, meta.version.to_string()).map_err(|e| UpdateError::io(&version_file, e))?;
    tracing::info!("Assets updated to version {}", meta.version);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha1::{Digest, Sha1};
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const LOADER_URL: &str = "https://packages.test/loader.zip";
    const ASSETS_URL: &str = "https://packages.test/assets.zip";

    fn sha1_hex(content: &[u8]) -> String {
        hex::encode(Sha1::digest(content))
    }

    fn zip_of(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, content) in files {
            writer
                .start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn loader_package() -> Vec<u8> {
        let dll: &[u8] = b"loader core";
        let hashes = format!(r#"{{"Dalamud.dll": "{}"}}"#, sha1_hex(dll));
        zip_of(&[
            ("Dalamud.Injector.exe", b"injector".as_slice()),
            ("Dalamud.Boot.dll", b"boot".as_slice()),
            ("Dalamud.dll", dll),
            ("hashes.json", hashes.as_bytes()),
        ])
    }

    fn asset_meta(version: u32, hash: Option<String>) -> AssetMeta {
        AssetMeta {
            version,
            package_url: ASSETS_URL.to_string(),
            assets: vec![AssetEntry {
                url: String::new(),
                file_name: "UIRes/logo.png".to_string(),
                hash,
            }],
        }
    }

    struct FakeSource {
        info: VersionInfo,
        meta: AssetMeta,
        packages: HashMap<String, Vec<u8>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeSource {
        fn new(meta: AssetMeta) -> Self {
            let mut packages = HashMap::new();
            packages.insert(LOADER_URL.to_string(), loader_package());
            packages.insert(ASSETS_URL.to_string(), zip_of(&[("UIRes/logo.png", b"logo".as_slice())]));
            Self {
                info: VersionInfo {
                    track: "release".to_string(),
                    assembly_version: "9.1.0.4".to_string(),
                    runtime_version: "8.0.0".to_string(),
                    runtime_required: false,
                    supported_game_ver: "2024.07.10.0001.0000".to_string(),
                    is_applicable_for_current_game_ver: true,
                    download_url: LOADER_URL.to_string(),
                },
                meta,
                packages,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn downloads(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.starts_with("https://packages"))
                .cloned()
                .collect()
        }
    }

    impl LoaderSource for FakeSource {
        async fn version_info(&self, staging: bool) -> Result<VersionInfo, UpdateError> {
            self.calls.lock().unwrap().push(format!("version:{}", staging));
            Ok(self.info.clone())
        }

        async fn asset_meta(&self) -> Result<AssetMeta, UpdateError> {
            self.calls.lock().unwrap().push("meta".to_string());
            Ok(self.meta.clone())
        }

        async fn download(&self, url: &str) -> Result<Vec<u8>, UpdateError> {
            self.calls.lock().unwrap().push(url.to_string());
            self.packages.get(url).cloned().ok_or_else(|| UpdateError::Status {
                url: url.to_string(),
                status: 404,
            })
        }
    }

    fn settings(root: &Utf8Path) -> LoaderSettings {
        LoaderSettings {
            enabled: true,
            auto_update: true,
            install_path: root.to_string(),
            ..LoaderSettings::default()
        }
    }

    fn temp_root() -> (TempDir, Utf8PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let root = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
        (temp_dir, root)
    }

    #[tokio::test]
    async fn test_fresh_install() {
        let (_temp_dir, root) = temp_root();
        let source = FakeSource::new(asset_meta(7, Some(sha1_hex(b"logo").to_uppercase())));
        let updater = LoaderUpdater::new(source);
        let (_tx, mut cancel) = watch::channel(false);

        let summary = updater.update(&settings(&root), &mut cancel).await.unwrap();

        assert_eq!(
            summary,
            UpdateSummary {
                version: "9.1.0.4".to_string(),
                loader_updated: true,
                asset_version: 7,
                assets_updated: true,
            }
        );

        let version_dir = root.join("addon/Hooks/9.1.0.4");
        assert!(version_dir.join(INJECTOR_EXE).is_file());
        assert!(version_dir.join(VERSION_FILE).is_file());
        assert_eq!(read_asset_version(&root.join("dalamudAssets")), 7);
        for dir in LOADER_DIRECTORIES {
            assert!(root.join(dir).is_dir(), "{} was not created", dir);
        }
        // An empty runtime directory would be handed to the injector
        assert!(!root.join("runtime").exists());
        assert_eq!(updater.source().downloads(), vec![LOADER_URL, ASSETS_URL]);
    }

    #[tokio::test]
    async fn test_up_to_date_install_downloads_nothing() {
        let (_temp_dir, root) = temp_root();
        let updater = LoaderUpdater::new(FakeSource::new(asset_meta(7, None)));
        let (_tx, mut cancel) = watch::channel(false);

        updater.update(&settings(&root), &mut cancel).await.unwrap();
        let summary = updater.update(&settings(&root), &mut cancel).await.unwrap();

        assert!(!summary.loader_updated);
        assert!(!summary.assets_updated);
        assert_eq!(updater.source().downloads().len(), 2);
    }

    #[tokio::test]
    async fn test_damaged_loader_is_downloaded_again() {
        let (_temp_dir, root) = temp_root();
        let updater = LoaderUpdater::new(FakeSource::new(asset_meta(7, None)));
        let (_tx, mut cancel) = watch::channel(false);

        updater.update(&settings(&root), &mut cancel).await.unwrap();

        let dll = root.join("addon/Hooks/9.1.0.4/Dalamud.dll");
        fs::write(&dll, "patched").unwrap();
        assert!(!installed_intact(&root.join("addon/Hooks/9.1.0.4")));

        let summary = updater.update(&settings(&root), &mut cancel).await.unwrap();

        assert!(summary.loader_updated);
        assert!(!summary.assets_updated);
        assert_eq!(fs::read_to_string(&dll).unwrap(), "loader core");
        assert_eq!(
            updater.source().downloads(),
            vec![LOADER_URL, ASSETS_URL, LOADER_URL]
        );
    }

    #[tokio::test]
    async fn test_asset_hash_mismatch_keeps_old_asset_version() {
        let (_temp_dir, root) = temp_root();
        let source = FakeSource::new(asset_meta(7, Some("0".repeat(40))));
        let updater = LoaderUpdater::new(source);
        let (_tx, mut cancel) = watch::channel(false);

        let err = updater.update(&settings(&root), &mut cancel).await.unwrap_err();

        assert_eq!(err.kind(), "AssetMismatch");
        assert!(err.to_string().contains("UIRes/logo.png"));
        assert_eq!(read_asset_version(&root.join("dalamudAssets")), 0);
    }

    #[tokio::test]
    async fn test_staging_track_and_asset_override() {
        let (_temp_dir, root) = temp_root();
        let updater = LoaderUpdater::new(FakeSource::new(asset_meta(3, None)));
        let (_tx, mut cancel) = watch::channel(false);

        let mut settings = settings(&root);
        settings.staging = true;
        settings.asset_path = Some(root.join("shared-assets").to_string());

        updater.update(&settings, &mut cancel).await.unwrap();

        assert_eq!(updater.source().calls.lock().unwrap()[0], "version:true");
        assert_eq!(read_asset_version(&root.join("shared-assets")), 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_any_request() {
        let (_temp_dir, root) = temp_root();
        let updater = LoaderUpdater::new(FakeSource::new(asset_meta(7, None)));
        let (tx, mut cancel) = watch::channel(false);
        tx.send(true).unwrap();

        let err = updater.update(&settings(&root), &mut cancel).await.unwrap_err();

        assert_eq!(err.kind(), "Cancelled");
        assert!(updater.source().calls.lock().unwrap().is_empty());
        assert!(!root.join("addon").exists());
    }

    #[test]
    fn test_unusable_versions_and_names() {
        let mut info = FakeSource::new(asset_meta(1, None)).info;
        info.assembly_version = "../../evil".to_string();
        assert_eq!(checked_version(&info).unwrap_err().kind(), "Malformed");

        info.assembly_version = String::new();
        assert!(checked_version(&info).is_err());

        assert!(relative_path("/etc/passwd").is_none());
        assert!(relative_path("UIRes\\..\\..\\x").is_none());
        assert_eq!(
            relative_path("UIRes\\logo.png"),
            Some(Utf8PathBuf::from("UIRes/logo.png"))
        );
    }

    #[test]
    fn test_bad_archive() {
        let (_temp_dir, root) = temp_root();
        let err = extract_zip(LOADER_URL, b"not a zip", &root.join("out")).unwrap_err();
        assert_eq!(err.kind(), "Archive");
    }

    #[test]
    fn test_version_info_parses_release_payload() {
        let json = r#"{
            "key": null,
            "track": "release",
            "assemblyVersion": "9.1.0.4",
            "runtimeVersion": "8.0.0",
            "runtimeRequired": true,
            "supportedGameVer": "2024.07.10.0001.0000",
            "isApplicableForCurrentGameVer": true,
            "changelog": {"date": "", "version": "", "changes": []},
            "downloadUrl": "https://example.test/latest.zip"
        }"#;
        let info: VersionInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.assembly_version, "9.1.0.4");
        assert!(info.runtime_required);

        let meta: AssetMeta = serde_json::from_str(
            r#"{"version": 12, "packageUrl": "https://example.test/a.zip",
                "assets": [{"url": "u", "fileName": "UIRes/a.png", "hash": null}]}"#,
        )
        .unwrap();
        assert_eq!(meta.version, 12);
        assert_eq!(meta.assets[0].hash, None);
    }
}
