use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use sha1::{Digest, Sha1};
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use thiserror::Error;

/// Boot binaries whose hashes prove the client version to the login service
pub const BOOT_FILES: [&str; 6] = [
    "ffxivboot.exe",
    "ffxivboot64.exe",
    "ffxivlauncher.exe",
    "ffxivlauncher64.exe",
    "ffxivupdater.exe",
    "ffxivupdater64.exe",
];

/// Reference digests keyed by path relative to the verified root
pub type ExpectedHashes = IndexMap<String, String>;

/// Errors that make the whole verification step impossible.
///
/// A single mismatching or missing file is *not* an error; it is recorded in the
/// [`IntegrityReport`].
#[derive(Error, Debug)]
pub enum IntegrityError {
    #[error("Install path not found: {0}")]
    PathNotFound(Utf8PathBuf),

    #[error("Install path is not readable: {path}")]
    Unreadable {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Reference hashes could not be loaded from {path}: {reason}")]
    BadReference { path: Utf8PathBuf, reason: String },
}

impl IntegrityError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PathNotFound(_) => "PathNotFound",
            Self::Unreadable { .. } => "Unreadable",
            Self::BadReference { .. } => "BadReference",
        }
    }
}

/// Outcome for one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileVerdict {
    /// Digest matches the reference
    Pass,
    /// Digest differs from the reference
    Mismatch { expected: String },
    /// Hashed, but there was no reference value to compare against
    Unverified,
    Missing,
    Unreadable(String),
}

impl FileVerdict {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::Mismatch { .. } | Self::Missing | Self::Unreadable(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCheck {
    pub hash: Option<String>,
    pub size: Option<u64>,
    pub verdict: FileVerdict,
}

/// Per-file hashes and verdicts, in file-set order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityReport {
    pub root: Utf8PathBuf,
    pub files: IndexMap<String, FileCheck>,
}

impl IntegrityReport {
    /// True if no file failed. Unverified files do not count as failures.
    pub fn passed(&self) -> bool {
        !self.files.values().any(|check| check.verdict.is_failure())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&String, &FileCheck)> {
        self.files
            .iter()
            .filter(|(_, check)| check.verdict.is_failure())
    }

    /// Comma-separated `<file name>/<sha1>` list submitted during the version check.
    ///
    /// Files that could not be hashed are left out.
    pub fn version_report(&self) -> String {
        self.files
            .iter()
            .filter_map(|(path, check)| {
                let hash = check.hash.as_ref()?;
                let name = path.rsplit('/').next().unwrap_or(path);
                Some(format!("{}/{}", name, hash))
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    /// One-line summary for the launch log
    pub fn summary(&self) -> String {
        let total = self.files.len();
        let failed = self.failures().count();
        let unverified = self
            .files
            .values()
            .filter(|c| c.verdict == FileVerdict::Unverified)
            .count();

        if failed == 0 {
            format!("{} files hashed, {} unverified", total, unverified)
        } else {
            let names: Vec<&str> = self.failures().map(|(p, _)| p.as_str()).collect();
            format!("{} of {} files failed: {}", failed, total, names.join(", "))
        }
    }
}

/// Computes SHA-1 digests over a fixed file set and compares them to reference values.
///
/// Stateless apart from its configuration, so the same `Hasher` can verify any number
/// of trees. Verifying an unchanged tree twice yields identical reports.
#[derive(Debug, Clone)]
pub struct Hasher {
    files: Vec<String>,
    expected: ExpectedHashes,
}

impl Hasher {
    pub fn new<I, S>(files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            files: files.into_iter().map(Into::into).collect(),
            expected: ExpectedHashes::new(),
        }
    }

    /// The game's boot binaries, relative to the install root
    pub fn boot_files() -> Self {
        Self::new(BOOT_FILES.iter().map(|f| format!("boot/{}", f)))
    }

    /// Verify exactly the files listed in a reference map
    pub fn from_expected(expected: ExpectedHashes) -> Self {
        Self {
            files: expected.keys().cloned().collect(),
            expected,
        }
    }

    pub fn with_expected(mut self, expected: ExpectedHashes) -> Self {
        self.expected = expected;
        self
    }

    pub fn files(&self) -> &[String] {
        &self.files
    }

    /// Hash every file in the set under `root`.
    ///
    /// Fails only if `root` itself is missing or unreadable.
    pub fn verify(&self, root: &Utf8Path) -> Result<IntegrityReport, IntegrityError> {
        if !root.exists() {
            return Err(IntegrityError::PathNotFound(root.to_path_buf()));
        }

        fs::read_dir(root).map_err(|source| IntegrityError::Unreadable {
            path: root.to_path_buf(),
            source,
        })?;

        let mut files = IndexMap::new();

        for relative in &self.files {
            let path = root.join(relative);
            let check = self.check_file(relative, &path);

            if check.verdict.is_failure() {
                tracing::warn!("Integrity check failed for {}: {:?}", relative, check.verdict);
            } else {
                tracing::debug!("Hashed {}: {:?}", relative, check.hash);
            }

            files.insert(relative.clone(), check);
        }

        Ok(IntegrityReport {
            root: root.to_path_buf(),
            files,
        })
    }

    fn check_file(&self, relative: &str, path: &Utf8Path) -> FileCheck {
        if !path.is_file() {
            return FileCheck {
                hash: None,
                size: None,
                verdict: FileVerdict::Missing,
            };
        }

        match hash_file(path) {
            Ok((hash, size)) => {
                let verdict = match self.expected.get(relative) {
                    Some(expected) if expected.eq_ignore_ascii_case(&hash) => FileVerdict::Pass,
                    Some(expected) => FileVerdict::Mismatch {
                        expected: expected.to_lowercase(),
                    },
                    None => FileVerdict::Unverified,
                };

                FileCheck {
                    hash: Some(hash),
                    size: Some(size),
                    verdict,
                }
            }
            Err(e) => FileCheck {
                hash: None,
                size: None,
                verdict: FileVerdict::Unreadable(e.to_string()),
            },
        }
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::boot_files()
    }
}

/// Streaming SHA-1 of a file, lowercase hex, plus its size in bytes
pub fn hash_file(path: &Utf8Path) -> io::Result<(String, u64)> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha1::new();
    let mut buffer = [0u8; 64 * 1024];
    let mut size = 0u64;

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        size += read as u64;
    }

    Ok((hex::encode(hasher.finalize()), size))
}

/// Load a `hashes.json` reference map (`{ "relative/path": "sha1hex" }`)
pub fn load_expected_hashes(path: &Utf8Path) -> Result<ExpectedHashes, IntegrityError> {
    let content = fs::read_to_string(path).map_err(|e| IntegrityError::BadReference {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    serde_json::from_str(&content).map_err(|e| IntegrityError::BadReference {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}
