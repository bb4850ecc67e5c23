//! Validation of a [`LaunchConfig`] and the game argument builder.
//!
//! [`validate`] is the only place raw front-end values are checked. It produces a
//! [`LaunchSettings`] with typed enumerations; everything downstream works on that.
//! [`LaunchParameters::build`] is then a pure function of the settings and the
//! launch ticket.
//!
//! The game takes `KEY=VALUE` tokens. Without encryption each pair becomes its own
//! argv entry, so values never need quoting. With encryption the whole list collapses
//! into one `//**sqex0003...**//` token (see [`super::argument_cipher`]).

use camino::Utf8PathBuf;
use indexmap::IndexMap;
use std::fmt;
use thiserror::Error;

use super::argument_cipher;
use super::game_install::GameInstall;
use crate::models::{
    ClientLanguage, DpiAwareness, ExpansionLevel, GraphicsApi, LaunchConfig, LaunchPolicy,
    LaunchTicket, LoaderSettings, Region,
};

pub const KEY_DATA_PATH_TYPE: &str = "DEV.DataPathType";
pub const KEY_MAX_EXPANSION: &str = "DEV.MaxEntitledExpansionID";
pub const KEY_SESSION: &str = "DEV.TestSID";
pub const KEY_USE_SQPACK: &str = "DEV.UseSqPack";
pub const KEY_REGION: &str = "SYS.Region";
pub const KEY_LANGUAGE: &str = "language";
pub const KEY_DPI_AWARENESS: &str = "SYS.DpiAwareness";
pub const KEY_IS_STEAM: &str = "IsSteam";

/// Keys the builder always sets; additional arguments may not repeat them
pub const RESERVED_KEYS: [&str; 8] = [
    KEY_DATA_PATH_TYPE,
    KEY_MAX_EXPANSION,
    KEY_SESSION,
    KEY_USE_SQPACK,
    KEY_REGION,
    KEY_LANGUAGE,
    KEY_DPI_AWARENESS,
    KEY_IS_STEAM,
];

/// Starts a new entry in the game's own argument parser
const ARGUMENT_SEPARATOR: &str = " /";

pub const ENV_STEAM_LAUNCH: &str = "IS_FFXIV_LAUNCH_FROM_STEAM";
pub const ENV_COMPAT_LAYER: &str = "__COMPAT_LAYER";

/// Input rejected before any I/O
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("game path is empty")]
    EmptyPath,

    #[error("game path is malformed: {0}")]
    MalformedPath(String),

    #[error("client language {0} is out of range (0-3)")]
    InvalidLanguage(u32),

    #[error("region {0} is out of range (1-3)")]
    InvalidRegion(u32),

    #[error("expansion level {0} is out of range (0-{max})", max = ExpansionLevel::MAX)]
    InvalidExpansion(u32),

    #[error("DPI awareness must be \"Aware\" or \"Unaware\", got {0:?}")]
    InvalidDpiAwareness(String),

    #[error("additional argument {0:?} is not of the form KEY=VALUE")]
    MalformedArgument(String),

    #[error("additional argument {0:?} repeats a key the launcher sets itself")]
    ReservedArgument(String),

    #[error("additional arguments contain an unterminated quote")]
    UnbalancedQuote,

    #[error("value of additional argument {0:?} contains \" /\", which the game reads as a new argument")]
    ArgumentSeparator(String),

    #[error("game version could not be read from {path}: {reason}")]
    MissingGameVersion { path: Utf8PathBuf, reason: String },

    #[error("loader is enabled but its install path is empty")]
    MissingLoaderPath,

    #[error("integrity check failed: {0}")]
    IntegrityFailed(String),
}

impl ValidationError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EmptyPath => "EmptyPath",
            Self::MalformedPath(_) => "MalformedPath",
            Self::InvalidLanguage(_) => "InvalidLanguage",
            Self::InvalidRegion(_) => "InvalidRegion",
            Self::InvalidExpansion(_) => "InvalidExpansion",
            Self::InvalidDpiAwareness(_) => "InvalidDpiAwareness",
            Self::MalformedArgument(_) => "MalformedArgument",
            Self::ReservedArgument(_) => "ReservedArgument",
            Self::UnbalancedQuote => "UnbalancedQuote",
            Self::ArgumentSeparator(_) => "ArgumentSeparator",
            Self::MissingGameVersion { .. } => "MissingGameVersion",
            Self::MissingLoaderPath => "MissingLoaderPath",
            Self::IntegrityFailed(_) => "IntegrityFailed",
        }
    }
}

/// A [`LaunchConfig`] after validation: every enumeration is typed, every path usable.
#[derive(Debug, Clone)]
pub struct LaunchSettings {
    pub install: GameInstall,
    pub graphics_api: GraphicsApi,
    pub language: ClientLanguage,
    pub region: Region,
    pub expansion: ExpansionLevel,
    pub dpi_awareness: DpiAwareness,
    pub is_steam: bool,
    pub encrypt_arguments: bool,
    /// Parsed `KEY=VALUE` pairs from the free-form additional arguments
    pub additional_args: Vec<(String, String)>,
    pub game_version: String,
    /// Reference values for the boot-file check, if configured
    pub boot_hashes: Option<Utf8PathBuf>,
    /// `Some` only when the loader is enabled
    pub loader: Option<LoaderSettings>,
    pub policy: LaunchPolicy,
}

/// Check a raw configuration and read the installed game version.
///
/// The version file is the only filesystem access; no network I/O happens here.
pub fn validate(config: &LaunchConfig) -> Result<LaunchSettings, ValidationError> {
    let root = validate_path(&config.game_path)?;

    let language = ClientLanguage::from_raw(config.language)
        .ok_or(ValidationError::InvalidLanguage(config.language))?;
    let region =
        Region::from_raw(config.region).ok_or(ValidationError::InvalidRegion(config.region))?;
    let expansion = ExpansionLevel::new(config.expansion_level)
        .ok_or(ValidationError::InvalidExpansion(config.expansion_level))?;
    let dpi_awareness = DpiAwareness::parse(&config.dpi_awareness)
        .ok_or_else(|| ValidationError::InvalidDpiAwareness(config.dpi_awareness.clone()))?;

    let additional_args = parse_additional_args(&config.additional_launch_args)?;

    let loader = if config.loader.enabled {
        validate_path(&config.loader.install_path).map_err(|e| match e {
            ValidationError::EmptyPath => ValidationError::MissingLoaderPath,
            other => other,
        })?;
        Some(config.loader.clone())
    } else {
        None
    };

    let install = GameInstall::new(root);
    let game_version = install
        .game_version()
        .map_err(|e| ValidationError::MissingGameVersion {
            path: install.version_file(),
            reason: format!("{:#}", e),
        })?;

    Ok(LaunchSettings {
        install,
        graphics_api: config.graphics_api(),
        language,
        region,
        expansion,
        dpi_awareness,
        is_steam: config.is_steam,
        encrypt_arguments: config.encrypt_arguments,
        additional_args,
        game_version,
        boot_hashes: config
            .boot_hashes_path
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(Utf8PathBuf::from),
        loader,
        policy: config.policy,
    })
}

fn validate_path(path: &str) -> Result<Utf8PathBuf, ValidationError> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyPath);
    }
    if trimmed.contains('\0') {
        return Err(ValidationError::MalformedPath(
            "contains a NUL character".to_string(),
        ));
    }
    if trimmed.chars().any(|c| c.is_control()) {
        return Err(ValidationError::MalformedPath(
            "contains a control character".to_string(),
        ));
    }
    Ok(Utf8PathBuf::from(trimmed))
}

/// Split free-form additional arguments into `KEY=VALUE` pairs.
///
/// Whitespace separates tokens; double quotes group, so `Name="two words"` is one
/// token. Blank input yields no pairs at all. A quoted value may not contain ` /`.
pub fn parse_additional_args(raw: &str) -> Result<Vec<(String, String)>, ValidationError> {
    let mut pairs = Vec::new();

    for token in tokenize(raw)? {
        let (key, value) = token
            .split_once('=')
            .filter(|(key, _)| !key.is_empty() && !key.contains(char::is_whitespace))
            .ok_or_else(|| ValidationError::MalformedArgument(token.clone()))?;

        if RESERVED_KEYS.iter().any(|r| r.eq_ignore_ascii_case(key)) {
            return Err(ValidationError::ReservedArgument(key.to_string()));
        }
        if pairs
            .iter()
            .any(|(existing, _): &(String, String)| existing.eq_ignore_ascii_case(key))
        {
            return Err(ValidationError::MalformedArgument(format!(
                "{} (given more than once)",
                key
            )));
        }

        if value.contains(ARGUMENT_SEPARATOR) {
            return Err(ValidationError::ArgumentSeparator(key.to_string()));
        }

        pairs.push((key.to_string(), value.to_string()));
    }

    Ok(pairs)
}

fn tokenize(raw: &str) -> Result<Vec<String>, ValidationError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for c in raw.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }

    if in_quotes {
        return Err(ValidationError::UnbalancedQuote);
    }
    if has_token {
        tokens.push(current);
    }

    // A lone `""` is not an argument
    tokens.retain(|t| !t.is_empty());
    Ok(tokens)
}

/// Ordered game arguments and extra environment for one launch.
///
/// The session value is kept as a [`LaunchTicket`] and only materialised when the
/// command line is rendered; `Debug` and [`redacted`](Self::redacted) mask it.
#[derive(Clone)]
pub struct LaunchParameters {
    args: Vec<(String, String)>,
    ticket: LaunchTicket,
    env: IndexMap<String, String>,
    encrypt: bool,
    /// Expansion level actually requested, after capping to the account's entitlement
    pub effective_expansion: u32,
}

impl LaunchParameters {
    /// Build the argument list for the game executable.
    ///
    /// `max_entitled` is the expansion level reported by the login service, if any; a
    /// lower value caps the configured level.
    pub fn build(settings: &LaunchSettings, ticket: &LaunchTicket, max_entitled: Option<u32>) -> Self {
        let configured = settings.expansion.get();
        let effective_expansion = match max_entitled {
            Some(max) if max < configured => max,
            _ => configured,
        };

        let mut args = vec![
            (KEY_DATA_PATH_TYPE.to_string(), "1".to_string()),
            (KEY_MAX_EXPANSION.to_string(), effective_expansion.to_string()),
            (KEY_SESSION.to_string(), String::new()),
            (KEY_USE_SQPACK.to_string(), "1".to_string()),
            (KEY_REGION.to_string(), (settings.region as u32).to_string()),
            (KEY_LANGUAGE.to_string(), (settings.language as u32).to_string()),
            (
                KEY_DPI_AWARENESS.to_string(),
                settings.dpi_awareness.as_str().to_string(),
            ),
        ];

        let mut env = IndexMap::new();

        if settings.is_steam {
            args.push((KEY_IS_STEAM.to_string(), "1".to_string()));
            env.insert(ENV_STEAM_LAUNCH.to_string(), "1".to_string());
        }

        if settings.dpi_awareness == DpiAwareness::Unaware {
            env.insert(ENV_COMPAT_LAYER.to_string(), "HighDpiAware".to_string());
        }

        args.extend(settings.additional_args.iter().cloned());

        Self {
            args,
            ticket: ticket.clone(),
            env,
            encrypt: settings.encrypt_arguments,
            effective_expansion,
        }
    }

    /// Value of an argument as it will be passed (the session is masked)
    pub fn get(&self, key: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|(k, _)| k == key)
            .map(|(k, v)| if k == KEY_SESSION { "***" } else { v.as_str() })
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.args.iter().map(|(k, _)| k.as_str())
    }

    pub fn env(&self) -> &IndexMap<String, String> {
        &self.env
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypt
    }

    /// Plain `(key, value)` pairs including the session value. Do not log.
    pub fn pairs(&self) -> Vec<(String, String)> {
        self.args
            .iter()
            .map(|(k, v)| {
                let value = if k == KEY_SESSION {
                    self.ticket.expose().to_string()
                } else {
                    v.clone()
                };
                (k.clone(), value)
            })
            .collect()
    }

    /// argv for the game: `KEY=VALUE` per entry, or one encrypted token.
    pub fn command_line(&self) -> Vec<String> {
        self.command_line_at(argument_cipher::tick_count())
    }

    pub fn command_line_at(&self, ticks: u32) -> Vec<String> {
        let pairs = self.pairs();
        if self.encrypt {
            vec![argument_cipher::encrypt_arguments(&pairs, ticks)]
        } else {
            pairs
                .into_iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect()
        }
    }

    /// Loggable rendering with the session masked
    pub fn redacted(&self) -> String {
        let rendered = self
            .args
            .iter()
            .map(|(k, v)| {
                if k == KEY_SESSION {
                    format!("{}=***", k)
                } else {
                    format!("{}={}", k, v)
                }
            })
            .collect::<Vec<_>>()
            .join(" ");

        if self.encrypt {
            format!("{} (encrypted)", rendered)
        } else {
            rendered
        }
    }
}

impl fmt::Debug for LaunchParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchParameters")
            .field("args", &self.redacted())
            .field("env", &self.env)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Secret;
    use std::fs;
    use tempfile::TempDir;

    fn create_install() -> (TempDir, LaunchConfig) {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().to_str().unwrap().to_string();
        fs::create_dir_all(temp_dir.path().join("game")).unwrap();
        fs::write(
            temp_dir.path().join("game/ffxivgame.ver"),
            "2024.07.10.0001.0000",
        )
        .unwrap();

        let config = LaunchConfig {
            game_path: root,
            username: "user".to_string(),
            password: Secret::new("pw"),
            ..LaunchConfig::default()
        };
        (temp_dir, config)
    }

    #[test]
    fn test_validate_defaults() {
        let (_temp_dir, config) = create_install();
        let settings = validate(&config).unwrap();

        assert_eq!(settings.language, ClientLanguage::English);
        assert_eq!(settings.region, Region::Europe);
        assert_eq!(settings.game_version, "2024.07.10.0001.0000");
        assert!(settings.loader.is_none());
        assert!(settings.additional_args.is_empty());
    }

    #[test]
    fn test_validate_rejects_out_of_range_values() {
        let (_temp_dir, config) = create_install();

        let cases = [
            (LaunchConfig { language: 4, ..config.clone() }, "InvalidLanguage"),
            (LaunchConfig { region: 0, ..config.clone() }, "InvalidRegion"),
            (LaunchConfig { expansion_level: 9, ..config.clone() }, "InvalidExpansion"),
            (
                LaunchConfig { dpi_awareness: "Sometimes".to_string(), ..config.clone() },
                "InvalidDpiAwareness",
            ),
            (LaunchConfig { game_path: "  ".to_string(), ..config.clone() }, "EmptyPath"),
            (
                LaunchConfig { game_path: "C:/Games\0/FFXIV".to_string(), ..config.clone() },
                "MalformedPath",
            ),
        ];

        for (config, expected) in cases {
            assert_eq!(validate(&config).unwrap_err().kind(), expected);
        }
    }

    #[test]
    fn test_missing_version_file() {
        let temp_dir = TempDir::new().unwrap();
        let config = LaunchConfig {
            game_path: temp_dir.path().to_str().unwrap().to_string(),
            ..LaunchConfig::default()
        };

        assert!(matches!(
            validate(&config),
            Err(ValidationError::MissingGameVersion { .. })
        ));
    }

    #[test]
    fn test_loader_requires_path() {
        let (_temp_dir, mut config) = create_install();
        config.loader.enabled = true;
        assert_eq!(validate(&config).unwrap_err(), ValidationError::MissingLoaderPath);
    }

    #[test]
    fn test_values_with_argument_separator_rejected() {
        assert_eq!(
            parse_additional_args(r#"Extra="C: /dir""#),
            Err(ValidationError::ArgumentSeparator("Extra".to_string()))
        );

        // A slash without the leading space round-trips through the cipher
        let pairs = parse_additional_args(r#"Extra="C:/dir two""#).unwrap();
        let token = argument_cipher::encrypt_arguments(&pairs, 0x0042_0000);
        assert_eq!(argument_cipher::decrypt_arguments(&token, 0x0042_0000).unwrap(), pairs);

        let (_temp_dir, mut config) = create_install();
        config.additional_launch_args = r#"Extra="C: /dir""#.to_string();
        assert_eq!(validate(&config).unwrap_err().kind(), "ArgumentSeparator");
    }

    #[test]
    fn test_boot_hashes_path() {
        let (_temp_dir, mut config) = create_install();
        assert!(validate(&config).unwrap().boot_hashes.is_none());

        config.boot_hashes_path = Some("   ".to_string());
        assert!(validate(&config).unwrap().boot_hashes.is_none());

        config.boot_hashes_path = Some(" /data/boot-hashes.json ".to_string());
        assert_eq!(
            validate(&config).unwrap().boot_hashes,
            Some(Utf8PathBuf::from("/data/boot-hashes.json"))
        );
    }

    #[test]
    fn test_parse_additional_args() {
        assert!(parse_additional_args("").unwrap().is_empty());
        assert!(parse_additional_args("   \t ").unwrap().is_empty());

        let pairs = parse_additional_args(r#"  Foo=1   Bar="two words" "#).unwrap();
        assert_eq!(
            pairs,
            vec![
                ("Foo".to_string(), "1".to_string()),
                ("Bar".to_string(), "two words".to_string()),
            ]
        );

        assert_eq!(
            parse_additional_args("language=2"),
            Err(ValidationError::ReservedArgument("language".to_string()))
        );
        assert_eq!(
            parse_additional_args("Foo=1 foo=2").unwrap_err().kind(),
            "MalformedArgument"
        );
        assert_eq!(
            parse_additional_args("novalue").unwrap_err().kind(),
            "MalformedArgument"
        );
        assert_eq!(
            parse_additional_args(r#"Foo="open"#),
            Err(ValidationError::UnbalancedQuote)
        );
    }

    #[test]
    fn test_build_standard_arguments() {
        let (_temp_dir, config) = create_install();
        let settings = validate(&config).unwrap();
        let ticket = LaunchTicket::new("ticket-123");

        let params = LaunchParameters::build(&settings, &ticket, None);
        let argv = params.command_line();

        assert_eq!(
            argv,
            vec![
                "DEV.DataPathType=1",
                "DEV.MaxEntitledExpansionID=4",
                "DEV.TestSID=ticket-123",
                "DEV.UseSqPack=1",
                "SYS.Region=3",
                "language=1",
                "SYS.DpiAwareness=Aware",
            ]
        );
        assert!(params.env().is_empty());
        assert!(!params.redacted().contains("ticket-123"));
        assert!(!format!("{:?}", params).contains("ticket-123"));
        assert_eq!(params.get(KEY_SESSION), Some("***"));
    }

    #[test]
    fn test_build_steam_unaware_and_capped() {
        let (_temp_dir, mut config) = create_install();
        config.is_steam = true;
        config.dpi_awareness = "Unaware".to_string();
        config.expansion_level = 5;
        let settings = validate(&config).unwrap();

        let params = LaunchParameters::build(&settings, &LaunchTicket::new("t"), Some(3));

        assert_eq!(params.effective_expansion, 3);
        assert_eq!(params.get(KEY_MAX_EXPANSION), Some("3"));
        assert_eq!(params.get(KEY_IS_STEAM), Some("1"));
        assert_eq!(params.env()[ENV_STEAM_LAUNCH], "1");
        assert_eq!(params.env()[ENV_COMPAT_LAYER], "HighDpiAware");
    }

    #[test]
    fn test_build_encrypted() {
        let (_temp_dir, mut config) = create_install();
        config.encrypt_arguments = true;
        let settings = validate(&config).unwrap();
        let params = LaunchParameters::build(&settings, &LaunchTicket::new("secret-sid"), None);

        let argv = params.command_line_at(0x0042_0000);
        assert_eq!(argv.len(), 1);
        assert!(argv[0].starts_with("//**sqex0003"));

        let decrypted = argument_cipher::decrypt_arguments(&argv[0], 0x0042_0000).unwrap();
        assert_eq!(decrypted, params.pairs());
        assert!(params.redacted().ends_with("(encrypted)"));
    }
}
