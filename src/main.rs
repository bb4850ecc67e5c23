//! XIVLoader - command-line front end
//!
//! Loads `Launcher Settings.yaml`, applies command-line overrides, collects the
//! credentials and runs one launch attempt, printing each result line as it is
//! produced. Ctrl-C cancels the attempt; a game that already started keeps running.
//!
//! # Credentials
//!
//! - Password: `XIVLOADER_PASSWORD`, otherwise one line from stdin
//! - One-time password: `--otp`, and with `--otp-prompt` a fresh code is asked for
//!   on stdin for every further attempt
//!
//! Neither is ever written to the settings file or the log.

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::Parser;
use std::io::{BufRead, IsTerminal, Write};
use std::process::ExitCode;
use tokio::sync::watch;
use xivloader::models::Secret;
use xivloader::services::NoOtp;
use xivloader::{APP_NAME, ConfigManager, LaunchResult, Orchestrator, VERSION};

/// Password environment variable
const PASSWORD_ENV: &str = "XIVLOADER_PASSWORD";

#[derive(Parser, Debug)]
#[command(name = "xivloader", version, about = "Log in and launch FINAL FANTASY XIV")]
struct Cli {
    /// Directory holding Launcher Settings.yaml
    #[arg(long, default_value = "XIVLoader Data")]
    config_dir: Utf8PathBuf,

    /// Directory for log files
    #[arg(long, default_value = "logs")]
    log_dir: String,

    /// Game install directory (overrides the settings file)
    #[arg(long)]
    game_path: Option<String>,

    /// Square Enix ID (overrides the settings file)
    #[arg(short, long)]
    username: Option<String>,

    /// One-time password for the first login attempt
    #[arg(long)]
    otp: Option<String>,

    /// Ask for a new one-time password on stdin when the login service wants one
    #[arg(long)]
    otp_prompt: bool,

    /// Reference hashes for the boot files (`hashes.json` shape)
    #[arg(long)]
    boot_hashes: Option<String>,

    /// Launch through Steam
    #[arg(long)]
    steam: bool,

    /// Skip loader injection for this launch
    #[arg(long)]
    no_loader: bool,

    /// Install or update the loader before launching
    #[arg(long)]
    update_loader: bool,

    /// Write the effective settings back to the settings file
    #[arg(long)]
    save: bool,

    /// Debug-level logging
    #[arg(long)]
    debug: bool,

    /// Mirror log output on stderr
    #[arg(long)]
    verbose: bool,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let _guard =
        xivloader::logging::setup_logging_with_console(&cli.log_dir, APP_NAME, cli.debug, cli.verbose)?;

    tracing::info!("Starting {} v{}", APP_NAME, VERSION);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("xivloader-worker")
        .build()
        .context("Failed to create the tokio runtime")?;

    let success = runtime.block_on(run(cli))?;

    runtime.shutdown_timeout(std::time::Duration::from_secs(5));
    tracing::info!("Shutdown complete");

    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn run(cli: Cli) -> Result<bool> {
    let config_manager = ConfigManager::new(&cli.config_dir)?;
    let mut settings = config_manager.load_settings()?;

    if let Some(game_path) = &cli.game_path {
        settings.game_path = game_path.clone();
    }
    if let Some(username) = &cli.username {
        settings.username = username.clone();
    }
    if let Some(boot_hashes) = &cli.boot_hashes {
        settings.boot_hashes_path = Some(boot_hashes.clone());
    }
    if cli.steam {
        settings.is_steam = true;
    }
    if cli.update_loader {
        settings.loader.auto_update = true;
    }

    if cli.save {
        config_manager.save_settings(&settings)?;
    }

    if cli.no_loader {
        settings.loader.enabled = false;
    }

    let password = read_password()?;
    let config = settings.to_launch_config(password, cli.otp.clone().map(Secret::from));

    let orchestrator = Orchestrator::with_defaults().context("Failed to create the HTTP client")?;

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Ctrl-C received, cancelling the launch");
            let _ = cancel_tx.send(true);
        }
    });

    let (result, mut events) = LaunchResult::with_events(64);
    let printer = tokio::spawn(async move {
        while let Ok(line) = events.recv().await {
            println!("{}", line);
        }
    });

    let result = if cli.otp_prompt {
        orchestrator
            .launch_into(&config, &prompt_otp, cancel_rx, result)
            .await
    } else {
        orchestrator
            .launch_into(&config, &NoOtp, cancel_rx, result)
            .await
    };

    let success = result.is_success();
    drop(result);
    let _ = printer.await;

    Ok(success)
}

fn read_password() -> Result<Secret> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        return Ok(Secret::new(password));
    }

    let stdin = std::io::stdin();
    if stdin.is_terminal() {
        eprint!("Password: ");
        std::io::stderr().flush().ok();
    }

    Secret::read_line(&mut stdin.lock()).context("Failed to read the password from stdin")
}

fn prompt_otp(attempt: u32) -> Option<String> {
    eprint!("One-time password (attempt {}): ", attempt);
    std::io::stderr().flush().ok();

    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line).ok()?;
    let code = line.trim().to_string();
    (!code.is_empty()).then_some(code)
}
