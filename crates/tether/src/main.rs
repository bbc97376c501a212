mod app;
mod logging;
mod settings;
mod single_instance;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::{error, info};
use tether_core::{InstallLayout, InstallOutcome, InstallRequest, validate_player_name};
use tether_platform::{AppPaths, Platform};
use tokio_util::sync::CancellationToken;

use crate::app::{AppError, Launcher, ProgressStyle};
use crate::logging::LogSource;
use crate::settings::Settings;
use crate::single_instance::{AcquireError, SingleInstance};

#[derive(Debug, Parser)]
#[command(name = "tether", version, about = "Install and update the game")]
struct Cli {
    /// Log at debug level regardless of settings.
    #[arg(long, global = true)]
    verbose: bool,

    /// Print progress as JSON lines instead of text.
    #[arg(long, global = true)]
    json_progress: bool,

    /// Defaults to `install` with the saved settings.
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Install the game or bring it up to date.
    Install {
        #[arg(long)]
        channel: Option<String>,
        /// Install this exact version into its own directory.
        #[arg(long)]
        version: Option<u32>,
        #[arg(long)]
        no_online_fix: bool,
    },
    /// Install or update, then start the game in offline mode.
    Launch {
        /// Nickname shown in game; defaults to the saved one.
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        channel: Option<String>,
        #[arg(long)]
        version: Option<u32>,
        #[arg(long)]
        no_online_fix: bool,
    },
    /// Print the end of a log file.
    Logs {
        #[arg(long, value_enum, default_value_t = LogSource::Launcher)]
        source: LogSource,
        #[arg(long, default_value_t = 200)]
        lines: usize,
    },
    /// Replace this launcher with the newest release.
    Update,
    /// Report whether a newer launcher is published.
    CheckUpdate,
    /// Print a troubleshooting report.
    Diagnose {
        #[arg(long)]
        json: bool,
    },
    /// List the installed and published game versions.
    Versions {
        #[arg(long)]
        channel: Option<String>,
    },
    /// Change the saved defaults used by `install`.
    Configure {
        #[arg(long)]
        channel: Option<String>,
        /// `0` follows the newest version.
        #[arg(long)]
        version: Option<u32>,
        #[arg(long)]
        online_fix: Option<bool>,
        /// Nickname used by `launch`.
        #[arg(long)]
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let paths = match AppPaths::new() {
        Ok(paths) => paths,
        Err(error) => {
            eprintln!("error: {error}");
            return ExitCode::FAILURE;
        }
    };
    let settings = Settings::load(&paths);
    logging::init_logging(
        &paths,
        settings.debug_logging || cli.verbose,
        settings.max_log_size_bytes,
    );

    let _instance = match SingleInstance::acquire(&paths) {
        Ok(instance) => instance,
        Err(AcquireError::AlreadyRunning) => {
            eprintln!("error: another Tether instance is already running");
            return ExitCode::FAILURE;
        }
        Err(error) => {
            error!("Failed to acquire the instance lock: {error}");
            eprintln!("error: {error}");
            return ExitCode::FAILURE;
        }
    };

    let json_progress = cli.json_progress;
    match run(cli, &paths, settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!("{error}");
            if json_progress && let Some(line) = app::error_line(&error) {
                println!("{line}");
            }
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, paths: &AppPaths, settings: Settings) -> Result<(), AppError> {
    info!("Tether {} starting", app::CURRENT_VERSION);
    let command = match cli.command.unwrap_or(Command::Install {
        channel: None,
        version: None,
        no_online_fix: false,
    }) {
        Command::Configure {
            channel,
            version,
            online_fix,
            name,
        } => {
            return configure(
                paths,
                settings,
                ConfigureArgs {
                    channel,
                    version,
                    online_fix,
                    name,
                },
            );
        }
        Command::Logs { source, lines } => return print_log(paths, source, lines),
        command => command,
    };

    let launcher = Launcher::new(paths, settings)?;
    launcher.startup_cleanup();

    let cancel = CancellationToken::new();
    spawn_ctrl_c_handler(cancel.clone());

    let style = if cli.json_progress {
        ProgressStyle::Json
    } else {
        ProgressStyle::Text
    };

    match command {
        Command::Install {
            channel,
            version,
            no_online_fix,
        } => {
            launcher.silent_update_check().await;
            let request = install_request(launcher.settings(), channel, version, no_online_fix);
            print_outcome(launcher.install(&request, style, &cancel).await?);
        }
        Command::Launch {
            name,
            channel,
            version,
            no_online_fix,
        } => {
            launcher.silent_update_check().await;
            let request = install_request(launcher.settings(), channel, version, no_online_fix);
            let name = name.unwrap_or_else(|| launcher.settings().player_name.clone());
            let outcome = launcher.launch(&request, &name, style, &cancel).await?;
            print_outcome(outcome);
            println!("Game closed");
        }
        Command::Update => {
            if launcher.self_update(style, &cancel).await? {
                println!("Update downloaded, restarting...");
            } else {
                println!("Tether {} is up to date", app::CURRENT_VERSION);
            }
        }
        Command::CheckUpdate => match launcher.check_update().await? {
            Some(update) => println!(
                "Tether {} is available (running {})",
                update.latest_version, update.current_version
            ),
            None => println!("Tether {} is up to date", app::CURRENT_VERSION),
        },
        Command::Diagnose { json } => {
            let report = launcher.diagnose(&cancel).await;
            if json {
                println!("{}", report.to_json()?);
            } else {
                print!("{report}");
            }
        }
        Command::Versions { channel } => {
            launcher.silent_update_check().await;
            let channel = channel.unwrap_or_else(|| launcher.settings().channel.clone());
            let versions = launcher.versions(&channel, &cancel).await;
            println!("Installed: {}", versions.current);
            if versions.latest == 0 {
                println!("Latest: unknown (version discovery failed, see the log)");
            } else {
                println!("Latest: {}", versions.latest);
                println!("Available: 1..={}", versions.latest);
            }
        }
        Command::Configure { .. } | Command::Logs { .. } => {}
    }

    Ok(())
}

/// Saved settings with the command-line overrides applied.
fn install_request(
    settings: &Settings,
    channel: Option<String>,
    version: Option<u32>,
    no_online_fix: bool,
) -> InstallRequest {
    let mut request = settings.install_request();
    if let Some(channel) = channel {
        request.channel = channel;
    }
    if let Some(version) = version {
        request = request.pinned(version);
    }
    if no_online_fix {
        request = request.with_online_fix(false);
    }
    request
}

fn print_outcome(outcome: InstallOutcome) {
    match outcome {
        InstallOutcome::AlreadyUpToDate { version } => {
            println!("Game is up to date (version {version})");
        }
        InstallOutcome::Installed { from, to } => {
            println!("Installed version {to} (from {from})");
        }
    }
}

fn print_log(paths: &AppPaths, source: LogSource, lines: usize) -> Result<(), AppError> {
    let layout = InstallLayout::new(paths, Platform::current());
    let path = source.path(paths, &layout);
    match logging::read_log_tail(&path, lines)
        .map_err(|error| AppError::io("failed to read log file", error))?
    {
        Some(tail) => print!("{tail}"),
        None => println!("No log at {} yet", path.display()),
    }
    Ok(())
}

struct ConfigureArgs {
    channel: Option<String>,
    version: Option<u32>,
    online_fix: Option<bool>,
    name: Option<String>,
}

fn configure(
    paths: &AppPaths,
    mut settings: Settings,
    args: ConfigureArgs,
) -> Result<(), AppError> {
    if let Some(channel) = args.channel {
        settings.channel = channel;
    }
    if let Some(version) = args.version {
        settings.game_version = version;
    }
    if let Some(online_fix) = args.online_fix {
        settings.online_fix = online_fix;
    }
    if let Some(name) = args.name {
        settings.player_name = validate_player_name(&name)?.to_string();
    }
    settings
        .save(paths)
        .map_err(|error| AppError::io("failed to save settings", error))?;
    println!("Settings saved to {}", paths.settings_file().display());
    Ok(())
}

fn spawn_ctrl_c_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling");
            cancel.cancel();
        }
    });
}
