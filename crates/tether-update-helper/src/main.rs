//! Replaces the launcher executable with a downloaded build, then restarts it.
//!
//! Started detached by the launcher, which exits right after.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};
use simplelog::{ColorChoice, ConfigBuilder, LevelFilter, TermLogger, TerminalMode};
use tether_core::{DetachedRelauncher, ReplacePolicy, perform_replace};

#[derive(Debug, Parser)]
#[command(name = "tether-update-helper", version)]
struct Args {
    /// The launcher executable to replace.
    old_exe: PathBuf,
    /// The verified build to install in its place.
    new_exe: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = ConfigBuilder::new()
        .set_time_format_rfc3339()
        .add_filter_allow_str("tether")
        .build();
    let _ = TermLogger::init(
        LevelFilter::Info,
        config,
        TerminalMode::Stderr,
        ColorChoice::Never,
    );

    info!(
        "Replacing {} with {}",
        args.old_exe.display(),
        args.new_exe.display()
    );
    match perform_replace(
        &args.old_exe,
        &args.new_exe,
        &ReplacePolicy::default(),
        &DetachedRelauncher,
    ) {
        Ok(()) => ExitCode::SUCCESS,
        Err(replace_error) => {
            error!("Update failed: {replace_error}");
            eprintln!("Update failed: {replace_error}");
            ExitCode::FAILURE
        }
    }
}
