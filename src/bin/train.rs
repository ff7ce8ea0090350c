//! `hark-train`: run the training pipeline for a profile.
//!
//! Exit code 0 on success; on failure, one reason per line on stderr and a
//! non-zero exit.

use hark::config::Profile;
use hark::train::Trainer;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let profile = match std::env::args().nth(1) {
        Some(name) => Profile::load(&name, Profile::search_dirs()),
        None => Profile::load_default(),
    };
    let profile = match profile {
        Ok(profile) => profile,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    match Trainer::new(profile).run(|phase| info!("training phase: {phase:?}")) {
        Ok(report) => {
            info!(
                "{} task(s) ran, {} up to date",
                report.ran.len(),
                report.skipped.len()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            for line in e.to_string().lines() {
                eprintln!("{line}");
            }
            ExitCode::FAILURE
        }
    }
}
