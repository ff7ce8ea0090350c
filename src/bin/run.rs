//! `hark`: run the assistant against a profile.

use anyhow::Context;
use hark::config::Profile;
use hark::runtime::Assistant;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let profile = match std::env::args().nth(1) {
        Some(name) => Profile::load(&name, Profile::search_dirs()),
        None => Profile::load_default(),
    }
    .context("failed to load profile")?;

    let assistant = Assistant::start(profile)?;
    let dialogue = assistant.dialogue().clone();

    if !assistant.profile().config.listen_on_start {
        dialogue.listen_for_wake().await?;
    }

    tokio::signal::ctrl_c().await?;
    assistant.shutdown().await;
    Ok(())
}
