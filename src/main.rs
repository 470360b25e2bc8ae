use std::path::PathBuf;

use clap::Parser;

use ircship::{control, Config, Core};

/// A supervised IRC client daemon with an HTTP control plane and webhook
/// fan-out.
#[derive(Parser)]
#[command(name = "ircship", version, about)]
struct Cli {
    /// Path to the TOML configuration file. `IRCSHIP_*` environment
    /// variables override file values either way.
    #[arg(short, long, env = "IRCSHIP_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    config.apply_env()?;

    let core = Core::new(config)?;

    let control = tokio::spawn({
        let core = core.clone();
        async move {
            if let Err(err) = control::serve(core.clone()).await {
                log::error!("control surface failed: {}", err);
                core.stop().await;
            }
        }
    });

    let runner = tokio::spawn({
        let core = core.clone();
        async move { core.run().await }
    });

    tokio::signal::ctrl_c().await?;
    log::info!("interrupt received, shutting down");
    core.stop().await;

    let _ = runner.await;
    let _ = control.await;
    Ok(())
}
