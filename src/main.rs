use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tokio::runtime::Builder;

use unifs::config;
use unifs::plugin::Registry;
use unifs::server;

#[derive(Parser, Debug)]
#[clap(name = "unifs", author, version = env!("GIT_VERSION"), about, long_about = None)]
struct Options {
    /// enable debugging logs
    #[clap(short, long, action = ArgAction::Count)]
    debug: u8,

    /// config file path
    #[clap(short, long)]
    config_path: String,
}

fn main() -> Result<()> {
    let rt = Builder::new_multi_thread()
        .thread_stack_size(8 * 1024 * 1024)
        .enable_all()
        .build()
        .context("failed to build runtime")?;
    rt.block_on(app())
}

async fn app() -> Result<()> {
    let opts = Options::parse();
    simple_logger::SimpleLogger::new()
        .with_utc_timestamps()
        .with_level(match opts.debug {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        })
        .with_module_level("sqlx", log::LevelFilter::Error)
        .init()?;

    let config = config::parse_config(&opts.config_path).context("failed to parse config file")?;

    let registry = Registry::new();
    for mount in &config.mounts {
        let plugin_config = config::plugin_config(&mount.config)?;
        registry
            .mount(&mount.fstype, &mount.path, plugin_config)
            .await
            .with_context(|| format!("failed to mount {} at {}", mount.fstype, mount.path))?;
    }

    server::serve(registry.clone(), &config.host, config.port).await?;

    // plugins shut down in reverse mount order once the listener stops
    registry.shutdown().await;

    Ok(())
}
