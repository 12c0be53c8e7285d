use anyhow::Result;
use clap::{CommandFactory, Parser};
use tracing::{error, info};

use chat_relay::{cli::Cli, relay::Relay};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let Some(config) = cli.relay_config() else {
        println!("{}", Cli::command().render_usage());
        return Ok(());
    };

    let relay = match Relay::bind(config).await {
        Ok(relay) => relay,
        Err(err) => {
            error!("{err:#}");
            return Err(err);
        }
    };
    info!("relay listening on {}", relay.local_addr()?);

    if let Err(err) = relay.run_until_ctrl_c().await {
        error!("relay exited with error: {err:#}");
        return Err(err);
    }

    Ok(())
}
