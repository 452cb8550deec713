use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use dali2mqtt::bridge;
use dali2mqtt::bridge::Bridge;
use dali2mqtt::bus;
use dali2mqtt::config::Config;
use dali2mqtt::mqtt::HomeAssistant;
use dali2mqtt::mqtt::RumqttcClient;
use dali2mqtt::scheduler;
use tracing::error;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Expose a DALI lighting bus to Home Assistant over MQTT
#[derive(Parser, Debug)]
#[command(name = "dali2mqtt", version, about)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    /// Keep Home Assistant updated but never send commands to the bus
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Log at debug level regardless of configuration
    #[arg(long)]
    debug: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(config.logging.targets(args.debug))
        .init();

    info!("dali2mqtt starting");
    info!("Loaded config from: {}", args.config.display());
    if args.dry_run {
        info!("Dry run: no commands will be sent to the bus");
    }

    let last_will = (
        bridge::status_topic(&config.dali),
        bridge::STATUS_STOPPED.to_string(),
    );
    let client = RumqttcClient::new(&config.mqtt, Some(last_will));
    let hass = HomeAssistant::new(client, &config.mqtt);
    let driver = bus::from_config(&config.dali.bus);

    let mut bridge = Bridge::new(hass, driver, &config.dali, args.dry_run)
        .await
        .context("Failed to set up bridge")?;

    info!(
        "Bridging bus {} ({}) to MQTT broker {}:{}",
        config.dali.bus_id, config.dali.bus_name, config.mqtt.broker, config.mqtt.port
    );

    let result = tokio::select! {
        result = scheduler::run(&mut bridge) => result,
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("Received shutdown signal"),
                Err(e) => error!("Failed to listen for shutdown signal: {}", e),
            }
            Ok(())
        }
    };

    result.context("Bridge stopped")?;

    bridge.shutdown().await.context("Failed to shut down cleanly")?;
    info!("dali2mqtt shutdown complete");
    Ok(())
}
