use color_eyre::Result;
use std::path::PathBuf;
use topicwire::config::AppConfig;
use topicwire::loading;
use topicwire::mqtt::{self, ArrivedMessage, SubscribeOptions};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(AppConfig::default_path);
    let config = AppConfig::load(&path).await?;
    setup_logging_env(config.logging.level());
    info!("Loaded configuration from {}", path.display());

    let handle = mqtt::instance(&config.mqtt);

    let command_topic = handle.resolve_topic("{basetopic}/cmnd/#");
    let subscription = handle
        .subscribe(
            &command_topic,
            |msg: &ArrivedMessage| info!("{}", msg),
            SubscribeOptions::default(),
        )
        .await;
    if subscription.is_none() {
        warn!("Could not subscribe {}", command_topic);
    }

    let mut interrupted = false;
    if handle.has_client() {
        loading::toggle(Some(true));
        tokio::select! {
            connected = handle.wait_connected() => {
                if !connected {
                    warn!("MQTT worker stopped before connecting");
                }
            }
            _ = tokio::signal::ctrl_c() => interrupted = true,
        }
        loading::toggle(Some(false));
    } else {
        warn!("No broker configured, set [mqtt] host and port in {}", path.display());
    }

    if !interrupted {
        info!("Listening on {}, press Ctrl-C to stop", command_topic);
        tokio::signal::ctrl_c().await?;
    }

    if let Some(subscription) = subscription {
        subscription.remove().await;
    }
    handle.shutdown().await;
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

fn setup_logging_env(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
