use aliot::{AliotObject, TomlConfig};
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const HEARTBEAT: Duration = Duration::from_secs(5);

/// Connects one configured object to the platform and keeps it running
#[derive(Parser, Debug)]
#[command(name = "aliot-run", version, about)]
struct Args {
    /// Configuration file (defaults to ./config.toml, then the user config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Section of the configuration describing the object
    #[arg(short, long)]
    object: String,

    /// Log raw frames and every state change
    #[arg(long)]
    trace: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup(args.trace)?;

    let path = TomlConfig::discover(args.config.as_deref()).await?;
    let config = TomlConfig::load(&path).await?;
    let mut object = AliotObject::from_provider(&args.object, &config)
        .map_err(|e| eyre!("Failed to set up {}: {}", args.object, e))?;

    register_demo_handlers(&mut object)?;

    let ctrl_c_handle = object.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, disconnecting");
            ctrl_c_handle.stop();
        }
    });

    object.run().await?;
    info!("{} stopped: {:?}", object.name(), object.status());
    Ok(())
}

fn register_demo_handlers(object: &mut AliotObject) -> Result<()> {
    // Action 1 echoes whatever it is given
    object.register_action(1, |value: Value| json!({ "echo": value }));

    object.register_listener(["/doc/state"], |fields| {
        info!("Document changed: {:?}", fields);
    })?;

    object.register_broadcast_listener(|data| {
        info!("Broadcast received: {}", data);
    });

    let beats = AtomicU64::new(0);
    object.main_loop(None, move |handle| {
        let beat = beats.fetch_add(1, Ordering::Relaxed);
        handle.update_component("heartbeat", json!(beat));
        std::thread::sleep(HEARTBEAT);
    })?;

    object.on_end(|handle| {
        warn!("{} lost its connection", handle.name());
    })?;

    Ok(())
}

fn setup(trace: bool) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env(if trace { Level::TRACE } else { Level::INFO });
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
