use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use btleplug::api::Manager as _;
use btleplug::platform::{Adapter, Manager};
use clap::Parser;
use log::{LevelFilter, info, warn};
use rppal::gpio::Gpio;

use crate::clock::MonotonicClock;
use crate::config::AppConfig;
use crate::controller::CoverController;
use crate::cover::CoverEngine;
use crate::gateway::HomeAssistant;
use crate::gpio::Indicator;
use crate::messages::ButtonTag;
use crate::proximity::ProximityTracker;
use crate::scanner::{BtleRadio, ScanParams, Scanner};

mod advertisement;
mod clock;
mod config;
mod controller;
mod cover;
mod dispatch;
mod gateway;
mod gpio;
mod manager;
mod messages;
mod proximity;
mod scanner;
#[cfg(test)]
mod testing;

const STARTUP_RETRY_MIN: Duration = Duration::from_secs(1);
const STARTUP_RETRY_MAX: Duration = Duration::from_secs(30);

/// Garage cover button controller gated on Bluetooth proximity
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = AppConfig::load(&args.config)?;
    init_logging(config.log_level);
    info!(target: "main", "Start, cover policy {:?}", config.cover_policy());

    let clock = MonotonicClock::new();
    let gpio = Gpio::new().context("opening GPIO")?;
    let pins = &config.pins;
    let buttons = config.buttons.clone().unwrap_or_default();

    // Interrupts stay registered while these pins are held.
    let (edges, queue) = dispatch::deferred_queue(
        buttons
            .queue_depth
            .unwrap_or(config::DEFAULT_QUEUE_DEPTH),
    );
    let mut watched = vec![gpio::watch_button(
        &gpio,
        pins.outdoor_button,
        ButtonTag::OutdoorCover,
        edges.clone(),
    )?];
    if let Some(pin) = pins.indoor_button {
        watched.push(gpio::watch_button(&gpio, pin, ButtonTag::IndoorCover, edges.clone())?);
    }
    if let Some(pin) = pins.lock_button {
        watched.push(gpio::watch_button(&gpio, pin, ButtonTag::Lock, edges.clone())?);
    }
    drop(edges);

    let mut tracker = ProximityTracker::new(clock, &config.proximity.clone().unwrap_or_default())
        .on_tracking_started(|| info!(target: "main", "Peer arrived, opening is allowed"))
        .on_tracking_ended(|| info!(target: "main", "Peer gone, opening is blocked"));
    if let Some(pin) = pins.tracking_led {
        tracker = tracker.with_indicator(gpio::output(&gpio, pin)?);
    }

    let engine = CoverEngine::new(
        config.cover_policy(),
        config.remote.as_ref().map(HomeAssistant::new),
        config
            .remote
            .as_ref()
            .map(|r| r.entity_id.clone())
            .unwrap_or_default(),
        gpio::output(&gpio, pins.cover_led)?,
        tracker.handle(),
    );
    let mut controller = CoverController::new(
        clock,
        engine,
        buttons.debounce_ms.unwrap_or(config::DEFAULT_DEBOUNCE_MS),
    );
    if pins.lock_button.is_some() {
        let lock_led = match pins.lock_led {
            Some(pin) => Some(Box::new(gpio::output(&gpio, pin)?) as Box<dyn Indicator + Send>),
            None => None,
        };
        controller = controller.with_lock(lock_led);
    }

    let central = retry_startup("Bluetooth adapter", first_adapter).await;
    let scanner = Scanner::new(
        BtleRadio::new(central),
        tracker,
        ScanParams::from_config(&config.scan.clone().unwrap_or_default()),
    );

    let mut run_led = pins.run_led.map(|pin| gpio::output(&gpio, pin)).transpose()?;
    if let Some(led) = run_led.as_mut() {
        led.set(true);
    }

    let core = manager::Manager::new(scanner, queue, controller);
    let result = core.run_loop().await;
    drop(watched);
    result
}

/// Repeats a startup step until it succeeds, backing off between attempts.
async fn retry_startup<T, F, Fut>(what: &str, mut attempt: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut delay = STARTUP_RETRY_MIN;
    loop {
        match attempt().await {
            Ok(value) => return value,
            Err(err) => {
                warn!(target: "main", "{} not ready, retrying in {:?}: {:?}", what, delay, err);
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(STARTUP_RETRY_MAX);
            }
        }
    }
}

async fn first_adapter() -> anyhow::Result<Adapter> {
    let bt_manager = Manager::new().await?;

    // get the first bluetooth adapter
    let adapters = bt_manager.adapters().await?;
    adapters
        .into_iter()
        .next()
        .context("no bluetooth adapter found")
}

fn init_logging(level: Option<LevelFilter>) {
    let mut builder = pretty_env_logger::formatted_builder();
    builder.filter_level(level.unwrap_or(LevelFilter::Info));
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.init();
}
