mod config;

use std::path::Path;
use std::time::Duration;

use mixd_engine::init;
use mixd_engine::message::{Action, Event};
use tokio::sync::mpsc::channel;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Config;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(Path::new(&path))?,
        None => Config::default(),
    };
    let period = Duration::from_micros(
        config.device.round as u64 * 1_000_000 / config.device.rate as u64,
    );

    let (tx, engine) = init();
    let (etx, mut erx) = channel::<Event>(256);
    tx.send(Action::Subscribe(etx))
        .await
        .map_err(|e| e.to_string())?;
    tx.send(Action::OpenDevice(config.device))
        .await
        .map_err(|e| e.to_string())?;

    let dev = loop {
        match erx.recv().await {
            Some(Event::DeviceOpen { dev }) => break dev,
            Some(Event::Error(e)) => return Err(e),
            Some(_) => continue,
            None => return Err("engine exited during setup".to_string()),
        }
    };

    // stand-in for the hardware completion interrupt: the loopback
    // device is always ready, so cycles run on a wall-clock period
    let cycle_tx = tx.clone();
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(period);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Burst);
        loop {
            timer.tick().await;
            if cycle_tx.send(Action::DeviceCycle(dev)).await.is_err() {
                break;
            }
        }
    });

    tokio::spawn(async move {
        while let Some(event) = erx.recv().await {
            match event {
                Event::Error(e) => error!("{e}"),
                Event::DeviceGone { reason, .. } => error!("device gone: {reason}"),
                other => debug!(?other, "event"),
            }
        }
    });

    info!("mixd running, ^C to stop");
    tokio::signal::ctrl_c().await.map_err(|e| e.to_string())?;
    tx.send(Action::Quit).await.map_err(|e| e.to_string())?;
    engine.await.map_err(|e| e.to_string())?;
    Ok(())
}
