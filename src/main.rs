mod average;
mod clock;
mod config;
mod models;
mod mqtt;
mod particulate;
mod scheduler;
mod sensors;
mod serial;
mod utils;

use log::{error, info, warn};
use std::path::Path;
use time::OffsetDateTime;

use clock::{Clock, MonotonicClock};
use config::AppConfig;
use mqtt::{MqttConnection, PublishSession, Topics};
use particulate::PmsSensor;
use scheduler::Device;
use sensors::{IioClimate, Mhz19, Mq135, SensorError};
use serial::{open_port, SerialLink};
use tokio_serial::SerialStream;
use utils::format_datetime;

async fn open_particulate(path: &Path) -> Result<PmsSensor<Box<dyn SerialLink>>, SensorError> {
    let port = open_port(path)?;
    let mut pms = PmsSensor::new(Box::new(port) as Box<dyn SerialLink>);
    pms.begin().await?;
    pms.wake_up(false).await?;
    if !pms.detect().await {
        warn!(
            "Particulate sensor on {} is silent, will keep polling",
            path.display()
        );
    }
    Ok(pms)
}

async fn open_ndir(path: &Path) -> Result<Mhz19<SerialStream>, SensorError> {
    let port = open_port(path)?;
    let mut sensor = Mhz19::new(port);
    sensor.begin().await?;
    Ok(sensor)
}

/// Wire up every configured sensor; a sensor that fails to open is left out
async fn build_device(config: &AppConfig, now_ms: u32) -> Device<MqttConnection> {
    let topics = Topics::new(config.discovery_prefix.clone(), config.hostname.clone());
    let session = PublishSession::new(
        MqttConnection::new(config.broker.clone()),
        topics,
        &config.metrics,
    );
    let mut device = Device::new(config.periods, &config.metrics, session, now_ms);

    if let Some(dir) = &config.climate_iio_dir {
        info!("Climate sensor at {}", dir.display());
        device = device.with_climate(Box::new(IioClimate::new(dir)));
    }

    if let Some(path) = &config.gas_adc_path {
        if config.climate_iio_dir.is_none() {
            warn!("Gas sensor configured without a climate sensor, no gas samples will be taken");
        }
        info!("Gas sensor ADC at {}", path.display());
        device = device.with_gas(Box::new(Mq135::new(path)));
    }

    if let Some(path) = &config.mhz19_device {
        match open_ndir(path).await {
            Ok(sensor) => {
                info!("CO2 sensor on {}", path.display());
                device = device.with_ndir(Box::new(sensor));
            }
            Err(e) => error!("Failed to open CO2 sensor {}: {}", path.display(), e),
        }
    }

    if let Some(path) = &config.pms_device {
        match open_particulate(path).await {
            Ok(pms) => device = device.with_particulate(pms),
            Err(e) => error!(
                "Failed to open particulate sensor {}: {}",
                path.display(),
                e
            ),
        }
    }

    device
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match AppConfig::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    info!(
        "Starting {} at {}, publishing {} channels every {} ms",
        config.hostname,
        format_datetime(&OffsetDateTime::now_utc()),
        config.metrics.len(),
        config.periods.publish_ms
    );

    let clock = MonotonicClock::new();
    let mut device = build_device(&config, clock.now_ms()).await;

    // Handle Ctrl+C gracefully
    let (tx, mut rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        let _ = tx.send(());
    });

    // Run main loop or wait for shutdown signal
    tokio::select! {
        _ = scheduler::run(&mut device, &clock) => {}
        _ = &mut rx => {
            info!("Program terminated by user. Exiting gracefully.");
        }
    }

    device.shutdown().await;
    Ok(())
}
