/// Cooperative multi-rate sampling and publish loop
///
/// One `tick()` per loop iteration. Three timers run independently against a
/// wrapping millisecond clock: fast sensors, the slow NDIR sensor, and the
/// publish cycle. Within a tick fast sampling precedes slow sampling, and both
/// precede the publish decision.
use log::{debug, info, trace, warn};
use time::OffsetDateTime;
use tokio::time::{sleep, Duration};

use crate::average::{RunningAverage, SensorChannel};
use crate::clock::Clock;
use crate::models::{Cadence, ClimateReading, Metric, MetricAverage, PublishBatch};
use crate::mqtt::{ConnectionState, PublishSession, PublishSummary, Transport};
use crate::particulate::{generate_report, PmsSensor};
use crate::sensors::{ClimateSensor, Co2Sensor, GasSensor};
use crate::serial::SerialLink;
use crate::utils::{format_datetime, period_elapsed};

/// Pause between loop iterations
pub const TICK_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Periods {
    pub fast_ms: u32,
    pub slow_ms: u32,
    pub publish_ms: u32,
}

impl Periods {
    /// Samples a channel can take in one publish cycle
    pub fn capacity_for(&self, cadence: Cadence) -> usize {
        let period = match cadence {
            Cadence::Fast => self.fast_ms,
            Cadence::Slow => self.slow_ms,
        };
        (self.publish_ms / period.max(1)).max(1) as usize
    }
}

/// Last-fired timestamps
#[derive(Debug, Clone, Copy)]
struct Timers {
    fast: u32,
    slow: u32,
    publish: u32,
}

/// What happened during one tick
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TickReport {
    pub fast_sampled: bool,
    pub slow_sampled: bool,
    /// Samples that landed in an accumulator
    pub accepted: usize,
    pub published: Option<PublishSummary>,
    pub batch: Option<PublishBatch>,
    pub connection: ConnectionState,
}

struct ParticulateAverages {
    pm1: RunningAverage,
    pm25: RunningAverage,
    pm10: RunningAverage,
}

impl ParticulateAverages {
    fn new(capacity: usize) -> Self {
        Self {
            pm1: RunningAverage::new(capacity),
            pm25: RunningAverage::new(capacity),
            pm10: RunningAverage::new(capacity),
        }
    }

    fn clear(&mut self) {
        self.pm1.clear();
        self.pm25.clear();
        self.pm10.clear();
    }
}

/// Every sensor, accumulator and timer of the node, plus its publish session
pub struct Device<T> {
    periods: Periods,
    timers: Timers,
    channels: Vec<SensorChannel>,
    particulate: ParticulateAverages,
    climate: Option<Box<dyn ClimateSensor>>,
    gas: Option<Box<dyn GasSensor>>,
    ndir: Option<Box<dyn Co2Sensor>>,
    pms: Option<PmsSensor<Box<dyn SerialLink>>>,
    session: PublishSession<T>,
}

impl<T: Transport> Device<T> {
    /// All timers start at `now_ms`
    pub fn new(periods: Periods, metrics: &[Metric], session: PublishSession<T>, now_ms: u32) -> Self {
        let channels = metrics
            .iter()
            .map(|&metric| SensorChannel::new(metric, periods.capacity_for(metric.cadence())))
            .collect();
        Self {
            periods,
            timers: Timers {
                fast: now_ms,
                slow: now_ms,
                publish: now_ms,
            },
            channels,
            particulate: ParticulateAverages::new(periods.capacity_for(Cadence::Fast)),
            climate: None,
            gas: None,
            ndir: None,
            pms: None,
            session,
        }
    }

    pub fn with_climate(mut self, sensor: Box<dyn ClimateSensor>) -> Self {
        self.climate = Some(sensor);
        self
    }

    pub fn with_gas(mut self, sensor: Box<dyn GasSensor>) -> Self {
        self.gas = Some(sensor);
        self
    }

    pub fn with_ndir(mut self, sensor: Box<dyn Co2Sensor>) -> Self {
        self.ndir = Some(sensor);
        self
    }

    pub fn with_particulate(mut self, sensor: PmsSensor<Box<dyn SerialLink>>) -> Self {
        self.pms = Some(sensor);
        self
    }

    pub fn session(&self) -> &PublishSession<T> {
        &self.session
    }

    pub fn channel(&self, metric: Metric) -> Option<&SensorChannel> {
        self.channels.iter().find(|c| c.metric == metric)
    }

    /// Append to a configured channel; NaN and unconfigured metrics are dropped
    fn record(&mut self, metric: Metric, value: f32) -> bool {
        if !value.is_finite() {
            debug!("Skipping non-numeric {} sample", metric.key());
            return false;
        }
        match self.channels.iter_mut().find(|c| c.metric == metric) {
            Some(channel) => channel.average.add_value(value),
            None => false,
        }
    }

    async fn sample_fast(&mut self) -> usize {
        let mut accepted = 0;

        let climate = match self.climate.as_mut() {
            Some(sensor) => match sensor.read_climate().await {
                Ok(reading) => Some(reading),
                Err(e) => {
                    warn!("Climate read failed: {}", e);
                    None
                }
            },
            None => None,
        };

        // A reading with either value missing is dropped as a whole
        match climate {
            Some(reading) if reading.is_numeric() => {
                accepted += usize::from(self.record(Metric::Temperature, reading.temperature));
                accepted += usize::from(self.record(Metric::Humidity, reading.humidity));
            }
            Some(_) => debug!("Skipping incomplete climate reading"),
            None => {}
        }

        // The gas values are corrected with the climate sample of this tick
        if let (Some(sensor), Some(reading)) = (self.gas.as_mut(), climate) {
            if reading.is_numeric() {
                let result = sensor.read_gas(reading).await;
                match result {
                    Ok(gas) => {
                        accepted += usize::from(self.record(Metric::GasReference, gas.rzero));
                        accepted += usize::from(self.record(Metric::GasConcentration, gas.ppm));
                    }
                    Err(e) => warn!("Gas read failed: {}", e),
                }
            }
        }

        if let Some(pms) = self.pms.as_mut() {
            let got_frame = if pms.needs_resync() {
                pms.resync().await
            } else {
                pms.read().await
            };
            if got_frame {
                if let Some(reading) = pms.reading() {
                    let added = self.particulate.pm25.add_value(reading.pm25);
                    self.particulate.pm1.add_value(reading.pm1);
                    self.particulate.pm10.add_value(reading.pm10);
                    accepted += usize::from(added);
                }
            }
        }

        accepted
    }

    async fn sample_slow(&mut self) -> usize {
        let Some(sensor) = self.ndir.as_mut() else {
            return 0;
        };
        let result = sensor.read_ppm().await;
        match result {
            Ok(ppm) if ppm > 0 => usize::from(self.record(Metric::NdirCo2, ppm as f32)),
            Ok(ppm) => {
                debug!("Skipping invalid CO2 reading {}", ppm);
                0
            }
            Err(e) => {
                warn!("CO2 read failed: {}", e);
                0
            }
        }
    }

    /// Take every accumulated average and reset the accumulators
    fn drain(&mut self) -> PublishBatch {
        let metrics = self
            .channels
            .iter()
            .map(|c| MetricAverage {
                metric: c.metric,
                value: c.average.average(),
                samples: c.average.count(),
            })
            .collect();

        let particulate_samples = self.particulate.pm25.count();
        let particulate = (particulate_samples > 0).then(|| {
            generate_report(
                self.particulate.pm1.average(),
                self.particulate.pm25.average(),
                self.particulate.pm10.average(),
            )
        });

        for channel in &mut self.channels {
            channel.average.clear();
        }
        self.particulate.clear();

        PublishBatch {
            metrics,
            particulate,
            particulate_samples,
        }
    }

    /// One pass of the control loop
    ///
    /// `hook` runs periodically while waiting out a failed reconnect, the only
    /// place a tick may stall for seconds.
    pub async fn tick<F: FnMut()>(&mut self, now_ms: u32, hook: F) -> TickReport {
        let mut report = TickReport::default();

        if period_elapsed(now_ms, self.timers.fast, self.periods.fast_ms) {
            self.timers.fast = now_ms;
            report.fast_sampled = true;
            report.accepted += self.sample_fast().await;
        }

        if period_elapsed(now_ms, self.timers.slow, self.periods.slow_ms) {
            self.timers.slow = now_ms;
            report.slow_sampled = true;
            report.accepted += self.sample_slow().await;
        }

        if self.session.service().await != ConnectionState::Connected
            && self.session.advance(now_ms).await.is_err()
        {
            self.session.wait_for_retry(hook).await;
        }

        if self.session.is_connected()
            && period_elapsed(now_ms, self.timers.publish, self.periods.publish_ms)
        {
            let batch = self.drain();
            let summary = self.session.publish_batch(&batch).await;
            self.timers.publish = now_ms;
            log_cycle(&batch, summary);
            report.published = Some(summary);
            report.batch = Some(batch);
        }

        report.connection = self.session.state();
        report
    }

    pub async fn shutdown(&mut self) {
        if let Some(pms) = self.pms.as_mut() {
            if let Err(e) = pms.sleep().await {
                warn!("Failed to put particulate sensor to sleep: {}", e);
            }
        }
        self.session.shutdown().await;
    }
}

fn log_cycle(batch: &PublishBatch, summary: PublishSummary) {
    let counts = batch
        .metrics
        .iter()
        .map(|m| format!("{} {}", m.samples, m.metric.key()))
        .collect::<Vec<_>>()
        .join(", ");
    info!(
        "Published averages of {}, {} particulate at {} ({} delivered, {} dropped)",
        counts,
        batch.particulate_samples,
        format_datetime(&OffsetDateTime::now_utc()),
        summary.delivered,
        summary.dropped
    );
}

/// Drive the device until the surrounding future is dropped
pub async fn run<T: Transport>(device: &mut Device<T>, clock: &impl Clock) {
    info!("Starting sampling loop");
    loop {
        let report = device
            .tick(clock.now_ms(), || trace!("Waiting for MQTT reconnect"))
            .await;
        if report.fast_sampled || report.slow_sampled {
            trace!("Tick: {:?}", report);
        }
        sleep(TICK_INTERVAL).await;
    }
}
