/// PMS5003 session: power and mode commands, frame polling, reporting
///
/// The sensor is kept in passive mode. Every `read()` first consumes whatever
/// bytes are already buffered, then asks for the next frame, so the reply is
/// waiting by the following tick and no call ever waits on the UART.
use futures_util::FutureExt;
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{self, Duration, Instant};

use super::decoder::{DecodeStatus, Decoder, Frame, MAGIC};
use super::report::{generate_report, ParticulateReport};
use crate::models::ParticulateReading;
use crate::sensors::SensorError;
use crate::serial::SerialLink;

pub const PMS_BAUD_RATE: u32 = 9600;
/// How long `detect()` waits for a first valid frame
pub const DETECT_TIMEOUT_MS: u64 = 3000;
/// Consecutive empty reads after which the sensor is woken and re-synced
pub const RESYNC_AFTER_MISSES: u32 = 30;
/// How long `resync()` waits for a frame; the tick stalls for at most this
pub const RESYNC_TIMEOUT_MS: u64 = 1000;

const WRITE_TIMEOUT: Duration = Duration::from_millis(100);
const RETRY_INTERVAL: Duration = Duration::from_millis(50);
/// Passive-mode sensors answer a request within a few hundred ms
const REQUEST_INTERVAL: Duration = Duration::from_millis(1000);
const READ_CHUNK: usize = 64;

/// 7-byte command frame: magic, command, two data bytes, checksum
const fn command(cmd: u8, data: u16) -> [u8; 7] {
    let d = data.to_be_bytes();
    let sum = MAGIC[0] as u16 + MAGIC[1] as u16 + cmd as u16 + d[0] as u16 + d[1] as u16;
    let c = sum.to_be_bytes();
    [MAGIC[0], MAGIC[1], cmd, d[0], d[1], c[0], c[1]]
}

pub const CMD_PASSIVE_MODE: [u8; 7] = command(0xE1, 0x0000);
pub const CMD_ACTIVE_MODE: [u8; 7] = command(0xE1, 0x0001);
pub const CMD_REQUEST_READ: [u8; 7] = command(0xE2, 0x0000);
pub const CMD_SLEEP: [u8; 7] = command(0xE4, 0x0000);
pub const CMD_WAKE_UP: [u8; 7] = command(0xE4, 0x0001);

pub struct PmsSensor<S> {
    link: S,
    decoder: Decoder,
    detected: bool,
    awake: bool,
    missed_reads: u32,
    latest: Option<Frame>,
}

impl<S: SerialLink> PmsSensor<S> {
    /// The sensor powers up awake and in active mode
    pub fn new(link: S) -> Self {
        Self {
            link,
            decoder: Decoder::new(),
            detected: false,
            awake: true,
            missed_reads: 0,
            latest: None,
        }
    }

    /// Set the line speed and switch the sensor to passive mode
    pub async fn begin(&mut self) -> Result<(), SensorError> {
        self.link.set_baud_rate(PMS_BAUD_RATE).await?;
        self.send(&CMD_PASSIVE_MODE).await
    }

    /// Look for a valid frame within `DETECT_TIMEOUT_MS`
    pub async fn detect(&mut self) -> bool {
        self.detected = self.read_until_successful(DETECT_TIMEOUT_MS).await;
        if self.detected {
            info!("Particulate sensor detected");
        } else {
            warn!(
                "No particulate frame within {} ms, sensor not detected",
                DETECT_TIMEOUT_MS
            );
        }
        self.detected
    }

    /// One non-blocking attempt; true when a new valid frame was decoded
    pub async fn read(&mut self) -> bool {
        let got_frame = self.drain_available();
        if got_frame {
            self.detected = true;
        } else if self.awake {
            self.missed_reads = self.missed_reads.saturating_add(1);
        }
        if self.awake {
            if let Err(e) = self.send(&CMD_REQUEST_READ).await {
                debug!("Failed to request particulate frame: {}", e);
            }
        }
        got_frame
    }

    /// True once an awake sensor has stayed silent for `RESYNC_AFTER_MISSES` reads
    pub fn needs_resync(&self) -> bool {
        self.awake && self.missed_reads >= RESYNC_AFTER_MISSES
    }

    /// Drop partial input, force a wake-up and wait briefly for a frame
    pub async fn resync(&mut self) -> bool {
        warn!(
            "No particulate frame in {} reads, re-syncing sensor",
            self.missed_reads
        );
        self.decoder.reset();
        self.missed_reads = 0;
        if let Err(e) = self.wake_up(true).await {
            warn!("Failed to wake particulate sensor: {}", e);
            return false;
        }
        self.read_until_successful(RESYNC_TIMEOUT_MS).await
    }

    /// Poll until a frame arrives or `timeout_ms` elapses
    ///
    /// Only meant for startup and recovery; the scheduler uses `read()`.
    pub async fn read_until_successful(&mut self, timeout_ms: u64) -> bool {
        let started = Instant::now();
        let timeout = Duration::from_millis(timeout_ms);
        let mut last_request: Option<Instant> = None;

        loop {
            if self.drain_available() {
                self.detected = true;
                return true;
            }
            if last_request.map_or(true, |t| t.elapsed() >= REQUEST_INTERVAL) {
                if let Err(e) = self.send(&CMD_REQUEST_READ).await {
                    debug!("Failed to request particulate frame: {}", e);
                }
                last_request = Some(Instant::now());
            }
            if started.elapsed() >= timeout {
                return false;
            }
            time::sleep(RETRY_INTERVAL).await;
        }
    }

    pub async fn sleep(&mut self) -> Result<(), SensorError> {
        self.send(&CMD_SLEEP).await?;
        self.awake = false;
        Ok(())
    }

    /// No-op when already awake unless `force` is set
    ///
    /// Waking resets the sensor to active mode, so passive mode is re-issued.
    pub async fn wake_up(&mut self, force: bool) -> Result<(), SensorError> {
        if self.awake && !force {
            return Ok(());
        }
        self.send(&CMD_WAKE_UP).await?;
        self.send(&CMD_PASSIVE_MODE).await?;
        self.awake = true;
        Ok(())
    }

    pub fn is_detected(&self) -> bool {
        self.detected
    }

    pub fn is_awake(&self) -> bool {
        self.awake
    }

    pub fn latest_frame(&self) -> Option<&Frame> {
        self.latest.as_ref()
    }

    pub fn reading(&self) -> Option<ParticulateReading> {
        self.latest.map(|frame| frame.reading())
    }

    /// Report built from the latest frame, if the sensor has been seen
    pub fn report(&self) -> Option<ParticulateReport> {
        if !self.detected {
            return None;
        }
        self.reading()
            .map(|r| generate_report(r.pm1, r.pm25, r.pm10))
    }

    /// Feed every byte that is ready right now through the decoder
    fn drain_available(&mut self) -> bool {
        let mut chunk = [0u8; READ_CHUNK];
        let mut got_frame = false;

        while !got_frame {
            let n = match self.link.read(&mut chunk).now_or_never() {
                Some(Ok(n)) if n > 0 => n,
                Some(Ok(_)) | None => break,
                Some(Err(e)) => {
                    warn!("Particulate sensor read failed: {}", e);
                    break;
                }
            };

            // Bytes past a completed frame stay in the decoder for the next frame
            for &byte in &chunk[..n] {
                match self.decoder.push(byte) {
                    DecodeStatus::Pending => {}
                    DecodeStatus::Frame(frame) => {
                        self.latest = Some(frame);
                        self.missed_reads = 0;
                        got_frame = true;
                    }
                    DecodeStatus::Invalid(e) => {
                        debug!("Discarding particulate frame: {}", e);
                    }
                }
            }
        }

        got_frame
    }

    async fn send(&mut self, cmd: &[u8]) -> Result<(), SensorError> {
        let link = &mut self.link;
        time::timeout(WRITE_TIMEOUT, async {
            link.write_all(cmd).await?;
            link.flush().await
        })
        .await
        .map_err(|_| SensorError::Timeout("particulate command write"))??;
        Ok(())
    }
}
