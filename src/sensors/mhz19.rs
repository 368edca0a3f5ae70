/// MH-Z19 NDIR CO2 sensor over UART
///
/// Request `FF 01 86 00 00 00 00 00 79`; the 9-byte reply carries the
/// concentration in bytes 2-3 and a checksum in byte 8.
use futures_util::future::{BoxFuture, FutureExt};
use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout, Duration};

use super::{Co2Sensor, SensorError};
use crate::serial::SerialLink;

pub const MHZ19_BAUD_RATE: u32 = 9600;
pub const CMD_READ_CO2: [u8; 9] = [0xFF, 0x01, 0x86, 0x00, 0x00, 0x00, 0x00, 0x00, 0x79];

const RESPONSE_TIMEOUT: Duration = Duration::from_millis(200);

/// Negated sum of bytes 1-7
pub fn checksum(packet: &[u8; 9]) -> u8 {
    let sum = packet[1..8]
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b));
    0xFFu8.wrapping_sub(sum).wrapping_add(1)
}

pub fn parse_response(packet: &[u8; 9]) -> Result<i32, SensorError> {
    if packet[0] != 0xFF || packet[1] != 0x86 {
        return Err(SensorError::InvalidData(format!(
            "unexpected MH-Z19 header {:02X} {:02X}",
            packet[0], packet[1]
        )));
    }
    let computed = checksum(packet);
    if computed != packet[8] {
        return Err(SensorError::Checksum {
            computed,
            received: packet[8],
        });
    }
    Ok(i32::from(u16::from_be_bytes([packet[2], packet[3]])))
}

pub struct Mhz19<S> {
    link: S,
}

impl<S: SerialLink> Mhz19<S> {
    pub fn new(link: S) -> Self {
        Self { link }
    }

    pub async fn begin(&mut self) -> Result<(), SensorError> {
        self.link.set_baud_rate(MHZ19_BAUD_RATE).await?;
        Ok(())
    }

    /// Drop bytes already waiting on the link, such as the tail of a reply
    /// that arrived after its read timed out
    fn discard_pending(&mut self) -> Result<usize, SensorError> {
        let mut buf = [0u8; 16];
        let mut discarded = 0;
        loop {
            match self.link.read(&mut buf).now_or_never() {
                Some(Ok(0)) | None => break,
                Some(Ok(n)) => discarded += n,
                Some(Err(e)) => return Err(e.into()),
            }
        }
        if discarded > 0 {
            debug!("Discarded {} stale MH-Z19 bytes", discarded);
        }
        Ok(discarded)
    }

    async fn exchange(&mut self) -> Result<i32, SensorError> {
        self.discard_pending()?;
        self.link.write_all(&CMD_READ_CO2).await?;
        let mut reply = [0u8; 9];
        self.link.read_exact(&mut reply).await?;
        parse_response(&reply)
    }
}

impl<S: SerialLink> Co2Sensor for Mhz19<S> {
    fn read_ppm(&mut self) -> BoxFuture<'_, Result<i32, SensorError>> {
        async move {
            timeout(RESPONSE_TIMEOUT, self.exchange())
                .await
                .map_err(|_| SensorError::Timeout("MH-Z19 response"))?
        }
        .boxed()
    }
}
