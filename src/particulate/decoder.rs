/// Byte-at-a-time decoder for the PMS5003 binary frame format
///
/// A frame is 32 bytes, big-endian throughout:
/// - Bytes 0-1: Magic (0x42, 0x4D)
/// - Bytes 2-3: Declared length (28: thirteen fields plus the checksum)
/// - Bytes 4-9: Factory PM1.0 / PM2.5 / PM10
/// - Bytes 10-15: Atmospheric PM1.0 / PM2.5 / PM10
/// - Bytes 16-27: Particle counts per 0.1 L (>0.3, >0.5, >1.0, >2.5, >5.0, >10 µm)
/// - Bytes 28-29: Reserved
/// - Bytes 30-31: Checksum, sum of bytes 0-29 modulo 65536
use thiserror::Error;

use crate::models::ParticulateReading;

pub const MAGIC: [u8; 2] = [0x42, 0x4D];
pub const FIELD_COUNT: usize = 13;
/// Declared length of a data frame: the fields plus the trailing checksum
pub const FRAME_LENGTH: u16 = (FIELD_COUNT * 2 + 2) as u16;
pub const FRAME_SIZE: usize = 4 + FRAME_LENGTH as usize;

const CHECKSUM_OFFSET: usize = FRAME_SIZE - 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    SeekingMagic1,
    SeekingMagic2,
    ReadingLength,
    ReadingBody,
    Validating,
}

/// Reasons a candidate frame was thrown away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("unexpected frame length {0}, expected {}", FRAME_LENGTH)]
    UnexpectedLength(u16),
    #[error("checksum mismatch: computed {computed:#06x}, received {received:#06x}")]
    ChecksumMismatch { computed: u16, received: u16 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodeStatus {
    Pending,
    Frame(Frame),
    Invalid(FramingError),
}

/// A checksum-verified data frame
///
/// Only the decoder can build one, so every instance is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    fields: [u16; FIELD_COUNT],
    checksum: u16,
}

impl Frame {
    fn from_validated(bytes: &[u8; FRAME_SIZE], checksum: u16) -> Self {
        let mut fields = [0u16; FIELD_COUNT];
        for (i, field) in fields.iter_mut().enumerate() {
            let offset = 4 + i * 2;
            *field = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
        }
        Self { fields, checksum }
    }

    pub fn fields(&self) -> &[u16; FIELD_COUNT] {
        &self.fields
    }

    pub fn checksum(&self) -> u16 {
        self.checksum
    }

    pub fn pm1_factory(&self) -> u16 {
        self.fields[0]
    }

    pub fn pm25_factory(&self) -> u16 {
        self.fields[1]
    }

    pub fn pm10_factory(&self) -> u16 {
        self.fields[2]
    }

    /// PM1.0 under atmospheric environment
    pub fn pm1(&self) -> u16 {
        self.fields[3]
    }

    pub fn pm25(&self) -> u16 {
        self.fields[4]
    }

    pub fn pm10(&self) -> u16 {
        self.fields[5]
    }

    /// Particle counts for the >0.3, >0.5, >1.0, >2.5, >5.0 and >10 µm bins
    pub fn particle_counts(&self) -> &[u16] {
        &self.fields[6..12]
    }

    pub fn reserved(&self) -> u16 {
        self.fields[12]
    }

    /// Atmospheric concentrations; the factory set is calibrated for lab conditions
    pub fn reading(&self) -> ParticulateReading {
        ParticulateReading {
            pm1: f32::from(self.pm1()),
            pm25: f32::from(self.pm25()),
            pm10: f32::from(self.pm10()),
        }
    }
}

/// Incremental frame decoder with resynchronisation on any framing error
#[derive(Debug, Clone)]
pub struct Decoder {
    state: DecoderState,
    buf: [u8; FRAME_SIZE],
    pos: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            state: DecoderState::SeekingMagic1,
            buf: [0; FRAME_SIZE],
            pos: 0,
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// Drop any partial frame and go back to scanning for the magic bytes
    pub fn reset(&mut self) {
        self.state = DecoderState::SeekingMagic1;
        self.pos = 0;
    }

    pub fn push(&mut self, byte: u8) -> DecodeStatus {
        match self.state {
            DecoderState::SeekingMagic1 => {
                if byte == MAGIC[0] {
                    self.buf[0] = byte;
                    self.pos = 1;
                    self.state = DecoderState::SeekingMagic2;
                }
            }
            DecoderState::SeekingMagic2 => {
                if byte == MAGIC[1] {
                    self.store(byte);
                    self.state = DecoderState::ReadingLength;
                } else if byte != MAGIC[0] {
                    // A repeated 0x42 may itself start the frame
                    self.reset();
                }
            }
            DecoderState::ReadingLength => {
                self.store(byte);
                if self.pos == 4 {
                    let length = u16::from_be_bytes([self.buf[2], self.buf[3]]);
                    if length != FRAME_LENGTH {
                        self.reset();
                        return DecodeStatus::Invalid(FramingError::UnexpectedLength(length));
                    }
                    self.state = DecoderState::ReadingBody;
                }
            }
            DecoderState::ReadingBody => {
                self.store(byte);
                if self.pos == CHECKSUM_OFFSET {
                    self.state = DecoderState::Validating;
                }
            }
            DecoderState::Validating => {
                self.store(byte);
                if self.pos == FRAME_SIZE {
                    let status = self.validate();
                    self.reset();
                    return status;
                }
            }
        }
        DecodeStatus::Pending
    }

    /// Feed a slice until a frame completes or fails
    ///
    /// Returns how many bytes were consumed; the rest belong to the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> (usize, DecodeStatus) {
        for (i, &byte) in bytes.iter().enumerate() {
            match self.push(byte) {
                DecodeStatus::Pending => continue,
                status => return (i + 1, status),
            }
        }
        (bytes.len(), DecodeStatus::Pending)
    }

    fn store(&mut self, byte: u8) {
        self.buf[self.pos] = byte;
        self.pos += 1;
    }

    fn validate(&self) -> DecodeStatus {
        let computed = checksum(&self.buf[..CHECKSUM_OFFSET]);
        let received = u16::from_be_bytes([self.buf[CHECKSUM_OFFSET], self.buf[CHECKSUM_OFFSET + 1]]);
        if computed != received {
            return DecodeStatus::Invalid(FramingError::ChecksumMismatch { computed, received });
        }
        DecodeStatus::Frame(Frame::from_validated(&self.buf, received))
    }
}

/// Arithmetic sum of all bytes modulo 65536
pub fn checksum(bytes: &[u8]) -> u16 {
    bytes
        .iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)))
}

/// Build a well-formed frame carrying `fields`
#[cfg(test)]
pub(crate) fn encode_frame(fields: &[u16; FIELD_COUNT]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(FRAME_SIZE);
    bytes.extend_from_slice(&MAGIC);
    bytes.extend_from_slice(&FRAME_LENGTH.to_be_bytes());
    for field in fields {
        bytes.extend_from_slice(&field.to_be_bytes());
    }
    let sum = checksum(&bytes);
    bytes.extend_from_slice(&sum.to_be_bytes());
    bytes
}
