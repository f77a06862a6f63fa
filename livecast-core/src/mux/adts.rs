//! ADTS framing for raw AAC access units
//!
//! Every AAC packet in a transport stream carries a 7-byte header with the
//! profile, sampling frequency index, channel configuration and the total
//! frame length (header + payload).

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{LivecastError, Result};

/// Header size without CRC
pub const HEADER_LEN: usize = 7;

/// Largest frame length the 13-bit field can carry
pub const MAX_FRAME_LEN: usize = 0x1FFF;

/// MPEG-4 audio object type for AAC-LC
pub const AAC_LC: u8 = 2;

const SAMPLE_RATES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000,
    7_350,
];

/// Sampling frequency index for a sample rate
pub fn sample_rate_index(sample_rate: u32) -> Option<u8> {
    SAMPLE_RATES
        .iter()
        .position(|&r| r == sample_rate)
        .map(|i| i as u8)
}

/// Sample rate for a sampling frequency index
pub fn sample_rate_for_index(index: u8) -> Option<u32> {
    SAMPLE_RATES.get(index as usize).copied()
}

/// Decoded ADTS header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdtsHeader {
    /// MPEG-4 audio object type (2 = AAC-LC)
    pub object_type: u8,
    pub sample_rate_index: u8,
    pub channels: u8,
    /// Header plus payload
    pub frame_length: usize,
}

impl AdtsHeader {
    /// Header for an AAC-LC payload of `payload_len` bytes
    pub fn for_payload(sample_rate: u32, channels: u32, payload_len: usize) -> Result<Self> {
        let sample_rate_index = sample_rate_index(sample_rate).ok_or_else(|| {
            LivecastError::config(format!("No ADTS frequency index for {} Hz", sample_rate))
        })?;
        if channels == 0 || channels > 7 {
            return Err(LivecastError::config(format!(
                "No ADTS channel configuration for {} channels",
                channels
            )));
        }
        let frame_length = payload_len + HEADER_LEN;
        if frame_length > MAX_FRAME_LEN {
            return Err(LivecastError::encoder(format!(
                "AAC frame of {} bytes exceeds ADTS limit",
                payload_len
            )));
        }
        Ok(Self {
            object_type: AAC_LC,
            sample_rate_index,
            channels: channels as u8,
            frame_length,
        })
    }

    pub fn write(&self, out: &mut BytesMut) {
        let profile = self.object_type.saturating_sub(1) & 0x03;
        let len = self.frame_length as u16;
        out.put_u8(0xFF);
        // MPEG-4, layer 0, no CRC
        out.put_u8(0xF1);
        out.put_u8((profile << 6) | ((self.sample_rate_index & 0x0F) << 2) | ((self.channels >> 2) & 0x01));
        out.put_u8(((self.channels & 0x03) << 6) | ((len >> 11) as u8 & 0x03));
        out.put_u8((len >> 3) as u8);
        out.put_u8((((len & 0x07) as u8) << 5) | 0x1F);
        // buffer fullness 0x7FF (VBR), one raw data block
        out.put_u8(0xFC);
    }

    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_LEN || data[0] != 0xFF || data[1] & 0xF0 != 0xF0 {
            return None;
        }
        let object_type = ((data[2] >> 6) & 0x03) + 1;
        let sample_rate_index = (data[2] >> 2) & 0x0F;
        let channels = ((data[2] & 0x01) << 2) | ((data[3] >> 6) & 0x03);
        let frame_length = (((data[3] & 0x03) as usize) << 11)
            | ((data[4] as usize) << 3)
            | ((data[5] >> 5) as usize);
        Some(Self {
            object_type,
            sample_rate_index,
            channels,
            frame_length,
        })
    }
}

/// Prefix an AAC payload with its ADTS header
pub fn frame(payload: &[u8], sample_rate: u32, channels: u32) -> Result<Bytes> {
    let header = AdtsHeader::for_payload(sample_rate, channels, payload.len())?;
    let mut out = BytesMut::with_capacity(header.frame_length);
    header.write(&mut out);
    out.put_slice(payload);
    Ok(out.freeze())
}
