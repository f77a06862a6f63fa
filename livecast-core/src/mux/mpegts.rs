//! MPEG transport stream packetizer (ITU-T H.222.0)
//!
//! Just enough of the format for HLS segments: one program, H.264 video on
//! [`VIDEO_PID`], ADTS AAC on [`AUDIO_PID`], PCR carried on the video PID.

use bytes::{BufMut, BytesMut};

/// Transport packet size
pub const PACKET_SIZE: usize = 188;

const PAYLOAD_SIZE: usize = PACKET_SIZE - 4;
const SYNC_BYTE: u8 = 0x47;

pub const PAT_PID: u16 = 0x0000;
pub const PMT_PID: u16 = 0x1000;
pub const VIDEO_PID: u16 = 0x0100;
pub const AUDIO_PID: u16 = 0x0101;

const STREAM_TYPE_H264: u8 = 0x1B;
const STREAM_TYPE_ADTS_AAC: u8 = 0x0F;

const STREAM_ID_VIDEO: u8 = 0xE0;
const STREAM_ID_AUDIO: u8 = 0xC0;

/// Presentation timestamps lead the PCR by 1.4 s (90 kHz units)
const PTS_OFFSET: u64 = 126_000;

/// H.264 access unit delimiter prepended to every video PES
const ACCESS_UNIT_DELIMITER: [u8; 6] = [0x00, 0x00, 0x00, 0x01, 0x09, 0xF0];

/// CRC-32/MPEG-2 over a PSI section
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Microseconds to 90 kHz clock ticks
pub fn to_90khz(time_us: i64) -> u64 {
    (time_us.max(0) as u64) * 9 / 100
}

/// Stateful packetizer; continuity counters persist across segments
#[derive(Debug, Default)]
pub struct TsMuxer {
    has_audio: bool,
    cc_pat: u8,
    cc_pmt: u8,
    cc_video: u8,
    cc_audio: u8,
}

impl TsMuxer {
    pub fn new(has_audio: bool) -> Self {
        Self {
            has_audio,
            ..Default::default()
        }
    }

    fn next_cc(&mut self, pid: u16) -> u8 {
        let counter = match pid {
            PAT_PID => &mut self.cc_pat,
            PMT_PID => &mut self.cc_pmt,
            VIDEO_PID => &mut self.cc_video,
            _ => &mut self.cc_audio,
        };
        let cc = *counter;
        *counter = (cc + 1) & 0x0F;
        cc
    }

    /// PAT and PMT; written at the start of every segment
    pub fn write_tables(&mut self, out: &mut BytesMut) {
        let pat = pat_section();
        self.write_section(out, PAT_PID, &pat);
        let pmt = pmt_section(self.has_audio);
        self.write_section(out, PMT_PID, &pmt);
    }

    fn write_section(&mut self, out: &mut BytesMut, pid: u16, section: &[u8]) {
        let cc = self.next_cc(pid);
        out.put_u8(SYNC_BYTE);
        out.put_u8(0x40 | ((pid >> 8) as u8 & 0x1F));
        out.put_u8(pid as u8);
        out.put_u8(0x10 | cc);
        // pointer field
        out.put_u8(0x00);
        out.put_slice(section);
        out.put_bytes(0xFF, PAYLOAD_SIZE - 1 - section.len());
    }

    /// One H.264 access unit (Annex B)
    pub fn write_video(&mut self, out: &mut BytesMut, pts_us: i64, keyframe: bool, data: &[u8]) {
        let pts = to_90khz(pts_us) + PTS_OFFSET;
        let mut pes = BytesMut::with_capacity(data.len() + 20);
        write_pes_header(&mut pes, STREAM_ID_VIDEO, pts, None);
        pes.put_slice(&ACCESS_UNIT_DELIMITER);
        pes.put_slice(data);
        let pcr = pts - PTS_OFFSET;
        self.write_pes(out, VIDEO_PID, &pes, keyframe, Some(pcr));
    }

    /// One ADTS-framed AAC packet
    pub fn write_audio(&mut self, out: &mut BytesMut, pts_us: i64, adts_frame: &[u8]) {
        let pts = to_90khz(pts_us) + PTS_OFFSET;
        let mut pes = BytesMut::with_capacity(adts_frame.len() + 14);
        write_pes_header(&mut pes, STREAM_ID_AUDIO, pts, Some(adts_frame.len()));
        pes.put_slice(adts_frame);
        self.write_pes(out, AUDIO_PID, &pes, true, None);
    }

    fn write_pes(
        &mut self,
        out: &mut BytesMut,
        pid: u16,
        pes: &[u8],
        random_access: bool,
        pcr: Option<u64>,
    ) {
        let mut offset = 0;
        let mut first = true;
        while offset < pes.len() {
            let mut adaptation: Option<Vec<u8>> = None;
            if first && (random_access || pcr.is_some()) {
                let mut field = Vec::with_capacity(7);
                let mut flags = 0u8;
                if random_access {
                    flags |= 0x40;
                }
                if pcr.is_some() {
                    flags |= 0x10;
                }
                field.push(flags);
                if let Some(pcr) = pcr {
                    field.extend_from_slice(&encode_pcr(pcr));
                }
                adaptation = Some(field);
            }

            let adaptation_size = adaptation.as_ref().map_or(0, |f| 1 + f.len());
            let chunk = (PAYLOAD_SIZE - adaptation_size).min(pes.len() - offset);
            let pad = PAYLOAD_SIZE - adaptation_size - chunk;
            if pad > 0 {
                match adaptation.as_mut() {
                    Some(field) => field.resize(field.len() + pad, 0xFF),
                    None if pad == 1 => adaptation = Some(Vec::new()),
                    None => {
                        let mut field = vec![0x00];
                        field.resize(pad - 1, 0xFF);
                        adaptation = Some(field);
                    }
                }
            }

            let cc = self.next_cc(pid);
            out.put_u8(SYNC_BYTE);
            let start = if first { 0x40 } else { 0x00 };
            out.put_u8(start | ((pid >> 8) as u8 & 0x1F));
            out.put_u8(pid as u8);
            match &adaptation {
                Some(field) => {
                    out.put_u8(0x30 | cc);
                    out.put_u8(field.len() as u8);
                    out.put_slice(field);
                }
                None => out.put_u8(0x10 | cc),
            }
            out.put_slice(&pes[offset..offset + chunk]);

            offset += chunk;
            first = false;
        }
    }
}

fn pat_section() -> Vec<u8> {
    let mut section = Vec::with_capacity(16);
    section.push(0x00);
    // section length: 5 header bytes + one program + CRC
    section.extend_from_slice(&[0xB0, 13]);
    // transport_stream_id
    section.extend_from_slice(&[0x00, 0x01]);
    // version 0, current
    section.push(0xC1);
    section.extend_from_slice(&[0x00, 0x00]);
    // program 1 -> PMT
    section.extend_from_slice(&[0x00, 0x01]);
    section.extend_from_slice(&(0xE000 | PMT_PID).to_be_bytes());
    let crc = crc32_mpeg2(&section);
    section.extend_from_slice(&crc.to_be_bytes());
    section
}

fn pmt_section(has_audio: bool) -> Vec<u8> {
    let mut streams: Vec<(u8, u16)> = vec![(STREAM_TYPE_H264, VIDEO_PID)];
    if has_audio {
        streams.push((STREAM_TYPE_ADTS_AAC, AUDIO_PID));
    }
    let section_length = 9 + 5 * streams.len() + 4;

    let mut section = Vec::with_capacity(3 + section_length);
    section.push(0x02);
    section.extend_from_slice(&(0xB000 | section_length as u16).to_be_bytes());
    // program number
    section.extend_from_slice(&[0x00, 0x01]);
    section.push(0xC1);
    section.extend_from_slice(&[0x00, 0x00]);
    section.extend_from_slice(&(0xE000 | VIDEO_PID).to_be_bytes());
    // no program descriptors
    section.extend_from_slice(&[0xF0, 0x00]);
    for (stream_type, pid) in streams {
        section.push(stream_type);
        section.extend_from_slice(&(0xE000 | pid).to_be_bytes());
        section.extend_from_slice(&[0xF0, 0x00]);
    }
    let crc = crc32_mpeg2(&section);
    section.extend_from_slice(&crc.to_be_bytes());
    section
}

fn write_pes_header(out: &mut BytesMut, stream_id: u8, pts: u64, payload_len: Option<usize>) {
    out.put_slice(&[0x00, 0x00, 0x01, stream_id]);
    // 3 flag/length bytes + 5 PTS bytes; video may exceed the 16-bit field
    let length = payload_len
        .map(|len| len + 8)
        .filter(|&len| len <= u16::MAX as usize)
        .unwrap_or(0);
    out.put_u16(length as u16);
    out.put_u8(0x80);
    // PTS only
    out.put_u8(0x80);
    out.put_u8(5);
    out.put_slice(&encode_timestamp(0x20, pts));
}

fn encode_timestamp(prefix: u8, ts: u64) -> [u8; 5] {
    [
        prefix | (((ts >> 29) as u8) & 0x0E) | 0x01,
        (ts >> 22) as u8,
        (((ts >> 14) as u8) & 0xFE) | 0x01,
        (ts >> 7) as u8,
        (((ts << 1) as u8) & 0xFE) | 0x01,
    ]
}

fn encode_pcr(base: u64) -> [u8; 6] {
    [
        (base >> 25) as u8,
        (base >> 17) as u8,
        (base >> 9) as u8,
        (base >> 1) as u8,
        (((base & 0x01) as u8) << 7) | 0x7E,
        0x00,
    ]
}

/// Decode a 5-byte PES timestamp
pub fn decode_timestamp(bytes: &[u8]) -> u64 {
    (((bytes[0] as u64) >> 1) & 0x07) << 30
        | (bytes[1] as u64) << 22
        | ((bytes[2] as u64) >> 1) << 15
        | (bytes[3] as u64) << 7
        | (bytes[4] as u64) >> 1
}
