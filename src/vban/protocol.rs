/*
 * Meeting Pipeline - VBAN Protocol Codec
 * Copyright (c) 2025 Meeting Pipeline Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use thiserror::Error;

pub const VBAN_MAGIC: &[u8; 4] = b"VBAN";
pub const VBAN_HEADER_SIZE: usize = 28;

/// Sample rate indices (VBAN specification).
pub const VBAN_SR_TABLE: [u32; 21] = [
    6000, 12000, 24000, 48000, 96000, 192000, 384000,
    8000, 16000, 32000, 64000, 128000, 256000, 512000,
    11025, 22050, 44100, 88200, 176400, 352800, 705600,
];

pub const VBAN_PROTOCOL_AUDIO: u8 = 0x00;
pub const VBAN_DATATYPE_INT16: u8 = 0x01;
pub const VBAN_CODEC_PCM: u8 = 0x00;

/// Sweet spot for latency vs per-packet overhead: 256 samples at 48kHz is ~5.3ms.
pub const MAX_SAMPLES_PER_PACKET: usize = 256;

pub const MAX_STREAM_NAME_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum VbanError {
    #[error("Sample rate {0} not in VBAN spec")]
    UnsupportedSampleRate(u32),

    #[error("Sample rate index {0} out of range (0-20)")]
    SampleRateIndex(u8),

    #[error("Samples per frame {0} out of range (1-256)")]
    SamplesPerFrame(usize),

    #[error("Channel count {0} out of range (1-256)")]
    Channels(usize),

    #[error("Stream name {0:?} must be printable ASCII, at most 16 bytes")]
    StreamName(String),
}

/// A parsed VBAN audio packet header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VbanHeader {
    pub sample_rate: u32,
    pub samples: u16,
    pub channels: u16,
    pub data_format: u8,
    pub codec: u8,
    pub stream_name: String,
    pub frame_counter: u32,
}

/// Look up the VBAN sample rate index for a rate in Hz.
pub fn sr_index(rate: u32) -> Result<u8, VbanError> {
    VBAN_SR_TABLE
        .iter()
        .position(|&r| r == rate)
        .map(|i| i as u8)
        .ok_or(VbanError::UnsupportedSampleRate(rate))
}

fn valid_stream_name(name: &str) -> bool {
    name.len() <= MAX_STREAM_NAME_LEN
        && name.bytes().all(|b| (0x20..0x7f).contains(&b))
}

/// Build a 28-byte VBAN header.
///
/// Byte layout (little-endian where multi-byte):
///   0..4   magic "VBAN"
///   4      SR index (low 5 bits) | protocol (high 3 bits)
///   5      samples per frame - 1
///   6      channels - 1
///   7      data format (low 3 bits) | codec (high 5 bits)
///   8..24  stream name, null-padded ASCII
///   24..28 frame counter (u32)
pub fn build_header(
    sr_idx: u8,
    samples_per_frame: usize,
    channels: usize,
    frame_counter: u32,
    stream_name: &str,
) -> Result<[u8; VBAN_HEADER_SIZE], VbanError> {
    if sr_idx as usize >= VBAN_SR_TABLE.len() {
        return Err(VbanError::SampleRateIndex(sr_idx));
    }
    if !(1..=256).contains(&samples_per_frame) {
        return Err(VbanError::SamplesPerFrame(samples_per_frame));
    }
    if !(1..=256).contains(&channels) {
        return Err(VbanError::Channels(channels));
    }
    if !valid_stream_name(stream_name) {
        return Err(VbanError::StreamName(stream_name.to_string()));
    }

    let mut header = [0u8; VBAN_HEADER_SIZE];
    header[0..4].copy_from_slice(VBAN_MAGIC);
    header[4] = (sr_idx & 0x1f) | ((VBAN_PROTOCOL_AUDIO & 0x07) << 5);
    header[5] = ((samples_per_frame - 1) & 0xff) as u8;
    header[6] = ((channels - 1) & 0xff) as u8;
    header[7] = (VBAN_DATATYPE_INT16 & 0x07) | ((VBAN_CODEC_PCM & 0x1f) << 3);
    header[8..8 + stream_name.len()].copy_from_slice(stream_name.as_bytes());
    header[24..28].copy_from_slice(&frame_counter.to_le_bytes());
    Ok(header)
}

/// Parse a VBAN packet header. Returns None if the packet is not a
/// well-formed VBAN audio frame.
///
/// The payload length is deliberately not validated against the declared
/// samples/channels; the consumer is expected to tolerate truncation.
pub fn parse_header(data: &[u8]) -> Option<VbanHeader> {
    if data.len() < VBAN_HEADER_SIZE {
        return None;
    }
    if &data[0..4] != VBAN_MAGIC {
        return None;
    }

    let sr_sub = data[4];
    let sr_idx = (sr_sub & 0x1f) as usize;
    let protocol = (sr_sub >> 5) & 0x07;
    if protocol != VBAN_PROTOCOL_AUDIO {
        return None;
    }
    if sr_idx >= VBAN_SR_TABLE.len() {
        return None;
    }

    let stream_name = data[8..24]
        .split(|&b| b == 0)
        .next()
        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
        .unwrap_or_default();

    let mut counter_bytes = [0u8; 4];
    counter_bytes.copy_from_slice(&data[24..28]);

    Some(VbanHeader {
        sample_rate: VBAN_SR_TABLE[sr_idx],
        samples: data[5] as u16 + 1,
        channels: data[6] as u16 + 1,
        data_format: data[7] & 0x07,
        codec: (data[7] >> 3) & 0x1f,
        stream_name,
        frame_counter: u32::from_le_bytes(counter_bytes),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip_identity() {
        let sr_idx = sr_index(48000).unwrap();
        let header = build_header(sr_idx, 256, 1, 42, "MeetingAudio").unwrap();
        let parsed = parse_header(&header).unwrap();

        assert_eq!(parsed.sample_rate, 48000);
        assert_eq!(parsed.samples, 256);
        assert_eq!(parsed.channels, 1);
        assert_eq!(parsed.data_format, VBAN_DATATYPE_INT16);
        assert_eq!(parsed.codec, VBAN_CODEC_PCM);
        assert_eq!(parsed.stream_name, "MeetingAudio");
        assert_eq!(parsed.frame_counter, 42);
    }

    #[test]
    fn round_trip_all_table_rates() {
        for (i, &rate) in VBAN_SR_TABLE.iter().enumerate() {
            let header = build_header(i as u8, 1, 256, u32::MAX, "s").unwrap();
            let parsed = parse_header(&header).unwrap();
            assert_eq!(parsed.sample_rate, rate);
            assert_eq!(parsed.samples, 1);
            assert_eq!(parsed.channels, 256);
            assert_eq!(parsed.frame_counter, u32::MAX);
        }
    }

    #[test]
    fn build_rejects_out_of_range_inputs() {
        assert!(matches!(
            build_header(21, 256, 1, 0, "x"),
            Err(VbanError::SampleRateIndex(21))
        ));
        assert!(matches!(
            build_header(3, 0, 1, 0, "x"),
            Err(VbanError::SamplesPerFrame(0))
        ));
        assert!(matches!(
            build_header(3, 257, 1, 0, "x"),
            Err(VbanError::SamplesPerFrame(257))
        ));
        assert!(matches!(
            build_header(3, 256, 0, 0, "x"),
            Err(VbanError::Channels(0))
        ));
        assert!(matches!(
            build_header(3, 256, 257, 0, "x"),
            Err(VbanError::Channels(257))
        ));
        assert!(matches!(
            build_header(3, 256, 1, 0, "seventeen-chars!!"),
            Err(VbanError::StreamName(_))
        ));
    }

    #[test]
    fn sr_index_rejects_unknown_rate() {
        assert!(sr_index(48000).is_ok());
        assert!(matches!(
            sr_index(44000),
            Err(VbanError::UnsupportedSampleRate(44000))
        ));
    }

    #[test]
    fn parse_rejects_short_packet() {
        assert!(parse_header(&[0u8; 27]).is_none());
    }

    #[test]
    fn parse_rejects_bad_magic() {
        let mut header = build_header(3, 256, 1, 0, "x").unwrap();
        header[0] = b'X';
        assert!(parse_header(&header).is_none());
    }

    #[test]
    fn parse_rejects_non_audio_protocol() {
        let mut header = build_header(3, 256, 1, 0, "x").unwrap();
        // Protocol lives in the high 3 bits of byte 4; 0x20 marks serial.
        header[4] |= 0x20;
        assert!(parse_header(&header).is_none());
    }

    #[test]
    fn parse_drops_out_of_table_sample_rate() {
        let mut header = build_header(3, 256, 1, 0, "x").unwrap();
        header[4] = (header[4] & 0xe0) | 21;
        assert!(parse_header(&header).is_none());
    }

    #[test]
    fn parse_ignores_payload_bytes() {
        let header = build_header(3, 4, 1, 7, "pkt").unwrap();
        let mut packet = header.to_vec();
        packet.extend_from_slice(&[0u8; 8]);
        let parsed = parse_header(&packet).unwrap();
        assert_eq!(parsed.samples, 4);
        assert_eq!(parsed.frame_counter, 7);
    }
}
