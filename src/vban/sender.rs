/*
 * Meeting Pipeline - VBAN Sender
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

use anyhow::{Context, Result};
use std::net::{SocketAddr, UdpSocket};
use std::time::Instant;

use super::protocol::{build_header, sr_index, MAX_SAMPLES_PER_PACKET, VBAN_HEADER_SIZE};

const STATS_INTERVAL_SECS: u64 = 10;

/// Streams mono float32 blocks as VBAN packets over UDP.
///
/// One datagram carries one header plus one PCM block of at most 256
/// samples. The frame counter wraps; it exists for observability, not gap
/// recovery. Send errors are logged and the packet is dropped - the sender
/// never retries a datagram.
pub struct VbanSender {
    socket: UdpSocket,
    target: SocketAddr,
    sr_idx: u8,
    channels: usize,
    stream_name: String,
    frame_counter: u32,
    packets_sent: u64,
    last_report: Instant,
}

impl VbanSender {
    pub fn new(
        target: SocketAddr,
        sample_rate: u32,
        channels: usize,
        stream_name: &str,
    ) -> Result<Self> {
        let sr_idx = sr_index(sample_rate)?;
        // Validate the header parameters once up front so per-block sends
        // cannot fail on anything but the socket.
        build_header(sr_idx, MAX_SAMPLES_PER_PACKET, channels, 0, stream_name)?;

        let socket = UdpSocket::bind("0.0.0.0:0").context("Failed to open UDP send socket")?;

        tracing::info!(
            "VBAN sender ready: target={} stream={} {}Hz {}ch int16 {} samples/pkt",
            target,
            stream_name,
            sample_rate,
            channels,
            MAX_SAMPLES_PER_PACKET
        );

        Ok(Self {
            socket,
            target,
            sr_idx,
            channels,
            stream_name: stream_name.to_string(),
            frame_counter: 0,
            packets_sent: 0,
            last_report: Instant::now(),
        })
    }

    /// Convert a block of mono float32 samples to int16 and send it as one
    /// or more VBAN packets.
    pub fn send_block(&mut self, samples: &[f32]) {
        let mut packet = Vec::with_capacity(VBAN_HEADER_SIZE + MAX_SAMPLES_PER_PACKET * 2);

        for chunk in samples.chunks(MAX_SAMPLES_PER_PACKET) {
            let header = match build_header(
                self.sr_idx,
                chunk.len(),
                self.channels,
                self.frame_counter,
                &self.stream_name,
            ) {
                Ok(header) => header,
                Err(e) => {
                    tracing::error!("Failed to build VBAN header: {}", e);
                    return;
                }
            };

            packet.clear();
            packet.extend_from_slice(&header);
            for &sample in chunk {
                let pcm = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
                packet.extend_from_slice(&pcm.to_le_bytes());
            }

            match self.socket.send_to(&packet, self.target) {
                Ok(_) => {
                    self.frame_counter = self.frame_counter.wrapping_add(1);
                    self.packets_sent += 1;
                }
                Err(e) => {
                    tracing::error!("Send error: {}", e);
                }
            }
        }

        let elapsed = self.last_report.elapsed();
        if elapsed.as_secs() >= STATS_INTERVAL_SECS {
            let pps = self.packets_sent as f64 / elapsed.as_secs_f64();
            tracing::info!("Stats: {} packets sent ({:.0}/s)", self.packets_sent, pps);
            self.packets_sent = 0;
            self.last_report = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vban::protocol::parse_header;

    #[test]
    fn sender_rejects_unsupported_rate() {
        let target: SocketAddr = "127.0.0.1:6980".parse().unwrap();
        assert!(VbanSender::new(target, 44000, 1, "MeetingAudio").is_err());
    }

    #[test]
    fn blocks_are_segmented_and_counted() {
        // Loop a sender back into a local socket and check segmentation.
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        let target = receiver.local_addr().unwrap();

        let mut sender = VbanSender::new(target, 48000, 1, "TestStream").unwrap();
        // 300 samples -> one full 256-sample packet plus a 44-sample tail.
        sender.send_block(&vec![0.5f32; 300]);

        let mut buf = [0u8; 2048];
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        let first = parse_header(&buf[..n]).unwrap();
        assert_eq!(first.samples, 256);
        assert_eq!(first.frame_counter, 0);
        assert_eq!(n, VBAN_HEADER_SIZE + 256 * 2);

        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        let second = parse_header(&buf[..n]).unwrap();
        assert_eq!(second.samples, 44);
        assert_eq!(second.frame_counter, 1);
        assert_eq!(n, VBAN_HEADER_SIZE + 44 * 2);
    }
}
