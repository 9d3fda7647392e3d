/*
 * Meeting Pipeline - VBAN Receiver
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
use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::protocol::{parse_header, VBAN_HEADER_SIZE};

const RECV_TIMEOUT: Duration = Duration::from_secs(1);
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
const STALE_STREAM_SECS: u64 = 5;
const STATS_INTERVAL_SECS: u64 = 10;

/// Receives a VBAN stream on a UDP port and writes the PCM payload to a
/// WAV file whose header is finalized on stop.
///
/// Packets are written in arrival order; there is no reordering by frame
/// counter and no gap insertion. The WAV format is derived from the first
/// valid frame; subsequent frames are appended as-is, trusting the
/// sender's consistency.
pub struct WavCapture {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<u64>>>,
    path: PathBuf,
}

impl WavCapture {
    /// Bind the UDP port and launch the capture thread.
    pub fn start(path: &Path, port: u16, stream_name: &str) -> Result<Self> {
        let socket = bind_reusable(port)
            .with_context(|| format!("Failed to bind VBAN port {}", port))?;
        socket
            .set_read_timeout(Some(RECV_TIMEOUT))
            .context("Failed to set recv timeout")?;

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let thread_path = path.to_path_buf();
        let thread_stream = stream_name.to_string();

        tracing::info!(
            "VBAN capture listening on UDP {} for stream '{}' -> {}",
            port,
            stream_name,
            path.display()
        );

        let handle = std::thread::Builder::new()
            .name("vban-capture".into())
            .spawn(move || capture_loop(socket, &thread_path, &thread_stream, &thread_stop))
            .context("Failed to spawn VBAN capture thread")?;

        Ok(Self {
            stop,
            handle: Some(handle),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Signal the capture thread to stop, join it within a bounded wait,
    /// and finalize the WAV. Returns the number of packets written.
    pub fn stop(mut self) -> Result<u64> {
        self.stop.store(true, Ordering::Relaxed);

        let handle = match self.handle.take() {
            Some(handle) => handle,
            None => return Ok(0),
        };

        // The recv timeout guarantees the loop observes the flag within a
        // second; the deadline here only covers WAV finalization.
        let deadline = Instant::now() + STOP_JOIN_TIMEOUT;
        while !handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        if !handle.is_finished() {
            tracing::warn!("VBAN capture thread slow to stop, joining anyway");
        }

        match handle.join() {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("VBAN capture thread panicked")),
        }
    }
}

impl Drop for WavCapture {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// Bind a UDP socket with SO_REUSEADDR so a restarted appliance can
/// re-grab the port immediately.
fn bind_reusable(port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

fn capture_loop(
    socket: UdpSocket,
    path: &Path,
    stream_name: &str,
    stop: &AtomicBool,
) -> Result<u64> {
    let mut writer: Option<hound::WavWriter<std::io::BufWriter<std::fs::File>>> = None;
    let mut buf = [0u8; 2048];
    let mut receiving = false;
    let mut packets_written: u64 = 0;
    let mut packets_since_report: u64 = 0;
    let mut last_report = Instant::now();
    let mut last_packet = Instant::now();

    while !stop.load(Ordering::Relaxed) {
        let (n, addr) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                if receiving && last_packet.elapsed().as_secs() > STALE_STREAM_SECS {
                    tracing::info!("Stream idle for {}s, waiting for packets...", STALE_STREAM_SECS);
                    receiving = false;
                }
                continue;
            }
            Err(e) => {
                return Err(e).context("UDP recv failed");
            }
        };

        let header = match parse_header(&buf[..n]) {
            Some(header) => header,
            None => continue,
        };

        if header.stream_name != stream_name {
            tracing::debug!("Ignoring stream '{}' from {}", header.stream_name, addr);
            continue;
        }

        if writer.is_none() {
            let spec = hound::WavSpec {
                channels: header.channels,
                sample_rate: header.sample_rate,
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int,
            };
            writer = Some(
                hound::WavWriter::create(path, spec)
                    .with_context(|| format!("Failed to create WAV at {}", path.display()))?,
            );
            tracing::info!(
                "Receiving from {} - {}Hz, {}ch",
                addr,
                header.sample_rate,
                header.channels
            );
        }

        if !receiving {
            receiving = true;
        }
        last_packet = Instant::now();

        if let Some(ref mut wav) = writer {
            let pcm = &buf[VBAN_HEADER_SIZE..n];
            for pair in pcm.chunks_exact(2) {
                wav.write_sample(i16::from_le_bytes([pair[0], pair[1]]))
                    .context("WAV write failed")?;
            }
        }

        packets_written += 1;
        packets_since_report += 1;

        if last_report.elapsed().as_secs() >= STATS_INTERVAL_SECS {
            tracing::info!("Stats: {} pkts recv", packets_since_report);
            packets_since_report = 0;
            last_report = Instant::now();
        }
    }

    if let Some(wav) = writer {
        wav.finalize().context("Failed to finalize WAV")?;
    }

    tracing::info!("VBAN capture stopped: {} packets written", packets_written);
    Ok(packets_written)
}
