/*
 * Meeting Pipeline - Audio Capture
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

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Device preference order for auto-selection. BlackHole carries routed
/// app audio and pairs with a real mic for full-conversation capture; the
/// app virtual devices carry remote participants only.
pub const DEVICE_PREFERENCE: [&str; 3] = ["BlackHole 2ch", "ZoomAudioDevice", "Microsoft Teams"];

/// Name fragments that mark a virtual device, excluded from mic selection.
pub const VIRTUAL_DEVICE_MARKERS: [&str; 3] = ["blackhole", "zoom", "teams"];

/// Blocks buffered between an audio callback and the mixer. At 48kHz with
/// ~10ms callbacks this is a few hundred milliseconds of slack.
const QUEUE_CAPACITY: usize = 32;

pub const DEFAULT_MIC_GAIN: f32 = 1.0;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("No input device matching '{0}'")]
    DeviceNotFound(String),

    #[error("Ambiguous: multiple devices match '{query}': {matches}")]
    AmbiguousDevice { query: String, matches: String },

    #[error("Failed to open device '{device}': {detail}")]
    DeviceBusy { device: String, detail: String },

    #[error("Audio stream error: {0}")]
    Stream(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub channels: u16,
    pub sample_rate: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureQuality {
    /// Both sides of the conversation (routed app audio + mic mixed).
    Full,
    /// Remote participants only.
    Partial,
}

pub fn is_virtual_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    VIRTUAL_DEVICE_MARKERS.iter().any(|m| lower.contains(m))
}

/// Enumerate the host's audio input devices.
pub fn list_input_devices() -> Result<Vec<Device>, AudioError> {
    let host = cpal::default_host();
    let mut devices = Vec::new();

    let inputs = host
        .input_devices()
        .map_err(|e| AudioError::Stream(e.to_string()))?;
    for device in inputs {
        let name = match device.name() {
            Ok(name) => name,
            Err(_) => continue,
        };
        let (channels, sample_rate) = match device.default_input_config() {
            Ok(config) => (config.channels(), config.sample_rate().0),
            Err(_) => continue,
        };
        devices.push(Device {
            id: name.clone(),
            name,
            channels,
            sample_rate,
        });
    }
    Ok(devices)
}

/// Resolve a device by case-insensitive substring match. When several
/// devices match, a unique prefix match wins; otherwise the ambiguity is
/// an error listing the candidates.
pub fn match_device<'a>(devices: &'a [Device], query: &str) -> Result<&'a Device, AudioError> {
    let needle = query.to_lowercase();
    let matches: Vec<&Device> = devices
        .iter()
        .filter(|d| d.name.to_lowercase().contains(&needle))
        .collect();

    match matches.len() {
        0 => Err(AudioError::DeviceNotFound(query.to_string())),
        1 => Ok(matches[0]),
        _ => {
            let prefix: Vec<&&Device> = matches
                .iter()
                .filter(|d| d.name.to_lowercase().starts_with(&needle))
                .collect();
            if prefix.len() == 1 {
                return Ok(prefix[0]);
            }
            Err(AudioError::AmbiguousDevice {
                query: query.to_string(),
                matches: matches
                    .iter()
                    .map(|d| d.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            })
        }
    }
}

pub fn find_input_device(query: &str) -> Result<Device, AudioError> {
    let devices = list_input_devices()?;
    match_device(&devices, query).cloned()
}

/// Pick the best capture device by preference order.
pub fn find_best_device() -> Option<(Device, CaptureQuality)> {
    let devices = list_input_devices().ok()?;
    pick_best_device(&devices)
}

pub fn pick_best_device(devices: &[Device]) -> Option<(Device, CaptureQuality)> {
    for pref in DEVICE_PREFERENCE {
        let needle = pref.to_lowercase();
        if let Some(device) = devices
            .iter()
            .find(|d| d.name.to_lowercase().contains(&needle))
        {
            let quality = if device.name.to_lowercase().contains("blackhole") {
                CaptureQuality::Full
            } else {
                CaptureQuality::Partial
            };
            return Some((device.clone(), quality));
        }
    }
    None
}

/// Find the microphone for dual-input mixing: the system default input
/// unless it is a virtual device, else the first physical input.
pub fn find_mic_device() -> Option<Device> {
    let host = cpal::default_host();
    if let Some(default) = host.default_input_device() {
        if let Ok(name) = default.name() {
            if !is_virtual_device(&name) {
                if let Ok(config) = default.default_input_config() {
                    return Some(Device {
                        id: name.clone(),
                        name,
                        channels: config.channels(),
                        sample_rate: config.sample_rate().0,
                    });
                }
            }
        }
    }

    list_input_devices()
        .ok()?
        .into_iter()
        .find(|d| !is_virtual_device(&d.name))
}

/// Sum a primary block with an optional mic block.
///
/// The primary block is the time base: the mic is trimmed or zero-padded
/// to the primary's length, scaled by `mic_gain`, and the sum is
/// hard-clipped to [-1.0, 1.0].
pub fn mix_blocks(primary: &[f32], mic: Option<&[f32]>, mic_gain: f32) -> Vec<f32> {
    match mic {
        None => primary.to_vec(),
        Some(mic) => primary
            .iter()
            .enumerate()
            .map(|(i, &s)| {
                let m = mic.get(i).copied().unwrap_or(0.0);
                (s + m * mic_gain).clamp(-1.0, 1.0)
            })
            .collect(),
    }
}

/// Average interleaved frames down to mono.
pub fn downmix_to_mono(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Dual-source capture: the primary device is the time base, the mic is
/// best-effort. Audio callbacks only downmix and enqueue onto bounded
/// drop-oldest channels; they never block on I/O or take locks.
///
/// cpal streams are not Send, so a DualCapture must be opened and drained
/// on the same thread.
pub struct DualCapture {
    primary_rx: Receiver<Vec<f32>>,
    mic_rx: Option<Receiver<Vec<f32>>>,
    error_rx: Receiver<String>,
    mic_gain: f32,
    _streams: Vec<cpal::Stream>,
}

impl DualCapture {
    pub fn open(
        primary: &Device,
        mic: Option<&Device>,
        sample_rate: u32,
        block_frames: usize,
        mic_gain: f32,
    ) -> Result<Self, AudioError> {
        let (error_tx, error_rx) = bounded::<String>(8);
        let mut streams = Vec::new();

        let (primary_tx, primary_rx) = bounded::<Vec<f32>>(QUEUE_CAPACITY);
        streams.push(open_input_stream(
            primary,
            sample_rate,
            block_frames,
            primary_tx,
            error_tx.clone(),
        )?);

        let mic_rx = match mic {
            Some(mic) => {
                let (mic_tx, mic_rx) = bounded::<Vec<f32>>(QUEUE_CAPACITY);
                streams.push(open_input_stream(
                    mic,
                    sample_rate,
                    block_frames,
                    mic_tx,
                    error_tx,
                )?);
                Some(mic_rx)
            }
            None => None,
        };

        Ok(Self {
            primary_rx,
            mic_rx,
            error_rx,
            mic_gain,
            _streams: streams,
        })
    }

    /// Wait briefly for the next primary block and mix the mic into it.
    /// Returns Ok(None) on a quiet interval; a device error is fatal for
    /// the capture.
    pub fn next_block(&mut self, timeout: Duration) -> Result<Option<Vec<f32>>, AudioError> {
        if let Ok(error) = self.error_rx.try_recv() {
            return Err(AudioError::Stream(error));
        }

        let primary = match self.primary_rx.recv_timeout(timeout) {
            Ok(block) => block,
            Err(RecvTimeoutError::Timeout) => return Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(AudioError::Stream("capture stream closed".into()));
            }
        };

        // Mic is taken non-blocking: a missing mic block must not stall
        // the stream, mix_blocks zero-fills the gap.
        let mic = match &self.mic_rx {
            Some(rx) => rx.try_recv().ok(),
            None => None,
        };

        Ok(Some(mix_blocks(&primary, mic.as_deref(), self.mic_gain)))
    }
}

fn open_input_stream(
    device: &Device,
    sample_rate: u32,
    block_frames: usize,
    tx: Sender<Vec<f32>>,
    error_tx: Sender<String>,
) -> Result<cpal::Stream, AudioError> {
    let host = cpal::default_host();
    let cpal_device = host
        .input_devices()
        .map_err(|e| AudioError::Stream(e.to_string()))?
        .find(|d| d.name().map(|n| n == device.name).unwrap_or(false))
        .ok_or_else(|| AudioError::DeviceNotFound(device.name.clone()))?;

    let channels = device.channels.max(1);
    let config = cpal::StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Fixed(block_frames as u32),
    };

    let name = device.name.clone();
    let error_name = device.name.clone();
    let stream = cpal_device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let block = downmix_to_mono(data, channels as usize);
                // Drop-oldest so the real-time callback never blocks.
                if let Err(TrySendError::Full(block)) = tx.try_send(block) {
                    let _ = tx.try_recv();
                    let _ = tx.try_send(block);
                }
            },
            move |err| {
                let _ = error_tx.try_send(format!("{}: {}", error_name, err));
            },
            None,
        )
        .map_err(|e| AudioError::DeviceBusy {
            device: name.clone(),
            detail: e.to_string(),
        })?;

    stream.play().map_err(|e| AudioError::DeviceBusy {
        device: name,
        detail: e.to_string(),
    })?;

    Ok(stream)
}
