/*
 * Meeting Pipeline - VBAN UDP Audio Transport
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

pub mod protocol;
pub mod receiver;
pub mod sender;

pub use protocol::{build_header, parse_header, sr_index, VbanError, VbanHeader};
pub use receiver::WavCapture;
pub use sender::VbanSender;
