// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decode-session controller for stateful V4L2 memory-to-memory video decoders.
//!
//! Encoded access units are pulled from a [`bitstream_utils::BitstreamSource`] and queued on the
//! OUTPUT queue of a [`device::DecoderDevice`], decoded frames are retrieved from the CAPTURE
//! queue, given a presentation timestamp by the [`timestamp::TimestampReconciler`] and handed to a
//! [`session::FrameSink`]. Resolution changes signaled by the decoder are handled by the
//! [`reconfig::ReconfigMachine`] while the stream keeps flowing.
//!
//! [`scheduler::EventScheduler`] ties all of this into a single-threaded, poll-driven loop.

pub mod allocator;
pub mod bitstream_utils;
pub mod buffer_pool;
pub mod device;
pub mod event;
pub mod image_processing;
pub mod queue;
pub mod reconfig;
pub mod scheduler;
pub mod session;
pub mod timestamp;
pub mod utils;

use std::fmt;
use std::str::FromStr;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Returns `true` if one of the dimensions is zero.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self { width: value.0, height: value.1 }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A V4L2-style four character code.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct Fourcc(pub u32);

impl From<&[u8; 4]> for Fourcc {
    fn from(n: &[u8; 4]) -> Self {
        Self(u32::from_le_bytes(*n))
    }
}

impl From<u32> for Fourcc {
    fn from(n: u32) -> Self {
        Self(n)
    }
}

impl From<Fourcc> for u32 {
    fn from(fourcc: Fourcc) -> Self {
        fourcc.0
    }
}

impl fmt::Display for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.to_le_bytes();
        for b in bytes {
            let c = if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fourcc({self})")
    }
}

/// Pixel format produced on the CAPTURE queue.
pub const NV12_FOURCC: Fourcc = Fourcc(u32::from_le_bytes(*b"NV12"));

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum EncodedFormat {
    H264,
    H265,
    VP8,
    VP9,
}

impl EncodedFormat {
    /// Fourcc used to negotiate this format on the OUTPUT queue.
    pub fn fourcc(&self) -> Fourcc {
        match self {
            EncodedFormat::H264 => Fourcc::from(b"H264"),
            EncodedFormat::H265 => Fourcc::from(b"HEVC"),
            EncodedFormat::VP8 => Fourcc::from(b"VP80"),
            EncodedFormat::VP9 => Fourcc::from(b"VP90"),
        }
    }
}

impl FromStr for EncodedFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "h264" | "H264" => Ok(EncodedFormat::H264),
            "h265" | "H265" | "hevc" | "HEVC" => Ok(EncodedFormat::H265),
            "vp8" | "VP8" => Ok(EncodedFormat::VP8),
            "vp9" | "VP9" => Ok(EncodedFormat::VP9),
            _ => Err("unrecognized input format. Valid values: h264, h265, vp8, vp9"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_display() {
        assert_eq!(Fourcc::from(b"NV12").to_string(), "NV12");
        assert_eq!(EncodedFormat::H265.fourcc().to_string(), "HEVC");
        assert_eq!(NV12_FOURCC, Fourcc::from(b"NV12"));
    }

    #[test]
    fn encoded_format_from_str() {
        assert_eq!("hevc".parse::<EncodedFormat>(), Ok(EncodedFormat::H265));
        assert!("av1".parse::<EncodedFormat>().is_err());
    }
}
