// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::Cursor;
use std::path::PathBuf;
use std::str::FromStr;

use argh::FromArgs;
use matroska_demuxer::Frame;
use matroska_demuxer::MatroskaFile;

use vidc_decode::bitstream_utils::BitstreamSource;
use vidc_decode::bitstream_utils::BitstreamUnit;
use vidc_decode::bitstream_utils::FrameClock;
use vidc_decode::bitstream_utils::SourceError;
use vidc_decode::timestamp::UnitTiming;
use vidc_decode::EncodedFormat;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Md5Computation {
    Stream,
    Frame,
}

impl FromStr for Md5Computation {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stream" => Ok(Md5Computation::Stream),
            "frame" => Ok(Md5Computation::Frame),
            _ => Err("unrecognized MD5 computation option. Valid values: stream, frame"),
        }
    }
}

/// Frame rate given as `num/den` or as a plain number of frames per second.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct FrameRate(pub u32, pub u32);

impl FromStr for FrameRate {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const ERR: &str = "invalid frame rate, expected NUM or NUM/DEN";

        let (num, den) = match s.split_once('/') {
            Some((num, den)) => (num, den),
            None => (s, "1"),
        };
        let num = num.trim().parse().map_err(|_| ERR)?;
        let den = den.trim().parse().map_err(|_| ERR)?;
        if num == 0 || den == 0 {
            return Err(ERR);
        }

        Ok(FrameRate(num, den))
    }
}

/// Decodes a video stream with a Qualcomm V4L2 decoder.
#[derive(Debug, FromArgs)]
pub struct Args {
    /// input file
    #[argh(positional)]
    pub input: PathBuf,

    /// input format to decode from.
    #[argh(option)]
    pub input_format: EncodedFormat,

    /// path to the video decoder node. Default: /dev/video32
    #[argh(option, default = "PathBuf::from(\"/dev/video32\")")]
    pub device: PathBuf,

    /// path to the ION device the buffers are allocated from. Default: /dev/ion
    #[argh(option, default = "PathBuf::from(\"/dev/ion\")")]
    pub ion_device: PathBuf,

    /// frame rate of the stream (NUM or NUM/DEN), used when the container does not carry one
    #[argh(option)]
    pub frame_rate: Option<FrameRate>,

    /// return frames in decode order instead of display order
    #[argh(switch)]
    pub decode_order: bool,

    /// let the decoder skip non-reference frames
    #[argh(switch)]
    pub skip_frames: bool,

    /// output file to write the decoded NV12 frames to
    #[argh(option)]
    pub output: Option<PathBuf>,

    /// whether to display the MD5 of the decoded stream, and at which granularity (stream or
    /// frame)
    #[argh(option)]
    pub compute_md5: Option<Md5Computation>,

    /// print the CRC32 of every decoded frame
    #[argh(switch)]
    pub frame_crc: bool,
}

/// Frames of the first video track of a Matroska file.
pub struct MkvSource {
    input: MatroskaFile<Cursor<Vec<u8>>>,
    video_track: u64,
    /// Nanoseconds per timestamp tick.
    timestamp_scale: u64,
    clock: FrameClock,
}

impl MkvSource {
    pub fn new(input: Vec<u8>, frame_rate: Option<(u32, u32)>) -> anyhow::Result<Self> {
        let input = MatroskaFile::open(Cursor::new(input))?;
        let video_track = input
            .tracks()
            .iter()
            .find(|t| t.track_type() == matroska_demuxer::TrackType::Video)
            .map(|t| t.track_number().get())
            .ok_or_else(|| anyhow::anyhow!("no video track in input file"))?;
        let timestamp_scale = input.info().timestamp_scale().get();

        Ok(Self {
            input,
            video_track,
            timestamp_scale,
            clock: FrameClock::new(frame_rate.unwrap_or(FrameClock::DEFAULT_FRAME_RATE)),
        })
    }
}

impl BitstreamSource for MkvSource {
    fn next_unit(&mut self) -> Result<Option<BitstreamUnit>, SourceError> {
        let mut frame = Frame::default();
        loop {
            let more = self
                .input
                .next_frame(&mut frame)
                .map_err(|e| SourceError::Container(anyhow::anyhow!(e)))?;
            if !more {
                return Ok(None);
            }
            if frame.track == self.video_track {
                break;
            }
        }

        let timing = block_timing(
            frame.timestamp,
            frame.duration,
            self.timestamp_scale,
            self.clock.frame_duration(),
        );

        Ok(Some(BitstreamUnit {
            data: std::mem::take(&mut frame.data),
            is_config: false,
            timing,
        }))
    }
}

/// Timing in microseconds of a Matroska block, from its timestamp and duration in units of
/// `timestamp_scale` nanoseconds.
fn block_timing(
    timestamp: u64,
    duration: Option<u64>,
    timestamp_scale: u64,
    default_duration: u64,
) -> UnitTiming {
    let timestamp = timestamp.saturating_mul(timestamp_scale) / 1000;
    let duration = match duration {
        Some(duration) => duration.saturating_mul(timestamp_scale) / 1000,
        None => default_duration,
    };

    // VP8 and VP9 blocks are never reordered, the block timestamp is also the decode timestamp.
    UnitTiming { dts: Some(timestamp), pts: Some(timestamp), duration }
}

/// Whether `input` starts with the EBML magic of Matroska files.
pub fn is_matroska(input: &[u8]) -> bool {
    input.starts_with(&[0x1a, 0x45, 0xdf, 0xa3])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rate_parsing() {
        assert_eq!("30".parse(), Ok(FrameRate(30, 1)));
        assert_eq!("30000/1001".parse(), Ok(FrameRate(30000, 1001)));
        assert!("0".parse::<FrameRate>().is_err());
        assert!("25/0".parse::<FrameRate>().is_err());
        assert!("fast".parse::<FrameRate>().is_err());
    }

    #[test]
    fn container_detection() {
        assert!(is_matroska(&[0x1a, 0x45, 0xdf, 0xa3, 0x01]));
        assert!(!is_matroska(b"DKIF"));
    }

    #[test]
    fn matroska_blocks_carry_decode_timestamps() {
        // Millisecond timestamp scale.
        let timing = block_timing(40, Some(20), 1_000_000, 33_333);
        assert_eq!(timing, UnitTiming { dts: Some(40_000), pts: Some(40_000), duration: 20_000 });

        let timing = block_timing(0, None, 1_000_000, 33_333);
        assert_eq!(timing.duration, 33_333);
        assert_eq!(timing.dts, timing.pts);
    }
}
