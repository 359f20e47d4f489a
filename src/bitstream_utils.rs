// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bitstream sources feeding a decoding session.
//!
//! A [`BitstreamSource`] hands out the stream one decodable unit at a time. Two sources are
//! provided: [`AnnexBSource`] splits H.264 and H.265 elementary streams into access units, and
//! [`IvfSource`] reads the frames of a VP8 or VP9 IVF file.

use std::collections::VecDeque;

use bitreader::BitReader;
use bytes::Buf;
use thiserror::Error;

use crate::timestamp::UnitTiming;
use crate::EncodedFormat;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid IVF header: {0}")]
    InvalidIvfHeader(&'static str),
    #[error("IVF frame {index} is truncated: {size} bytes announced, {available} available")]
    TruncatedIvfFrame { index: u64, size: usize, available: usize },
    #[error("{0:?} streams are not Annex-B")]
    NotAnnexB(EncodedFormat),
    #[error("container error: {0}")]
    Container(anyhow::Error),
}

/// One unit of bitstream, to be queued in a single OUTPUT buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BitstreamUnit {
    pub data: Vec<u8>,
    /// The unit only carries codec configuration and will not produce a frame.
    pub is_config: bool,
    pub timing: UnitTiming,
}

/// Lazy, finite source of bitstream units.
pub trait BitstreamSource {
    /// Returns the next unit, or `None` once the stream is exhausted.
    fn next_unit(&mut self) -> Result<Option<BitstreamUnit>, SourceError>;
}

impl<S: BitstreamSource + ?Sized> BitstreamSource for Box<S> {
    fn next_unit(&mut self) -> Result<Option<BitstreamUnit>, SourceError> {
        (**self).next_unit()
    }
}

/// Synthesizes decode timestamps for streams that carry none.
#[derive(Copy, Clone, Debug)]
pub struct FrameClock {
    numerator: u64,
    denominator: u64,
    count: u64,
}

impl FrameClock {
    /// Frame rate used when the stream does not say.
    pub const DEFAULT_FRAME_RATE: (u32, u32) = (30, 1);

    /// `frame_rate` is `(numerator, denominator)` in frames per second.
    pub fn new(frame_rate: (u32, u32)) -> Self {
        let (numerator, denominator) = match frame_rate {
            (0, _) | (_, 0) => Self::DEFAULT_FRAME_RATE,
            rate => rate,
        };

        Self { numerator: numerator as u64, denominator: denominator as u64, count: 0 }
    }

    /// Duration of one frame in microseconds.
    pub fn frame_duration(&self) -> u64 {
        1_000_000 * self.denominator / self.numerator
    }

    /// Timing of the next frame. Only the decode timestamp is known.
    pub fn tick(&mut self) -> UnitTiming {
        let dts = self.count * 1_000_000 * self.denominator / self.numerator;
        self.count += 1;

        UnitTiming { dts: Some(dts), pts: None, duration: self.frame_duration() }
    }
}

/// Returns the position of the first `00 00 01` start code in `data`.
fn find_start_code(data: &[u8]) -> Option<usize> {
    data.windows(3).position(|window| window == [0x00, 0x00, 0x01])
}

/// Reads an unsigned Exp-Golomb value.
fn read_ue(reader: &mut BitReader) -> Option<u32> {
    let mut leading_zeros = 0;
    while !reader.read_bool().ok()? {
        leading_zeros += 1;
        if leading_zeros > 31 {
            return None;
        }
    }

    let suffix = if leading_zeros == 0 { 0 } else { reader.read_u32(leading_zeros).ok()? };
    ((1u32 << leading_zeros) - 1).checked_add(suffix)
}

/// Position of a NAL unit in the stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct NalSpan {
    /// Offset of the start code, including the optional leading zero byte.
    sc_offset: usize,
    /// Offset of the NAL header.
    offset: usize,
    /// End of the NAL unit, trailing zero bytes excluded.
    end: usize,
    nal_type: u8,
    /// Whether this is a slice that starts a new picture.
    first_slice: bool,
}

/// NAL unit classification for the codecs with an Annex-B syntax.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum NalSyntax {
    H264,
    H265,
}

impl NalSyntax {
    fn header_len(self) -> usize {
        match self {
            NalSyntax::H264 => 1,
            NalSyntax::H265 => 2,
        }
    }

    fn nal_type(self, header: u8) -> u8 {
        match self {
            NalSyntax::H264 => header & 0x1f,
            NalSyntax::H265 => (header >> 1) & 0x3f,
        }
    }

    fn is_slice(self, nal_type: u8) -> bool {
        match self {
            NalSyntax::H264 => (1..=5).contains(&nal_type),
            NalSyntax::H265 => nal_type <= 9 || (16..=21).contains(&nal_type),
        }
    }

    fn is_parameter_set(self, nal_type: u8) -> bool {
        match self {
            NalSyntax::H264 => matches!(nal_type, 7 | 8),
            NalSyntax::H265 => matches!(nal_type, 32..=34),
        }
    }

    /// Access unit delimiter.
    fn is_delimiter(self, nal_type: u8) -> bool {
        match self {
            NalSyntax::H264 => nal_type == 9,
            NalSyntax::H265 => nal_type == 35,
        }
    }

    /// End of sequence or end of stream, closing the current access unit.
    fn is_end(self, nal_type: u8) -> bool {
        match self {
            NalSyntax::H264 => matches!(nal_type, 10 | 11),
            NalSyntax::H265 => matches!(nal_type, 36 | 37),
        }
    }

    /// Non-VCL units that, when found after a picture, belong to the next access unit.
    fn specifies_new_au(self, nal_type: u8) -> bool {
        match self {
            NalSyntax::H264 => matches!(nal_type, 6..=8 | 14..=18),
            NalSyntax::H265 => matches!(nal_type, 32..=34 | 39 | 41..=44),
        }
    }

    /// Whether the slice whose payload (after the NAL header) is `payload` starts a picture.
    fn starts_picture(self, payload: &[u8]) -> bool {
        let mut reader = BitReader::new(payload);
        match self {
            // first_mb_in_slice
            NalSyntax::H264 => read_ue(&mut reader) == Some(0),
            // first_slice_segment_in_pic_flag
            NalSyntax::H265 => reader.read_bool().unwrap_or(false),
        }
    }
}

/// Splits an H.264 or H.265 Annex-B elementary stream into access units.
///
/// Parameter sets found before the first picture are returned as a separate codec configuration
/// unit. Later parameter sets are sent along with the picture that follows them.
pub struct AnnexBSource {
    data: Vec<u8>,
    pos: usize,
    syntax: NalSyntax,
    clock: FrameClock,
    nalus: Vec<NalSpan>,
    picture_started: bool,
    config_sent: bool,
    ready: VecDeque<BitstreamUnit>,
}

impl AnnexBSource {
    pub fn new(
        data: Vec<u8>,
        format: EncodedFormat,
        frame_rate: Option<(u32, u32)>,
    ) -> Result<Self, SourceError> {
        let syntax = match format {
            EncodedFormat::H264 => NalSyntax::H264,
            EncodedFormat::H265 => NalSyntax::H265,
            format => return Err(SourceError::NotAnnexB(format)),
        };

        Ok(Self {
            data,
            pos: 0,
            syntax,
            clock: FrameClock::new(frame_rate.unwrap_or(FrameClock::DEFAULT_FRAME_RATE)),
            nalus: Vec::new(),
            picture_started: false,
            config_sent: false,
            ready: VecDeque::new(),
        })
    }

    fn next_nalu(&mut self) -> Option<NalSpan> {
        loop {
            let data = &self.data[self.pos..];
            let start = self.pos + find_start_code(data)?;
            let offset = start + 3;

            // Four-byte start code.
            let sc_offset = if start > 0 && self.data[start - 1] == 0 { start - 1 } else { start };

            let mut end = match find_start_code(&self.data[offset..]) {
                Some(len) => offset + len,
                None => self.data.len(),
            };
            self.pos = end;

            // trailing_zero_8bits
            while end > offset && self.data[end - 1] == 0 {
                end -= 1;
            }

            let header_len = self.syntax.header_len();
            if end < offset + header_len {
                log::debug!("Skipping empty NAL unit at {}", offset);
                continue;
            }

            let nal_type = self.syntax.nal_type(self.data[offset]);
            let first_slice = self.syntax.is_slice(nal_type)
                && self.syntax.starts_picture(&self.data[offset + header_len..end]);

            return Some(NalSpan { sc_offset, offset, end, nal_type, first_slice });
        }
    }

    /// Takes the first `len` accumulated NAL units out as an access unit.
    fn collect(&mut self, len: usize) -> Vec<NalSpan> {
        let au: Vec<NalSpan> = self.nalus.drain(..len).collect();

        log::debug!(
            "Collecting access unit: (type, size) {:?}",
            au.iter().map(|n| (n.nal_type, n.end - n.offset)).collect::<Vec<_>>()
        );

        if !self.nalus.iter().any(|n| self.syntax.is_slice(n.nal_type)) {
            self.picture_started = false;
        }

        au
    }

    /// Adds `nalu` to the current access unit. Returns the previous access unit if `nalu`
    /// completed it.
    fn accumulate(&mut self, nalu: NalSpan) -> Option<Vec<NalSpan>> {
        let syntax = self.syntax;
        self.nalus.push(nalu);
        let len = self.nalus.len();

        if !self.picture_started {
            self.picture_started = syntax.is_slice(nalu.nal_type);
            return None;
        }

        if syntax.is_end(nalu.nal_type) {
            return Some(self.collect(len));
        }

        if syntax.is_delimiter(nalu.nal_type)
            || syntax.specifies_new_au(nalu.nal_type)
            || nalu.first_slice
        {
            let au = self.collect(len - 1);
            // The unit that closed the previous access unit may itself open the next picture.
            self.picture_started = syntax.is_slice(nalu.nal_type);
            return Some(au);
        }

        None
    }

    fn bytes(&self, nalus: &[NalSpan]) -> Vec<u8> {
        match (nalus.first(), nalus.last()) {
            (Some(first), Some(last)) => self.data[first.sc_offset..last.end].to_vec(),
            _ => Vec::new(),
        }
    }

    fn make_units(&mut self, nalus: Vec<NalSpan>) {
        let syntax = self.syntax;
        let has_slice = nalus.iter().any(|n| syntax.is_slice(n.nal_type));

        if !has_slice {
            let data = self.bytes(&nalus);
            let unit = BitstreamUnit { data, is_config: true, timing: Default::default() };
            self.ready.push_back(unit);
            return;
        }

        let mut picture = &nalus[..];
        if !self.config_sent {
            self.config_sent = true;
            let num_params =
                nalus.iter().take_while(|n| syntax.is_parameter_set(n.nal_type)).count();
            if num_params > 0 {
                let (params, rest) = nalus.split_at(num_params);
                let data = self.bytes(params);
                self.ready.push_back(BitstreamUnit {
                    data,
                    is_config: true,
                    timing: Default::default(),
                });
                picture = rest;
            }
        }

        let unit = BitstreamUnit {
            data: self.bytes(picture),
            is_config: false,
            timing: self.clock.tick(),
        };
        self.ready.push_back(unit);
    }
}

impl BitstreamSource for AnnexBSource {
    fn next_unit(&mut self) -> Result<Option<BitstreamUnit>, SourceError> {
        while self.ready.is_empty() {
            match self.next_nalu() {
                Some(nalu) => {
                    if let Some(au) = self.accumulate(nalu) {
                        self.make_units(au);
                    }
                }
                None if self.nalus.is_empty() => break,
                None => {
                    // Whatever is left forms the last access unit.
                    let au = std::mem::take(&mut self.nalus);
                    self.picture_started = false;
                    self.make_units(au);
                }
            }
        }

        Ok(self.ready.pop_front())
    }
}

/// Header of an IVF file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IvfFileHeader {
    pub magic: [u8; 4],
    pub version: u16,
    pub header_size: u16,
    pub codec: [u8; 4],
    pub width: u16,
    pub height: u16,
    /// Time base denominator.
    pub framerate: u32,
    /// Time base numerator.
    pub timescale: u32,
    pub frame_count: u32,
    pub unused: u32,
}

impl IvfFileHeader {
    pub const MAGIC: [u8; 4] = *b"DKIF";
    pub const CODEC_VP8: [u8; 4] = *b"VP80";
    pub const CODEC_VP9: [u8; 4] = *b"VP90";
    pub const LEN: usize = 32;

    /// Parses the header at the start of `buf`, leaving `buf` positioned on the first frame.
    pub fn parse<B: Buf>(buf: &mut B) -> Result<Self, SourceError> {
        if buf.remaining() < Self::LEN {
            return Err(SourceError::InvalidIvfHeader("file too short"));
        }

        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != Self::MAGIC {
            return Err(SourceError::InvalidIvfHeader("bad magic"));
        }

        let version = buf.get_u16_le();
        let header_size = buf.get_u16_le();
        let mut codec = [0u8; 4];
        buf.copy_to_slice(&mut codec);
        let header = Self {
            magic,
            version,
            header_size,
            codec,
            width: buf.get_u16_le(),
            height: buf.get_u16_le(),
            framerate: buf.get_u32_le(),
            timescale: buf.get_u32_le(),
            frame_count: buf.get_u32_le(),
            unused: buf.get_u32_le(),
        };

        if header.framerate == 0 || header.timescale == 0 {
            return Err(SourceError::InvalidIvfHeader("null time base"));
        }

        // Some writers use a larger header.
        let extra = (header_size as usize).saturating_sub(Self::LEN);
        if buf.remaining() < extra {
            return Err(SourceError::InvalidIvfHeader("header size past end of file"));
        }
        buf.advance(extra);

        Ok(header)
    }

    /// Converts a frame timestamp, in time base units, to microseconds.
    pub fn to_micros(&self, timestamp: u64) -> u64 {
        let micros =
            timestamp as u128 * self.timescale as u128 * 1_000_000 / self.framerate as u128;
        micros.min(u64::MAX as u128) as u64
    }
}

/// Size of the header preceding each frame of an IVF file.
const IVF_FRAME_HEADER_LEN: usize = 12;

/// Reads the frames of a VP8 or VP9 IVF file.
pub struct IvfSource {
    header: IvfFileHeader,
    data: bytes::Bytes,
    index: u64,
}

impl IvfSource {
    pub fn new(data: Vec<u8>) -> Result<Self, SourceError> {
        let mut data = bytes::Bytes::from(data);
        let header = IvfFileHeader::parse(&mut data)?;

        log::debug!(
            "IVF {} {}x{}, time base {}/{}, {} frames",
            String::from_utf8_lossy(&header.codec),
            header.width,
            header.height,
            header.timescale,
            header.framerate,
            header.frame_count
        );

        Ok(Self { header, data, index: 0 })
    }

    pub fn header(&self) -> &IvfFileHeader {
        &self.header
    }
}

impl BitstreamSource for IvfSource {
    fn next_unit(&mut self) -> Result<Option<BitstreamUnit>, SourceError> {
        if self.data.remaining() < IVF_FRAME_HEADER_LEN {
            if self.data.has_remaining() {
                log::warn!("Ignoring {} trailing bytes", self.data.remaining());
            }
            return Ok(None);
        }

        let size = self.data.get_u32_le() as usize;
        let timestamp = self.header.to_micros(self.data.get_u64_le());
        if self.data.remaining() < size {
            return Err(SourceError::TruncatedIvfFrame {
                index: self.index,
                size,
                available: self.data.remaining(),
            });
        }

        let frame = self.data.split_to(size);
        self.index += 1;

        Ok(Some(BitstreamUnit {
            data: frame.to_vec(),
            is_config: false,
            timing: UnitTiming {
                dts: Some(timestamp),
                pts: Some(timestamp),
                duration: self.header.to_micros(1),
            },
        }))
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;

    use super::*;

    fn collect<S: BitstreamSource>(mut source: S) -> Vec<BitstreamUnit> {
        let mut units = Vec::new();
        while let Some(unit) = source.next_unit().unwrap() {
            units.push(unit);
        }
        units
    }

    // SPS, PPS, IDR slice, then two P frames made of two slices each.
    const H264_STREAM: &[u8] = &[
        0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1e, // SPS
        0, 0, 0, 1, 0x68, 0xce, 0x38, 0x80, // PPS
        0, 0, 0, 1, 0x65, 0x88, 0x84, // IDR, first_mb_in_slice = 0
        0, 0, 1, 0x41, 0x9a, 0x02, // P, first_mb_in_slice = 0
        0, 0, 1, 0x41, 0x40, 0x02, // P, first_mb_in_slice = 1
        0, 0, 0, 1, 0x09, 0x10, // AUD
        0, 0, 1, 0x41, 0x9a, 0x03, // P, first_mb_in_slice = 0
        0, 0, 1, 0x41, 0x40, 0x03, 0x00, // P, first_mb_in_slice = 1, trailing zero
    ];

    #[test]
    fn h264_access_units() {
        let source = AnnexBSource::new(H264_STREAM.to_vec(), EncodedFormat::H264, None).unwrap();
        let units = collect(source);

        assert_eq!(units.len(), 4);
        assert!(units[0].is_config);
        assert_eq!(units[0].data, &H264_STREAM[..16]);
        assert_eq!(units[0].timing, UnitTiming::default());

        assert!(!units[1].is_config);
        assert_eq!(units[1].data, &H264_STREAM[16..23]);
        assert_eq!(units[2].data, &H264_STREAM[23..35]);
        // The delimiter opens the last access unit, the trailing zero is dropped.
        assert_eq!(units[3].data, &H264_STREAM[35..H264_STREAM.len() - 1]);

        let dts: Vec<_> = units[1..].iter().map(|u| u.timing.dts).collect();
        assert_eq!(dts, vec![Some(0), Some(33_333), Some(66_666)]);
        assert!(units[1..].iter().all(|u| u.timing.pts.is_none() && u.timing.duration == 33_333));
    }

    #[test]
    fn h265_access_units() {
        let stream: &[u8] = &[
            0, 0, 0, 1, 0x40, 0x01, 0x0c, // VPS
            0, 0, 0, 1, 0x42, 0x01, 0x01, // SPS
            0, 0, 0, 1, 0x44, 0x01, 0xc1, // PPS
            0, 0, 0, 1, 0x26, 0x01, 0xaf, // IDR_W_RADL, first slice
            0, 0, 0, 1, 0x26, 0x01, 0x20, // IDR_W_RADL, dependent slice
            0, 0, 0, 1, 0x44, 0x01, 0xc1, // PPS, in-band
            0, 0, 0, 1, 0x02, 0x01, 0xd0, // TRAIL_R, first slice
        ];
        let source =
            AnnexBSource::new(stream.to_vec(), EncodedFormat::H265, Some((25, 1))).unwrap();
        let units = collect(source);

        assert_eq!(units.len(), 3);
        assert!(units[0].is_config);
        assert_eq!(units[0].data, &stream[..21]);
        assert_eq!(units[1].data, &stream[21..35]);
        // In-band parameter sets stay with their picture.
        assert_eq!(units[2].data, &stream[35..]);
        assert!(!units[2].is_config);
        assert_eq!(units[2].timing.dts, Some(40_000));
    }

    #[test]
    fn garbage_is_not_a_unit() {
        let source = AnnexBSource::new(vec![1, 2, 3, 4, 5], EncodedFormat::H264, None).unwrap();
        assert!(collect(source).is_empty());
        assert!(AnnexBSource::new(Vec::new(), EncodedFormat::VP9, None).is_err());
    }

    fn ivf_stream(frames: &[(&[u8], u64)]) -> Vec<u8> {
        let mut data = Vec::new();
        data.put_slice(&IvfFileHeader::MAGIC);
        data.put_u16_le(0);
        data.put_u16_le(IvfFileHeader::LEN as u16);
        data.put_slice(&IvfFileHeader::CODEC_VP9);
        data.put_u16_le(64);
        data.put_u16_le(48);
        // 30 fps in a millisecond time base.
        data.put_u32_le(30_000);
        data.put_u32_le(1000);
        data.put_u32_le(frames.len() as u32);
        data.put_u32_le(0);
        for (frame, timestamp) in frames {
            data.put_u32_le(frame.len() as u32);
            data.put_u64_le(*timestamp);
            data.put_slice(frame);
        }
        data
    }

    #[test]
    fn ivf_frames() {
        let data = ivf_stream(&[(&[1, 2, 3], 0), (&[4, 5], 1), (&[6], 2)]);
        let source = IvfSource::new(data).unwrap();
        assert_eq!(source.header().width, 64);
        let units = collect(source);

        assert_eq!(units.len(), 3);
        assert_eq!(units[1].data, vec![4, 5]);
        assert_eq!(units[1].timing.pts, Some(33_333));
        assert_eq!(units[2].timing.dts, Some(66_666));
        assert!(units.iter().all(|u| !u.is_config));
    }

    #[test]
    fn ivf_errors() {
        assert!(matches!(
            IvfSource::new(b"RIFF".to_vec()),
            Err(SourceError::InvalidIvfHeader(_))
        ));

        let mut data = ivf_stream(&[(&[1, 2, 3, 4], 0)]);
        data.truncate(data.len() - 2);
        let mut source = IvfSource::new(data).unwrap();
        assert!(matches!(
            source.next_unit(),
            Err(SourceError::TruncatedIvfFrame { index: 0, size: 4, available: 2 })
        ));
    }

    #[test]
    fn exp_golomb() {
        // 1, 010, 011, 00100
        let data = [0b1010_0110, 0b0100_0000];
        let mut reader = BitReader::new(&data);
        assert_eq!(read_ue(&mut reader), Some(0));
        assert_eq!(read_ue(&mut reader), Some(1));
        assert_eq!(read_ue(&mut reader), Some(2));
        assert_eq!(read_ue(&mut reader), Some(3));
    }
}
