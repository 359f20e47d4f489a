// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Control surface of a stateful memory-to-memory decoder.
//!
//! [`DecoderDevice`] is the boundary between the session controller and the hardware. The
//! `v4l2` implementation drives a real video node through ioctls, while [`dummy::DummyDevice`]
//! emulates a decoder in-process so the controller can be exercised without hardware.

pub mod dummy;
#[cfg(feature = "v4l2")]
pub mod v4l2;

use std::fmt;
use std::ops::BitOr;
use std::ops::BitOrAssign;
use std::os::fd::RawFd;

use enumn::N;
use nix::errno::Errno;
use thiserror::Error;

use crate::utils::flags_to_string;
use crate::Fourcc;
use crate::Resolution;

/// The two queues of a memory-to-memory decoder. Discriminants are the V4L2 multiplanar buffer
/// types.
#[repr(u32)]
#[derive(N, Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum QueueType {
    /// Decoded frames, produced by the device.
    Capture = 9,
    /// Encoded bitstream, consumed by the device.
    Output = 10,
}

impl QueueType {
    /// Number of planes each buffer of this queue carries.
    pub fn num_planes(&self) -> usize {
        match self {
            QueueType::Output => 1,
            // Payload plus the auxiliary (extradata) plane.
            QueueType::Capture => 2,
        }
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueType::Capture => f.write_str("CAPTURE"),
            QueueType::Output => f.write_str("OUTPUT"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to open {0}: {1}")]
    Open(String, std::io::Error),
    #[error("{op} failed: {errno}")]
    Ioctl { op: &'static str, errno: Errno },
    #[error("device is missing required capability {0}")]
    MissingCapability(&'static str),
    #[error("{queue} queue does not support format {fourcc}")]
    UnsupportedFormat { queue: QueueType, fourcc: Fourcc },
}

impl DeviceError {
    pub fn ioctl(op: &'static str, errno: Errno) -> Self {
        DeviceError::Ioctl { op, errno }
    }

    /// Returns the error number reported by the device, if any.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            DeviceError::Ioctl { errno, .. } => Some(*errno),
            _ => None,
        }
    }

    /// Whether trying the same call again later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.errno(), Some(Errno::EAGAIN | Errno::EBUSY | Errno::ENOMEM))
    }
}

/// Flags carried by a buffer, including the Qualcomm vendor extensions.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct BufferFlags(pub u32);

impl BufferFlags {
    pub const KEYFRAME: Self = Self(0x0000_0008);
    pub const PFRAME: Self = Self(0x0000_0010);
    pub const BFRAME: Self = Self(0x0000_0020);
    pub const ERROR: Self = Self(0x0000_0040);
    pub const CODEC_CONFIG: Self = Self(0x0002_0000);
    pub const END_OF_SEQUENCE: Self = Self(0x0004_0000);
    pub const TIMESTAMP_INVALID: Self = Self(0x0008_0000);
    pub const IDR_FRAME: Self = Self(0x0010_0000);
    pub const DECODE_ONLY: Self = Self(0x0020_0000);
    pub const DATA_CORRUPT: Self = Self(0x0040_0000);
    pub const DROP_FRAME: Self = Self(0x0080_0000);
    pub const INPUT_UNSUPPORTED: Self = Self(0x0100_0000);
    pub const EOS: Self = Self(0x0200_0000);
    pub const READ_ONLY: Self = Self(0x0400_0000);

    const NAMES: &'static [(u32, &'static str)] = &[
        (Self::KEYFRAME.0, "KEYFRAME"),
        (Self::PFRAME.0, "PFRAME"),
        (Self::BFRAME.0, "BFRAME"),
        (Self::ERROR.0, "ERROR"),
        (Self::CODEC_CONFIG.0, "CODECCONFIG"),
        (Self::END_OF_SEQUENCE.0, "EOSEQ"),
        (Self::TIMESTAMP_INVALID.0, "TIMESTAMP_INVALID"),
        (Self::IDR_FRAME.0, "IDRFRAME"),
        (Self::DECODE_ONLY.0, "DECODEONLY"),
        (Self::DATA_CORRUPT.0, "DATA_CORRUPT"),
        (Self::DROP_FRAME.0, "DROP_FRAME"),
        (Self::INPUT_UNSUPPORTED.0, "INPUT_UNSUPPORTED"),
        (Self::EOS.0, "EOS"),
        (Self::READ_ONLY.0, "READONLY"),
    ];

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }
}

impl BitOr for BufferFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for BufferFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for BufferFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&flags_to_string(self.0, Self::NAMES))
    }
}

impl fmt::Display for BufferFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Buffer timestamp in microseconds, the unit the device reports them in.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn from_parts(sec: i64, usec: i64) -> Self {
        let timestamp = sec.wrapping_mul(1_000_000).wrapping_add(usec);
        Timestamp(timestamp.max(0) as u64)
    }

    pub fn secs(&self) -> i64 {
        (self.0 / 1_000_000).min(i64::MAX as u64) as i64
    }

    pub fn subsec_micros(&self) -> i64 {
        (self.0 % 1_000_000) as i64
    }
}

/// Location of one plane of a buffer inside the queue's shared allocation.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PlaneDescriptor {
    /// Descriptor of the allocation backing the plane.
    pub fd: RawFd,
    /// Address of the start of the allocation in our address space.
    pub base_addr: usize,
    /// Offset of the plane inside the allocation.
    pub offset: u32,
    pub length: u32,
    pub bytes_used: u32,
}

/// Everything the device needs to queue one buffer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub index: u32,
    pub flags: BufferFlags,
    pub timestamp: Timestamp,
    pub planes: Vec<PlaneDescriptor>,
}

/// A buffer handed back by the device.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: u32,
    /// Bytes used in the payload plane.
    pub bytes_used: u32,
    pub flags: BufferFlags,
    pub timestamp: Timestamp,
}

impl DequeuedBuffer {
    /// The buffer timestamp, unless the device flagged it as meaningless.
    pub fn valid_timestamp(&self) -> Option<Timestamp> {
        if self.flags.contains(BufferFlags::TIMESTAMP_INVALID) {
            None
        } else {
            Some(self.timestamp)
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PlaneFormat {
    pub size_image: u32,
    pub bytes_per_line: u32,
    /// Number of lines of the plane including padding, 0 if unknown.
    pub scanlines: u32,
}

/// Multiplanar format of a queue.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Format {
    pub fourcc: Fourcc,
    pub resolution: Resolution,
    pub planes: Vec<PlaneFormat>,
}

impl Format {
    pub fn new(fourcc: Fourcc, resolution: Resolution) -> Self {
        Self { fourcc, resolution, planes: Vec::new() }
    }

    /// Image size of the first plane, or 0 if the device did not report one.
    pub fn size_image(&self) -> u32 {
        self.planes.first().map(|p| p.size_image).unwrap_or(0)
    }

    pub fn bytes_per_line(&self) -> u32 {
        self.planes.first().map(|p| p.bytes_per_line).unwrap_or(0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FormatDescription {
    pub fourcc: Fourcc,
    pub description: String,
}

/// Capability bits the session relies on.
pub const CAP_VIDEO_CAPTURE_MPLANE: u32 = 0x0000_1000;
pub const CAP_VIDEO_OUTPUT_MPLANE: u32 = 0x0000_2000;
pub const CAP_VIDEO_M2M_MPLANE: u32 = 0x0000_4000;
pub const CAP_STREAMING: u32 = 0x0400_0000;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    pub version: u32,
    pub device_caps: u32,
}

impl Capabilities {
    /// Checks that the device is a multiplanar memory-to-memory device supporting streaming I/O.
    pub fn check(&self) -> Result<(), DeviceError> {
        let has = |bit| self.device_caps & bit == bit;

        if !has(CAP_VIDEO_M2M_MPLANE)
            && !(has(CAP_VIDEO_CAPTURE_MPLANE) && has(CAP_VIDEO_OUTPUT_MPLANE))
        {
            return Err(DeviceError::MissingCapability("VIDEO_M2M_MPLANE"));
        }
        if !has(CAP_STREAMING) {
            return Err(DeviceError::MissingCapability("STREAMING"));
        }

        Ok(())
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "driver={} bus_info={} card={} version={}.{}.{} caps={:#010x}",
            self.driver,
            self.bus_info,
            self.card,
            (self.version >> 16) & 0xff,
            (self.version >> 8) & 0xff,
            self.version & 0xff,
            self.device_caps
        )
    }
}

/// Raw control event as dequeued from the device. Decoded by [`crate::event::Event::from_raw`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: u32,
    pub sequence: u32,
    pub data: [u8; 64],
}

impl RawEvent {
    pub fn new(kind: u32) -> Self {
        Self { kind, sequence: 0, data: [0; 64] }
    }

    /// Builds an event whose payload is a sequence of native-endian words.
    pub fn with_words(kind: u32, words: &[u32]) -> Self {
        let mut event = Self::new(kind);
        for (chunk, word) in event.data.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_ne_bytes());
        }
        event
    }
}

/// Queues affected by a decoder flush.
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct FlushMask(pub u32);

impl FlushMask {
    pub const OUTPUT: Self = Self(1 << 0);
    pub const CAPTURE: Self = Self(1 << 1);

    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for FlushMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for FlushMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: &[(u32, &str)] =
            &[(FlushMask::OUTPUT.0, "OUTPUT"), (FlushMask::CAPTURE.0, "CAPTURE")];
        f.write_str(&flags_to_string(self.0, NAMES))
    }
}

/// Qualcomm private event types.
pub mod vidc_event {
    const V4L2_EVENT_PRIVATE_START: u32 = 0x0800_0000;
    const START: u32 = V4L2_EVENT_PRIVATE_START + 0x0000_1000;

    pub const FLUSH_DONE: u32 = START + 1;
    pub const PORT_SETTINGS_CHANGED_SUFFICIENT: u32 = START + 2;
    pub const PORT_SETTINGS_CHANGED_INSUFFICIENT: u32 = START + 3;
    pub const SYS_ERROR: u32 = START + 5;
    pub const RELEASE_BUFFER_REFERENCE: u32 = START + 6;
    pub const RELEASE_UNQUEUED_BUFFER: u32 = START + 7;
    pub const HW_OVERLOAD: u32 = START + 8;
    pub const MAX_CLIENTS: u32 = START + 9;
    pub const HW_UNSUPPORTED: u32 = START + 10;

    /// Events the session subscribes to before streaming.
    pub const SUBSCRIBED: &[u32] = &[
        FLUSH_DONE,
        PORT_SETTINGS_CHANGED_SUFFICIENT,
        PORT_SETTINGS_CHANGED_INSUFFICIENT,
        SYS_ERROR,
        RELEASE_BUFFER_REFERENCE,
        RELEASE_UNQUEUED_BUFFER,
        HW_OVERLOAD,
        HW_UNSUPPORTED,
    ];
}

/// Qualcomm private decoder controls.
pub mod vidc_ctrl {
    const V4L2_CTRL_CLASS_MPEG: u32 = 0x0099_0000;
    const BASE: u32 = V4L2_CTRL_CLASS_MPEG | 0x2000;

    pub const CONTINUE_DATA_TRANSFER: u32 = BASE + 5;
    pub const OUTPUT_ORDER: u32 = BASE + 7;
    pub const PICTYPE_DEC_MODE: u32 = BASE + 21;
    pub const SET_PERF_LEVEL: u32 = BASE + 37;
    pub const STREAM_OUTPUT_MODE: u32 = BASE + 70;
    pub const DPB_COLOR_FORMAT: u32 = BASE + 86;
    pub const CONCEAL_COLOR: u32 = BASE + 90;

    pub const OUTPUT_ORDER_DISPLAY: i32 = 0;
    pub const OUTPUT_ORDER_DECODE: i32 = 1;
    pub const PICTYPE_DECODE_ON: i32 = 1;
    pub const PERF_LEVEL_TURBO: i32 = 2;
    pub const STREAM_OUTPUT_PRIMARY: i32 = 0;
    pub const STREAM_OUTPUT_SECONDARY: i32 = 1;
    pub const DPB_COLOR_FMT_NONE: i32 = 0;
    pub const DPB_COLOR_FMT_TP10_UBWC: i32 = 2;
}

/// Vendor decoder command used to flush queues.
pub const DEC_QCOM_CMD_FLUSH: u32 = 4;

/// One control value to apply to the decoder.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Control {
    pub id: u32,
    pub value: i32,
    /// Human-readable name for logs.
    pub name: &'static str,
}

impl Control {
    pub const fn new(name: &'static str, id: u32, value: i32) -> Self {
        Self { id, value, name }
    }
}

/// Operations of a stateful memory-to-memory decoder.
///
/// Calls never block: `dequeue_buffer` and `dequeue_event` return `Ok(None)` when nothing is
/// ready. Readiness itself is observed through a [`crate::scheduler::Poller`].
pub trait DecoderDevice {
    fn capabilities(&mut self) -> Result<Capabilities, DeviceError>;

    fn enum_formats(&mut self, queue: QueueType) -> Result<Vec<FormatDescription>, DeviceError>;

    /// Sets the format of `queue` and returns what the device picked.
    fn set_format(&mut self, queue: QueueType, format: &Format) -> Result<Format, DeviceError>;

    fn get_format(&mut self, queue: QueueType) -> Result<Format, DeviceError>;

    /// Requests `count` buffers on `queue`. Returns the number granted, which may differ. A count
    /// of 0 frees the buffers of the queue.
    fn request_buffers(&mut self, queue: QueueType, count: u32) -> Result<u32, DeviceError>;

    fn stream_on(&mut self, queue: QueueType) -> Result<(), DeviceError>;

    fn stream_off(&mut self, queue: QueueType) -> Result<(), DeviceError>;

    fn queue_buffer(
        &mut self,
        queue: QueueType,
        buffer: &BufferDescriptor,
    ) -> Result<(), DeviceError>;

    fn dequeue_buffer(&mut self, queue: QueueType) -> Result<Option<DequeuedBuffer>, DeviceError>;

    fn set_control(&mut self, control: Control) -> Result<(), DeviceError>;

    /// Sets the frame period of `queue` to `numerator / denominator` seconds.
    fn set_frame_period(
        &mut self,
        queue: QueueType,
        numerator: u32,
        denominator: u32,
    ) -> Result<(), DeviceError>;

    fn subscribe_event(&mut self, kind: u32) -> Result<(), DeviceError>;

    fn dequeue_event(&mut self) -> Result<Option<RawEvent>, DeviceError>;

    /// Asks the decoder to return all buffers of the queues in `mask`. Completion is signaled by
    /// a flush-done event.
    fn flush(&mut self, mask: FlushMask) -> Result<(), DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_flags() {
        let flags = BufferFlags::EOS | BufferFlags::TIMESTAMP_INVALID;
        assert!(flags.contains(BufferFlags::EOS));
        assert!(!flags.contains(BufferFlags::CODEC_CONFIG));
        assert_eq!(format!("{flags:?}"), "TIMESTAMP_INVALID|EOS");
        assert_eq!(format!("{:?}", BufferFlags::empty()), "0");
    }

    #[test]
    fn invalid_timestamp_is_hidden() {
        let mut buffer = DequeuedBuffer { timestamp: Timestamp(42), ..Default::default() };
        assert_eq!(buffer.valid_timestamp(), Some(Timestamp(42)));
        buffer.flags |= BufferFlags::TIMESTAMP_INVALID;
        assert_eq!(buffer.valid_timestamp(), None);
    }

    #[test]
    fn timestamp_parts() {
        let ts = Timestamp::from_parts(3, 250_000);
        assert_eq!(ts, Timestamp(3_250_000));
        assert_eq!((ts.secs(), ts.subsec_micros()), (3, 250_000));
        assert_eq!(Timestamp::from_parts(-1, 0), Timestamp(0));
    }

    #[test]
    fn capabilities_check() {
        let mut caps = Capabilities {
            device_caps: CAP_VIDEO_M2M_MPLANE | CAP_STREAMING,
            ..Default::default()
        };
        assert!(caps.check().is_ok());

        caps.device_caps = CAP_VIDEO_CAPTURE_MPLANE | CAP_VIDEO_OUTPUT_MPLANE;
        assert!(matches!(caps.check(), Err(DeviceError::MissingCapability("STREAMING"))));

        caps.device_caps = CAP_STREAMING;
        assert!(caps.check().is_err());
    }

    #[test]
    fn queue_type_from_raw() {
        assert_eq!(QueueType::n(9), Some(QueueType::Capture));
        assert_eq!(QueueType::n(10), Some(QueueType::Output));
        assert_eq!(QueueType::n(1), None);
        assert_eq!(QueueType::Capture.num_planes(), 2);
    }

    #[test]
    fn raw_event_words() {
        let event = RawEvent::with_words(vidc_event::FLUSH_DONE, &[2, 7]);
        assert_eq!(&event.data[0..4], &2u32.to_ne_bytes());
        assert_eq!(&event.data[4..8], &7u32.to_ne_bytes());
    }
}
