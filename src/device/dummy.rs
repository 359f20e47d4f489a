// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! In-process decoder that behaves like a stateful V4L2 decoder without touching any hardware.
//!
//! Every bitstream unit queued on the OUTPUT queue is "decoded" into exactly one frame, delivered
//! in FIFO order on the first available CAPTURE buffer with the unit's timestamp. Tests can
//! script resolution changes, rejected controls and timestamp loss through [`DummyState`].

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use nix::errno::Errno;

use crate::device::vidc_event;
use crate::device::BufferDescriptor;
use crate::device::BufferFlags;
use crate::device::Capabilities;
use crate::device::Control;
use crate::device::DecoderDevice;
use crate::device::DequeuedBuffer;
use crate::device::DeviceError;
use crate::device::FlushMask;
use crate::device::Format;
use crate::device::FormatDescription;
use crate::device::PlaneFormat;
use crate::device::QueueType;
use crate::device::RawEvent;
use crate::device::Timestamp;
use crate::device::CAP_STREAMING;
use crate::device::CAP_VIDEO_M2M_MPLANE;
use crate::scheduler::Poller;
use crate::scheduler::Readiness;
use crate::scheduler::SchedulerError;
use crate::EncodedFormat;
use crate::Fourcc;
use crate::Resolution;
use crate::NV12_FOURCC;

/// Default size of OUTPUT buffers when the client does not ask for one.
const DEFAULT_OUTPUT_SIZE: u32 = 1 << 20;

/// Per-queue state of the dummy decoder.
#[derive(Debug, Default)]
pub struct DummyQueue {
    pub format: Format,
    pub num_buffers: u32,
    pub streaming: bool,
    pub queued: VecDeque<BufferDescriptor>,
    pub done: VecDeque<DequeuedBuffer>,
}

impl DummyQueue {
    fn reset_buffers(&mut self) {
        self.queued.clear();
        self.done.clear();
    }
}

#[derive(Debug)]
struct PendingFrame {
    timestamp: Timestamp,
    flags: BufferFlags,
}

/// Scriptable state shared between a [`DummyDevice`], its [`DummyPoller`] and the test that
/// drives them.
#[derive(Debug, Default)]
pub struct DummyState {
    pub output: DummyQueue,
    pub capture: DummyQueue,
    pub events: VecDeque<RawEvent>,
    pub subscribed_events: Vec<u32>,
    pub controls: Vec<Control>,
    pub frame_period: Option<(u32, u32)>,
    pub flushes: Vec<FlushMask>,

    /// Grant this many buffers regardless of the requested count.
    pub granted_buffers: Option<u32>,
    /// Control ids answered with `EINVAL`.
    pub rejected_controls: Vec<u32>,
    /// Answer flush commands with this error.
    pub flush_error: Option<Errno>,
    /// Answer buffer allocations with this error.
    pub reqbufs_error: Option<Errno>,
    /// CAPTURE pixel format picked regardless of the requested one.
    pub capture_fourcc: Option<Fourcc>,
    /// When set, decoded frames come back flagged with an invalid timestamp.
    pub drop_timestamps: bool,
    /// Emit a port-settings-changed event once this many frames have been decoded.
    pub resolution_change: Option<(usize, Resolution)>,
    /// Terminate the poll loop after this many waits.
    pub max_polls: Option<usize>,

    pub frames_decoded: usize,
    pub polls: usize,
    /// Highest number of CAPTURE buffers queued at the same time.
    pub max_capture_queued: usize,
    /// Highest number of OUTPUT buffers queued at the same time.
    pub max_output_queued: usize,
    pending_frames: VecDeque<PendingFrame>,
    awaiting_reconfiguration: bool,
    /// Events becoming visible on the next poll.
    deferred_events: VecDeque<RawEvent>,
}

impl DummyState {
    fn queue_mut(&mut self, queue: QueueType) -> &mut DummyQueue {
        match queue {
            QueueType::Output => &mut self.output,
            QueueType::Capture => &mut self.capture,
        }
    }

    pub fn queue(&self, queue: QueueType) -> &DummyQueue {
        match queue {
            QueueType::Output => &self.output,
            QueueType::Capture => &self.capture,
        }
    }

    /// Consumes queued bitstream and produces frames for as long as both queues allow it.
    fn process(&mut self) {
        if self.output.streaming {
            while let Some(buffer) = self.output.queued.pop_front() {
                let bytes_used = buffer.planes.first().map(|p| p.bytes_used).unwrap_or(0);
                let is_config = buffer.flags.contains(BufferFlags::CODEC_CONFIG);

                if bytes_used > 0 && !is_config {
                    let mut flags = BufferFlags::empty();
                    if self.drop_timestamps || buffer.flags.contains(BufferFlags::TIMESTAMP_INVALID)
                    {
                        flags |= BufferFlags::TIMESTAMP_INVALID;
                    }
                    let frame = PendingFrame { timestamp: buffer.timestamp, flags };
                    self.pending_frames.push_back(frame);
                }
                if buffer.flags.contains(BufferFlags::EOS) {
                    let frame = PendingFrame { timestamp: Timestamp(0), flags: BufferFlags::EOS };
                    self.pending_frames.push_back(frame);
                }

                self.output.done.push_back(DequeuedBuffer {
                    index: buffer.index,
                    bytes_used: 0,
                    flags: buffer.flags,
                    timestamp: buffer.timestamp,
                });
            }
        }

        while self.capture.streaming && !self.awaiting_reconfiguration {
            if self.pending_frames.is_empty() || self.capture.queued.is_empty() {
                break;
            }
            let Some(frame) = self.pending_frames.pop_front() else {
                break;
            };
            let Some(buffer) = self.capture.queued.pop_front() else {
                break;
            };

            let bytes_used = if frame.flags.contains(BufferFlags::EOS) {
                0
            } else {
                self.frames_decoded += 1;
                buffer.planes.first().map(|p| p.length).unwrap_or(0)
            };

            self.capture.done.push_back(DequeuedBuffer {
                index: buffer.index,
                bytes_used,
                flags: frame.flags,
                timestamp: frame.timestamp,
            });

            if let Some((after, resolution)) = self.resolution_change {
                if self.frames_decoded == after {
                    self.resolution_change = None;
                    self.awaiting_reconfiguration = true;
                    self.events.push_back(RawEvent::with_words(
                        vidc_event::PORT_SETTINGS_CHANGED_INSUFFICIENT,
                        &[resolution.height, resolution.width, 0, 1, 0],
                    ));
                }
            }
        }
    }
}

/// Decoder device emulated in-process.
#[derive(Clone, Debug, Default)]
pub struct DummyDevice {
    state: Rc<RefCell<DummyState>>,
}

impl DummyDevice {
    pub fn new() -> Self {
        Default::default()
    }

    /// Handle to the shared state, for scripting and inspection.
    pub fn state(&self) -> Rc<RefCell<DummyState>> {
        Rc::clone(&self.state)
    }

    /// Returns a poller observing this device.
    pub fn poller(&self) -> DummyPoller {
        DummyPoller { state: self.state() }
    }

    pub fn push_event(&self, event: RawEvent) {
        self.state.borrow_mut().events.push_back(event);
    }
}

impl DecoderDevice for DummyDevice {
    fn capabilities(&mut self) -> Result<Capabilities, DeviceError> {
        Ok(Capabilities {
            driver: String::from("dummy"),
            card: String::from("dummy decoder"),
            bus_info: String::from("platform:dummy"),
            version: 0x0006_0000,
            device_caps: CAP_VIDEO_M2M_MPLANE | CAP_STREAMING,
        })
    }

    fn enum_formats(&mut self, queue: QueueType) -> Result<Vec<FormatDescription>, DeviceError> {
        let formats = match queue {
            QueueType::Output => [
                EncodedFormat::H264,
                EncodedFormat::H265,
                EncodedFormat::VP8,
                EncodedFormat::VP9,
            ]
            .iter()
            .map(|f| FormatDescription { fourcc: f.fourcc(), description: format!("{f:?}") })
            .collect(),
            QueueType::Capture => vec![FormatDescription {
                fourcc: NV12_FOURCC,
                description: String::from("Y/CbCr 4:2:0"),
            }],
        };

        Ok(formats)
    }

    fn set_format(&mut self, queue: QueueType, format: &Format) -> Result<Format, DeviceError> {
        let mut state = self.state.borrow_mut();
        let capture_fourcc = state.capture_fourcc;
        let q = state.queue_mut(queue);
        if q.num_buffers > 0 {
            return Err(DeviceError::ioctl("VIDIOC_S_FMT", Errno::EBUSY));
        }

        let mut negotiated = format.clone();
        if let (QueueType::Capture, Some(fourcc)) = (queue, capture_fourcc) {
            negotiated.fourcc = fourcc;
        }
        negotiated.planes = match queue {
            QueueType::Output => {
                let size_image = match format.size_image() {
                    0 => DEFAULT_OUTPUT_SIZE,
                    size => size,
                };
                vec![PlaneFormat { size_image, ..Default::default() }]
            }
            QueueType::Capture => {
                let Resolution { width, height } = format.resolution;
                vec![PlaneFormat {
                    size_image: width * height * 3 / 2,
                    bytes_per_line: width,
                    scanlines: height,
                }]
            }
        };
        q.format = negotiated.clone();

        Ok(negotiated)
    }

    fn get_format(&mut self, queue: QueueType) -> Result<Format, DeviceError> {
        Ok(self.state.borrow().queue(queue).format.clone())
    }

    fn request_buffers(&mut self, queue: QueueType, count: u32) -> Result<u32, DeviceError> {
        let mut state = self.state.borrow_mut();
        let granted = match (count, state.granted_buffers) {
            (0, _) => 0,
            (_, Some(granted)) => granted,
            (count, None) => count,
        };
        if let (1.., Some(errno)) = (granted, state.reqbufs_error) {
            return Err(DeviceError::ioctl("VIDIOC_REQBUFS", errno));
        }

        let q = state.queue_mut(queue);
        if q.streaming {
            return Err(DeviceError::ioctl("VIDIOC_REQBUFS", Errno::EBUSY));
        }
        q.reset_buffers();
        q.num_buffers = granted;

        Ok(granted)
    }

    fn stream_on(&mut self, queue: QueueType) -> Result<(), DeviceError> {
        let mut state = self.state.borrow_mut();
        let q = state.queue_mut(queue);
        if q.num_buffers == 0 {
            return Err(DeviceError::ioctl("VIDIOC_STREAMON", Errno::EINVAL));
        }
        q.streaming = true;
        if queue == QueueType::Capture {
            state.awaiting_reconfiguration = false;
        }
        state.process();

        Ok(())
    }

    fn stream_off(&mut self, queue: QueueType) -> Result<(), DeviceError> {
        let mut state = self.state.borrow_mut();
        let q = state.queue_mut(queue);
        q.streaming = false;
        q.reset_buffers();

        Ok(())
    }

    fn queue_buffer(
        &mut self,
        queue: QueueType,
        buffer: &BufferDescriptor,
    ) -> Result<(), DeviceError> {
        let mut state = self.state.borrow_mut();
        let q = state.queue_mut(queue);

        if buffer.index >= q.num_buffers
            || buffer.planes.len() != queue.num_planes()
            || q.queued.iter().any(|b| b.index == buffer.index)
        {
            return Err(DeviceError::ioctl("VIDIOC_QBUF", Errno::EINVAL));
        }
        q.queued.push_back(buffer.clone());
        let queued = q.queued.len();

        match queue {
            QueueType::Output => state.max_output_queued = state.max_output_queued.max(queued),
            QueueType::Capture => state.max_capture_queued = state.max_capture_queued.max(queued),
        }
        state.process();

        Ok(())
    }

    fn dequeue_buffer(&mut self, queue: QueueType) -> Result<Option<DequeuedBuffer>, DeviceError> {
        let mut state = self.state.borrow_mut();
        let q = state.queue_mut(queue);
        if !q.streaming {
            return Err(DeviceError::ioctl("VIDIOC_DQBUF", Errno::EINVAL));
        }

        Ok(q.done.pop_front())
    }

    fn set_control(&mut self, control: Control) -> Result<(), DeviceError> {
        let mut state = self.state.borrow_mut();
        if state.rejected_controls.contains(&control.id) {
            return Err(DeviceError::ioctl("VIDIOC_S_CTRL", Errno::EINVAL));
        }
        state.controls.push(control);

        Ok(())
    }

    fn set_frame_period(
        &mut self,
        _queue: QueueType,
        numerator: u32,
        denominator: u32,
    ) -> Result<(), DeviceError> {
        self.state.borrow_mut().frame_period = Some((numerator, denominator));
        Ok(())
    }

    fn subscribe_event(&mut self, kind: u32) -> Result<(), DeviceError> {
        self.state.borrow_mut().subscribed_events.push(kind);
        Ok(())
    }

    fn dequeue_event(&mut self) -> Result<Option<RawEvent>, DeviceError> {
        Ok(self.state.borrow_mut().events.pop_front())
    }

    fn flush(&mut self, mask: FlushMask) -> Result<(), DeviceError> {
        let mut state = self.state.borrow_mut();
        if let Some(errno) = state.flush_error {
            return Err(DeviceError::ioctl("VIDIOC_DECODER_CMD", errno));
        }
        state.flushes.push(mask);

        if mask.contains(FlushMask::CAPTURE) {
            while let Some(buffer) = state.capture.queued.pop_front() {
                state.capture.done.push_back(DequeuedBuffer {
                    index: buffer.index,
                    bytes_used: 0,
                    flags: BufferFlags::empty(),
                    timestamp: Timestamp(0),
                });
            }
        }
        if mask.contains(FlushMask::OUTPUT) {
            while let Some(buffer) = state.output.queued.pop_front() {
                state.output.done.push_back(DequeuedBuffer {
                    index: buffer.index,
                    bytes_used: 0,
                    flags: buffer.flags,
                    timestamp: buffer.timestamp,
                });
            }
        }
        // Completion is reported asynchronously, like the hardware does.
        state.deferred_events.push_back(RawEvent::with_words(vidc_event::FLUSH_DONE, &[mask.0]));

        Ok(())
    }
}

/// [`Poller`] reporting the readiness of a [`DummyDevice`]. Never blocks.
///
/// Flush completions queued by the device become visible to [`DecoderDevice::dequeue_event`]
/// when this poller is waited on.
pub struct DummyPoller {
    state: Rc<RefCell<DummyState>>,
}

impl Poller for DummyPoller {
    fn wait(&mut self) -> Result<Readiness, SchedulerError> {
        let mut state = self.state.borrow_mut();
        state.polls += 1;
        let deferred = std::mem::take(&mut state.deferred_events);
        state.events.extend(deferred);

        Ok(Readiness {
            event: !state.events.is_empty(),
            capture: !state.capture.done.is_empty(),
            output: !state.output.done.is_empty(),
            terminate: state.max_polls.is_some_and(|max| state.polls > max),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::PlaneDescriptor;
    use crate::Fourcc;

    fn descriptor(queue: QueueType, index: u32, bytes_used: u32, ts: u64) -> BufferDescriptor {
        let plane = PlaneDescriptor { length: 4096, bytes_used, ..Default::default() };
        BufferDescriptor {
            index,
            flags: BufferFlags::empty(),
            timestamp: Timestamp(ts),
            planes: vec![plane; queue.num_planes()],
        }
    }

    fn streaming_device() -> DummyDevice {
        let mut device = DummyDevice::new();
        let h264 = Format::new(Fourcc::from(b"H264"), (64, 64).into());
        device.set_format(QueueType::Output, &h264).unwrap();
        device.set_format(QueueType::Capture, &Format::new(NV12_FOURCC, (64, 64).into())).unwrap();
        assert_eq!(device.request_buffers(QueueType::Output, 2).unwrap(), 2);
        assert_eq!(device.request_buffers(QueueType::Capture, 2).unwrap(), 2);
        device.stream_on(QueueType::Output).unwrap();
        device.stream_on(QueueType::Capture).unwrap();
        device
    }

    #[test]
    fn one_frame_per_unit() {
        let mut device = streaming_device();
        let capture = descriptor(QueueType::Capture, 0, 0, 0);
        device.queue_buffer(QueueType::Capture, &capture).unwrap();
        let output = descriptor(QueueType::Output, 1, 100, 1234);
        device.queue_buffer(QueueType::Output, &output).unwrap();

        let out = device.dequeue_buffer(QueueType::Output).unwrap().unwrap();
        assert_eq!(out.index, 1);
        let cap = device.dequeue_buffer(QueueType::Capture).unwrap().unwrap();
        assert_eq!((cap.index, cap.timestamp, cap.bytes_used), (0, Timestamp(1234), 4096));
        assert!(device.dequeue_buffer(QueueType::Capture).unwrap().is_none());
    }

    #[test]
    fn double_queue_is_rejected() {
        let mut device = streaming_device();
        let buffer = descriptor(QueueType::Capture, 1, 0, 0);
        device.queue_buffer(QueueType::Capture, &buffer).unwrap();
        assert!(device.queue_buffer(QueueType::Capture, &buffer).is_err());
        let out_of_range = descriptor(QueueType::Capture, 5, 0, 0);
        assert!(device.queue_buffer(QueueType::Capture, &out_of_range).is_err());
    }

    #[test]
    fn flush_returns_capture_buffers() {
        let mut device = streaming_device();
        let capture = descriptor(QueueType::Capture, 0, 0, 0);
        device.queue_buffer(QueueType::Capture, &capture).unwrap();
        device.flush(FlushMask::CAPTURE).unwrap();

        let cap = device.dequeue_buffer(QueueType::Capture).unwrap().unwrap();
        assert_eq!(cap.bytes_used, 0);
        assert!(device.dequeue_event().unwrap().is_none());

        assert!(device.poller().wait().unwrap().event);
        let event = device.dequeue_event().unwrap().unwrap();
        assert_eq!(event.kind, vidc_event::FLUSH_DONE);
    }

    #[test]
    fn poller_reports_readiness() {
        let device = streaming_device();
        let mut poller = device.poller();
        assert_eq!(poller.wait().unwrap(), Readiness::default());

        device.push_event(RawEvent::new(vidc_event::HW_OVERLOAD));
        assert!(poller.wait().unwrap().event);
    }
}
