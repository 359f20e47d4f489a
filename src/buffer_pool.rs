// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Buffers of the OUTPUT and CAPTURE queues.
//!
//! Each queue is backed by one physically contiguous allocation, partitioned into equally sized
//! slots at fixed offsets. The device identifies a slot by the allocation's file descriptor and
//! the slot offset, which is how the Qualcomm video driver expects USERPTR buffers.

use nix::sys::mman::ProtFlags;
use thiserror::Error;

use crate::allocator::AllocationError;
use crate::allocator::MappedRegion;
use crate::allocator::PhysicalAllocator;
use crate::device::BufferDescriptor;
use crate::device::BufferFlags;
use crate::device::DecoderDevice;
use crate::device::DeviceError;
use crate::device::Format;
use crate::device::PlaneDescriptor;
use crate::device::PlaneFormat;
use crate::device::QueueType;
use crate::device::Timestamp;
use crate::utils::align_up;
use crate::Fourcc;
use crate::Resolution;
use crate::NV12_FOURCC;

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("{0} queue: device granted no buffers")]
    FormatRejected(QueueType),
    #[error("{0} queue is already set up")]
    AlreadySetUp(QueueType),
    #[error("{0} queue: device reported a zero buffer size")]
    ZeroBufferSize(QueueType),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlotAccessError {
    #[error("{0} queue has no slot {1}")]
    InvalidSlot(QueueType, u32),
    #[error("{0} slot {1} is owned by the device")]
    Queued(QueueType, u32),
    #[error("{len} bytes do not fit in a {capacity} bytes slot")]
    TooLarge { len: usize, capacity: u32 },
}

/// Ownership state of a slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// Owned by us, never handed to the device or returned and released.
    Free,
    /// Owned by the device. Its memory must not be touched.
    Queued,
    /// Returned by the device, holding data that has not been consumed yet.
    DequeuedPendingReuse,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferSlot {
    pub index: u32,
    /// Offset of the slot in the queue allocation.
    pub offset: u32,
    pub length: u32,
    pub bytes_used: u32,
    pub state: SlotState,
}

impl BufferSlot {
    /// Whether the slot can be handed to the device.
    pub fn is_queueable(&self) -> bool {
        matches!(self.state, SlotState::Free | SlotState::DequeuedPendingReuse)
    }
}

/// Buffers of one queue: the slot arena and the memory backing it.
pub struct QueuePool {
    queue: QueueType,
    region: Option<MappedRegion>,
    slots: Vec<BufferSlot>,
    format: Option<Format>,
    streaming: bool,
}

impl QueuePool {
    fn new(queue: QueueType) -> Self {
        Self { queue, region: None, slots: Vec::new(), format: None, streaming: false }
    }

    pub fn queue(&self) -> QueueType {
        self.queue
    }

    pub fn count(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn is_set_up(&self) -> bool {
        self.region.is_some()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Negotiated format, once set up.
    pub fn format(&self) -> Option<&Format> {
        self.format.as_ref()
    }

    pub fn slots(&self) -> &[BufferSlot] {
        &self.slots
    }

    pub fn slot(&self, index: u32) -> Option<&BufferSlot> {
        self.slots.get(index as usize)
    }

    pub(crate) fn slot_mut(&mut self, index: u32) -> Option<&mut BufferSlot> {
        self.slots.get_mut(index as usize)
    }

    pub fn num_queued(&self) -> usize {
        self.slots.iter().filter(|s| s.state == SlotState::Queued).count()
    }

    /// Index of the first slot in the FREE state.
    pub fn first_free(&self) -> Option<u32> {
        self.slots.iter().find(|s| s.state == SlotState::Free).map(|s| s.index)
    }

    /// Starts or stops streaming. Does nothing if the queue is already in the requested state.
    ///
    /// Stopping returns every QUEUED slot to FREE, as the device drops them.
    pub(crate) fn set_streaming<D: DecoderDevice>(
        &mut self,
        device: &mut D,
        on: bool,
    ) -> Result<(), DeviceError> {
        if self.streaming == on {
            return Ok(());
        }

        if on {
            device.stream_on(self.queue)?;
        } else {
            device.stream_off(self.queue)?;
            for slot in self.slots.iter_mut().filter(|s| s.state == SlotState::Queued) {
                slot.state = SlotState::Free;
                slot.bytes_used = 0;
            }
        }
        self.streaming = on;
        log::debug!("{}: streaming {}", self.queue, if on { "on" } else { "off" });

        Ok(())
    }

    fn populate(&mut self, region: MappedRegion, count: u32, buffer_size: u32, format: Format) {
        self.slots = (0..count)
            .map(|index| BufferSlot {
                index,
                offset: index * buffer_size,
                length: buffer_size,
                bytes_used: 0,
                state: SlotState::Free,
            })
            .collect();
        self.region = Some(region);
        self.format = Some(format);
    }

    /// Stops streaming, releases the memory and the device buffers. Safe to call at any time.
    fn teardown<D: DecoderDevice>(&mut self, device: &mut D) -> Result<(), DeviceError> {
        let stream_res = self.set_streaming(device, false);
        // Drop the device state even if STREAMOFF failed, REQBUFS will tell us if it matters.
        self.streaming = false;

        let had_buffers = !self.slots.is_empty() || self.region.is_some();
        self.slots.clear();
        self.format = None;
        if let Some(region) = self.region.take() {
            log::debug!("{}: releasing {} bytes", self.queue, region.len());
            drop(region);
        }

        if had_buffers {
            device.request_buffers(self.queue, 0)?;
        }

        stream_res
    }

    /// Builds the descriptor passed to the device to queue `index`.
    pub(crate) fn descriptor(
        &self,
        index: u32,
        bytes_used: u32,
        flags: BufferFlags,
        timestamp: Timestamp,
    ) -> Option<BufferDescriptor> {
        let slot = self.slot(index)?;
        let region = self.region.as_ref()?;

        let payload = PlaneDescriptor {
            fd: region.raw_fd(),
            base_addr: region.addr(),
            offset: slot.offset,
            length: slot.length,
            bytes_used,
        };

        let planes = match self.queue {
            QueueType::Output => vec![payload],
            // The auxiliary plane shares the allocation and carries nothing.
            QueueType::Capture => vec![
                payload,
                PlaneDescriptor {
                    fd: region.raw_fd(),
                    base_addr: region.addr(),
                    offset: 0,
                    length: 0,
                    bytes_used: 0,
                },
            ],
        };

        Some(BufferDescriptor { index, flags, timestamp, planes })
    }

    /// Returns the first `len` bytes of slot `index`. Refused while the device owns the slot.
    pub fn slot_data(&self, index: u32, len: usize) -> Result<&[u8], SlotAccessError> {
        let slot = self.slot(index).ok_or(SlotAccessError::InvalidSlot(self.queue, index))?;
        if slot.state == SlotState::Queued {
            return Err(SlotAccessError::Queued(self.queue, index));
        }
        if len > slot.length as usize {
            return Err(SlotAccessError::TooLarge { len, capacity: slot.length });
        }

        self.region
            .as_ref()
            .and_then(|r| r.slice(slot.offset as usize, len))
            .ok_or(SlotAccessError::InvalidSlot(self.queue, index))
    }

    /// Copies `data` at the start of slot `index` and returns the number of bytes written.
    pub fn write_slot(&mut self, index: u32, data: &[u8]) -> Result<u32, SlotAccessError> {
        let queue = self.queue;
        let slot =
            self.slots.get(index as usize).ok_or(SlotAccessError::InvalidSlot(queue, index))?;
        if slot.state == SlotState::Queued {
            return Err(SlotAccessError::Queued(queue, index));
        }
        if data.len() > slot.length as usize {
            return Err(SlotAccessError::TooLarge { len: data.len(), capacity: slot.length });
        }
        let offset = slot.offset as usize;

        let dst = self
            .region
            .as_mut()
            .and_then(|r| r.slice_mut(offset, data.len()))
            .ok_or(SlotAccessError::InvalidSlot(queue, index))?;
        dst.copy_from_slice(data);

        Ok(data.len() as u32)
    }
}

/// Size of an NV12 buffer as laid out by the Venus firmware: 128-byte stride, 32-line luma and
/// 16-line chroma scanline alignment, plus room for the chroma alignment and metadata.
pub fn venus_nv12_buffer_size(resolution: Resolution) -> u32 {
    const EXTRADATA_SIZE: usize = 16 * 1024;

    let width = resolution.width as usize;
    let height = resolution.height as usize;
    if width == 0 || height == 0 {
        return 0;
    }

    let stride = align_up(width, 128);
    let y_scanlines = align_up(height, 32);
    let uv_scanlines = align_up((height + 1) >> 1, 16);

    let y_plane = stride * y_scanlines;
    let uv_plane = stride * uv_scanlines + 4096;
    let size = y_plane + uv_plane + EXTRADATA_SIZE.max(8 * stride);

    align_up(size, 4096) as u32
}

/// The two queue pools of a session.
pub struct BufferPool {
    output: QueuePool,
    capture: QueuePool,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            output: QueuePool::new(QueueType::Output),
            capture: QueuePool::new(QueueType::Capture),
        }
    }

    pub fn get(&self, queue: QueueType) -> &QueuePool {
        match queue {
            QueueType::Output => &self.output,
            QueueType::Capture => &self.capture,
        }
    }

    pub fn get_mut(&mut self, queue: QueueType) -> &mut QueuePool {
        match queue {
            QueueType::Output => &mut self.output,
            QueueType::Capture => &mut self.capture,
        }
    }

    pub fn output(&self) -> &QueuePool {
        &self.output
    }

    pub fn capture(&self) -> &QueuePool {
        &self.capture
    }

    /// Negotiates the bitstream format and `count` buffers of at least `unit_size` bytes on the
    /// OUTPUT queue, then allocates and maps their memory.
    pub fn setup_output<D: DecoderDevice, A: PhysicalAllocator>(
        &mut self,
        device: &mut D,
        allocator: &A,
        fourcc: Fourcc,
        coded_size: Resolution,
        unit_size: u32,
        count: u32,
    ) -> Result<(), SetupError> {
        if self.output.is_set_up() {
            return Err(SetupError::AlreadySetUp(QueueType::Output));
        }

        let mut format = Format::new(fourcc, coded_size);
        format.planes.push(PlaneFormat { size_image: unit_size, ..Default::default() });
        let format = device.set_format(QueueType::Output, &format)?;

        let buffer_size = match format.size_image() {
            0 => unit_size,
            size => size,
        };
        log::debug!("OUTPUT: setup buffer size={} (requested={})", buffer_size, unit_size);
        if buffer_size == 0 {
            return Err(SetupError::ZeroBufferSize(QueueType::Output));
        }

        let granted = device.request_buffers(QueueType::Output, count)?;
        log::debug!("OUTPUT: requested {} buffers, got {}", count, granted);
        if granted == 0 {
            return Err(SetupError::FormatRejected(QueueType::Output));
        }

        let region = match allocator
            .allocate(granted as usize * buffer_size as usize)
            .and_then(|buffer| buffer.map(ProtFlags::PROT_READ | ProtFlags::PROT_WRITE))
        {
            Ok(region) => region,
            Err(e) => {
                let _ = device.request_buffers(QueueType::Output, 0);
                return Err(e.into());
            }
        };

        self.output.populate(region, granted, buffer_size, format);
        log::debug!("OUTPUT: successfully mapped {} buffers", granted);

        Ok(())
    }

    /// Negotiates NV12 at `resolution` and `count` buffers on the CAPTURE queue, then allocates
    /// and maps their memory.
    pub fn setup_capture<D: DecoderDevice, A: PhysicalAllocator>(
        &mut self,
        device: &mut D,
        allocator: &A,
        resolution: Resolution,
        count: u32,
    ) -> Result<(), SetupError> {
        if self.capture.is_set_up() {
            return Err(SetupError::AlreadySetUp(QueueType::Capture));
        }

        let negotiated =
            device.set_format(QueueType::Capture, &Format::new(NV12_FOURCC, resolution))?;
        // Decoded frames are only ever read as linear NV12.
        if negotiated.fourcc != NV12_FOURCC {
            return Err(DeviceError::UnsupportedFormat {
                queue: QueueType::Capture,
                fourcc: negotiated.fourcc,
            }
            .into());
        }

        let granted = device.request_buffers(QueueType::Capture, count)?;
        log::debug!("CAPTURE: requested {} buffers, got {}", count, granted);
        if granted == 0 {
            return Err(SetupError::FormatRejected(QueueType::Capture));
        }

        let format = device.get_format(QueueType::Capture)?;
        log::debug!(
            "CAPTURE: {} fmt={} ({} planes)",
            format.resolution,
            format.fourcc,
            format.planes.len()
        );
        for (n, plane) in format.planes.iter().enumerate() {
            log::debug!(
                "    plane {}: size={} stride={}",
                n,
                plane.size_image,
                plane.bytes_per_line
            );
        }

        let buffer_size = format.size_image().max(venus_nv12_buffer_size(format.resolution));
        if buffer_size == 0 {
            let _ = device.request_buffers(QueueType::Capture, 0);
            return Err(SetupError::ZeroBufferSize(QueueType::Capture));
        }

        let region = match allocator
            .allocate(granted as usize * buffer_size as usize)
            .and_then(|buffer| buffer.map(ProtFlags::PROT_READ))
        {
            Ok(region) => region,
            Err(e) => {
                let _ = device.request_buffers(QueueType::Capture, 0);
                return Err(e.into());
            }
        };

        self.capture.populate(region, granted, buffer_size, format);
        log::debug!("CAPTURE: successfully mapped {} buffers", granted);

        Ok(())
    }

    pub fn teardown_output<D: DecoderDevice>(
        &mut self,
        device: &mut D,
    ) -> Result<(), DeviceError> {
        self.output.teardown(device)
    }

    pub fn teardown_capture<D: DecoderDevice>(
        &mut self,
        device: &mut D,
    ) -> Result<(), DeviceError> {
        self.capture.teardown(device)
    }
}
