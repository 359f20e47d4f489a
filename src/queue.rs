// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Submission and retrieval of buffers on both queues of the decoder.

use thiserror::Error;

use crate::allocator::PhysicalAllocator;
use crate::buffer_pool::BufferPool;
use crate::buffer_pool::SetupError;
use crate::buffer_pool::SlotAccessError;
use crate::buffer_pool::SlotState;
use crate::device::BufferFlags;
use crate::device::DecoderDevice;
use crate::device::DequeuedBuffer;
use crate::device::DeviceError;
use crate::device::QueueType;
use crate::device::Timestamp;
use crate::timestamp::TimestampReconciler;
use crate::timestamp::UnitTiming;
use crate::Fourcc;
use crate::Resolution;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("{0} queue has no slot {1}")]
    InvalidSlot(QueueType, u32),
    #[error("{0} slot {1} is already queued")]
    AlreadyQueued(QueueType, u32),
    #[error("device rejected {queue} slot {index}: {error}")]
    DeviceRejected { queue: QueueType, index: u32, error: DeviceError },
    #[error("no buffer ready")]
    Again,
    #[error(transparent)]
    Device(DeviceError),
    #[error("{0}: device returned slot {1} that was not queued")]
    ProtocolViolation(QueueType, u32),
    #[error(transparent)]
    SlotAccess(#[from] SlotAccessError),
}

/// Drives both queues of a decoder: owns the device, the buffer pool and the pending timestamps
/// of the units in flight.
pub struct QueueDriver<D: DecoderDevice> {
    device: D,
    pool: BufferPool,
    timestamps: TimestampReconciler,
    total_output_queued: u64,
    total_captured: u64,
}

impl<D: DecoderDevice> QueueDriver<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            pool: BufferPool::new(),
            timestamps: TimestampReconciler::new(),
            total_output_queued: 0,
            total_captured: 0,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn timestamps(&self) -> &TimestampReconciler {
        &self.timestamps
    }

    pub fn timestamps_mut(&mut self) -> &mut TimestampReconciler {
        &mut self.timestamps
    }

    /// Number of bitstream units queued since the start of the session.
    pub fn total_output_queued(&self) -> u64 {
        self.total_output_queued
    }

    /// Number of frames with a payload retrieved since the start of the session.
    pub fn total_captured(&self) -> u64 {
        self.total_captured
    }

    pub fn setup_output<A: PhysicalAllocator>(
        &mut self,
        allocator: &A,
        fourcc: Fourcc,
        coded_size: Resolution,
        unit_size: u32,
        count: u32,
    ) -> Result<(), SetupError> {
        self.pool.setup_output(&mut self.device, allocator, fourcc, coded_size, unit_size, count)
    }

    pub fn setup_capture<A: PhysicalAllocator>(
        &mut self,
        allocator: &A,
        resolution: Resolution,
        count: u32,
    ) -> Result<(), SetupError> {
        self.pool.setup_capture(&mut self.device, allocator, resolution, count)
    }

    pub fn teardown_output(&mut self) -> Result<(), DeviceError> {
        self.pool.teardown_output(&mut self.device)
    }

    pub fn teardown_capture(&mut self) -> Result<(), DeviceError> {
        self.pool.teardown_capture(&mut self.device)
    }

    /// Starts or stops streaming on `queue`. A no-op if it is already in that state.
    pub fn set_streaming(&mut self, queue: QueueType, on: bool) -> Result<(), DeviceError> {
        self.pool.get_mut(queue).set_streaming(&mut self.device, on)
    }

    /// Copies a bitstream unit into OUTPUT slot `index`.
    pub fn write_output(&mut self, index: u32, data: &[u8]) -> Result<u32, QueueError> {
        Ok(self.pool.get_mut(QueueType::Output).write_slot(index, data)?)
    }

    fn check_queueable(&self, queue: QueueType, index: u32) -> Result<(), QueueError> {
        let slot =
            self.pool.get(queue).slot(index).ok_or(QueueError::InvalidSlot(queue, index))?;
        if !slot.is_queueable() {
            return Err(QueueError::AlreadyQueued(queue, index));
        }
        Ok(())
    }

    fn queue(
        &mut self,
        queue: QueueType,
        index: u32,
        bytes_used: u32,
        flags: BufferFlags,
        timestamp: Timestamp,
    ) -> Result<(), QueueError> {
        self.check_queueable(queue, index)?;

        let pool = self.pool.get_mut(queue);
        let descriptor = pool
            .descriptor(index, bytes_used, flags, timestamp)
            .ok_or(QueueError::InvalidSlot(queue, index))?;

        self.device
            .queue_buffer(queue, &descriptor)
            .map_err(|error| QueueError::DeviceRejected { queue, index, error })?;

        if let Some(slot) = pool.slot_mut(index) {
            slot.state = SlotState::Queued;
            slot.bytes_used = bytes_used;
        }
        debug_assert!(pool.num_queued() <= pool.count() as usize);

        log::trace!(
            "{}: queued buffer {} flags={} bytes={}, {}/{} queued",
            queue,
            index,
            flags,
            bytes_used,
            pool.num_queued(),
            pool.count()
        );

        Ok(())
    }

    /// Queues OUTPUT slot `index` holding a `bytes_used` bytes unit, and records its timing.
    ///
    /// The device receives the unit PTS as buffer timestamp when it is known. Codec configuration
    /// units do not produce frames and leave no pending timestamp behind.
    pub fn queue_output(
        &mut self,
        index: u32,
        bytes_used: u32,
        flags: BufferFlags,
        timing: UnitTiming,
    ) -> Result<(), QueueError> {
        let mut flags = flags;
        let timestamp = match timing.pts {
            Some(pts) => Timestamp(pts),
            None => {
                flags |= BufferFlags::TIMESTAMP_INVALID;
                Timestamp(0)
            }
        };

        self.queue(QueueType::Output, index, bytes_used, flags, timestamp)?;

        if !flags.contains(BufferFlags::CODEC_CONFIG) {
            self.timestamps.record_submission(timing);
        }
        self.total_output_queued += 1;

        Ok(())
    }

    /// Queues an empty OUTPUT buffer flagged as end of stream.
    pub fn queue_eos(&mut self, index: u32) -> Result<(), QueueError> {
        self.queue(
            QueueType::Output,
            index,
            0,
            BufferFlags::EOS | BufferFlags::TIMESTAMP_INVALID,
            Timestamp(0),
        )
    }

    /// Hands CAPTURE slot `index` to the device so a frame can be decoded into it.
    pub fn queue_capture(&mut self, index: u32) -> Result<(), QueueError> {
        let length = self
            .pool
            .capture()
            .slot(index)
            .map(|s| s.length)
            .ok_or(QueueError::InvalidSlot(QueueType::Capture, index))?;

        self.queue(QueueType::Capture, index, length, BufferFlags::empty(), Timestamp(0))
    }

    /// Queues every CAPTURE slot that is not owned by the device. Returns how many were queued.
    pub fn queue_all_capture(&mut self) -> Result<u32, QueueError> {
        let indices: Vec<u32> = self
            .pool
            .capture()
            .slots()
            .iter()
            .filter(|s| s.is_queueable())
            .map(|s| s.index)
            .collect();

        for &index in &indices {
            self.queue_capture(index)?;
        }

        Ok(indices.len() as u32)
    }

    fn dequeue(
        &mut self,
        queue: QueueType,
        next_state: SlotState,
    ) -> Result<DequeuedBuffer, QueueError> {
        let buffer = match self.device.dequeue_buffer(queue) {
            Ok(Some(buffer)) => buffer,
            Ok(None) => return Err(QueueError::Again),
            Err(e) => return Err(QueueError::Device(e)),
        };

        let pool = self.pool.get_mut(queue);
        let count = pool.count();
        let slot = match pool.slot_mut(buffer.index) {
            Some(slot) if slot.state == SlotState::Queued => slot,
            _ => {
                log::error!("{}: dequeued buffer {} was not queued", queue, buffer.index);
                debug_assert!(false, "{queue}: dequeued buffer {} was not queued", buffer.index);
                return Err(QueueError::ProtocolViolation(queue, buffer.index));
            }
        };
        slot.state = next_state;
        slot.bytes_used = buffer.bytes_used;

        log::trace!(
            "{}: dequeued buffer {} flags={} bytes={} ts={}, {}/{} queued",
            queue,
            buffer.index,
            buffer.flags,
            buffer.bytes_used,
            buffer.timestamp.0,
            pool.num_queued(),
            count
        );

        Ok(buffer)
    }

    /// Reclaims a consumed OUTPUT buffer. Its slot goes straight back to FREE.
    pub fn dequeue_output(&mut self) -> Result<DequeuedBuffer, QueueError> {
        self.dequeue(QueueType::Output, SlotState::Free)
    }

    /// Retrieves a decoded frame. Its slot stays DEQUEUED_PENDING_REUSE until re-queued.
    pub fn dequeue_capture(&mut self) -> Result<DequeuedBuffer, QueueError> {
        let buffer = self.dequeue(QueueType::Capture, SlotState::DequeuedPendingReuse)?;
        if buffer.bytes_used > 0 {
            self.total_captured += 1;
        }
        Ok(buffer)
    }

    /// Contents of a retrieved CAPTURE slot.
    pub fn capture_data(&self, index: u32, len: usize) -> Result<&[u8], QueueError> {
        Ok(self.pool.capture().slot_data(index, len)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::MemfdAllocator;
    use crate::device::dummy::DummyDevice;
    use crate::EncodedFormat;

    fn streaming_driver() -> QueueDriver<DummyDevice> {
        let mut driver = QueueDriver::new(DummyDevice::new());
        driver
            .setup_output(
                &MemfdAllocator,
                EncodedFormat::H264.fourcc(),
                Resolution { width: 64, height: 64 },
                4096,
                2,
            )
            .unwrap();
        driver.setup_capture(&MemfdAllocator, Resolution { width: 64, height: 64 }, 3).unwrap();
        driver.set_streaming(QueueType::Output, true).unwrap();
        driver.set_streaming(QueueType::Capture, true).unwrap();
        driver
    }

    fn timing(ts: u64) -> UnitTiming {
        UnitTiming { dts: Some(ts), pts: Some(ts), duration: 33 }
    }

    #[test]
    fn queue_rejects_bad_slots() {
        let mut driver = streaming_driver();

        assert!(matches!(
            driver.queue_output(2, 10, BufferFlags::empty(), timing(0)),
            Err(QueueError::InvalidSlot(QueueType::Output, 2))
        ));

        driver.queue_capture(0).unwrap();
        assert!(matches!(
            driver.queue_capture(0),
            Err(QueueError::AlreadyQueued(QueueType::Capture, 0))
        ));
        assert_eq!(driver.pool().capture().num_queued(), 1);
    }

    #[test]
    fn dequeue_transitions() {
        let mut driver = streaming_driver();
        assert!(matches!(driver.dequeue_capture(), Err(QueueError::Again)));

        assert_eq!(driver.queue_all_capture().unwrap(), 3);
        driver.write_output(0, &[0, 0, 0, 1, 0x65]).unwrap();
        driver.queue_output(0, 5, BufferFlags::empty(), timing(1000)).unwrap();
        assert_eq!(driver.timestamps().pending().len(), 1);

        let out = driver.dequeue_output().unwrap();
        assert_eq!(out.index, 0);
        assert_eq!(driver.pool().output().slot(0).unwrap().state, SlotState::Free);

        let cap = driver.dequeue_capture().unwrap();
        assert_eq!(cap.timestamp, Timestamp(1000));
        assert_eq!(
            driver.pool().capture().slot(cap.index).unwrap().state,
            SlotState::DequeuedPendingReuse
        );
        assert_eq!(driver.total_captured(), 1);

        // Data of a dequeued slot is readable, then the slot can be queued again.
        assert!(driver.capture_data(cap.index, 16).is_ok());
        driver.queue_capture(cap.index).unwrap();
        assert!(driver.capture_data(cap.index, 16).is_err());
    }

    #[test]
    fn unknown_pts_is_flagged_invalid() {
        let mut driver = streaming_driver();
        driver.queue_all_capture().unwrap();
        let timing = UnitTiming { dts: Some(5), pts: None, duration: 1 };
        driver.queue_output(1, 5, BufferFlags::empty(), timing).unwrap();

        let cap = driver.dequeue_capture().unwrap();
        assert_eq!(cap.valid_timestamp(), None);
    }

    #[test]
    fn codec_config_leaves_no_pending_timestamp() {
        let mut driver = streaming_driver();
        driver.queue_output(0, 5, BufferFlags::CODEC_CONFIG, timing(0)).unwrap();
        assert!(driver.timestamps().pending().is_empty());
        assert_eq!(driver.total_output_queued(), 1);
    }

    #[test]
    fn stream_off_frees_queued_slots() {
        let mut driver = streaming_driver();
        driver.queue_all_capture().unwrap();
        assert_eq!(driver.pool().capture().num_queued(), 3);

        driver.set_streaming(QueueType::Capture, false).unwrap();
        assert_eq!(driver.pool().capture().num_queued(), 0);
        assert!(driver.pool().capture().slots().iter().all(|s| s.state == SlotState::Free));

        // Already off.
        driver.set_streaming(QueueType::Capture, false).unwrap();
    }

    #[test]
    fn device_rejection_keeps_slot_free() {
        let mut driver = streaming_driver();
        // The dummy refuses indices beyond the number of buffers it granted.
        driver.device_mut().state().borrow_mut().output.num_buffers = 0;

        assert!(matches!(
            driver.queue_output(0, 5, BufferFlags::empty(), timing(0)),
            Err(QueueError::DeviceRejected { queue: QueueType::Output, index: 0, .. })
        ));
        assert_eq!(driver.pool().output().slot(0).unwrap().state, SlotState::Free);
        assert!(driver.timestamps().pending().is_empty());
    }
}
