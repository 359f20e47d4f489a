// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A decoding session: one bitstream decoded by one device.
//!
//! [`DecodeSession`] owns the [`QueueDriver`] and the stream parameters, and reacts to the three
//! kinds of readiness reported by the device. It is meant to be driven by
//! [`crate::scheduler::EventScheduler`], but every step can also be called by hand.

use std::time::Duration;

use thiserror::Error;

use crate::allocator::AllocationError;
use crate::allocator::PhysicalAllocator;
use crate::bitstream_utils::BitstreamSource;
use crate::bitstream_utils::SourceError;
use crate::buffer_pool::SetupError;
use crate::device::vidc_ctrl;
use crate::device::vidc_event;
use crate::device::BufferFlags;
use crate::device::Control;
use crate::device::DecoderDevice;
use crate::device::DeviceError;
use crate::device::QueueType;
use crate::event::Event;
use crate::image_processing::FrameLayout;
use crate::queue::QueueDriver;
use crate::queue::QueueError;
use crate::reconfig::apply_control;
use crate::reconfig::restart_capture;
use crate::reconfig::EventAction;
use crate::reconfig::ReconfigMachine;
use crate::scheduler::SchedulerError;
use crate::utils::align_up;
use crate::EncodedFormat;
use crate::Resolution;

/// Parameters of a decoding session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub format: EncodedFormat,
    /// Coded size used until the decoder reports the real one.
    pub coded_size: Resolution,
    /// Requested size of each OUTPUT buffer.
    pub output_unit_size: u32,
    pub output_buffer_count: u32,
    pub capture_buffer_count: u32,
    /// Stream frame rate as `(numerator, denominator)`, if known.
    pub frame_rate: Option<(u32, u32)>,
    /// Return frames in decode order instead of display order.
    pub decode_order: bool,
    /// Only decode frames of the picture types selected by the driver.
    pub skip_frames: bool,
    /// Color used to paint corrupted macroblocks.
    pub conceal_color: i32,
    /// How long a scheduler step waits for the device.
    pub poll_timeout: Duration,
    /// Idle steps after the end of stream was queued before giving up on the decoder.
    pub eos_idle_polls: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            format: EncodedFormat::H265,
            coded_size: Resolution { width: 1928, height: 1208 },
            output_unit_size: 1024 * 1024,
            output_buffer_count: 4,
            capture_buffer_count: 4,
            frame_rate: None,
            decode_order: false,
            skip_frames: false,
            conceal_color: 0x00ff,
            poll_timeout: Duration::from_millis(10),
            eos_idle_polls: 200,
        }
    }
}

/// Parameters of the stream being decoded.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionState {
    pub resolution: Resolution,
    pub bit_depth: u32,
    pub interlaced: bool,
    pub colour_space: u32,
    pub reconfiguration_pending: bool,
    pub end_of_stream: bool,
    pub decode_order: bool,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("setup failed: {0}")]
    Setup(#[from] SetupError),
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
    #[error("allocation failed: {0}")]
    Allocation(#[from] AllocationError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("bitstream source error: {0}")]
    Source(#[from] SourceError),
    #[error("frame sink error: {0}")]
    Sink(anyhow::Error),
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("decoder reported {0:?}")]
    Decoder(Event),
    #[error("reconfiguration failed: {0}")]
    Reconfiguration(Box<SessionError>),
}

impl SessionError {
    /// Whether the session must stop.
    pub fn is_fatal(&self) -> bool {
        match self {
            SessionError::Device(e) => !e.is_retryable(),
            SessionError::Queue(QueueError::Again) => false,
            SessionError::Queue(QueueError::Device(e)) => !e.is_retryable(),
            SessionError::Queue(QueueError::DeviceRejected { error, .. }) => !error.is_retryable(),
            _ => true,
        }
    }
}

/// A decoded frame, borrowed from its CAPTURE buffer for the duration of the delivery.
#[derive(Debug)]
pub struct DecodedFrame<'a> {
    pub index: u32,
    pub data: &'a [u8],
    pub layout: FrameLayout,
    /// Presentation timestamp in microseconds.
    pub pts: u64,
    pub flags: BufferFlags,
}

/// Consumer of decoded frames.
pub trait FrameSink {
    fn deliver(&mut self, frame: &DecodedFrame<'_>) -> anyhow::Result<()>;
}

/// Result of trying to feed one bitstream unit to the decoder.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FeedOutcome {
    Submitted,
    /// No OUTPUT buffer is free, try again later.
    NoFreeBuffer,
    /// The source is exhausted and the end of stream was queued.
    EndOfStreamQueued,
    /// The unit did not fit in an OUTPUT buffer and was discarded.
    Dropped,
    /// Nothing left to feed.
    Idle,
}

pub struct DecodeSession<'a, D: DecoderDevice, A: PhysicalAllocator> {
    config: SessionConfig,
    allocator: &'a A,
    driver: QueueDriver<D>,
    state: SessionState,
    reconfig: ReconfigMachine,
    eos_queued: bool,
    idle_polls_after_eos: u32,
    stalled: bool,
    dropped_units: u64,
    terminated_by: Option<Event>,
}

impl<'a, D: DecoderDevice, A: PhysicalAllocator> DecodeSession<'a, D, A> {
    pub fn new(device: D, allocator: &'a A, config: SessionConfig) -> Self {
        let state = SessionState {
            resolution: config.coded_size,
            bit_depth: 8,
            decode_order: config.decode_order,
            ..Default::default()
        };

        Self {
            reconfig: ReconfigMachine::new(config.capture_buffer_count),
            config,
            allocator,
            driver: QueueDriver::new(device),
            state,
            eos_queued: false,
            idle_polls_after_eos: 0,
            stalled: false,
            dropped_units: 0,
            terminated_by: None,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn driver(&self) -> &QueueDriver<D> {
        &self.driver
    }

    pub fn reconfig(&self) -> &ReconfigMachine {
        &self.reconfig
    }

    /// The session is over: the stream ended, the decoder gave up or it stopped answering.
    pub fn is_finished(&self) -> bool {
        self.state.end_of_stream || self.stalled || self.terminated_by.is_some()
    }

    /// The end of stream was queued but the decoder never returned it.
    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    /// Number of units discarded because they did not fit in an OUTPUT buffer.
    pub fn dropped_units(&self) -> u64 {
        self.dropped_units
    }

    /// The event that made the decoder give up, if any.
    pub fn terminated_by(&self) -> Option<Event> {
        self.terminated_by
    }

    fn controls(&self) -> Vec<Control> {
        let mut controls = Vec::new();

        if self.config.decode_order {
            controls.push(Control::new(
                "output order",
                vidc_ctrl::OUTPUT_ORDER,
                vidc_ctrl::OUTPUT_ORDER_DECODE,
            ));
        }
        if self.config.skip_frames {
            controls.push(Control::new(
                "picture type decode mode",
                vidc_ctrl::PICTYPE_DEC_MODE,
                vidc_ctrl::PICTYPE_DECODE_ON,
            ));
        }
        controls.push(Control::new("continue data transfer", vidc_ctrl::CONTINUE_DATA_TRANSFER, 1));
        controls.push(Control::new(
            "performance level",
            vidc_ctrl::SET_PERF_LEVEL,
            vidc_ctrl::PERF_LEVEL_TURBO,
        ));
        controls.push(Control::new(
            "conceal color",
            vidc_ctrl::CONCEAL_COLOR,
            self.config.conceal_color,
        ));

        controls
    }

    /// Checks the device, negotiates both queues and starts streaming. Every CAPTURE buffer is
    /// queued when this returns.
    pub fn start(&mut self) -> Result<(), SessionError> {
        let device = self.driver.device_mut();

        let caps = device.capabilities()?;
        log::info!("Decoder: {}", caps);
        caps.check()?;

        for queue in [QueueType::Output, QueueType::Capture] {
            for desc in device.enum_formats(queue)? {
                log::debug!("{}: format {} ({})", queue, desc.fourcc, desc.description);
            }
        }

        for &kind in vidc_event::SUBSCRIBED {
            device.subscribe_event(kind)?;
        }

        if let Some((num, den)) = self.config.frame_rate.filter(|(num, _)| *num != 0) {
            // Time per frame is the inverse of the frame rate.
            if let Err(e) = device.set_frame_period(QueueType::Output, den, num) {
                log::error!("Failed to set frame rate to {}/{}: {}", num, den, e);
            }
        }

        self.driver.setup_output(
            self.allocator,
            self.config.format.fourcc(),
            self.config.coded_size,
            self.config.output_unit_size,
            self.config.output_buffer_count,
        )?;

        for control in self.controls() {
            apply_control(self.driver.device_mut(), control);
        }

        self.driver.set_streaming(QueueType::Output, true)?;
        restart_capture(
            &mut self.driver,
            self.allocator,
            &self.state,
            self.config.capture_buffer_count,
        )?;

        log::info!("Video stream started at {}", self.state.resolution);

        Ok(())
    }

    /// Dequeues and dispatches every pending control event.
    pub fn handle_events(&mut self) -> Result<(), SessionError> {
        while let Some(raw) = self.driver.device_mut().dequeue_event()? {
            let event = match Event::from_raw(&raw) {
                Ok(event) => event,
                Err(e) => {
                    log::error!("{}", e);
                    continue;
                }
            };

            let action = self.reconfig.handle_event(
                event,
                &mut self.driver,
                self.allocator,
                &mut self.state,
            )?;
            if let EventAction::Terminate(event) = action {
                self.terminated_by = Some(event);
                return Err(SessionError::Decoder(event));
            }
        }

        Ok(())
    }

    fn capture_layout(&self) -> FrameLayout {
        let format = self.driver.pool().capture().format();
        let resolution = format.map(|f| f.resolution).unwrap_or(self.state.resolution);

        let stride = match format.map(|f| f.bytes_per_line()).unwrap_or(0) {
            0 => align_up(resolution.width as usize, 128) as u32,
            stride => stride,
        };
        let scanlines = match format.and_then(|f| f.planes.first()).map(|p| p.scanlines) {
            Some(scanlines) if scanlines != 0 => scanlines,
            _ => align_up(resolution.height as usize, 32) as u32,
        };

        FrameLayout { resolution, stride, scanlines }
    }

    /// Retrieves every decoded frame, timestamps it and hands it to `sink`. Buffers are queued
    /// back unless a reconfiguration is pending.
    pub fn handle_capture<S: FrameSink + ?Sized>(
        &mut self,
        sink: &mut S,
    ) -> Result<(), SessionError> {
        loop {
            let buffer = match self.driver.dequeue_capture() {
                Ok(buffer) => buffer,
                Err(QueueError::Again) => return Ok(()),
                Err(e) => return Err(e.into()),
            };

            if buffer.bytes_used > 0 {
                let pts = self.driver.timestamps_mut().reconcile(buffer.valid_timestamp());
                let layout = self.capture_layout();
                let data = self.driver.capture_data(buffer.index, buffer.bytes_used as usize)?;

                log::debug!(
                    "CAPTURE: frame {} pts {} size {} {}",
                    buffer.index,
                    pts,
                    buffer.bytes_used,
                    layout.resolution
                );

                let frame =
                    DecodedFrame { index: buffer.index, data, layout, pts, flags: buffer.flags };
                sink.deliver(&frame).map_err(SessionError::Sink)?;
            }

            if !self.state.reconfiguration_pending
                && self.driver.pool().capture().is_streaming()
            {
                self.driver.queue_capture(buffer.index)?;
            }

            if buffer.flags.contains(BufferFlags::EOS) {
                log::info!(
                    "End of stream, {} frames captured from {} units",
                    self.driver.total_captured(),
                    self.driver.total_output_queued()
                );
                self.state.end_of_stream = true;
                return Ok(());
            }
        }
    }

    /// Reclaims every OUTPUT buffer the decoder is done with.
    pub fn handle_output(&mut self) -> Result<(), SessionError> {
        loop {
            match self.driver.dequeue_output() {
                Ok(_) => (),
                Err(QueueError::Again) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Pulls one unit from `source` and queues it, provided an OUTPUT buffer is free. Queues the
    /// end of stream once the source is exhausted.
    pub fn feed<B: BitstreamSource + ?Sized>(
        &mut self,
        source: &mut B,
    ) -> Result<FeedOutcome, SessionError> {
        if self.eos_queued {
            self.idle_polls_after_eos += 1;
            if self.idle_polls_after_eos > self.config.eos_idle_polls && !self.stalled {
                log::warn!("Decoder did not return the end of stream, stopping");
                self.stalled = true;
            }
            return Ok(FeedOutcome::Idle);
        }

        let Some(index) = self.driver.pool().output().first_free() else {
            log::trace!("No output buffer available");
            return Ok(FeedOutcome::NoFreeBuffer);
        };

        let unit = match source.next_unit() {
            Ok(Some(unit)) => unit,
            Ok(None) => {
                log::debug!("Queue end of stream");
                return self.queue_eos(index);
            }
            Err(e) => {
                log::error!("Parsing failed: {}", e);
                return self.queue_eos(index);
            }
        };

        let bytes_used = match self.driver.write_output(index, &unit.data) {
            Ok(bytes_used) => bytes_used,
            Err(e) => {
                self.dropped_units += 1;
                log::error!("Dropping {} bytes unit: {}", unit.data.len(), e);
                return Ok(FeedOutcome::Dropped);
            }
        };

        let flags = if unit.is_config { BufferFlags::CODEC_CONFIG } else { BufferFlags::empty() };
        self.driver.queue_output(index, bytes_used, flags, unit.timing)?;

        Ok(FeedOutcome::Submitted)
    }

    fn queue_eos(&mut self, index: u32) -> Result<FeedOutcome, SessionError> {
        log::info!("Sending EOS for buffer {}", index);
        self.driver.queue_eos(index)?;
        self.eos_queued = true;
        Ok(FeedOutcome::EndOfStreamQueued)
    }

    /// Stops both queues and releases their buffers. Safe to call more than once.
    pub fn stop(&mut self) -> Result<(), SessionError> {
        let capture = self.driver.teardown_capture();
        let output = self.driver.teardown_output();
        capture?;
        output?;
        Ok(())
    }
}

impl<'a, D: DecoderDevice, A: PhysicalAllocator> Drop for DecodeSession<'a, D, A> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::error!("Failed to stop decoding session: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::allocator::MemfdAllocator;
    use crate::bitstream_utils::BitstreamUnit;
    use crate::device::dummy::DummyDevice;
    use crate::device::RawEvent;
    use crate::scheduler::Poller;
    use crate::timestamp::UnitTiming;

    struct Units(VecDeque<BitstreamUnit>);

    impl BitstreamSource for Units {
        fn next_unit(&mut self) -> Result<Option<BitstreamUnit>, SourceError> {
            Ok(self.0.pop_front())
        }
    }

    /// Collects the timestamps of the delivered frames.
    #[derive(Default)]
    struct PtsSink(Vec<u64>);

    impl FrameSink for PtsSink {
        fn deliver(&mut self, frame: &DecodedFrame<'_>) -> anyhow::Result<()> {
            assert!(frame.data.len() >= frame.layout.uv_offset() * 3 / 2);
            self.0.push(frame.pts);
            Ok(())
        }
    }

    fn units(n: u64) -> Units {
        Units(
            (0..n)
                .map(|i| BitstreamUnit {
                    data: vec![0, 0, 1, 0x26, i as u8],
                    is_config: false,
                    timing: UnitTiming { dts: Some(i * 40), pts: Some(i * 40), duration: 40 },
                })
                .collect(),
        )
    }

    fn config() -> SessionConfig {
        SessionConfig {
            coded_size: Resolution { width: 320, height: 240 },
            output_unit_size: 16 * 1024,
            frame_rate: Some((25, 1)),
            ..Default::default()
        }
    }

    #[test]
    fn start_negotiates_everything() {
        let device = DummyDevice::new();
        let state = device.state();
        let mut session = DecodeSession::new(device, &MemfdAllocator, config());
        session.start().unwrap();

        let state = state.borrow();
        assert_eq!(state.subscribed_events, vidc_event::SUBSCRIBED);
        assert_eq!(state.frame_period, Some((1, 25)));
        assert!(state.output.streaming && state.capture.streaming);
        assert_eq!(state.capture.queued.len(), 4);
        assert!(state.controls.iter().any(|c| c.id == vidc_ctrl::CONCEAL_COLOR && c.value == 0xff));
        assert!(!state.controls.iter().any(|c| c.id == vidc_ctrl::OUTPUT_ORDER));
    }

    #[test]
    fn rejected_control_is_not_fatal() {
        let device = DummyDevice::new();
        device.state().borrow_mut().rejected_controls.push(vidc_ctrl::SET_PERF_LEVEL);
        let mut session = DecodeSession::new(device, &MemfdAllocator, config());
        session.start().unwrap();
    }

    #[test]
    fn decode_by_hand() {
        let device = DummyDevice::new();
        let mut session = DecodeSession::new(device, &MemfdAllocator, config());
        session.start().unwrap();

        let mut source = units(3);
        let mut sink = PtsSink::default();

        for _ in 0..3 {
            assert_eq!(session.feed(&mut source).unwrap(), FeedOutcome::Submitted);
            session.handle_output().unwrap();
            session.handle_capture(&mut sink).unwrap();
        }
        assert_eq!(session.feed(&mut source).unwrap(), FeedOutcome::EndOfStreamQueued);
        session.handle_capture(&mut sink).unwrap();

        assert!(session.is_finished());
        assert_eq!(sink.0, vec![0, 40, 80]);
        assert!(session.driver().timestamps().pending().is_empty());
    }

    #[test]
    fn no_free_output_buffer() {
        let device = DummyDevice::new();
        let mut session = DecodeSession::new(device, &MemfdAllocator, config());
        session.start().unwrap();

        let mut source = units(8);
        for _ in 0..4 {
            assert_eq!(session.feed(&mut source).unwrap(), FeedOutcome::Submitted);
        }
        // All OUTPUT buffers are done but not reclaimed yet.
        assert_eq!(session.feed(&mut source).unwrap(), FeedOutcome::NoFreeBuffer);
        session.handle_output().unwrap();
        assert_eq!(session.feed(&mut source).unwrap(), FeedOutcome::Submitted);
    }

    #[test]
    fn oversized_unit_is_dropped() {
        let device = DummyDevice::new();
        let mut session = DecodeSession::new(device, &MemfdAllocator, config());
        session.start().unwrap();

        let mut source = units(3);
        source.0[1].data = vec![0; 64 * 1024];
        let mut sink = PtsSink::default();

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            outcomes.push(session.feed(&mut source).unwrap());
            session.handle_output().unwrap();
            session.handle_capture(&mut sink).unwrap();
        }
        assert_eq!(
            outcomes,
            vec![FeedOutcome::Submitted, FeedOutcome::Dropped, FeedOutcome::Submitted]
        );
        assert_eq!(session.dropped_units(), 1);
        assert_eq!(session.driver().total_output_queued(), 2);

        assert_eq!(session.feed(&mut source).unwrap(), FeedOutcome::EndOfStreamQueued);
        session.handle_capture(&mut sink).unwrap();
        assert_eq!(sink.0, vec![0, 80]);
        assert!(session.driver().timestamps().pending().is_empty());
    }

    #[test]
    fn capture_is_not_requeued_during_reconfiguration() {
        let device = DummyDevice::new();
        let mut poller = device.poller();
        device.push_event(RawEvent::with_words(
            vidc_event::PORT_SETTINGS_CHANGED_INSUFFICIENT,
            &[480, 640, 0, 1, 0],
        ));
        let mut session = DecodeSession::new(device, &MemfdAllocator, config());
        session.start().unwrap();

        session.handle_events().unwrap();
        assert!(session.state().reconfiguration_pending);

        // The flushed buffers come back empty and stay with us.
        session.handle_capture(&mut PtsSink::default()).unwrap();
        assert_eq!(session.driver().pool().capture().num_queued(), 0);

        // Flush completion.
        assert!(poller.wait().unwrap().event);
        session.handle_events().unwrap();
        assert!(!session.state().reconfiguration_pending);
        assert_eq!(session.state().resolution, Resolution { width: 640, height: 480 });
        assert_eq!(session.driver().pool().capture().num_queued(), 4);
    }

    #[test]
    fn sys_error_terminates() {
        let device = DummyDevice::new();
        device.push_event(RawEvent::new(vidc_event::SYS_ERROR));
        let mut session = DecodeSession::new(device, &MemfdAllocator, config());
        session.start().unwrap();

        let err = session.handle_events().unwrap_err();
        assert!(matches!(err, SessionError::Decoder(Event::SysError)));
        assert!(err.is_fatal());
        assert!(session.is_finished());
    }

    #[test]
    fn stop_twice() {
        let device = DummyDevice::new();
        let state = device.state();
        let mut session = DecodeSession::new(device, &MemfdAllocator, config());
        session.start().unwrap();
        session.stop().unwrap();
        session.stop().unwrap();

        assert_eq!(state.borrow().capture.num_buffers, 0);
        assert_eq!(state.borrow().output.num_buffers, 0);
        assert_eq!(session.driver().pool().capture().count(), 0);
    }
}
