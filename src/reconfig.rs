// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Dynamic resolution change.
//!
//! When the decoder finds that the CAPTURE buffers cannot hold the frames of the stream anymore
//! it sends a port-settings-changed event. The CAPTURE queue is then flushed, and once the flush
//! completes it is torn down and set up again at the new resolution while the OUTPUT queue keeps
//! streaming.

use crate::allocator::PhysicalAllocator;
use crate::device::vidc_ctrl;
use crate::device::Control;
use crate::device::DecoderDevice;
use crate::device::FlushMask;
use crate::device::QueueType;
use crate::event::Event;
use crate::event::PortSettings;
use crate::queue::QueueDriver;
use crate::session::SessionError;
use crate::session::SessionState;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReconfigState {
    /// Streaming with correctly sized CAPTURE buffers.
    Steady,
    /// A CAPTURE flush was issued, waiting for it to complete.
    FlushPending,
    /// CAPTURE buffers are being reallocated.
    Reallocating,
}

/// What the session should do after an event was handled.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventAction {
    Continue,
    /// The decoder cannot go on. Carries the event that said so.
    Terminate(Event),
}

/// Controls selecting the decoded picture buffer layout for a stream of `bit_depth`.
pub fn dpb_controls(bit_depth: u32) -> [Control; 2] {
    let (output_mode, dpb_format) = if bit_depth == 10 {
        (vidc_ctrl::STREAM_OUTPUT_SECONDARY, vidc_ctrl::DPB_COLOR_FMT_TP10_UBWC)
    } else {
        (vidc_ctrl::STREAM_OUTPUT_PRIMARY, vidc_ctrl::DPB_COLOR_FMT_NONE)
    };

    [
        Control::new("stream output mode", vidc_ctrl::STREAM_OUTPUT_MODE, output_mode),
        Control::new("DPB color format", vidc_ctrl::DPB_COLOR_FORMAT, dpb_format),
    ]
}

/// Applies `control`, logging instead of failing if the device rejects it.
pub(crate) fn apply_control<D: DecoderDevice>(device: &mut D, control: Control) -> bool {
    log::trace!("Trying to set control {}", control.name);
    match device.set_control(control) {
        Ok(()) => {
            log::debug!("Control {} set to {}", control.name, control.value);
            true
        }
        Err(e) => {
            log::error!("Setting control {} to {} failed: {}", control.name, control.value, e);
            false
        }
    }
}

/// Tears down the CAPTURE queue if needed, sets it up for the current stream parameters and
/// starts it with all of its buffers queued. Returns the number of buffers queued.
pub fn restart_capture<D: DecoderDevice, A: PhysicalAllocator>(
    driver: &mut QueueDriver<D>,
    allocator: &A,
    state: &SessionState,
    count: u32,
) -> Result<u32, SessionError> {
    driver.set_streaming(QueueType::Capture, false)?;
    driver.teardown_capture()?;

    for control in dpb_controls(state.bit_depth) {
        apply_control(driver.device_mut(), control);
    }

    driver.setup_capture(allocator, state.resolution, count)?;
    driver.set_streaming(QueueType::Capture, true)?;
    let queued = driver.queue_all_capture()?;

    log::debug!("CAPTURE: restarted at {} with {} buffers", state.resolution, queued);

    Ok(queued)
}

/// Reconfiguration state machine. Dispatches every control event of the session.
#[derive(Debug)]
pub struct ReconfigMachine {
    state: ReconfigState,
    capture_count: u32,
}

impl ReconfigMachine {
    /// `capture_count` is the number of CAPTURE buffers requested on every reallocation.
    pub fn new(capture_count: u32) -> Self {
        Self { state: ReconfigState::Steady, capture_count }
    }

    pub fn state(&self) -> ReconfigState {
        self.state
    }

    fn set_state(&mut self, state: ReconfigState) {
        if self.state != state {
            log::debug!("reconfiguration: {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    fn begin<D: DecoderDevice>(
        &mut self,
        settings: PortSettings,
        driver: &mut QueueDriver<D>,
        session: &mut SessionState,
    ) -> Result<(), SessionError> {
        log::info!(
            "Port reconfiguration requested, new size {} depth {}{}",
            settings.resolution,
            settings.bit_depth,
            if settings.interlaced { " interlaced" } else { "" }
        );

        // Capture buffers come back through the flush, the queue is reallocated once it is done.
        // A failed flush leaves the decoder waiting for larger buffers.
        driver
            .device_mut()
            .flush(FlushMask::CAPTURE)
            .map_err(|e| SessionError::Reconfiguration(Box::new(e.into())))?;

        session.resolution = settings.resolution;
        session.bit_depth = settings.bit_depth;
        session.interlaced = settings.interlaced;
        session.colour_space = settings.colour_space;
        session.reconfiguration_pending = true;
        self.set_state(ReconfigState::FlushPending);

        Ok(())
    }

    fn reallocate<D: DecoderDevice, A: PhysicalAllocator>(
        &mut self,
        driver: &mut QueueDriver<D>,
        allocator: &A,
        session: &mut SessionState,
    ) -> Result<(), SessionError> {
        self.set_state(ReconfigState::Reallocating);
        if let Err(e) = restart_capture(driver, allocator, session, self.capture_count) {
            self.set_state(ReconfigState::Steady);
            return Err(SessionError::Reconfiguration(Box::new(e)));
        }
        session.reconfiguration_pending = false;
        self.set_state(ReconfigState::Steady);
        log::info!("Reconfiguration done, decoding at {}", session.resolution);

        Ok(())
    }

    /// Handles one control event.
    pub fn handle_event<D: DecoderDevice, A: PhysicalAllocator>(
        &mut self,
        event: Event,
        driver: &mut QueueDriver<D>,
        allocator: &A,
        session: &mut SessionState,
    ) -> Result<EventAction, SessionError> {
        match (self.state, event) {
            (_, Event::SysError | Event::HwUnsupported | Event::MaxClients) => {
                log::error!("Decoder reported {:?}, stopping", event);
                return Ok(EventAction::Terminate(event));
            }
            (ReconfigState::Steady, Event::PortChangeInsufficient(settings)) => {
                self.begin(settings, driver, session)?;
            }
            (ReconfigState::Steady, Event::PortChangeSufficient) => {
                log::debug!("Port settings changed, current buffers are sufficient");
            }
            (ReconfigState::FlushPending, Event::FlushDone(mask))
                if mask.contains(FlushMask::CAPTURE) =>
            {
                log::debug!("Flush done received on {:?}", mask);
                self.reallocate(driver, allocator, session)?;
            }
            (_, Event::FlushDone(mask)) => {
                log::debug!("Flush done received on {:?}", mask);
            }
            (_, Event::HwOverload) => log::warn!("Decoder hardware overloaded"),
            (_, Event::BufferReferenceReleased) => log::debug!("Release buffer reference"),
            (_, Event::UnqueuedBufferReleased) => log::debug!("Release unqueued buffer"),
            (_, Event::Unknown(code)) => log::error!("Unknown event type {:#x}", code),
            (state, event) => {
                log::warn!("Ignoring {:?} while in {:?}", event, state);
            }
        }

        Ok(EventAction::Continue)
    }
}
