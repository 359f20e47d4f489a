// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Single-threaded event loop driving a [`DecodeSession`].
//!
//! Each step waits for the device (or a termination signal) with a short timeout. Control events
//! are handled first, then decoded frames, then consumed bitstream buffers. When nothing happened
//! before the timeout, the next bitstream unit is fed to the decoder.

use std::os::fd::AsFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::epoll::Epoll;
use nix::sys::epoll::EpollCreateFlags;
use nix::sys::epoll::EpollEvent;
use nix::sys::epoll::EpollFlags;
use nix::sys::epoll::EpollTimeout;
use nix::sys::signal::SigSet;
use nix::sys::signal::Signal;
use nix::sys::signalfd::SfdFlags;
use nix::sys::signalfd::SignalFd;
use thiserror::Error;

use crate::allocator::PhysicalAllocator;
use crate::bitstream_utils::BitstreamSource;
use crate::device::DecoderDevice;
use crate::session::DecodeSession;
use crate::session::FrameSink;
use crate::session::SessionError;
use crate::utils::retry_on_interrupt;

const DEVICE_TOKEN: u64 = 1;
const SIGNAL_TOKEN: u64 = 2;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("failed to create Epoll: {0}")]
    Epoll(Errno),
    #[error("failed to add poll FDs to Epoll: {0}")]
    EpollAdd(Errno),
    #[error("failed to wait for events: {0}")]
    Wait(Errno),
    #[error("failed to set up termination signals: {0}")]
    Signal(Errno),
}

/// What became ready during one wait.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Readiness {
    /// A control event can be dequeued.
    pub event: bool,
    /// A CAPTURE buffer can be dequeued.
    pub capture: bool,
    /// An OUTPUT buffer can be dequeued.
    pub output: bool,
    /// The process was asked to stop.
    pub terminate: bool,
}

impl Readiness {
    /// Nothing happened before the timeout.
    pub fn is_timeout(&self) -> bool {
        *self == Self::default()
    }

    fn from_device_flags(flags: EpollFlags) -> Self {
        Self {
            event: flags.contains(EpollFlags::EPOLLPRI),
            capture: flags.intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLRDNORM),
            output: flags.intersects(EpollFlags::EPOLLOUT | EpollFlags::EPOLLWRNORM),
            terminate: false,
        }
    }
}

/// Source of readiness notifications for the scheduler.
pub trait Poller {
    fn wait(&mut self) -> Result<Readiness, SchedulerError>;
}

/// [`Poller`] waiting on a decoder device node and on `SIGINT`/`SIGTERM`.
pub struct EpollPoller {
    epoll: Epoll,
    signals: SignalFd,
    timeout_ms: u16,
}

impl EpollPoller {
    /// Blocks the termination signals for the calling thread so they are only reported through
    /// this poller.
    pub fn new<F: AsFd>(device: &F, timeout: Duration) -> Result<Self, SchedulerError> {
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGINT);
        mask.add(Signal::SIGTERM);
        mask.thread_block().map_err(SchedulerError::Signal)?;
        let signals = SignalFd::with_flags(&mask, SfdFlags::SFD_CLOEXEC | SfdFlags::SFD_NONBLOCK)
            .map_err(SchedulerError::Signal)?;

        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(SchedulerError::Epoll)?;
        let device_flags = EpollFlags::EPOLLIN
            | EpollFlags::EPOLLRDNORM
            | EpollFlags::EPOLLOUT
            | EpollFlags::EPOLLWRNORM
            | EpollFlags::EPOLLPRI;
        epoll
            .add(device.as_fd(), EpollEvent::new(device_flags, DEVICE_TOKEN))
            .map_err(SchedulerError::EpollAdd)?;
        epoll
            .add(signals.as_fd(), EpollEvent::new(EpollFlags::EPOLLIN, SIGNAL_TOKEN))
            .map_err(SchedulerError::EpollAdd)?;

        let timeout_ms = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);

        Ok(Self { epoll, signals, timeout_ms })
    }
}

impl Poller for EpollPoller {
    fn wait(&mut self) -> Result<Readiness, SchedulerError> {
        let mut events = [EpollEvent::empty(); 2];
        let timeout = EpollTimeout::from(self.timeout_ms);
        let nb_fds = retry_on_interrupt(|| self.epoll.wait(&mut events, timeout))
            .map_err(SchedulerError::Wait)?;

        let mut readiness = Readiness::default();
        for event in &events[..nb_fds] {
            match event.data() {
                DEVICE_TOKEN => {
                    let flags = event.events();
                    if flags.contains(EpollFlags::EPOLLERR) {
                        log::error!("Poll error on device");
                    }
                    let device = Readiness::from_device_flags(flags);
                    readiness.event |= device.event;
                    readiness.capture |= device.capture;
                    readiness.output |= device.output;
                }
                SIGNAL_TOKEN => {
                    match self.signals.read_signal() {
                        Ok(Some(info)) => log::info!("Received signal {}", info.ssi_signo),
                        Ok(None) => (),
                        Err(e) => log::error!("Failed to read signal: {}", e),
                    }
                    readiness.terminate = true;
                }
                token => log::warn!("Unexpected poll token {}", token),
            }
        }

        Ok(readiness)
    }
}

/// Why the event loop stopped.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The decoder returned the end of stream.
    StreamEnd,
    /// The end of stream was queued but the decoder never returned it.
    Stalled,
    /// A termination signal was received.
    Interrupted,
}

pub struct EventScheduler<P: Poller> {
    poller: P,
}

impl<P: Poller> EventScheduler<P> {
    pub fn new(poller: P) -> Self {
        Self { poller }
    }

    pub fn poller(&self) -> &P {
        &self.poller
    }

    /// Logs `result`'s error if the session can go on, returns it otherwise.
    fn check(result: Result<(), SessionError>) -> Result<(), SessionError> {
        match result {
            Err(e) if !e.is_fatal() => {
                log::warn!("{}", e);
                Ok(())
            }
            result => result,
        }
    }

    /// Runs `session` until the stream ends, a termination signal arrives or a fatal error
    /// occurs. The session must have been started.
    pub fn run<D, A, B, S>(
        &mut self,
        session: &mut DecodeSession<'_, D, A>,
        source: &mut B,
        sink: &mut S,
    ) -> Result<StopReason, SessionError>
    where
        D: DecoderDevice,
        A: PhysicalAllocator,
        B: BitstreamSource + ?Sized,
        S: FrameSink + ?Sized,
    {
        let mut interrupted = false;

        while !session.is_finished() && !interrupted {
            let readiness = self.poller.wait()?;
            log::trace!("{:?}", readiness);

            if readiness.terminate {
                log::info!("Termination requested");
                interrupted = true;
            }

            if readiness.is_timeout() {
                Self::check(session.feed(source).map(|_| ()))?;
                continue;
            }

            if readiness.event {
                Self::check(session.handle_events())?;
            }
            if readiness.capture {
                Self::check(session.handle_capture(sink))?;
            }
            if readiness.output {
                Self::check(session.handle_output())?;
            }
        }

        if session.state().end_of_stream {
            Ok(StopReason::StreamEnd)
        } else if session.is_stalled() {
            Ok(StopReason::Stalled)
        } else {
            Ok(StopReason::Interrupted)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::allocator::MemfdAllocator;
    use crate::bitstream_utils::BitstreamUnit;
    use crate::bitstream_utils::SourceError;
    use crate::device::dummy::DummyDevice;
    use crate::device::vidc_event;
    use crate::device::RawEvent;
    use crate::event::Event;
    use crate::reconfig::ReconfigState;
    use crate::session::DecodedFrame;
    use crate::session::SessionConfig;
    use crate::timestamp::UnitTiming;
    use crate::Resolution;

    struct Units(VecDeque<BitstreamUnit>);

    impl BitstreamSource for Units {
        fn next_unit(&mut self) -> Result<Option<BitstreamUnit>, SourceError> {
            Ok(self.0.pop_front())
        }
    }

    /// `count` units, with a codec configuration unit in front.
    fn stream(count: u64) -> Units {
        let config = BitstreamUnit {
            data: vec![0, 0, 0, 1, 0x40, 0x01],
            is_config: true,
            timing: UnitTiming::default(),
        };
        let frames = (0..count).map(|i| BitstreamUnit {
            data: vec![0, 0, 0, 1, 0x26, 0x01, i as u8],
            is_config: false,
            timing: UnitTiming { dts: Some(i * 33_333), pts: Some(i * 33_333), duration: 33_333 },
        });

        Units(std::iter::once(config).chain(frames).collect())
    }

    #[derive(Default)]
    struct Frames {
        pts: Vec<u64>,
        resolutions: Vec<Resolution>,
    }

    impl FrameSink for Frames {
        fn deliver(&mut self, frame: &DecodedFrame<'_>) -> anyhow::Result<()> {
            self.pts.push(frame.pts);
            self.resolutions.push(frame.layout.resolution);
            Ok(())
        }
    }

    fn config() -> SessionConfig {
        SessionConfig {
            coded_size: Resolution { width: 320, height: 240 },
            output_unit_size: 16 * 1024,
            ..Default::default()
        }
    }

    #[test]
    fn readiness_from_poll_flags() {
        let readiness = Readiness::from_device_flags(EpollFlags::EPOLLPRI | EpollFlags::EPOLLIN);
        assert_eq!(readiness, Readiness { event: true, capture: true, ..Default::default() });
        assert!(Readiness::from_device_flags(EpollFlags::empty()).is_timeout());
        assert!(Readiness::from_device_flags(EpollFlags::EPOLLWRNORM).output);
    }

    #[test]
    fn decode_whole_stream() {
        let device = DummyDevice::new();
        let state = device.state();
        let mut scheduler = EventScheduler::new(device.poller());
        let mut session = DecodeSession::new(device, &MemfdAllocator, config());
        session.start().unwrap();

        let mut frames = Frames::default();
        let reason = scheduler.run(&mut session, &mut stream(10), &mut frames).unwrap();

        assert_eq!(reason, StopReason::StreamEnd);
        assert_eq!(frames.pts, (0..10).map(|i| i * 33_333).collect::<Vec<_>>());
        assert!(session.driver().timestamps().pending().is_empty());
        assert_eq!(session.driver().total_output_queued(), 11);

        let state = state.borrow();
        assert!(state.max_capture_queued <= 4);
        assert!(state.max_output_queued <= 4);
    }

    #[test]
    fn decode_across_resolution_change() {
        let device = DummyDevice::new();
        let state = device.state();
        state.borrow_mut().resolution_change = Some((3, Resolution { width: 640, height: 480 }));
        let mut scheduler = EventScheduler::new(device.poller());
        let mut session = DecodeSession::new(device, &MemfdAllocator, config());
        session.start().unwrap();

        let mut frames = Frames::default();
        let reason = scheduler.run(&mut session, &mut stream(8), &mut frames).unwrap();

        assert_eq!(reason, StopReason::StreamEnd);
        assert_eq!(frames.pts.len(), 8);
        assert!(frames.pts.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(frames.resolutions[0], Resolution { width: 320, height: 240 });
        assert_eq!(frames.resolutions[7], Resolution { width: 640, height: 480 });
        assert_eq!(session.reconfig().state(), ReconfigState::Steady);
        assert_eq!(session.state().resolution, Resolution { width: 640, height: 480 });
        assert_eq!(state.borrow().flushes.len(), 1);
    }

    #[test]
    fn lost_timestamps_are_recovered() {
        let device = DummyDevice::new();
        device.state().borrow_mut().drop_timestamps = true;
        let mut scheduler = EventScheduler::new(device.poller());
        let mut session = DecodeSession::new(device, &MemfdAllocator, config());
        session.start().unwrap();

        let mut frames = Frames::default();
        scheduler.run(&mut session, &mut stream(5), &mut frames).unwrap();

        assert_eq!(frames.pts, (0..5).map(|i| i * 33_333).collect::<Vec<_>>());
    }

    #[test]
    fn termination_signal_stops_the_loop() {
        let device = DummyDevice::new();
        device.state().borrow_mut().max_polls = Some(3);
        let mut scheduler = EventScheduler::new(device.poller());
        let mut session = DecodeSession::new(device, &MemfdAllocator, config());
        session.start().unwrap();

        let reason = scheduler.run(&mut session, &mut stream(100), &mut Frames::default()).unwrap();
        assert_eq!(reason, StopReason::Interrupted);
        assert!(!session.is_finished());
    }

    #[test]
    fn fatal_event_stops_the_loop() {
        let device = DummyDevice::new();
        device.push_event(RawEvent::new(vidc_event::HW_UNSUPPORTED));
        let mut scheduler = EventScheduler::new(device.poller());
        let mut session = DecodeSession::new(device, &MemfdAllocator, config());
        session.start().unwrap();

        let err = scheduler.run(&mut session, &mut stream(4), &mut Frames::default()).unwrap_err();
        assert!(matches!(err, SessionError::Decoder(Event::HwUnsupported)));
    }

    #[test]
    fn missing_end_of_stream_times_out() {
        struct Discard;

        impl FrameSink for Discard {
            fn deliver(&mut self, _frame: &DecodedFrame<'_>) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let device = DummyDevice::new();
        let state = device.state();
        let mut scheduler = EventScheduler::new(device.poller());
        let session_config =
            SessionConfig { eos_idle_polls: 5, capture_buffer_count: 1, ..config() };
        let mut session = DecodeSession::new(device, &MemfdAllocator, session_config);
        session.start().unwrap();

        // Take the only CAPTURE buffer away so the end of stream can never be returned.
        state.borrow_mut().capture.queued.clear();

        let reason = scheduler.run(&mut session, &mut stream(1), &mut Discard).unwrap();
        assert_eq!(reason, StopReason::Stalled);
        assert!(session.is_stalled());
        assert!(!session.state().end_of_stream);
    }

    #[test]
    fn failed_reconfiguration_flush_stops_the_loop() {
        let device = DummyDevice::new();
        let state = device.state();
        {
            let mut state = state.borrow_mut();
            state.resolution_change = Some((3, Resolution { width: 640, height: 480 }));
            state.flush_error = Some(nix::errno::Errno::EBUSY);
        }
        let mut scheduler = EventScheduler::new(device.poller());
        let mut session = DecodeSession::new(device, &MemfdAllocator, config());
        session.start().unwrap();

        let mut frames = Frames::default();
        let err = scheduler.run(&mut session, &mut stream(8), &mut frames).unwrap_err();

        assert!(matches!(err, SessionError::Reconfiguration(_)));
        assert!(frames.pts.len() <= 3);
        assert!(!session.state().reconfiguration_pending);
        assert_eq!(session.state().resolution, Resolution { width: 320, height: 240 });
    }

    #[test]
    fn units_without_decode_timestamps_drain() {
        let device = DummyDevice::new();
        let mut scheduler = EventScheduler::new(device.poller());
        let mut session = DecodeSession::new(device, &MemfdAllocator, config());
        session.start().unwrap();

        let units = (0..6u64).map(|i| BitstreamUnit {
            data: vec![0, 0, 0, 1, 0x26, 0x01, i as u8],
            is_config: false,
            timing: UnitTiming { dts: None, pts: Some(1_000_000 + i * 33_333), duration: 33_333 },
        });
        let mut frames = Frames::default();
        let reason =
            scheduler.run(&mut session, &mut Units(units.collect()), &mut frames).unwrap();

        assert_eq!(reason, StopReason::StreamEnd);
        assert_eq!(frames.pts, (0..6).map(|i| i * 33_333).collect::<Vec<_>>());
        assert!(session.driver().timestamps().pending().is_empty());
    }
}
