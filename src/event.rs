// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoding of the control events sent by the decoder.

use byteorder::ByteOrder;
use byteorder::NativeEndian;
use enumn::N;
use thiserror::Error;

use crate::device::vidc_event;
use crate::device::FlushMask;
use crate::device::RawEvent;
use crate::Resolution;

/// Picture structure value meaning the stream may be interlaced.
const PIC_STRUCT_MAYBE_INTERLACED: u32 = 0;
const PIC_STRUCT_PROGRESSIVE: u32 = 1;

/// Bit depth codes used in port-settings events.
const BIT_DEPTH_8: u32 = 0;
const BIT_DEPTH_10: u32 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("malformed {kind:?} payload: {reason}")]
    Malformed { kind: EventKind, reason: &'static str },
}

#[repr(u32)]
#[derive(N, Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    FlushDone = vidc_event::FLUSH_DONE,
    PortSettingsChangedSufficient = vidc_event::PORT_SETTINGS_CHANGED_SUFFICIENT,
    PortSettingsChangedInsufficient = vidc_event::PORT_SETTINGS_CHANGED_INSUFFICIENT,
    SysError = vidc_event::SYS_ERROR,
    ReleaseBufferReference = vidc_event::RELEASE_BUFFER_REFERENCE,
    ReleaseUnqueuedBuffer = vidc_event::RELEASE_UNQUEUED_BUFFER,
    HwOverload = vidc_event::HW_OVERLOAD,
    MaxClients = vidc_event::MAX_CLIENTS,
    HwUnsupported = vidc_event::HW_UNSUPPORTED,
}

/// New stream parameters announced by the decoder.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PortSettings {
    pub resolution: Resolution,
    pub bit_depth: u32,
    pub interlaced: bool,
    pub colour_space: u32,
}

/// A control event, decoded.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// The stream parameters changed and the current CAPTURE buffers cannot hold the frames.
    PortChangeInsufficient(PortSettings),
    /// The stream parameters changed but the current CAPTURE buffers are still usable.
    PortChangeSufficient,
    FlushDone(FlushMask),
    SysError,
    HwOverload,
    HwUnsupported,
    /// The decoder no longer references a previously returned buffer.
    BufferReferenceReleased,
    /// The decoder released a buffer that was never queued.
    UnqueuedBufferReleased,
    /// Too many decoding sessions are open on the device.
    MaxClients,
    Unknown(u32),
}

fn word(raw: &RawEvent, n: usize) -> u32 {
    NativeEndian::read_u32(&raw.data[n * 4..n * 4 + 4])
}

impl Event {
    pub fn from_raw(raw: &RawEvent) -> Result<Self, EventError> {
        let Some(kind) = EventKind::n(raw.kind) else {
            return Ok(Event::Unknown(raw.kind));
        };

        let event = match kind {
            EventKind::PortSettingsChangedInsufficient => {
                let malformed = |reason| EventError::Malformed { kind, reason };

                let resolution = Resolution { width: word(raw, 1), height: word(raw, 0) };
                if resolution.is_empty() {
                    return Err(malformed("empty resolution"));
                }

                let bit_depth = match word(raw, 2) {
                    BIT_DEPTH_8 | 8 => 8,
                    BIT_DEPTH_10 | 10 => 10,
                    _ => return Err(malformed("unknown bit depth")),
                };

                let interlaced = match word(raw, 3) {
                    PIC_STRUCT_MAYBE_INTERLACED => true,
                    PIC_STRUCT_PROGRESSIVE => false,
                    _ => return Err(malformed("unknown picture structure")),
                };

                Event::PortChangeInsufficient(PortSettings {
                    resolution,
                    bit_depth,
                    interlaced,
                    colour_space: word(raw, 4),
                })
            }
            EventKind::PortSettingsChangedSufficient => Event::PortChangeSufficient,
            EventKind::FlushDone => Event::FlushDone(FlushMask(word(raw, 0))),
            EventKind::SysError => Event::SysError,
            EventKind::HwOverload => Event::HwOverload,
            EventKind::HwUnsupported => Event::HwUnsupported,
            EventKind::ReleaseBufferReference => Event::BufferReferenceReleased,
            EventKind::ReleaseUnqueuedBuffer => Event::UnqueuedBufferReleased,
            EventKind::MaxClients => Event::MaxClients,
        };

        Ok(event)
    }

    /// Whether the session cannot go on after this event.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Event::SysError | Event::HwUnsupported | Event::MaxClients)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_change_insufficient() {
        let raw = RawEvent::with_words(
            vidc_event::PORT_SETTINGS_CHANGED_INSUFFICIENT,
            &[480, 640, BIT_DEPTH_10, PIC_STRUCT_PROGRESSIVE, 3],
        );
        assert_eq!(
            Event::from_raw(&raw),
            Ok(Event::PortChangeInsufficient(PortSettings {
                resolution: Resolution { width: 640, height: 480 },
                bit_depth: 10,
                interlaced: false,
                colour_space: 3,
            }))
        );
    }

    #[test]
    fn malformed_payloads() {
        let raw = RawEvent::with_words(vidc_event::PORT_SETTINGS_CHANGED_INSUFFICIENT, &[0, 640]);
        assert!(matches!(
            Event::from_raw(&raw),
            Err(EventError::Malformed { reason: "empty resolution", .. })
        ));

        let raw = RawEvent::with_words(
            vidc_event::PORT_SETTINGS_CHANGED_INSUFFICIENT,
            &[480, 640, 5, PIC_STRUCT_PROGRESSIVE],
        );
        assert!(Event::from_raw(&raw).is_err());
    }

    #[test]
    fn flush_done_mask() {
        let raw = RawEvent::with_words(vidc_event::FLUSH_DONE, &[FlushMask::CAPTURE.0]);
        let Ok(Event::FlushDone(mask)) = Event::from_raw(&raw) else {
            panic!("not a flush done event");
        };
        assert!(mask.contains(FlushMask::CAPTURE));
        assert!(!mask.contains(FlushMask::OUTPUT));
    }

    #[test]
    fn simple_events() {
        let decode = |kind| Event::from_raw(&RawEvent::new(kind)).unwrap();

        assert_eq!(
            decode(vidc_event::PORT_SETTINGS_CHANGED_SUFFICIENT),
            Event::PortChangeSufficient
        );
        assert_eq!(decode(vidc_event::SYS_ERROR), Event::SysError);
        assert_eq!(decode(vidc_event::HW_OVERLOAD), Event::HwOverload);
        assert_eq!(decode(vidc_event::HW_UNSUPPORTED), Event::HwUnsupported);
        assert_eq!(decode(vidc_event::RELEASE_BUFFER_REFERENCE), Event::BufferReferenceReleased);
        assert_eq!(decode(vidc_event::RELEASE_UNQUEUED_BUFFER), Event::UnqueuedBufferReleased);
        assert_eq!(decode(0x1234), Event::Unknown(0x1234));

        assert!(Event::SysError.is_fatal());
        assert!(!Event::HwOverload.is_fatal());
    }
}
