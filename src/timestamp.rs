// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Presentation timestamp recovery.
//!
//! The decoder is supposed to copy the timestamp of a bitstream unit to the frame it produces,
//! but it may reorder frames or flag their timestamp as invalid. Every submitted unit leaves a
//! [`PendingTimestamp`] behind, and every decoded frame consumes the pending entry with the lowest
//! decode timestamp, which is then used to derive a PTS when the decoder did not provide one.
//! Units without a decode timestamp are consumed in submission order once no other entry is left.
//!
//! All values are in microseconds.

use crate::device::Timestamp;

/// Timing of a bitstream unit, as known by the bitstream source.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct UnitTiming {
    pub dts: Option<u64>,
    pub pts: Option<u64>,
    pub duration: u64,
}

/// A submitted unit whose frame has not been retrieved yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingTimestamp {
    pub dts: Option<u64>,
    pub pts: Option<u64>,
    pub duration: u64,
    /// Offset subtracted from the derived PTS so that the stream starts at zero.
    pub base: u64,
}

#[derive(Debug, Default)]
pub struct TimestampReconciler {
    /// Entries in submission order.
    pending: Vec<PendingTimestamp>,
    /// `PTS - DTS` of the first unit for which both were known.
    pts_dts_delta: Option<i64>,
    last_emitted_pts: Option<u64>,
    /// First known PTS of the stream.
    base: Option<u64>,
}

impl TimestampReconciler {
    pub fn new() -> Self {
        Default::default()
    }

    /// Records a unit handed to the decoder.
    pub fn record_submission(&mut self, timing: UnitTiming) {
        if let (None, Some(pts)) = (self.base, timing.pts) {
            log::debug!("stream base set to {}", pts);
            self.base = Some(pts);
            // Units submitted before the first PTS share the base of the rest of the stream.
            for entry in &mut self.pending {
                entry.base = pts;
            }
        }

        if self.pts_dts_delta.is_none() {
            if let (Some(pts), Some(dts)) = (timing.pts, timing.dts) {
                let delta = pts as i64 - dts as i64;
                log::debug!("pts/dts delta set to {}", delta);
                self.pts_dts_delta = Some(delta);
            }
        }

        self.pending.push(PendingTimestamp {
            dts: timing.dts,
            pts: timing.pts,
            duration: timing.duration,
            base: self.base.unwrap_or(0),
        });
    }

    /// Returns the presentation timestamp of a decoded frame whose device timestamp is
    /// `decoded`, `None` meaning the device flagged it as invalid.
    ///
    /// Consumes the pending entry with the lowest known DTS. When no entry has one, the oldest
    /// entry is consumed instead.
    pub fn reconcile(&mut self, decoded: Option<Timestamp>) -> u64 {
        let min = self
            .pending
            .iter()
            .enumerate()
            .filter_map(|(pos, entry)| entry.dts.map(|dts| (pos, dts)))
            .min_by_key(|(_, dts)| *dts)
            .map(|(pos, _)| pos)
            .or(if self.pending.is_empty() { None } else { Some(0) });

        if let Some(entry) = min.map(|pos| &self.pending[pos]) {
            log::trace!(
                "pending {} min pts {:?} dts {:?} duration {}",
                self.pending.len(),
                entry.pts,
                entry.dts,
                entry.duration
            );
        }

        let min_entry = min.map(|pos| &self.pending[pos]);
        let pts = match decoded {
            Some(timestamp) => timestamp.0,
            None => {
                log::trace!("no pts on frame");
                let from_delta = min_entry.and_then(|entry| {
                    let dts = entry.dts?;
                    let delta = self.pts_dts_delta?;
                    Some((dts as i64).saturating_add(delta).max(0) as u64)
                });

                match from_delta {
                    Some(pts) => pts,
                    None => {
                        let guess = match (min_entry, self.last_emitted_pts) {
                            (Some(entry), Some(last)) => last.saturating_add(entry.duration),
                            _ => 0,
                        };
                        log::trace!("guessing pts {}", guess);
                        guess
                    }
                }
            }
        };

        self.last_emitted_pts = Some(pts);

        match min {
            Some(pos) => {
                let entry = self.pending.remove(pos);
                pts.saturating_sub(entry.base)
            }
            None => pts,
        }
    }

    pub fn pending(&self) -> &[PendingTimestamp] {
        &self.pending
    }

    pub fn last_emitted_pts(&self) -> Option<u64> {
        self.last_emitted_pts
    }

    /// Forgets every pending entry, keeping the stream-wide delta and base.
    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }
}
