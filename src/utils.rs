// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Utility functions used by several parts of this crate.
//!
//! This module is for anything that doesn't fit into the other top-level modules. Try not to add
//! new code here unless it really doesn't belong anywhere else.

use nix::errno::Errno;

/// Calls `f` until it returns something other than `EINTR`.
///
/// Every call into the decoder device or the allocator goes through this, so that a signal
/// landing in the middle of an ioctl never surfaces as a device failure.
pub fn retry_on_interrupt<T, F>(mut f: F) -> nix::Result<T>
where
    F: FnMut() -> nix::Result<T>,
{
    loop {
        match f() {
            Err(Errno::EINTR) => continue,
            res => return res,
        }
    }
}

/// Renders the bits of `value` as a `|`-separated list of names from `names`.
///
/// Bits that have no name are printed as a single trailing hex value.
pub fn flags_to_string(value: u32, names: &[(u32, &'static str)]) -> String {
    let mut parts = Vec::new();
    let mut remaining = value;

    for (bit, name) in names {
        if value & bit == *bit && *bit != 0 {
            parts.push((*name).to_string());
            remaining &= !bit;
        }
    }

    if remaining != 0 {
        parts.push(format!("{remaining:#x}"));
    }

    if parts.is_empty() {
        String::from("0")
    } else {
        parts.join("|")
    }
}

/// Rounds `value` up to the next multiple of `alignment`, which must be a power of two.
pub const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn retry_stops_on_success() {
        let calls = Cell::new(0);
        let res = retry_on_interrupt(|| {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(Errno::EINTR)
            } else {
                Ok(calls.get())
            }
        });
        assert_eq!(res, Ok(3));
    }

    #[test]
    fn retry_passes_other_errors() {
        let calls = Cell::new(0);
        let res: nix::Result<()> = retry_on_interrupt(|| {
            calls.set(calls.get() + 1);
            Err(Errno::EBUSY)
        });
        assert_eq!(res, Err(Errno::EBUSY));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn flags_rendering() {
        const NAMES: &[(u32, &str)] = &[(0x1, "A"), (0x4, "C")];
        assert_eq!(flags_to_string(0, NAMES), "0");
        assert_eq!(flags_to_string(0x5, NAMES), "A|C");
        assert_eq!(flags_to_string(0x13, NAMES), "A|0x12");
    }

    #[test]
    fn align() {
        assert_eq!(align_up(0, 128), 0);
        assert_eq!(align_up(1, 128), 128);
        assert_eq!(align_up(1920, 128), 1920);
        assert_eq!(align_up(1928, 128), 2048);
    }
}
