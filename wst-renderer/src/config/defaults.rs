//! Default values used by `serde` when a key is missing.

use crate::ring::{MAX_RING_DEPTH, MIN_RING_DEPTH};

pub(super) fn default_false() -> bool {
    false
}

/// No fast-path delegate unless one is configured.
pub(super) fn default_fast_render() -> Option<String> {
    None
}

/// Triple buffering.
pub(super) fn default_overlay_buffers() -> usize {
    3
}

/// Two frames at 60 Hz.
pub(super) fn default_displayed_timeout_ms() -> u64 {
    32
}

pub(super) const OVERLAY_BUFFERS_RANGE: std::ops::RangeInclusive<usize> = MIN_RING_DEPTH..=MAX_RING_DEPTH;
