//! Hybrid timestamps shared by the id allocator, grants and time-ticks.
//!
//! A [`Timestamp`] packs wall-clock milliseconds into the high bits and an
//! 18-bit logical counter into the low bits, so timestamps drawn within the
//! same millisecond still order strictly.

/// Hybrid logical timestamp.
pub type Timestamp = u64;

/// Number of low bits reserved for the logical counter.
pub const LOGICAL_BITS: u32 = 18;

/// Mask selecting the logical counter.
pub const LOGICAL_MASK: u64 = (1 << LOGICAL_BITS) - 1;

/// Builds a timestamp from physical milliseconds and a logical counter.
#[must_use]
pub const fn compose_ts(physical_ms: u64, logical: u64) -> Timestamp {
    (physical_ms << LOGICAL_BITS) | (logical & LOGICAL_MASK)
}

/// Splits a timestamp into `(physical_ms, logical)`.
#[must_use]
pub const fn parse_ts(ts: Timestamp) -> (u64, u64) {
    (ts >> LOGICAL_BITS, ts & LOGICAL_MASK)
}

/// Shifts the physical part of `ts` forward by `ms`, keeping the logical part.
#[must_use]
pub const fn add_physical_ms(ts: Timestamp, ms: u64) -> Timestamp {
    let (physical, logical) = parse_ts(ts);
    compose_ts(physical.saturating_add(ms), logical)
}
