//! Leak heuristic applied to one accumulator entry.

use crate::report::{MemCounters, MemKey, Report};

/// Ratio reported when nothing was freed or the ratio is not finite.
pub const RATIO_NO_FREES: f64 = -1.0;

/// Upper bound applied to the alloc/free ratio.
pub const RATIO_CAP: f64 = 1_000_000.0;

/// Minimum allocation (KB) for the imbalance rule.
pub const IMBALANCE_MIN_ALLOC_KB: i64 = 1024;

/// Minimum alloc/free ratio for the imbalance rule.
pub const IMBALANCE_MIN_RATIO: f64 = 1.2;

/// Minimum allocation (KB) for the no-frees rule.
pub const NO_FREES_MIN_ALLOC_KB: i64 = 512;

/// Build a classified report for one `(key, counters)` entry.
pub fn classify(key: &MemKey, counters: &MemCounters, system_id: &str, now: i64) -> Report {
    let alloc_kb = to_kb(counters.allocated_bytes);
    let free_kb = to_kb(counters.freed_bytes);
    let ratio = alloc_ratio(counters);

    Report {
        system_id: system_id.to_string(),
        pid: key.pid,
        process: key.command_name.clone(),
        alloc_kb,
        free_kb,
        ratio,
        leak_suspect: is_leak_suspect(alloc_kb, free_kb, ratio),
        time_stamp: now,
    }
}

/// `allocated / freed`, with the sentinel and cap applied.
pub fn alloc_ratio(counters: &MemCounters) -> f64 {
    if counters.freed_bytes == 0 {
        return RATIO_NO_FREES;
    }

    let ratio = counters.allocated_bytes as f64 / counters.freed_bytes as f64;
    if !ratio.is_finite() {
        RATIO_NO_FREES
    } else if ratio > RATIO_CAP {
        RATIO_CAP
    } else {
        ratio
    }
}

pub fn is_leak_suspect(alloc_kb: i64, free_kb: i64, ratio: f64) -> bool {
    (alloc_kb >= IMBALANCE_MIN_ALLOC_KB && ratio >= IMBALANCE_MIN_RATIO)
        || (free_kb == 0 && alloc_kb >= NO_FREES_MIN_ALLOC_KB)
}

fn to_kb(bytes: u64) -> i64 {
    // u64::MAX / 1024 fits in i64.
    (bytes / 1024) as i64
}
