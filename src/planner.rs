// src/planner.rs
//
// Part sizing for multipart uploads.
//
// The planner is a pure function: the chosen part size is persisted in the
// resume store and must come out identical on every resume attempt for the
// same file, or previously-confirmed parts would map to the wrong byte
// ranges.

use crate::constants::{MAX_PART_SIZE, MIB, MIN_PART_SIZE, TARGET_PART_COUNT};

/// Pick a part size for a file of `file_size` bytes.
///
/// Targets [`TARGET_PART_COUNT`] parts so medium files still upload a few
/// parts in parallel, clamps to [`MIN_PART_SIZE`]..=[`MAX_PART_SIZE`], and
/// rounds up to a whole MiB to avoid odd sizes.
pub fn pick_part_size(file_size: u64) -> u64 {
    let raw = file_size.div_ceil(TARGET_PART_COUNT);
    let clamped = raw.clamp(MIN_PART_SIZE, MAX_PART_SIZE);
    clamped.div_ceil(MIB) * MIB
}

/// Number of parts a file of `file_size` bytes splits into.
/// The final part is the remainder and may be smaller than `part_size`.
pub fn part_count(file_size: u64, part_size: u64) -> u32 {
    file_size.div_ceil(part_size) as u32
}

/// Byte range `[start, end)` of part `part_number` (1-based).
pub fn part_range(file_size: u64, part_size: u64, part_number: u32) -> (u64, u64) {
    let start = (part_number as u64 - 1) * part_size;
    let end = file_size.min(start + part_size);
    (start, end)
}

/// Length in bytes of part `part_number` (1-based).
pub fn part_len(file_size: u64, part_size: u64, part_number: u32) -> u64 {
    let (start, end) = part_range(file_size, part_size, part_number);
    end - start
}
