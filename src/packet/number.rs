//! Packet-number truncation and reconstruction.
//!
//! Packet numbers are 64-bit internally and transmitted truncated to 1, 2
//! or 4 octets (short headers) or a fixed 4 octets (long headers). The
//! receiver reconstructs the full value by picking the candidate closest to
//! the next expected packet number.

/// Pick the on-wire length for a short-header packet number, sized so the
/// peer can reconstruct it from its acknowledgment state.
pub fn wire_length(pn: u64, largest_acked: u64) -> usize {
    let span = pn.saturating_sub(largest_acked);
    if span < 1 << 7 {
        1
    } else if span < 1 << 15 {
        2
    } else {
        4
    }
}

/// Truncate `pn` to its low `size` octets.
pub fn truncate(pn: u64, size: usize) -> u64 {
    if size >= 8 {
        return pn;
    }
    pn & ((1u64 << (size * 8)) - 1)
}

/// Reconstruct a full packet number from `size` on-wire octets.
///
/// The expected value is `highest_received + 1`. The truncated number fixes
/// the low bits; the high bits are taken from the expected value or its
/// neighbors one window up or down, whichever lands closest. Ties go to the
/// unshifted candidate.
pub fn expand(pn: u64, size: usize, highest_received: u64) -> u64 {
    if size >= 8 {
        return pn;
    }

    let expected = highest_received.wrapping_add(1);
    let window = 1u64 << (size * 8);
    let mask = window - 1;
    let high = expected & !mask;

    let mut best = high | pn;
    let mut best_distance = expected.abs_diff(best);

    if let Some(below) = high.checked_sub(window) {
        let candidate = below | pn;
        let distance = expected.abs_diff(candidate);
        if distance < best_distance {
            best = candidate;
            best_distance = distance;
        }
    }
    if let Some(above) = high.checked_add(window) {
        let candidate = above | pn;
        let distance = expected.abs_diff(candidate);
        if distance < best_distance {
            best = candidate;
        }
    }
    best
}
