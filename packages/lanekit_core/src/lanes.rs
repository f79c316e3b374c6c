//! Lane naming and ordering
//!
//! AFC-style hardware addresses feed channels by free-form object names like
//! `lane0` or `lane12`, and discovery can surface the same lane through
//! several status keys. Consumers need one stable, deduplicated ordering
//! before a topology snapshot is built from the raw names.

use std::cmp::Ordering;

/// Parse the numeric suffix of a `lane<N>` name.
///
/// Returns `Some` only for the literal prefix `lane` followed by one or more
/// ASCII digits and nothing else. Anything malformed (`lanes`, `lane`,
/// `lane1a`, `Lane3`) simply carries no index — absence, not an error.
pub fn parse_lane_index(name: &str) -> Option<u32> {
    let suffix = name.strip_prefix("lane")?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // Suffixes too large for u32 fall back to "no index" as well.
    suffix.parse().ok()
}

/// Compare two lane names under the canonical ordering: indexed names first,
/// ascending by parsed index, then non-indexed names in lexicographic order.
/// Equal indices (e.g. `lane1` vs `lane01`) fall back to the name so the
/// order is total.
pub fn compare_lane_names(left: &str, right: &str) -> Ordering {
    match (parse_lane_index(left), parse_lane_index(right)) {
        (Some(l), Some(r)) => l.cmp(&r).then_with(|| left.cmp(right)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => left.cmp(right),
    }
}

/// Sort lane names into the canonical order and drop duplicates.
///
/// The comparator is total, so the result is deterministic and applying the
/// function twice yields the same sequence.
pub fn sort_and_dedupe(mut names: Vec<String>) -> Vec<String> {
    names.sort_by(|left, right| compare_lane_names(left, right));
    names.dedup();
    names
}
