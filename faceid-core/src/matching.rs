//! Match decision logic.

use serde::Serialize;

/// Default similarity threshold.
pub const DEFAULT_THRESHOLD: f32 = 0.6;

/// Verdict for one verification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub matched: bool,
    /// Present only when `matched` is true.
    pub identity_label: Option<String>,
    pub similarity: f32,
    pub threshold: f32,
}

/// Whether `threshold` is usable: finite and within `[0, 1]`.
pub fn threshold_in_range(threshold: f32) -> bool {
    threshold.is_finite() && (0.0..=1.0).contains(&threshold)
}

/// Compare a raw similarity against `threshold`. The boundary is inclusive.
pub fn decide(similarity: f32, threshold: f32, candidate: Option<&str>) -> MatchResult {
    let matched = similarity >= threshold;
    MatchResult {
        matched,
        identity_label: if matched {
            candidate.map(str::to_string)
        } else {
            None
        },
        similarity,
        threshold,
    }
}
