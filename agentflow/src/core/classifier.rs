//! Deterministic classification of Validator output.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::Verdict;

/// Token the Validator emits to accept a draft.
pub const APPROVAL_MARKER: &str = "APPROVED";

/// Longest label tolerated before the marker, e.g. `Verdict: ` or `1. `.
const MAX_LABEL_CHARS: usize = 24;

static APPROVAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)\b{}\b", regex::escape(APPROVAL_MARKER)))
        .expect("approval pattern is valid")
});

static NEGATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:not|no|never|cannot|without|feedback)\b|n't\b")
        .expect("negation pattern is valid")
});

/// Classify validator text into approval or feedback.
///
/// - `Approval` if the approval marker opens the text. Leading whitespace,
///   markdown decoration (`**APPROVED**`, `# Approved`) and a short label on
///   the same line (`Verdict: APPROVED`, `1. APPROVED`) are allowed, as long
///   as the label does not negate the marker.
/// - `Feedback` otherwise, including when the marker only appears later on
///   (e.g. "not APPROVED", "FEEDBACK: cannot be APPROVED yet").
pub fn classify_validation(text: &str) -> Verdict {
    let text = text.trim_start();
    let Some(marker) = APPROVAL_RE.find(text) else {
        return Verdict::Feedback;
    };
    let label = &text[..marker.start()];
    let opens_text = !label.contains('\n')
        && label.chars().count() <= MAX_LABEL_CHARS
        && !NEGATION_RE.is_match(label);
    if opens_text {
        Verdict::Approval
    } else {
        Verdict::Feedback
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_marker_is_approval() {
        assert_eq!(classify_validation("APPROVED"), Verdict::Approval);
        assert_eq!(
            classify_validation("APPROVED. The plan is complete."),
            Verdict::Approval
        );
    }

    #[test]
    fn decorated_marker_is_approval() {
        assert_eq!(classify_validation("  **APPROVED**\nGreat work"), Verdict::Approval);
        assert_eq!(classify_validation("# Approved"), Verdict::Approval);
        assert_eq!(classify_validation("> approved: ship it"), Verdict::Approval);
    }

    #[test]
    fn short_label_before_marker_is_approval() {
        assert_eq!(classify_validation("Verdict: APPROVED"), Verdict::Approval);
        assert_eq!(
            classify_validation("Status - APPROVED. Ship it."),
            Verdict::Approval
        );
        assert_eq!(classify_validation("1. APPROVED"), Verdict::Approval);
        assert_eq!(
            classify_validation("**Decision:** Approved\nNice draft."),
            Verdict::Approval
        );
    }

    #[test]
    fn negated_label_is_feedback() {
        assert_eq!(classify_validation("Verdict: NOT APPROVED"), Verdict::Feedback);
        assert_eq!(classify_validation("Can't be approved yet"), Verdict::Feedback);
        assert_eq!(
            classify_validation("FEEDBACK: APPROVED once pricing is added"),
            Verdict::Feedback
        );
    }

    #[test]
    fn marker_after_first_line_is_feedback() {
        assert_eq!(
            classify_validation("Needs work.\nAPPROVED after fixes"),
            Verdict::Feedback
        );
        assert_eq!(
            classify_validation("The draft is thorough, but overall this is APPROVED"),
            Verdict::Feedback
        );
    }

    #[test]
    fn feedback_prefix_is_feedback() {
        assert_eq!(
            classify_validation("FEEDBACK: add a budget section"),
            Verdict::Feedback
        );
    }

    #[test]
    fn marker_later_in_text_is_feedback() {
        assert_eq!(classify_validation("Not APPROVED yet"), Verdict::Feedback);
        assert_eq!(
            classify_validation("FEEDBACK: this cannot be APPROVED until pricing is added"),
            Verdict::Feedback
        );
    }

    #[test]
    fn marker_must_be_a_whole_word() {
        assert_eq!(classify_validation("APPROVEDISH"), Verdict::Feedback);
    }

    #[test]
    fn empty_text_is_feedback() {
        assert_eq!(classify_validation(""), Verdict::Feedback);
    }
}
