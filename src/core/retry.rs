//! Failure classification and retry backoff.
//!
//! Failures fall into two buckets: transient infrastructure problems
//! (retried with exponential backoff, bounded by a separate failure count)
//! and terminal failures (retried up to `max_attempts` with a short fixed
//! backoff, then blocked). Classification is driven purely by the failure
//! text, so the same message always yields the same decision.

use std::sync::LazyLock;
use std::time::Duration;

use regex::RegexSet;

/// Signatures that mark a failure as transient infrastructure trouble.
static RETRYABLE_SIGNATURES: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)\btimed?[ -]?out\b",
        r"(?i)\brate.?limit",
        r"(?i)\btoo many requests\b",
        r"(?i)\b429\b",
        r"(?i)\b5\d\d\b.{0,40}(?i:error|status)",
        r"(?i)\b(?:500|502|503|504|529)\b",
        r"(?i)internal server error",
        r"(?i)service unavailable",
        r"(?i)temporarily unavailable",
        r"(?i)connection (?:reset|refused|closed|aborted)",
        r"(?i)network (?:error|unreachable|timeout)",
        r"(?i)unexpected eof",
        r"(?i)index\.lock",
        r"(?i)unable to create .*\.lock",
        r"(?i)lock (?:contention|held|busy)",
        r"(?i)resource temporarily unavailable",
    ])
    .expect("retryable signature set should compile")
});

/// Signatures that indicate provider capacity or overload trouble, which
/// triggers the cross-provider fallback chain rather than an outright retry.
static CAPACITY_SIGNATURES: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)\boverload(?:ed)?\b",
        r"(?i)\bcapacity\b",
        r"(?i)\b529\b",
        r"(?i)\b429\b",
        r"(?i)\brate.?limit",
        r"(?i)quota (?:exceeded|exhausted)",
        r"(?i)model .*(?:unavailable|not available)",
        r"(?i)usage limit",
    ])
    .expect("capacity signature set should compile")
});

/// Whether a failure is worth retrying without consuming an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Transient infrastructure failure; retried with exponential backoff.
    Retryable,
    /// Terminal failure; retried up to `max_attempts`, then blocked.
    Terminal,
}

/// Classify a failure message by its text.
pub fn classify(text: &str) -> FailureKind {
    if RETRYABLE_SIGNATURES.is_match(text) {
        FailureKind::Retryable
    } else {
        FailureKind::Terminal
    }
}

/// True if a failure message looks like provider capacity/overload trouble.
pub fn is_capacity_signature(text: &str) -> bool {
    CAPACITY_SIGNATURES.is_match(text)
}

/// Tunable retry bounds, sourced from lane configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before a terminally failing task is blocked.
    pub max_attempts: u32,
    /// Retryable failures tolerated before treating attempts as exhausted.
    pub max_retryable_failures: u32,
    /// Base delay for the exponential retryable backoff.
    pub retry_base_secs: u64,
    /// Ceiling for the retryable backoff.
    pub retry_cap_secs: u64,
    /// Lower bound of the short backoff applied between bounded attempts.
    pub attempt_backoff_min_secs: u64,
    /// Upper bound of the short backoff applied between bounded attempts.
    pub attempt_backoff_max_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_retryable_failures: 5,
            retry_base_secs: 60,
            retry_cap_secs: 3600,
            attempt_backoff_min_secs: 30,
            attempt_backoff_max_secs: 120,
        }
    }
}

/// What the scheduler should do with a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Reschedule as pending after the given cooldown, incrementing
    /// `retryable_failures` but not judging the attempt terminal.
    RetryTransient { delay: Duration },
    /// Reschedule as pending after a short cooldown; the attempt counted
    /// against `max_attempts`.
    RetryBounded { delay: Duration },
    /// Attempts (or retryable failures) exhausted; block permanently.
    Block,
}

/// Exponential backoff for consecutive retryable failures:
/// `min(cap, base * 2^(failures - 1))`. `failures` is 1-indexed.
pub fn retry_backoff(policy: &RetryPolicy, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(32);
    let secs = policy
        .retry_base_secs
        .saturating_mul(1u64 << exp)
        .min(policy.retry_cap_secs);
    Duration::from_secs(secs)
}

/// Short fixed-range backoff between bounded attempts.
///
/// Deterministic spread within `[min, max]` keyed on the attempt count, so
/// repeated failures do not all land on the same instant without introducing
/// randomness into scheduling.
pub fn attempt_backoff(policy: &RetryPolicy, attempts: u32) -> Duration {
    let min = policy.attempt_backoff_min_secs;
    let max = policy.attempt_backoff_max_secs.max(min);
    let span = max - min + 1;
    let secs = min + (u64::from(attempts).saturating_mul(17)) % span;
    Duration::from_secs(secs)
}

/// Decide the disposition for a failed execution.
///
/// `attempts` and `retryable_failures` are the counts *before* this failure
/// is folded in.
pub fn decide(
    kind: FailureKind,
    attempts: u32,
    retryable_failures: u32,
    policy: &RetryPolicy,
) -> Disposition {
    match kind {
        FailureKind::Retryable => {
            let failures = retryable_failures + 1;
            if failures > policy.max_retryable_failures {
                Disposition::Block
            } else {
                Disposition::RetryTransient {
                    delay: retry_backoff(policy, failures),
                }
            }
        }
        FailureKind::Terminal => {
            if attempts >= policy.max_attempts {
                Disposition::Block
            } else {
                Disposition::RetryBounded {
                    delay: attempt_backoff(policy, attempts),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_matches_transient_signatures() {
        for text in [
            "Request timed out after 600s",
            "HTTP 429 Too Many Requests",
            "upstream returned 503 Service Unavailable",
            "error: rate limit exceeded, retry later",
            "fatal: Unable to create '/repo/.git/index.lock': File exists.",
            "connection reset by peer",
        ] {
            assert_eq!(classify(text), FailureKind::Retryable, "text: {text}");
        }
    }

    #[test]
    fn classify_treats_other_failures_as_terminal() {
        for text in [
            "assertion failed: expected 3 got 4",
            "agent produced no output",
            "compile error in src/lib.rs",
        ] {
            assert_eq!(classify(text), FailureKind::Terminal, "text: {text}");
        }
    }

    #[test]
    fn capacity_signatures_detected() {
        assert!(is_capacity_signature("Anthropic API is overloaded (529)"));
        assert!(is_capacity_signature("quota exceeded for model"));
        assert!(!is_capacity_signature("segmentation fault"));
    }

    #[test]
    fn retry_backoff_is_monotonic_and_capped() {
        let policy = RetryPolicy::default();
        let mut previous = Duration::ZERO;
        for failures in 1..=12 {
            let delay = retry_backoff(&policy, failures);
            assert!(delay >= previous, "backoff decreased at {failures}");
            assert!(delay <= Duration::from_secs(policy.retry_cap_secs));
            previous = delay;
        }
        assert_eq!(retry_backoff(&policy, 1).as_secs(), 60);
        assert_eq!(retry_backoff(&policy, 3).as_secs(), 240);
        assert_eq!(retry_backoff(&policy, 12).as_secs(), 3600);
    }

    #[test]
    fn attempt_backoff_stays_in_range() {
        let policy = RetryPolicy::default();
        for attempts in 0..20 {
            let delay = attempt_backoff(&policy, attempts).as_secs();
            assert!(delay >= policy.attempt_backoff_min_secs);
            assert!(delay <= policy.attempt_backoff_max_secs);
        }
    }

    #[test]
    fn decide_retryable_within_budget() {
        let policy = RetryPolicy::default();
        let disposition = decide(FailureKind::Retryable, 1, 0, &policy);
        assert_eq!(
            disposition,
            Disposition::RetryTransient {
                delay: Duration::from_secs(60)
            }
        );
    }

    #[test]
    fn decide_retryable_exhaustion_blocks() {
        let policy = RetryPolicy {
            max_retryable_failures: 2,
            ..RetryPolicy::default()
        };
        assert_eq!(decide(FailureKind::Retryable, 1, 2, &policy), Disposition::Block);
    }

    #[test]
    fn decide_terminal_respects_max_attempts() {
        let policy = RetryPolicy::default();
        assert!(matches!(
            decide(FailureKind::Terminal, 2, 0, &policy),
            Disposition::RetryBounded { .. }
        ));
        assert_eq!(decide(FailureKind::Terminal, 3, 0, &policy), Disposition::Block);
    }
}
