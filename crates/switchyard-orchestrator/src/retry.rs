use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use switchyard_core::SwitchyardError;

/// Substrings that mark a failure as transient.
pub const RETRYABLE_SIGNALS: [&str; 8] = [
    "timeout",
    "network",
    "connection",
    "unavailable",
    "overloaded",
    "busy",
    "temporary",
    "transient",
];

/// Whether a failure message names a transient condition.
pub fn is_retryable_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    RETRYABLE_SIGNALS.iter().any(|signal| lower.contains(signal))
}

/// Whether an attempt that failed with `err` is worth repeating.
///
/// Deadlines are always transient; cancellation and request errors never
/// are; everything else is judged by its message.
pub fn is_retryable(err: &SwitchyardError) -> bool {
    match err {
        SwitchyardError::Timeout(_) => true,
        SwitchyardError::Cancelled(_)
        | SwitchyardError::Validation(_)
        | SwitchyardError::InvalidTransition(_)
        | SwitchyardError::Config(_) => false,
        other => is_retryable_message(&other.to_string()),
    }
}

/// Exponential backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base_ms: u64,
    /// Upper bound before jitter.
    pub max_ms: u64,
    /// Extra random delay, as a fraction of the computed delay.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: 100,
            max_ms: 30_000,
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// `min(base × 2^retry, max)` for the zero-based `retry`, without jitter.
    pub fn base_delay_ms(&self, retry: u32) -> u64 {
        let delay = self.base_ms.saturating_mul(2u64.saturating_pow(retry));
        delay.min(self.max_ms)
    }

    /// The delay to sleep before retry `retry`, jittered upwards by up to `jitter`.
    pub fn delay(&self, retry: u32) -> Duration {
        let base = self.base_delay_ms(retry);
        let jitter = self.jitter.clamp(0.0, 1.0);
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let extra = if jitter > 0.0 && base > 0 {
            (base as f64 * rand::thread_rng().gen_range(0.0..=jitter)) as u64
        } else {
            0
        };
        Duration::from_millis(base.saturating_add(extra))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_signals() {
        assert!(is_retryable_message("Connection timeout"));
        assert!(is_retryable_message("service OVERLOADED, try later"));
        assert!(is_retryable_message("instance i-1 unavailable: status stopped"));
        assert!(!is_retryable_message("invalid input"));
        assert!(!is_retryable_message("permission denied"));
    }

    #[test]
    fn test_error_classification() {
        assert!(is_retryable(&SwitchyardError::Timeout("after 10ms".into())));
        assert!(is_retryable(&SwitchyardError::Execution("network reset".into())));
        assert!(!is_retryable(&SwitchyardError::Execution("invalid input".into())));
        assert!(!is_retryable(&SwitchyardError::Cancelled("connection dropped".into())));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.base_delay_ms(0), 100);
        assert_eq!(policy.base_delay_ms(1), 200);
        assert_eq!(policy.base_delay_ms(3), 800);
        assert_eq!(policy.base_delay_ms(20), 30_000);
        assert_eq!(policy.base_delay_ms(u32::MAX), 30_000);
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let policy = BackoffPolicy::default();
        for _ in 0..100 {
            let ms = policy.delay(2).as_millis();
            assert!((400..=440).contains(&ms), "{ms}");
        }
        let flat = BackoffPolicy {
            jitter: 0.0,
            ..policy
        };
        assert_eq!(flat.delay(1), Duration::from_millis(200));
    }
}
