// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Retry policies, used by clients to resubmit operations that reached a node which doesn't
//! own the target partition anymore.

use std::future::Future;
use std::num::NonZeroUsize;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_with::{DeserializeAs, SerializeAs};

// every pause gets a random extra of MIN_JITTER up to 30% of the pause
const JITTER_MULTIPLIER: f32 = 0.3;
const MIN_JITTER: Duration = Duration::from_millis(3);

/// How often, and after which pauses, a failed operation is attempted again.
///
/// ```rust
/// use std::time::Duration;
/// use permitgrid_types::retries::RetryPolicy;
///
/// let policy = RetryPolicy::fixed_delay(Duration::from_millis(100), Some(2));
/// assert_eq!(policy.into_iter().count(), 2);
/// ```
#[serde_with::serde_as]
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "kebab-case"
)]
pub enum RetryPolicy {
    /// # None
    ///
    /// Fail on the first error.
    #[default]
    None,
    /// # Fixed delay
    ///
    /// Pause for the same `interval` before every retry.
    FixedDelay {
        /// # Interval
        ///
        /// Pause between attempts, in humantime format, e.g. `100ms`.
        #[serde_as(as = "HumanDuration")]
        interval: Duration,
        /// # Max attempts
        ///
        /// Retries before giving up, unlimited if unset.
        max_attempts: Option<NonZeroUsize>,
    },
    /// # Exponential
    ///
    /// Multiply the pause by `factor` after every retry, up to `max_interval`.
    Exponential {
        /// # Initial interval
        #[serde_as(as = "HumanDuration")]
        initial_interval: Duration,
        /// # Factor
        factor: f32,
        /// # Max attempts
        ///
        /// Retries before giving up, unlimited if unset.
        max_attempts: Option<NonZeroUsize>,
        /// # Max interval
        #[serde_as(as = "Option<HumanDuration>")]
        max_interval: Option<Duration>,
    },
}

impl RetryPolicy {
    /// # Panics
    /// If `max_attempts` is `Some(0)`.
    pub fn fixed_delay(interval: Duration, max_attempts: Option<usize>) -> Self {
        Self::FixedDelay {
            interval,
            max_attempts: max_attempts.map(|m| NonZeroUsize::new(m).expect("non-zero")),
        }
    }

    /// # Panics
    /// If `max_attempts` is `Some(0)`.
    pub fn exponential(
        initial_interval: Duration,
        factor: f32,
        max_attempts: Option<usize>,
        max_interval: Option<Duration>,
    ) -> Self {
        Self::Exponential {
            initial_interval,
            factor,
            max_attempts: max_attempts.map(|m| NonZeroUsize::new(m).expect("non-zero")),
            max_interval,
        }
    }

    pub fn max_attempts(&self) -> Option<NonZeroUsize> {
        match self {
            RetryPolicy::None => None,
            RetryPolicy::FixedDelay { max_attempts, .. }
            | RetryPolicy::Exponential { max_attempts, .. } => *max_attempts,
        }
    }

    /// Runs `operation` until it succeeds, fails with an error `condition` rejects, or the
    /// policy runs out of retries. Returns the last error in the latter cases.
    pub async fn retry_if<T, E, Op, Fut, C>(
        self,
        mut operation: Op,
        mut condition: C,
    ) -> Result<T, E>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnMut(&E) -> bool,
    {
        let mut backoff = self.into_iter();
        loop {
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !condition(&err) {
                return Err(err);
            }
            match backoff.next() {
                Some(pause) => tokio::time::sleep(pause).await,
                None => return Err(err),
            }
        }
    }
}

impl IntoIterator for RetryPolicy {
    type Item = Duration;
    type IntoIter = Backoff;

    fn into_iter(self) -> Backoff {
        Backoff {
            policy: self,
            attempts: 0,
            last_pause: None,
        }
    }
}

/// The pauses of a [`RetryPolicy`], jittered.
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    attempts: usize,
    last_pause: Option<Duration>,
}

impl Backoff {
    fn next_pause(&self) -> Option<Duration> {
        match &self.policy {
            RetryPolicy::None => None,
            RetryPolicy::FixedDelay { interval, .. } => Some(*interval),
            RetryPolicy::Exponential {
                initial_interval,
                factor,
                max_interval,
                ..
            } => Some(match self.last_pause {
                None => *initial_interval,
                Some(last) => last
                    .mul_f32(*factor)
                    .min(max_interval.unwrap_or(Duration::MAX)),
            }),
        }
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self
            .policy
            .max_attempts()
            .is_some_and(|limit| self.attempts >= limit.get())
        {
            return None;
        }

        let pause = self.next_pause()?;
        self.attempts += 1;
        self.last_pause = Some(pause);
        Some(jittered(pause))
    }
}

fn jittered(pause: Duration) -> Duration {
    let max_jitter = pause.mul_f32(JITTER_MULTIPLIER);
    if max_jitter <= MIN_JITTER {
        pause + MIN_JITTER
    } else {
        pause + rand::rng().random_range(MIN_JITTER..max_jitter)
    }
}

/// Serializes a [`Duration`] in the [`humantime`] format, e.g. `1s 500ms`.
pub struct HumanDuration;

impl SerializeAs<Duration> for HumanDuration {
    fn serialize_as<S: Serializer>(source: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*source))
    }
}

impl<'de> DeserializeAs<'de, Duration> for HumanDuration {
    fn deserialize_as<D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let value = String::deserialize(deserializer)?;
        humantime::parse_duration(&value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    use googletest::prelude::*;

    use super::*;

    fn jitter_range(pause: Duration) -> std::ops::RangeInclusive<Duration> {
        pause..=pause + pause.mul_f32(JITTER_MULTIPLIER).max(MIN_JITTER)
    }

    fn assert_pauses(policy: RetryPolicy, expected: &[Duration]) {
        let actual: Vec<_> = policy.into_iter().collect();
        assert_that!(actual.len(), eq(expected.len()));
        for (pause, expected) in actual.iter().zip(expected) {
            assert!(
                jitter_range(*expected).contains(pause),
                "{pause:?} is not a jittered {expected:?}"
            );
        }
    }

    #[test]
    fn none_never_retries() {
        assert_that!(RetryPolicy::None.into_iter().next(), none());
    }

    #[test]
    fn fixed_delay_is_bounded_by_max_attempts() {
        assert_pauses(
            RetryPolicy::fixed_delay(Duration::from_millis(100), Some(4)),
            &[Duration::from_millis(100); 4],
        );
    }

    #[test]
    fn exponential_grows_up_to_max_interval() {
        assert_pauses(
            RetryPolicy::exponential(
                Duration::from_millis(100),
                2.0,
                Some(5),
                Some(Duration::from_millis(500)),
            ),
            &[
                Duration::from_millis(100),
                Duration::from_millis(100).mul_f32(2.0),
                Duration::from_millis(100).mul_f32(2.0).mul_f32(2.0),
                Duration::from_millis(500),
                Duration::from_millis(500),
            ],
        );
    }

    #[test]
    fn unlimited_policies_keep_going() {
        let mut backoff = RetryPolicy::fixed_delay(Duration::from_millis(1), None).into_iter();
        assert_that!(backoff.by_ref().take(1000).count(), eq(1000));
        assert_that!(backoff.next(), some(anything()));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn retry_if_stops_on_rejected_error() {
        let attempts = Arc::new(AtomicU64::new(0));

        let result: std::result::Result<(), &str> =
            RetryPolicy::fixed_delay(Duration::from_millis(10), Some(5))
                .retry_if(
                    || {
                        let attempts = Arc::clone(&attempts);
                        async move {
                            if attempts.fetch_add(1, Ordering::Relaxed) < 2 {
                                Err("retryable")
                            } else {
                                Err("fatal")
                            }
                        }
                    },
                    |err| *err == "retryable",
                )
                .await;

        assert_that!(result, err(eq("fatal")));
        assert_that!(attempts.load(Ordering::Relaxed), eq(3));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn retry_if_gives_up_after_max_attempts() {
        let attempts = Arc::new(AtomicU64::new(0));

        let result: std::result::Result<(), u64> =
            RetryPolicy::fixed_delay(Duration::from_millis(10), Some(2))
                .retry_if(
                    || {
                        let attempts = Arc::clone(&attempts);
                        async move { Err(attempts.fetch_add(1, Ordering::Relaxed)) }
                    },
                    |_| true,
                )
                .await;

        assert_that!(result, err(eq(2)));
    }

    #[test]
    fn parses_humantime_durations() {
        #[derive(Deserialize)]
        struct Wrapper {
            policy: RetryPolicy,
        }

        let parsed: Wrapper = toml::from_str(
            r#"
            [policy]
            type = "exponential"
            initial-interval = "50ms"
            factor = 2.0
            max-attempts = 3
            max-interval = "1s"
            "#,
        )
        .unwrap();

        assert_that!(
            parsed.policy,
            eq(RetryPolicy::exponential(
                Duration::from_millis(50),
                2.0,
                Some(3),
                Some(Duration::from_secs(1))
            ))
        );
    }
}
