//! # Byte-Rate Admission Control
//!
//! Token bucket over bytes. Callers draw `n` bytes from a shared budget
//! that refills at a fixed rate up to a burst ceiling. When the budget is
//! short the configured [`AdmissionPolicy`] decides whether the caller
//! waits, is rejected at once, or waits up to a deadline.
//!
//! A checkout larger than the burst ceiling is admitted once the bucket is
//! full and drives the bucket into debt; later callers pay it off.
//!
//! Waiting callers queue in arrival order behind a fair async mutex. Only
//! the head of the queue draws on the bucket, so a stream of small
//! checkouts cannot overtake a large one that is waiting for refill.
//!
//! Nothing is reserved while a caller sleeps. Dropping a suspended
//! `checkout` future (client went away) releases its queue slot and leaves
//! the bucket untouched.
//!
//! Ingress and egress each get their own limiter; there is no
//! cross-crediting between them.

use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Mutex as WaitQueue;
use tokio::time::Instant;

use crate::error::AdmissionError;
use crate::metrics;

/// Shortest sleep between refill checks.
const MIN_WAIT: Duration = Duration::from_millis(1);

/// What to do when the bucket cannot cover a checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdmissionPolicy {
    /// Suspend until enough budget accrues.
    #[default]
    BlockUntilAvailable,
    /// Fail at once.
    RejectImmediately,
    /// Suspend for at most the given duration, then fail.
    RejectAfter(Duration),
}

impl fmt::Display for AdmissionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BlockUntilAvailable => f.write_str("block"),
            Self::RejectImmediately => f.write_str("reject"),
            Self::RejectAfter(limit) => write!(f, "reject-after({}ms)", limit.as_millis()),
        }
    }
}

/// Refill rate and burst ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRate {
    /// Bytes added to the bucket per second. Must be non-zero.
    pub bytes_per_sec: u64,
    /// Bucket capacity in bytes.
    pub burst_bytes: u64,
}

impl ByteRate {
    /// A rate whose burst equals one second of throughput.
    pub fn per_second(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec,
            burst_bytes: bytes_per_sec,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
    queue: WaitQueue<()>,
}

#[derive(Debug)]
struct BucketState {
    available: f64,
    refilled_at: Instant,
}

impl Bucket {
    fn new(rate: ByteRate) -> Self {
        let burst = rate.burst_bytes.max(1) as f64;
        Self {
            rate: rate.bytes_per_sec.max(1) as f64,
            burst,
            state: Mutex::new(BucketState {
                available: burst,
                refilled_at: Instant::now(),
            }),
            queue: WaitQueue::new(()),
        }
    }

    /// Take `n` bytes, or report how long until the bucket could cover them.
    fn try_take(&self, n: u64) -> Result<(), Duration> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.refilled_at).as_secs_f64();
        state.available = (state.available + elapsed * self.rate).min(self.burst);
        state.refilled_at = now;

        let requested = n as f64;
        let needed = requested.min(self.burst);
        if state.available >= needed {
            state.available -= requested;
            Ok(())
        } else {
            let wait = Duration::from_secs_f64((needed - state.available) / self.rate);
            Err(wait.max(MIN_WAIT))
        }
    }

    fn available(&self) -> f64 {
        self.state.lock().available
    }
}

/// A named byte-rate gate.
#[derive(Debug)]
pub struct AdmissionLimiter {
    name: &'static str,
    bucket: Option<Bucket>,
    policy: AdmissionPolicy,
}

impl AdmissionLimiter {
    /// A limiter with the given rate and policy.
    pub fn new(name: &'static str, rate: ByteRate, policy: AdmissionPolicy) -> Self {
        Self {
            name,
            bucket: Some(Bucket::new(rate)),
            policy,
        }
    }

    /// A limiter that admits everything at once.
    pub fn unlimited(name: &'static str) -> Self {
        Self {
            name,
            bucket: None,
            policy: AdmissionPolicy::default(),
        }
    }

    /// Build from an optional rate; `None` means unlimited.
    pub fn from_rate(name: &'static str, rate: Option<ByteRate>, policy: AdmissionPolicy) -> Self {
        match rate {
            Some(rate) if rate.bytes_per_sec > 0 => Self::new(name, rate, policy),
            _ => Self::unlimited(name),
        }
    }

    /// Limiter name (`ingress` / `egress`).
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Configured policy.
    pub fn policy(&self) -> AdmissionPolicy {
        self.policy
    }

    /// Whether a bucket is configured.
    pub fn is_limited(&self) -> bool {
        self.bucket.is_some()
    }

    /// Bytes currently in the bucket; negative while in debt. `None` if unlimited.
    pub fn available_bytes(&self) -> Option<f64> {
        self.bucket.as_ref().map(Bucket::available)
    }

    /// Admit `n` bytes according to the policy.
    pub async fn checkout(&self, n: u64) -> Result<(), AdmissionError> {
        let Some(bucket) = &self.bucket else {
            return Ok(());
        };

        let started = Instant::now();
        let deadline = match self.policy {
            AdmissionPolicy::BlockUntilAvailable => None,
            AdmissionPolicy::RejectImmediately => {
                // Nobody ever waits under this policy, so there is no queue
                // to respect.
                return bucket.try_take(n).map_err(|_| {
                    self.reject(AdmissionError::Rejected {
                        limiter: self.name,
                        requested: n,
                    })
                });
            }
            AdmissionPolicy::RejectAfter(limit) => Some(started + limit),
        };

        let _turn = match deadline {
            None => bucket.queue.lock().await,
            Some(deadline) => match tokio::time::timeout_at(deadline, bucket.queue.lock()).await {
                Ok(turn) => turn,
                Err(_) => return Err(self.timed_out(n, started)),
            },
        };

        loop {
            let mut wait = match bucket.try_take(n) {
                Ok(()) => break,
                Err(wait) => wait,
            };
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Err(self.timed_out(n, started));
                }
                wait = wait.min(deadline - now);
            }

            tracing::debug!(limiter = self.name, requested = n, wait_ms = wait.as_millis() as u64, "admission suspended");
            tokio::time::sleep(wait).await;
        }

        let waited = started.elapsed();
        if !waited.is_zero() {
            ::metrics::histogram!(metrics::ADMISSION_WAIT_TIME, "limiter" => self.name)
                .record(waited.as_secs_f64() * 1000.0);
        }
        Ok(())
    }

    fn timed_out(&self, n: u64, started: Instant) -> AdmissionError {
        self.reject(AdmissionError::TimedOut {
            limiter: self.name,
            requested: n,
            waited: started.elapsed(),
        })
    }

    fn reject(&self, err: AdmissionError) -> AdmissionError {
        ::metrics::counter!(metrics::ADMISSION_REJECTED_COUNT, "limiter" => self.name).increment(1);
        tracing::warn!(limiter = self.name, error = %err, "admission refused");
        err
    }
}
