//! Token-bucket pacing of outgoing packets.
//!
//! Sender threads call [`NetworkThrottle::wait_byte_allocation`] before putting each packet on
//! the wire. Callers are admitted strictly in the order they called, one at a time, and the
//! admitted caller accrues credit at the burst bitrate until it can pay for its packet.

use parking_lot::{Condvar, Mutex};
use serde::Deserialize;
use session_stats::{Statistic, StatisticRegistry};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

const BITS_IN_BYTE: f64 = 8.0;
const MS_IN_SECOND: f64 = 1000.0;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ThrottleError {
    #[error("Coin bucket must hold a positive duration, got {0}ms")]
    InvalidBucketDuration(f64),
    #[error("Poll interval must be positive")]
    ZeroPollInterval,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Duration of traffic at the burst bitrate the bucket can hold.
    pub coin_bucket_ms: f64,
    pub fill_bucket_initially: bool,
    /// Bitrate used until the first `set_burst_bitrate`.
    pub initial_burst_bitrate: i64,
    pub poll_interval_us: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        ThrottleConfig {
            coin_bucket_ms: 0.5,
            fill_bucket_initially: false,
            initial_burst_bitrate: 999_000_999,
            poll_interval_us: 50,
        }
    }
}

impl ThrottleConfig {
    pub fn validate(&self) -> Result<(), ThrottleError> {
        if !(self.coin_bucket_ms > 0.0) || !self.coin_bucket_ms.is_finite() {
            return Err(ThrottleError::InvalidBucketDuration(self.coin_bucket_ms));
        }
        if self.poll_interval_us == 0 {
            return Err(ThrottleError::ZeroPollInterval);
        }
        Ok(())
    }
}

/// Result of waiting for a byte allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Allocation {
    /// The packet may be sent. `polls` counts the sleeps spent waiting for credit.
    Granted { polls: u32 },
    /// The throttle is being destroyed; nothing was deducted.
    Aborted,
}

struct Queue {
    next_queue_id: u64,
    current_queue_id: u64,
}

struct CoinBucket {
    /// Fractional so slow bitrates still accrue credit across short polls
    coin_bucket: f64,
    coin_bucket_max: f64,
    burst_bitrate: i64,
    last_fill: Instant,
}

struct Inner {
    queue: Mutex<Queue>,
    queue_cond: Condvar,
    bucket: Mutex<CoinBucket>,
    destroying: AtomicBool,

    coin_bucket_ms: f64,
    fill_bucket_initially: bool,
    poll_interval: Duration,
    statistics: Option<Arc<StatisticRegistry>>,
}

/// Shareable handle to a throttle. Clones refer to the same bucket and queue.
#[derive(Clone)]
pub struct NetworkThrottle {
    inner: Arc<Inner>,
}

fn bucket_capacity(coin_bucket_ms: f64, burst_bitrate: i64) -> f64 {
    (coin_bucket_ms * burst_bitrate as f64 / (MS_IN_SECOND * BITS_IN_BYTE))
        .floor()
        .max(0.0)
}

impl NetworkThrottle {
    pub fn new(config: &ThrottleConfig) -> Result<NetworkThrottle, ThrottleError> {
        Self::build(config, None)
    }

    pub fn with_statistics(
        config: &ThrottleConfig,
        statistics: Arc<StatisticRegistry>,
    ) -> Result<NetworkThrottle, ThrottleError> {
        Self::build(config, Some(statistics))
    }

    fn build(
        config: &ThrottleConfig,
        statistics: Option<Arc<StatisticRegistry>>,
    ) -> Result<NetworkThrottle, ThrottleError> {
        config.validate()?;

        let coin_bucket_max = bucket_capacity(config.coin_bucket_ms, config.initial_burst_bitrate);
        let coin_bucket = if config.fill_bucket_initially {
            coin_bucket_max
        } else {
            0.0
        };

        tracing::info!(
            "Created network throttle with {}ms bucket of {} bytes",
            config.coin_bucket_ms,
            coin_bucket_max
        );

        Ok(NetworkThrottle {
            inner: Arc::new(Inner {
                queue: Mutex::new(Queue {
                    next_queue_id: 0,
                    current_queue_id: 0,
                }),
                queue_cond: Condvar::new(),
                bucket: Mutex::new(CoinBucket {
                    coin_bucket,
                    coin_bucket_max,
                    burst_bitrate: config.initial_burst_bitrate,
                    last_fill: Instant::now(),
                }),
                destroying: AtomicBool::new(false),
                coin_bucket_ms: config.coin_bucket_ms,
                fill_bucket_initially: config.fill_bucket_initially,
                poll_interval: Duration::from_micros(config.poll_interval_us),
                statistics,
            }),
        })
    }

    /// Sets the burst bitrate in bits per second. Zero or less disables throttling.
    pub fn set_burst_bitrate(&self, burst_bitrate: i64) {
        let mut bucket = self.inner.bucket.lock();
        let coin_bucket_max = bucket_capacity(self.inner.coin_bucket_ms, burst_bitrate);

        // Keep the same amount of headroom below the new capacity
        if self.inner.fill_bucket_initially {
            bucket.coin_bucket =
                (bucket.coin_bucket + coin_bucket_max - bucket.coin_bucket_max).max(0.0);
        }
        bucket.coin_bucket = bucket.coin_bucket.min(coin_bucket_max);
        bucket.coin_bucket_max = coin_bucket_max;
        bucket.burst_bitrate = burst_bitrate;
    }

    pub fn burst_bitrate(&self) -> i64 {
        self.inner.bucket.lock().burst_bitrate
    }

    /// Credit currently in the bucket, in bytes.
    pub fn coin_bucket(&self) -> u64 {
        self.inner.bucket.lock().coin_bucket as u64
    }

    pub fn coin_bucket_max(&self) -> u64 {
        self.inner.bucket.lock().coin_bucket_max as u64
    }

    pub fn is_destroying(&self) -> bool {
        self.inner.destroying.load(Ordering::Acquire)
    }

    /// Blocks until `bytes` may be sent.
    ///
    /// Requests larger than the bucket only wait for a full bucket.
    pub fn wait_byte_allocation(&self, bytes: usize) -> Allocation {
        if self.is_destroying() {
            return Allocation::Aborted;
        }
        if self.burst_bitrate() <= 0 {
            return Allocation::Granted { polls: 0 };
        }

        let start = Instant::now();

        {
            let mut queue = self.inner.queue.lock();
            let queue_id = queue.next_queue_id;
            queue.next_queue_id += 1;
            while queue_id > queue.current_queue_id {
                self.inner.queue_cond.wait(&mut queue);
            }
        }

        // This is the only thread accruing credit until the ticket is released
        let mut polls = 0;
        let allocation = loop {
            if self.is_destroying() {
                break Allocation::Aborted;
            }
            if self.inner.try_take(bytes) {
                break Allocation::Granted { polls };
            }
            polls += 1;
            std::thread::sleep(self.inner.poll_interval);
        };

        if let Some(statistics) = &self.inner.statistics {
            let delay_ms = start.elapsed().as_secs_f64() * MS_IN_SECOND;
            statistics.record(Statistic::ThrottledPacketDelay, delay_ms);
            if bytes > 0 {
                statistics.record(Statistic::ThrottledPacketDelayRate, delay_ms / bytes as f64);
            }
            statistics.record(Statistic::ThrottledPacketDelayLoops, polls as f64);
        }

        let mut queue = self.inner.queue.lock();
        queue.current_queue_id += 1;
        self.inner.queue_cond.notify_all();

        allocation
    }

    /// Aborts pending waits and blocks until every caller has left the queue.
    ///
    /// Calls made after this return [`Allocation::Aborted`] immediately.
    pub fn destroy(&self) {
        tracing::info!("Flushing network throttle queue");
        self.inner.destroying.store(true, Ordering::Release);

        let mut queue = self.inner.queue.lock();
        while queue.current_queue_id != queue.next_queue_id {
            self.inner.queue_cond.wait(&mut queue);
        }

        tracing::info!("Destroyed network throttle");
    }
}

impl Inner {
    /// Refills the bucket for the time since the last fill and deducts the allocation if it
    /// fits.
    fn try_take(&self, bytes: usize) -> bool {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last_fill);
        bucket.last_fill = now;

        let update = (elapsed.as_secs_f64() * bucket.burst_bitrate as f64 / BITS_IN_BYTE).max(0.0);
        bucket.coin_bucket = (bucket.coin_bucket + update).min(bucket.coin_bucket_max);

        let effective_bytes = (bytes as f64).min(bucket.coin_bucket_max);
        if bucket.coin_bucket >= effective_bytes {
            bucket.coin_bucket -= effective_bytes;
            true
        } else {
            false
        }
    }
}
