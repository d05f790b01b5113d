use std::{
    cmp::Ordering,
    collections::{BTreeMap, VecDeque},
    time::{Duration, Instant},
};

// Samples are summed as fixed-point integers so the running sum does not drift after many
// insertions and evictions
const FLOAT_SCALE: f64 = 1e6;

/// `f64` with a total order so it can key the ordered multiset.
#[derive(Clone, Copy, Debug)]
struct OrderedSample(f64);

impl PartialEq for OrderedSample {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrderedSample {}

impl PartialOrd for OrderedSample {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedSample {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

struct TimedSample {
    time: Instant,
    value: f64,
    scaled: i64,
}

/// Time-bounded sample store supporting average, max and percentile queries.
///
/// Samples are admitted at most once per `sample_period` and dropped once they are older than
/// `window_size`. Every query first evicts what fell out of the window at `now`.
pub(crate) struct SlidingWindowStat {
    name: &'static str,
    window_size: Duration,
    sample_period: Duration,
    last_sampled_time: Option<Instant>,
    sum: i64,
    /// Multiset of the values in the window, value -> number of occurrences
    ordered: BTreeMap<OrderedSample, usize>,
    /// Samples in insertion (time) order
    queue: VecDeque<TimedSample>,
}

impl SlidingWindowStat {
    pub fn new(name: &'static str, window_size: Duration, sample_period: Duration) -> Self {
        SlidingWindowStat {
            name,
            window_size,
            sample_period,
            last_sampled_time: None,
            sum: 0,
            ordered: BTreeMap::new(),
            queue: VecDeque::new(),
        }
    }

    /// Tries to append a sample to the window. Returns `false` if the sample came sooner than
    /// `sample_period` after the previously admitted one.
    pub fn insert(&mut self, now: Instant, value: f64) -> bool {
        if let Some(last_sampled_time) = self.last_sampled_time {
            if now.saturating_duration_since(last_sampled_time) < self.sample_period {
                return false;
            }
        }
        self.last_sampled_time = Some(now);

        let scaled = (value * FLOAT_SCALE).round() as i64;
        self.sum += scaled;
        *self.ordered.entry(OrderedSample(value)).or_insert(0) += 1;
        self.queue.push_back(TimedSample {
            time: now,
            value,
            scaled,
        });
        true
    }

    /// Drops every sample older than `window_size`.
    pub fn slide_window(&mut self, now: Instant) {
        while let Some(front) = self.queue.front() {
            if now.saturating_duration_since(front.time) <= self.window_size {
                break;
            }
            self.pop_front();
        }
        tracing::trace!("{} window holds {} samples", self.name, self.queue.len());
    }

    fn pop_front(&mut self) {
        if let Some(front) = self.queue.pop_front() {
            self.sum -= front.scaled;
            let key = OrderedSample(front.value);
            if let Some(count) = self.ordered.get_mut(&key) {
                *count -= 1;
                if *count == 0 {
                    self.ordered.remove(&key);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn average(&mut self, now: Instant) -> Option<f64> {
        self.slide_window(now);
        if self.is_empty() {
            None
        } else {
            Some(self.sum as f64 / FLOAT_SCALE / self.len() as f64)
        }
    }

    pub fn max(&mut self, now: Instant) -> Option<f64> {
        self.slide_window(now);
        self.ordered.keys().next_back().map(|v| v.0)
    }

    /// Returns the value that `percent`% of the samples are less than or equal to, counted down
    /// from the maximum. `percentile_max(100)` is the maximum.
    ///
    /// # Panics
    ///
    /// Panics if `percent` is not in `1..=100`.
    pub fn percentile_max(&mut self, now: Instant, percent: u32) -> Option<f64> {
        assert!((1..=100).contains(&percent), "percentile out of range");
        self.slide_window(now);

        let size = self.len();
        if size == 0 {
            return None;
        }

        let mut backward_steps = usize::min(size * (100 - percent as usize) / 100, size - 1);
        for (value, &count) in self.ordered.iter().rev() {
            if backward_steps < count {
                return Some(value.0);
            }
            backward_steps -= count;
        }
        None
    }
}
