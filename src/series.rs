use std::collections::VecDeque;

/// Trailing-window time series with time-weighted aggregates.
///
/// Samples are appended at the tail and evicted from the head once older
/// than `max_age_ms` or beyond `max_len` (either `-1` = unbounded).
/// Aggregates weight each sample by the time elapsed until the next-newer
/// sample, so sparse updates are honored instead of being treated as
/// equal-weight ticks.
#[derive(Debug, Clone)]
pub struct TimeSeries {
    samples: VecDeque<(i64, f64)>, // (timestamp ms, value), timestamps non-decreasing
    max_age_ms: i64,
    max_len: i64,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl TimeSeries {
    pub fn new(max_age_ms: i64, max_len: i64) -> Self {
        Self {
            samples: VecDeque::new(),
            max_age_ms,
            max_len,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn push(&mut self, value: f64) {
        self.push_at(now_ms(), value);
    }

    /// Append a sample with an explicit timestamp. Timestamps must be
    /// non-decreasing; a stray earlier stamp is bumped to the newest one.
    pub fn push_at(&mut self, ts_ms: i64, value: f64) {
        let ts_ms = match self.samples.back() {
            Some(&(last, _)) if ts_ms < last => last,
            _ => ts_ms,
        };
        self.samples.push_back((ts_ms, value));
        self.evict(ts_ms);
    }

    fn evict(&mut self, now_ms: i64) {
        if self.max_age_ms >= 0 {
            while let Some(&(ts, _)) = self.samples.front() {
                if now_ms - ts > self.max_age_ms {
                    self.samples.pop_front();
                } else {
                    break;
                }
            }
        }
        if self.max_len >= 0 {
            while self.samples.len() as i64 > self.max_len {
                self.samples.pop_front();
            }
        }
    }

    /// Time-weighted mean over the trailing `window_ms` (0 = everything
    /// retained). Returns `default` when no weighted time is available.
    pub fn average(&self, window_ms: i64, default: f64) -> f64 {
        self.average_at(now_ms(), window_ms, default)
    }

    pub fn average_at(&self, now_ms: i64, window_ms: i64, default: f64) -> f64 {
        let (sum, t_sum) = self.weighted_sum_at(now_ms, window_ms);
        if t_sum <= 0 {
            default
        } else {
            sum / t_sum as f64
        }
    }

    /// Time-weighted integral over the trailing window, value x ms.
    pub fn sum(&self, window_ms: i64) -> f64 {
        self.sum_at(now_ms(), window_ms)
    }

    pub fn sum_at(&self, now_ms: i64, window_ms: i64) -> f64 {
        self.weighted_sum_at(now_ms, window_ms).0
    }

    /// Integral of value x time over the trailing window: (value*ms, ms).
    fn weighted_sum_at(&self, now_ms: i64, window_ms: i64) -> (f64, i64) {
        let mut sum = 0.0;
        let mut t_sum: i64 = 0;
        let mut ts_step = now_ms;

        for &(ts, val) in self.samples.iter().rev() {
            let step_ms = (ts_step - ts).max(1);
            ts_step = ts;

            if window_ms > 0 && t_sum + step_ms > window_ms {
                break;
            }

            t_sum += step_ms;
            sum += val * step_ms as f64;
        }

        (sum, t_sum)
    }

    /// Windowed energy in kWh for a series of instantaneous watt samples.
    /// W·ms / 3.6e9 = kWh.
    pub fn energy_kwh(&self, window_ms: i64) -> f64 {
        self.energy_kwh_at(now_ms(), window_ms)
    }

    pub fn energy_kwh_at(&self, now_ms: i64, window_ms: i64) -> f64 {
        let (sum_wms, _) = self.weighted_sum_at(now_ms, window_ms);
        sum_wms / 3.6e9
    }

    /// Min and max over the trailing window; (0, 0) on an empty series.
    pub fn min_max(&self, window_ms: i64) -> (f64, f64) {
        self.min_max_at(now_ms(), window_ms)
    }

    pub fn min_max_at(&self, now_ms: i64, window_ms: i64) -> (f64, f64) {
        let mut iter = self
            .samples
            .iter()
            .rev()
            .take_while(|&&(ts, _)| window_ms <= 0 || now_ms - ts <= window_ms)
            .map(|&(_, v)| v);

        let first = match iter.next() {
            Some(v) => v,
            None => return (0.0, 0.0),
        };

        iter.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v)))
    }
}
