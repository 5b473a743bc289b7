/// Generic proportional-integral-derivative regulator.
///
/// Error is `offset - measured`. The integral term is clamped to a
/// fraction of the output range (anti-windup, derivative on error to avoid
/// setpoint kick). The timestep is either fixed or measured between calls;
/// in measured mode the first step after a reset only seeds the clock and
/// returns 0.
#[derive(Debug, Clone)]
pub struct Pid {
    // configuration
    step_s: f64, // fixed timestep in seconds, 0 = measured
    offset: f64,
    min: f64,
    max: f64,
    kp: f64,
    ki: f64,
    kd: f64,
    windup_frac: f64,

    // state
    err_prev: f64,
    integral: f64, // error x seconds accumulator
    last_ts_ms: Option<i64>,
    step_cnt: u64,
}

impl Pid {
    #[allow(clippy::too_many_arguments)]
    pub fn new(step_s: f64, offset: f64, min: f64, max: f64, kp: f64, ki: f64, kd: f64) -> Self {
        Self {
            step_s,
            offset,
            min,
            max,
            kp,
            ki,
            kd,
            windup_frac: 0.9,
            err_prev: 0.0,
            integral: 0.0,
            last_ts_ms: None,
            step_cnt: 0,
        }
    }

    pub fn set_windup_frac(&mut self, frac: f64) {
        self.windup_frac = frac.clamp(0.0, 1.0);
    }

    /// Re-parameterize the setpoint offset (hourly profile switch).
    pub fn set_offset(&mut self, offset: f64) {
        self.offset = offset;
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    pub fn set_limits(&mut self, min: f64, max: f64) {
        self.min = min;
        self.max = max;
    }

    pub fn reset(&mut self) {
        self.err_prev = 0.0;
        self.integral = 0.0;
        self.last_ts_ms = None;
        self.step_cnt = 0;
    }

    pub fn step_count(&self) -> u64 {
        self.step_cnt
    }

    pub fn step(&mut self, measured: f64) -> f64 {
        self.step_at(chrono::Utc::now().timestamp_millis(), measured)
    }

    pub fn step_at(&mut self, now_ms: i64, measured: f64) -> f64 {
        let error = self.offset - measured;

        let dt = if self.step_s > 0.0 {
            self.step_s
        } else {
            match self.last_ts_ms {
                Some(last) => ((now_ms - last) as f64 / 1000.0).max(0.001),
                None => {
                    // seed the clock, no control action yet
                    self.last_ts_ms = Some(now_ms);
                    self.err_prev = error;
                    self.step_cnt = 1;
                    return 0.0;
                }
            }
        };

        self.integral += error * dt;
        if self.ki != 0.0 {
            let i_min = self.min * self.windup_frac / self.ki;
            let i_max = self.max * self.windup_frac / self.ki;
            let (lo, hi) = if i_min <= i_max { (i_min, i_max) } else { (i_max, i_min) };
            self.integral = self.integral.clamp(lo, hi);
        }

        let derivative = (error - self.err_prev) / dt;

        self.err_prev = error;
        self.last_ts_ms = Some(now_ms);
        self.step_cnt += 1;

        let out = self.kp * error + self.ki * self.integral + self.kd * derivative;
        out.clamp(self.min, self.max)
    }
}
