//! Simulation clock and adaptive timestep.

/// Peak magnitudes observed during a step, used to size the next one.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StepPeaks {
    pub max_speed: f32,
    pub max_acceleration: f32,
}

impl StepPeaks {
    pub fn merge(self, other: Self) -> Self {
        Self {
            max_speed: self.max_speed.max(other.max_speed),
            max_acceleration: self.max_acceleration.max(other.max_acceleration),
        }
    }
}

/// Bounds the adaptive timestep follows.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimestepLimits {
    pub smoothing_radius: f32,
    pub speed_of_sound: f32,
    pub courant: f32,
    pub force_factor: f32,
    pub min_dt: f32,
    pub max_dt: f32,
}

impl TimestepLimits {
    /// Largest stable timestep for the given peaks.
    ///
    /// Takes the smallest of the acoustic bound `C h / c`, the velocity bound
    /// `C h / v_max` and the acceleration bound `F sqrt(h / a_max)`, then
    /// clamps into `[min_dt, max_dt]`.
    pub fn stable_dt(&self, peaks: StepPeaks) -> f32 {
        let h = self.smoothing_radius;
        let mut dt = self.courant * h / self.speed_of_sound;
        if peaks.max_speed > 0.0 {
            dt = dt.min(self.courant * h / peaks.max_speed);
        }
        if peaks.max_acceleration > 0.0 {
            dt = dt.min(self.force_factor * (h / peaks.max_acceleration).sqrt());
        }
        if dt.is_finite() {
            dt.clamp(self.min_dt, self.max_dt)
        } else {
            self.min_dt
        }
    }
}

/// Simulation clock.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Timer {
    /// Current simulated time in seconds.
    pub time: f64,
    /// Timestep for the next step.
    pub dt: f32,
    /// Time before the last step.
    pub previous_time: f64,
    pub steps: u64,
}

impl Timer {
    pub fn new(dt: f32) -> Self {
        Self {
            time: 0.0,
            dt,
            previous_time: 0.0,
            steps: 0,
        }
    }

    /// Moves the clock forward by the current timestep.
    pub fn advance(&mut self) {
        self.previous_time = self.time;
        self.time += self.dt as f64;
        self.steps += 1;
    }

    /// Picks the next timestep from this step's peaks.
    pub fn retune(&mut self, limits: &TimestepLimits, peaks: StepPeaks) {
        self.dt = limits.stable_dt(peaks);
    }

    pub fn elapsed_last_step(&self) -> f64 {
        self.time - self.previous_time
    }
}
