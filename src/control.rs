#![forbid(unsafe_code)]
#![deny(warnings)]
#![warn(clippy::pedantic)]

//! The feedback law shared by both adjusters.
//!
//! Each tick: PID on the sampled error with anti-windup, an affine map of the
//! adjustment into actuator units, a hard clamp, and an exponential blend with
//! the previous output. The blend of two in-range values stays in range, so
//! the output never leaves `[clamp_min, clamp_max]`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Gains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DerivativeMode {
    /// `(measurement - previous_measurement) / dt`
    Measurement,
    /// `error - previous_error`
    ErrorDelta,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FeedbackParams {
    pub gains: Gains,
    pub derivative: DerivativeMode,
    /// Integral accumulates only while `|error|` is below this.
    pub windup_limit: f64,
    pub offset: f64,
    pub scale: f64,
    pub clamp_min: f64,
    pub clamp_max: f64,
    pub initial: f64,
}

impl FeedbackParams {
    /// Load factor: multiplies work time, `2 - x` multiplies sleep time.
    pub const CPU: Self = Self {
        gains: Gains { kp: 0.8, ki: 0.1, kd: 0.01 },
        derivative: DerivativeMode::Measurement,
        windup_limit: 10.0,
        offset: 1.0,
        scale: 0.01,
        clamp_min: 0.3,
        clamp_max: 2.0,
        initial: 1.0,
    };

    /// Allocation rate: fraction of total memory to grab (or of the arena to free) per tick.
    pub const MEMORY: Self = Self {
        gains: Gains { kp: 0.5, ki: 0.05, kd: 0.01 },
        derivative: DerivativeMode::ErrorDelta,
        windup_limit: 10.0,
        offset: 0.0,
        scale: 0.01,
        clamp_min: -0.05,
        clamp_max: 0.1,
        initial: 0.0,
    };
}

/// Blend weight kept from the previous output. Low targets overshoot easily
/// and get the heaviest damping.
pub fn smoothing_for_target(target_percent: f64) -> f64 {
    if target_percent < 30.0 {
        0.7
    } else if target_percent < 60.0 {
        0.5
    } else {
        0.3
    }
}

#[derive(Clone, Debug)]
pub struct FeedbackController {
    params: FeedbackParams,
    smoothing: f64,
    integral: f64,
    previous_measurement: Option<f64>,
    previous_error: Option<f64>,
    output: f64,
}

impl FeedbackController {
    pub fn new(params: FeedbackParams, smoothing: f64) -> Self {
        Self {
            params,
            smoothing: smoothing.clamp(0.0, 1.0),
            integral: 0.0,
            previous_measurement: None,
            previous_error: None,
            output: params.initial.clamp(params.clamp_min, params.clamp_max),
        }
    }

    pub fn output(&self) -> f64 {
        self.output
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.params, self.smoothing);
    }

    /// Feeds one sample and returns the new output. Non-finite samples leave
    /// the controller untouched.
    pub fn update(&mut self, target: f64, measurement: f64, dt: Duration) -> f64 {
        if !measurement.is_finite() {
            return self.output;
        }
        let p = &self.params;
        let dt = dt.as_secs_f64();
        let error = target - measurement;

        if error.abs() < p.windup_limit {
            self.integral += error * dt;
        } else {
            self.integral = 0.0;
        }

        let derivative = match p.derivative {
            DerivativeMode::Measurement => match self.previous_measurement {
                Some(prev) if dt > 0.0 => (measurement - prev) / dt,
                _ => 0.0,
            },
            DerivativeMode::ErrorDelta => self.previous_error.map_or(0.0, |prev| error - prev),
        };

        let adjustment =
            p.gains.kp * error + p.gains.ki * self.integral - p.gains.kd * derivative;
        let raw = (p.offset + adjustment * p.scale).clamp(p.clamp_min, p.clamp_max);
        let blended = self.smoothing * self.output + (1.0 - self.smoothing) * raw;

        self.output = blended.clamp(p.clamp_min, p.clamp_max);
        self.previous_measurement = Some(measurement);
        self.previous_error = Some(error);
        self.output
    }
}

/// An `f64` control signal with one writer (the adjuster) and many readers.
#[derive(Debug)]
pub struct SharedSignal(AtomicU64);

impl SharedSignal {
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Release);
    }
}
