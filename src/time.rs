//! Frame clock for the simulation.
//!
//! The engine stamps every frame's parameter block with [`Clock::elapsed`].
//! A fixed step makes the timestamp a pure function of the frame count,
//! which headless runs and tests rely on. The viewer reads [`Clock::fps`]
//! for its title bar.

use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Clock {
    start: Instant,
    last_tick: Instant,
    elapsed_secs: f32,
    delta_secs: f32,
    ticks: u64,
    fps: f32,
    fps_ticks: u64,
    fps_window_start: Instant,
    fps_window: Duration,
    paused: bool,
    paused_total: Duration,
    paused_at: Option<Instant>,
    fixed_step: Option<f32>,
}

impl Clock {
    /// Wall-clock driven.
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_tick: now,
            elapsed_secs: 0.0,
            delta_secs: 0.0,
            ticks: 0,
            fps: 0.0,
            fps_ticks: 0,
            fps_window_start: now,
            fps_window: Duration::from_millis(500),
            paused: false,
            paused_total: Duration::ZERO,
            paused_at: None,
            fixed_step: None,
        }
    }

    /// Advances by exactly `step` seconds per tick.
    pub fn fixed(step: f32) -> Self {
        Self {
            fixed_step: Some(step.max(0.0)),
            ..Self::new()
        }
    }

    /// Advance one frame. Returns `(elapsed, delta)` in seconds.
    pub fn tick(&mut self) -> (f32, f32) {
        let now = Instant::now();
        if self.paused {
            self.delta_secs = 0.0;
            return (self.elapsed_secs, 0.0);
        }

        match self.fixed_step {
            Some(step) => {
                self.delta_secs = step;
                self.elapsed_secs += step;
            }
            None => {
                self.delta_secs = now.duration_since(self.last_tick).as_secs_f32();
                self.elapsed_secs = (now.duration_since(self.start) - self.paused_total).as_secs_f32();
            }
        }
        self.last_tick = now;
        self.ticks += 1;

        let window = now.duration_since(self.fps_window_start);
        if window >= self.fps_window {
            self.fps = (self.ticks - self.fps_ticks) as f32 / window.as_secs_f32();
            self.fps_ticks = self.ticks;
            self.fps_window_start = now;
        }

        (self.elapsed_secs, self.delta_secs)
    }

    #[inline]
    pub fn elapsed(&self) -> f32 {
        self.elapsed_secs
    }

    #[inline]
    pub fn delta(&self) -> f32 {
        self.delta_secs
    }

    #[inline]
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    #[inline]
    pub fn fps(&self) -> f32 {
        self.fps
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Freeze elapsed time. Ticks while paused report a zero delta.
    pub fn pause(&mut self) {
        if !self.paused {
            self.paused = true;
            self.paused_at = Some(Instant::now());
        }
    }

    pub fn resume(&mut self) {
        if let Some(at) = self.paused_at.take() {
            let now = Instant::now();
            self.paused_total += now.duration_since(at);
            self.last_tick = now;
        }
        self.paused = false;
    }

    /// Back to zero, keeping the fixed step.
    pub fn reset(&mut self) {
        let fixed_step = self.fixed_step;
        *self = Self::new();
        self.fixed_step = fixed_step;
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
