//! Frame clock for the pipeline.
//!
//! The host owns wall-clock time and hands the pipeline a frame time on
//! every tick. The clock keeps totals derived from those frame times so
//! the HUD and logs agree with what the simulation actually saw.
//!
//! # Example
//!
//! ```
//! use gpups::time::FrameClock;
//!
//! let mut clock = FrameClock::new();
//! for _ in 0..30 {
//!     clock.advance(1.0 / 60.0);
//! }
//!
//! assert_eq!(clock.frame(), 30);
//! assert!((clock.elapsed() - 0.5).abs() < 1e-4);
//! assert!((clock.fps() - 60.0).abs() < 0.5);
//! ```

/// Frame counter and FPS estimator driven by host frame times.
#[derive(Debug, Clone)]
pub struct FrameClock {
    /// Total simulated time in seconds.
    elapsed_secs: f64,
    /// Frame time of the last tick.
    delta_secs: f32,
    /// Total frames since start.
    frame_count: u64,
    /// Calculated FPS (updated periodically).
    fps: f32,
    /// Frame count at last FPS update.
    fps_frame_count: u64,
    /// Time accumulated since the last FPS update.
    fps_window: f32,
    /// How often to update the FPS estimate, in seconds.
    fps_update_interval: f32,
}

impl FrameClock {
    /// Clock at frame zero with a half-second FPS window.
    pub fn new() -> Self {
        Self {
            elapsed_secs: 0.0,
            delta_secs: 0.0,
            frame_count: 0,
            fps: 0.0,
            fps_frame_count: 0,
            fps_window: 0.0,
            fps_update_interval: 0.5,
        }
    }

    /// Record one frame of `dt` seconds.
    ///
    /// Negative or non-finite frame times count as a zero-length frame.
    pub fn advance(&mut self, dt: f32) {
        let dt = if dt.is_finite() && dt > 0.0 { dt } else { 0.0 };
        self.delta_secs = dt;
        self.elapsed_secs += dt as f64;
        self.frame_count += 1;

        self.fps_window += dt;
        if self.fps_window >= self.fps_update_interval {
            let frames_since = self.frame_count - self.fps_frame_count;
            self.fps = frames_since as f32 / self.fps_window;
            self.fps_frame_count = self.frame_count;
            self.fps_window = 0.0;
        }
    }

    /// Total simulated time in seconds.
    #[inline]
    pub fn elapsed(&self) -> f32 {
        self.elapsed_secs as f32
    }

    /// Frame time of the last tick.
    #[inline]
    pub fn delta(&self) -> f32 {
        self.delta_secs
    }

    /// Total frames since start.
    #[inline]
    pub fn frame(&self) -> u64 {
        self.frame_count
    }

    /// Frames per second over the last completed window.
    #[inline]
    pub fn fps(&self) -> f32 {
        self.fps
    }

    /// Change how often the FPS estimate refreshes.
    pub fn set_fps_update_interval(&mut self, seconds: f32) {
        self.fps_update_interval = seconds.max(f32::EPSILON);
    }

    /// Reset the clock to its initial state.
    pub fn reset(&mut self) {
        let interval = self.fps_update_interval;
        *self = Self::new();
        self.fps_update_interval = interval;
    }
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new()
    }
}
