//! Timed emission schedule.
//!
//! Every slot gets a fixed birth time when emission is configured; slot `i`
//! is born `i / frequency` seconds into the emission cycle. An accumulator
//! advanced by the frame time decides which slots are alive, and wraps to
//! zero once a full cycle (`max_particles / frequency`) has elapsed, which
//! recycles every slot.
//!
//! # Example
//!
//! ```
//! use gpups::emission::EmissionSchedule;
//! use gpups::grid::SlotGrid;
//!
//! let grid = SlotGrid::new(65536, 256).unwrap();
//! let mut schedule = EmissionSchedule::new(500.0, &grid).unwrap();
//!
//! let tick = schedule.advance(0.002);
//! assert!(schedule.is_alive(0));
//! assert!(schedule.is_alive(1));
//! assert!(!schedule.is_alive(2));
//! assert!(!tick.wrapped);
//! ```

use tracing::{debug, warn};

use crate::error::ConfigurationError;
use crate::grid::{SlotGrid, TexelGrid};

/// Birth time stored in padding slots; no accumulator value reaches it.
pub const NEVER_BORN: f32 = f32::MAX;

/// Accumulator state handed to one simulation step.
///
/// Every slot of a tick sees the same snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmissionTick {
    /// Time since the current emission cycle started.
    pub accumulated: f32,
    /// Frame time of this tick.
    pub elapsed: f32,
    /// Whether the accumulator wrapped to zero on this tick.
    pub wrapped: bool,
}

/// Emission schedule for a fixed slot grid.
#[derive(Debug, Clone)]
pub struct EmissionSchedule {
    grid: SlotGrid,
    frequency: f32,
    cycle_length: f32,
    accumulated: f64,
    cycles: u64,
}

impl EmissionSchedule {
    /// Schedule emitting `frequency` particles per second over `grid`.
    pub fn new(frequency: f32, grid: &SlotGrid) -> Result<Self, ConfigurationError> {
        if !frequency.is_finite() || frequency <= 0.0 {
            return Err(ConfigurationError::InvalidFrequency(frequency));
        }
        let cycle_length = grid.max_particles() as f32 / frequency;
        debug!(
            target: "emission",
            frequency,
            cycle_length,
            slots = grid.max_particles(),
            "emission schedule configured"
        );
        Ok(Self {
            grid: *grid,
            frequency,
            cycle_length,
            accumulated: 0.0,
            cycles: 0,
        })
    }

    /// Particles emitted per second.
    #[inline]
    pub fn frequency(&self) -> f32 {
        self.frequency
    }

    /// Seconds until every slot has been born once.
    #[inline]
    pub fn cycle_length(&self) -> f32 {
        self.cycle_length
    }

    /// Current accumulator value as the simulation sees it.
    #[inline]
    pub fn accumulated(&self) -> f32 {
        self.accumulated as f32
    }

    /// Number of completed emission cycles.
    #[inline]
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Birth time of one slot.
    pub fn birth_time(&self, index: u32) -> f32 {
        if !self.grid.is_emitting(index) {
            return NEVER_BORN;
        }
        (index as f64 / self.frequency as f64) as f32
    }

    /// Birth time of every slot, laid out as the birth-time texture.
    pub fn birth_times(&self) -> TexelGrid<f32> {
        let grid = self.grid;
        TexelGrid::from_fn(grid.width(), grid.height(), |x, y| {
            self.birth_time(grid.index(x, y))
        })
    }

    /// Advance the accumulator by one frame.
    ///
    /// Negative or non-finite frame times are treated as zero.
    pub fn advance(&mut self, dt: f32) -> EmissionTick {
        let elapsed = if dt.is_finite() && dt >= 0.0 {
            dt
        } else {
            warn!(target: "emission", dt, "ignoring invalid frame time");
            0.0
        };

        self.accumulated += elapsed as f64;
        let wrapped = self.accumulated >= self.cycle_length as f64;
        if wrapped {
            self.accumulated = 0.0;
            self.cycles += 1;
            debug!(target: "emission", cycle = self.cycles, "emission cycle wrapped");
        }

        EmissionTick {
            accumulated: self.accumulated as f32,
            elapsed,
            wrapped,
        }
    }

    /// Restart the emission cycle.
    pub fn reset(&mut self) {
        self.accumulated = 0.0;
        self.cycles = 0;
    }

    /// Whether a slot is alive at the current accumulator value.
    pub fn is_alive(&self, index: u32) -> bool {
        is_born(self.birth_time(index), self.accumulated())
    }

    /// Indices of all slots alive at the current accumulator value.
    pub fn alive_slots(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.grid.slot_count()).filter(move |&i| self.is_alive(i))
    }
}

/// Aliveness test shared by the reference kernel and the shaders.
#[inline]
pub fn is_born(birth_time: f32, accumulated: f32) -> bool {
    accumulated >= birth_time
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(max: u32, freq: f32) -> EmissionSchedule {
        let grid = SlotGrid::new(max, 256).unwrap();
        EmissionSchedule::new(freq, &grid).unwrap()
    }

    #[test]
    fn test_rejects_bad_frequency() {
        let grid = SlotGrid::new(16, 4).unwrap();
        for freq in [0.0, -1.0, f32::NAN, f32::INFINITY] {
            assert!(matches!(
                EmissionSchedule::new(freq, &grid),
                Err(ConfigurationError::InvalidFrequency(_))
            ));
        }
    }

    #[test]
    fn test_birth_times_row_major_step() {
        let s = schedule(65536, 500.0);
        assert_eq!(s.birth_time(0), 0.0);
        assert_eq!(s.birth_time(1), 0.002);
        assert!((s.birth_time(256) - 0.512).abs() < 1e-6);

        let times = s.birth_times();
        let flat = times.as_slice();
        for pair in flat.windows(2) {
            assert!(pair[1] >= pair[0]);
            assert!((pair[1] - pair[0] - 0.002).abs() < 1e-4);
        }
        assert!(flat.iter().all(|&t| (0.0..s.cycle_length()).contains(&t)));
    }

    #[test]
    fn test_padding_slots_never_born() {
        let s = schedule(300, 100.0);
        assert_eq!(s.birth_time(299), 2.99);
        assert_eq!(s.birth_time(300), NEVER_BORN);
        assert_eq!(s.birth_times().get(255, 1), NEVER_BORN);
    }

    #[test]
    fn test_wrap_at_exact_cycle_boundary() {
        let mut s = schedule(1000, 100.0);
        let tick = s.advance(s.cycle_length());
        assert!(tick.wrapped);
        assert_eq!(tick.accumulated, 0.0);
        assert_eq!(s.cycles(), 1);
    }

    #[test]
    fn test_wrap_is_idempotent_with_start() {
        let mut s = schedule(1000, 100.0);
        let at_start: Vec<u32> = s.alive_slots().collect();

        s.advance(4.0);
        s.advance(6.0);
        let tick = s.advance(0.0);
        assert!(!tick.wrapped || tick.accumulated == 0.0);
        assert_eq!(s.accumulated(), 0.0);
        let after_wrap: Vec<u32> = s.alive_slots().collect();
        assert_eq!(at_start, after_wrap);
        assert_eq!(after_wrap, vec![0]);
    }

    #[test]
    fn test_just_below_boundary_does_not_wrap() {
        let mut s = schedule(1000, 100.0);
        let tick = s.advance(9.99);
        assert!(!tick.wrapped);
        assert!(s.is_alive(999));
    }

    #[test]
    fn test_invalid_dt_is_ignored() {
        let mut s = schedule(1000, 100.0);
        s.advance(1.0);
        let tick = s.advance(-5.0);
        assert_eq!(tick.elapsed, 0.0);
        assert_eq!(s.accumulated(), 1.0);
        s.advance(f32::NAN);
        assert_eq!(s.accumulated(), 1.0);
    }
}
