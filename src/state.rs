//! Ping-pong generation pair.
//!
//! Two independent generations plus one active index. The simulation reads
//! [`GenerationPair::current`] and writes [`GenerationPair::next`]; nothing
//! ever mutates a generation in place while it is being read.

/// Life value marking a slot whose particle has not been born this cycle.
pub const UNBORN_LIFE: f32 = -1.0;

/// Life value marking a particle that expired before its cycle wrapped.
pub const EXPIRED_LIFE: f32 = 0.0;

/// Position texel of a slot that holds no particle.
pub const SENTINEL_POSITION: [f32; 4] = [0.0, 0.0, 0.0, UNBORN_LIFE];

/// Velocity texel of a slot that holds no particle.
pub const SENTINEL_VELOCITY: [f32; 4] = [0.0; 4];

/// Two generations of simulation state indexed by an active flag.
///
/// `T` is whatever a generation is made of for the caller: backend texture
/// handles in the pipeline, plain arrays in tests.
#[derive(Debug, Clone)]
pub struct GenerationPair<T> {
    generations: [T; 2],
    active: usize,
}

impl<T> GenerationPair<T> {
    /// Pair with generation 0 active.
    pub fn new(first: T, second: T) -> Self {
        Self {
            generations: [first, second],
            active: 0,
        }
    }

    /// Generation available for reading this tick.
    #[inline]
    pub fn current(&self) -> &T {
        &self.generations[self.active]
    }

    /// Generation written this tick.
    #[inline]
    pub fn next(&self) -> &T {
        &self.generations[1 - self.active]
    }

    /// Mutable access to the generation written this tick.
    #[inline]
    pub fn next_mut(&mut self) -> &mut T {
        &mut self.generations[1 - self.active]
    }

    /// Both generations, `(current, next)`, for a step that reads one and writes the other.
    pub fn split_mut(&mut self) -> (&T, &mut T) {
        let [a, b] = &mut self.generations;
        if self.active == 0 {
            (a, b)
        } else {
            (b, a)
        }
    }

    /// Publish `next()` as the readable generation.
    ///
    /// Must only be called once the write into `next()` is complete.
    #[inline]
    pub fn swap(&mut self) {
        self.active = 1 - self.active;
    }

    /// Index of the readable generation, 0 or 1.
    #[inline]
    pub fn active_index(&self) -> usize {
        self.active
    }

    /// Both generations in storage order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.generations.iter()
    }

    /// Consume the pair, returning generations in storage order.
    pub fn into_inner(self) -> [T; 2] {
        self.generations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_and_next_are_distinct() {
        let mut pair = GenerationPair::new("a", "b");
        assert_eq!(*pair.current(), "a");
        assert_eq!(*pair.next(), "b");
        pair.swap();
        assert_eq!(*pair.current(), "b");
        assert_eq!(*pair.next(), "a");
        assert_eq!(pair.active_index(), 1);
    }

    #[test]
    fn test_write_to_next_invisible_until_swap() {
        let mut pair = GenerationPair::new(vec![0; 4], vec![0; 4]);
        {
            let (cur, next) = pair.split_mut();
            for (dst, src) in next.iter_mut().zip(cur.iter()) {
                *dst = src + 1;
            }
        }
        assert_eq!(pair.current(), &vec![0; 4]);
        pair.swap();
        assert_eq!(pair.current(), &vec![1; 4]);
    }

    #[test]
    fn test_double_swap_restores() {
        let mut pair = GenerationPair::new(1, 2);
        pair.swap();
        pair.swap();
        assert_eq!(*pair.current(), 1);
        assert_eq!(pair.into_inner(), [1, 2]);
    }
}
