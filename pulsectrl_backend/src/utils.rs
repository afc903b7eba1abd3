use std::cmp::min;

/// Marches over `[0, end_pos)` in steps of `interval` positions.
///
/// ```
/// use pulsectrl_backend::utils::ChunkCounter;
///
/// let chunks: Vec<(usize, usize)> = ChunkCounter::new(10, 4).collect();
/// assert_eq!(chunks, vec![(0, 4), (4, 8), (8, 10)]);
/// ```
pub struct ChunkCounter {
    pos: usize,
    end_pos: usize,
    interval: usize,
}

impl ChunkCounter {
    pub fn new(end_pos: usize, interval: usize) -> Self {
        Self {
            pos: 0,
            end_pos,
            // A zero interval would never advance
            interval: interval.max(1),
        }
    }

    pub fn next_pos(&self) -> usize {
        min(self.pos + self.interval, self.end_pos)
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn is_done(&self) -> bool {
        self.pos == self.end_pos
    }

    /// Returns the next `(start, end)` chunk, `None` once the end is reached.
    pub fn tick_next(&mut self) -> Option<(usize, usize)> {
        if self.is_done() {
            return None;
        }
        let result = (self.pos(), self.next_pos());
        self.pos = self.next_pos();
        Some(result)
    }
}

impl Iterator for ChunkCounter {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        self.tick_next()
    }
}
