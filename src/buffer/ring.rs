//! Free-block ring for a single slab tier

/// Fixed-capacity ring of free slot offsets
///
/// Single producer / single consumer, owned by the thread that owns the
/// tier. Wrap-around is tracked with a `flipped` flag instead of a
/// modulo per access or a separate element count:
///
/// - `!flipped`: live elements are `[read_pos, write_pos)`; free space is
///   `[write_pos, capacity)` plus `[0, read_pos)` once the writer wraps.
/// - `flipped`: the writer has wrapped; live elements are
///   `[read_pos, capacity)` followed by `[0, write_pos)`, free space is
///   `[write_pos, read_pos)`.
///
/// An empty ring and a full, not yet flipped ring can share positions
/// (`read_pos == 0`, `write_pos` either `0` or `capacity`), so the flag
/// and the write position together disambiguate them.
#[derive(Debug)]
pub struct FreeBlockRing {
    elements: Box<[usize]>,
    capacity: usize,
    write_pos: usize,
    read_pos: usize,
    flipped: bool,
}

impl FreeBlockRing {
    /// Create an empty ring holding at most `capacity` offsets
    pub fn new(capacity: usize) -> Self {
        Self {
            elements: vec![0; capacity].into_boxed_slice(),
            capacity,
            write_pos: 0,
            read_pos: 0,
            flipped: false,
        }
    }

    /// Drop every element
    pub fn reset(&mut self) {
        self.write_pos = 0;
        self.read_pos = 0;
        self.flipped = false;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of offsets that can be taken
    pub fn available(&self) -> usize {
        if !self.flipped {
            self.write_pos - self.read_pos
        } else {
            self.capacity - self.read_pos + self.write_pos
        }
    }

    /// Number of offsets that can still be put
    pub fn remaining_capacity(&self) -> usize {
        if !self.flipped {
            self.capacity - self.write_pos + self.read_pos
        } else {
            self.read_pos - self.write_pos
        }
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    /// Append one offset
    ///
    /// Returns `false` only when the ring is genuinely full.
    pub fn put(&mut self, element: usize) -> bool {
        if !self.flipped {
            if self.write_pos < self.capacity {
                self.elements[self.write_pos] = element;
                self.write_pos += 1;
                return true;
            }
            // Top is exhausted; the bottom is usable only after reads.
            if self.read_pos == 0 {
                return false;
            }
            self.write_pos = 0;
            self.flipped = true;
        }

        if self.write_pos < self.read_pos {
            self.elements[self.write_pos] = element;
            self.write_pos += 1;
            true
        } else {
            false
        }
    }

    /// Append as many of `new_elements` as fit, returning how many were put
    pub fn put_many(&mut self, new_elements: &[usize]) -> usize {
        let mut moved = 0;

        if !self.flipped {
            let top = (self.capacity - self.write_pos).min(new_elements.len());
            self.elements[self.write_pos..self.write_pos + top]
                .copy_from_slice(&new_elements[..top]);
            self.write_pos += top;
            moved = top;

            if moved == new_elements.len() || self.read_pos == 0 {
                return moved;
            }
            self.write_pos = 0;
            self.flipped = true;
        }

        let bottom = (self.read_pos - self.write_pos).min(new_elements.len() - moved);
        self.elements[self.write_pos..self.write_pos + bottom]
            .copy_from_slice(&new_elements[moved..moved + bottom]);
        self.write_pos += bottom;
        moved + bottom
    }

    /// Remove the oldest offset
    pub fn take(&mut self) -> Option<usize> {
        if self.flipped && self.read_pos == self.capacity {
            self.read_pos = 0;
            self.flipped = false;
        }

        if self.flipped || self.read_pos < self.write_pos {
            let element = self.elements[self.read_pos];
            self.read_pos += 1;
            Some(element)
        } else {
            None
        }
    }

    /// Move up to `into.len()` offsets into `into`, returning how many were taken
    pub fn take_many(&mut self, into: &mut [usize]) -> usize {
        let mut moved = 0;

        if self.flipped {
            let top = (self.capacity - self.read_pos).min(into.len());
            into[..top].copy_from_slice(&self.elements[self.read_pos..self.read_pos + top]);
            self.read_pos += top;
            moved = top;

            if self.read_pos < self.capacity {
                return moved;
            }
            self.read_pos = 0;
            self.flipped = false;
        }

        let rest = (self.write_pos - self.read_pos).min(into.len() - moved);
        into[moved..moved + rest]
            .copy_from_slice(&self.elements[self.read_pos..self.read_pos + rest]);
        self.read_pos += rest;
        moved + rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_balanced(ring: &FreeBlockRing) {
        assert_eq!(
            ring.available() + ring.remaining_capacity(),
            ring.capacity(),
            "ring out of balance: {:?}",
            ring
        );
    }

    #[test]
    fn test_put_take_fifo() {
        let mut ring = FreeBlockRing::new(4);
        assert!(ring.is_empty());

        for i in 0..4 {
            assert!(ring.put(i * 10));
            assert_balanced(&ring);
        }
        assert!(!ring.put(99), "full ring must reject");
        assert_eq!(ring.available(), 4);

        for i in 0..4 {
            assert_eq!(ring.take(), Some(i * 10));
            assert_balanced(&ring);
        }
        assert_eq!(ring.take(), None);
    }

    #[test]
    fn test_wrap_around_preserves_order() {
        let mut ring = FreeBlockRing::new(3);
        assert!(ring.put(1));
        assert!(ring.put(2));
        assert!(ring.put(3));
        assert_eq!(ring.take(), Some(1));
        assert_eq!(ring.take(), Some(2));

        // Writer flips into the two freed cells
        assert!(ring.put(4));
        assert!(ring.put(5));
        assert!(!ring.put(6));
        assert_balanced(&ring);
        assert_eq!(ring.available(), 3);

        // Reader drains the top, flips back, then reads the bottom
        assert_eq!(ring.take(), Some(3));
        assert_eq!(ring.take(), Some(4));
        assert_eq!(ring.take(), Some(5));
        assert_eq!(ring.take(), None);
        assert_balanced(&ring);
    }

    #[test]
    fn test_empty_and_full_are_distinct() {
        let mut ring = FreeBlockRing::new(2);
        assert_eq!(ring.available(), 0);
        assert_eq!(ring.remaining_capacity(), 2);

        ring.put(7);
        ring.put(8);
        assert_eq!(ring.available(), 2);
        assert_eq!(ring.remaining_capacity(), 0);

        ring.reset();
        assert_eq!(ring.available(), 0);
        assert_eq!(ring.take(), None);
    }

    #[test]
    fn test_interleaved_fifo_with_model() {
        let mut ring = FreeBlockRing::new(5);
        let mut model = std::collections::VecDeque::new();
        let mut next = 0usize;

        // Deterministic interleaving that crosses the wrap point many times
        for step in 0..200 {
            if step % 3 != 2 && model.len() < 5 {
                assert!(ring.put(next));
                model.push_back(next);
                next += 1;
            } else {
                assert_eq!(ring.take(), model.pop_front());
            }
            assert_balanced(&ring);
            assert_eq!(ring.available(), model.len());
        }
    }

    #[test]
    fn test_put_many_partial_transfer() {
        let mut ring = FreeBlockRing::new(4);
        assert_eq!(ring.put_many(&[1, 2, 3]), 3);
        assert_eq!(ring.take(), Some(1));
        assert_eq!(ring.take(), Some(2));

        // One cell at the top, two at the bottom; only three fit
        assert_eq!(ring.put_many(&[4, 5, 6, 7]), 3);
        assert_balanced(&ring);
        assert_eq!(ring.remaining_capacity(), 0);

        let mut out = [0usize; 8];
        let n = ring.take_many(&mut out);
        assert_eq!(&out[..n], &[3, 4, 5, 6]);
        assert_balanced(&ring);
    }

    #[test]
    fn test_put_many_into_full_unread_ring() {
        let mut ring = FreeBlockRing::new(2);
        assert_eq!(ring.put_many(&[1, 2, 3]), 2);
        assert_eq!(ring.put_many(&[4]), 0);
        assert_balanced(&ring);
    }

    #[test]
    fn test_take_many_limited_by_destination() {
        let mut ring = FreeBlockRing::new(4);
        ring.put_many(&[1, 2, 3, 4]);
        let mut out = [0usize; 2];
        assert_eq!(ring.take_many(&mut out), 2);
        assert_eq!(out, [1, 2]);
        assert_eq!(ring.available(), 2);

        ring.put_many(&[5, 6]);
        let mut rest = [0usize; 4];
        assert_eq!(ring.take_many(&mut rest), 4);
        assert_eq!(rest, [3, 4, 5, 6]);
        assert!(ring.is_empty());
        assert_balanced(&ring);
    }
}
