//! Single-slot, lossy hand-off from an acquisition worker to a display.
//!
//! The writer only fills the slot while the ready flag is clear; the reader
//! copies the contents out and clears the flag. When the display falls behind,
//! new data is dropped instead of blocking acquisition.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug)]
struct Slot<T> {
    data: Mutex<Vec<T>>,
    ready: AtomicBool,
    writes: AtomicU64,
}

/// Fixed-shape shared buffer. Cloning yields another handle to the same slot.
#[derive(Debug, Clone)]
pub struct SharedBuffer<T> {
    slot: Arc<Slot<T>>,
    rows: usize,
    cols: usize,
}

impl<T: Copy + Default> SharedBuffer<T> {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            slot: Arc::new(Slot {
                data: Mutex::new(vec![T::default(); rows * cols]),
                ready: AtomicBool::new(false),
                writes: AtomicU64::new(0),
            }),
            rows,
            cols,
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn is_ready(&self) -> bool {
        self.slot.ready.load(Ordering::Acquire)
    }

    /// Number of times the slot has been filled since creation.
    pub fn write_count(&self) -> u64 {
        self.slot.writes.load(Ordering::Relaxed)
    }

    /// Fill the slot unless the display has not consumed the previous one.
    /// Returns whether anything was written.
    pub fn publish(&self, fill: impl FnOnce(&mut [T])) -> bool {
        if self.is_ready() {
            return false;
        }
        self.force_publish(fill);
        true
    }

    /// Fill the slot regardless of the ready flag.
    pub fn force_publish(&self, fill: impl FnOnce(&mut [T])) {
        {
            let mut data = self.slot.data.lock();
            fill(&mut data);
        }
        self.slot.writes.fetch_add(1, Ordering::Relaxed);
        self.slot.ready.store(true, Ordering::Release);
    }

    /// Copy out the latest contents if new data is waiting, clearing the flag.
    pub fn take(&self) -> Option<Vec<T>> {
        if !self.is_ready() {
            return None;
        }
        let copy = self.slot.data.lock().clone();
        self.slot.ready.store(false, Ordering::Release);
        Some(copy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_then_take() {
        let buffer: SharedBuffer<u32> = SharedBuffer::new(2, 3);
        assert_eq!(buffer.shape(), (2, 3));
        assert!(buffer.take().is_none());

        assert!(buffer.publish(|d| d.fill(7)));
        assert!(buffer.is_ready());
        assert_eq!(buffer.take().unwrap(), vec![7; 6]);
        assert!(!buffer.is_ready());
    }

    #[test]
    fn test_publish_drops_while_unconsumed() {
        let buffer: SharedBuffer<f32> = SharedBuffer::new(1, 4);
        assert!(buffer.publish(|d| d.fill(1.0)));
        assert!(!buffer.publish(|d| d.fill(2.0)));
        assert_eq!(buffer.write_count(), 1);
        assert_eq!(buffer.take().unwrap(), vec![1.0; 4]);

        assert!(buffer.publish(|d| d.fill(3.0)));
        assert_eq!(buffer.take().unwrap(), vec![3.0; 4]);
    }

    #[test]
    fn test_force_publish_overwrites() {
        let buffer: SharedBuffer<u32> = SharedBuffer::new(1, 1);
        buffer.publish(|d| d[0] = 1);
        buffer.force_publish(|d| d[0] = 9);
        assert_eq!(buffer.take().unwrap(), vec![9]);
    }
}
