use std::collections::{vec_deque, VecDeque};

/// Values per timestep: accelerometer x/y/z then gyroscope x/y/z.
pub const FRAME_CHANNELS: usize = 6;

pub type MotionFrame = [f32; FRAME_CHANNELS];

/// Fixed-capacity FIFO; the oldest entry is evicted when a push would overflow.
#[derive(Debug, Clone)]
pub struct SlidingWindow<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> SlidingWindow<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends `item`, returning the evicted oldest entry when the window was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() == self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest first.
    pub fn iter(&self) -> vec_deque::Iter<'_, T> {
        self.items.iter()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl SlidingWindow<MotionFrame> {
    /// Channel-major `1 × 6 × len` tensor.
    pub fn to_tensor(&self) -> WindowTensor {
        let timesteps = self.items.len();
        let mut data = vec![0.0f32; FRAME_CHANNELS * timesteps];
        for (t, frame) in self.items.iter().enumerate() {
            for (channel, value) in frame.iter().enumerate() {
                data[channel * timesteps + t] = *value;
            }
        }
        WindowTensor { data, timesteps }
    }
}

/// Classifier input, laid out as `[batch=1][channel][timestep]`.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowTensor {
    data: Vec<f32>,
    timesteps: usize,
}

impl WindowTensor {
    pub fn shape(&self) -> [usize; 3] {
        [1, FRAME_CHANNELS, self.timesteps]
    }

    pub fn timesteps(&self) -> usize {
        self.timesteps
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn value(&self, channel: usize, timestep: usize) -> Option<f32> {
        if channel >= FRAME_CHANNELS || timestep >= self.timesteps {
            return None;
        }
        self.data.get(channel * self.timesteps + timestep).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: usize) -> MotionFrame {
        let v = n as f32;
        [v, v + 0.1, v + 0.2, -v, -v - 0.1, -v - 0.2]
    }

    #[test]
    fn test_window_never_exceeds_capacity() {
        let mut window = SlidingWindow::new(60);
        for n in 1..=200 {
            window.push(n);
            assert!(window.len() <= 60);
        }
        assert!(window.is_full());
    }

    #[test]
    fn test_window_evicts_oldest_first() {
        let mut window = SlidingWindow::new(60);
        for n in 1..=60 {
            assert_eq!(window.push(n), None);
        }
        assert_eq!(window.push(61), Some(1));
        assert_eq!(window.iter().copied().collect::<Vec<_>>(), (2..=61).collect::<Vec<_>>());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut window = SlidingWindow::new(0);
        window.push(1);
        assert_eq!(window.push(2), Some(1));
        assert_eq!(window.capacity(), 1);
    }

    #[test]
    fn test_tensor_is_channel_major() {
        let mut window = SlidingWindow::new(3);
        for n in 1..=3 {
            window.push(frame(n));
        }
        let tensor = window.to_tensor();

        assert_eq!(tensor.shape(), [1, 6, 3]);
        assert_eq!(tensor.as_slice().len(), 18);
        // accelerometer x across time
        assert_eq!(&tensor.as_slice()[0..3], &[1.0, 2.0, 3.0]);
        // gyroscope x across time
        assert_eq!(&tensor.as_slice()[9..12], &[-1.0, -2.0, -3.0]);
        assert_eq!(tensor.value(1, 2), Some(frame(3)[1]));
        assert_eq!(tensor.value(6, 0), None);
    }
}
