//! Time-ordered IMU measurement buffer with interpolating range queries.

use std::collections::VecDeque;

use tracing::warn;

use super::sample::ImuSample;

pub struct ImuBuffer {
    samples: VecDeque<ImuSample>,
    capacity: usize,
}

impl ImuBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(4096)),
            capacity: capacity.max(2),
        }
    }

    /// Appends a sample. Samples that do not advance time are dropped.
    pub fn add(&mut self, sample: ImuSample) -> bool {
        if let Some(last) = self.samples.back() {
            if sample.timestamp_s <= last.timestamp_s {
                warn!(
                    t = sample.timestamp_s,
                    last = last.timestamp_s,
                    "dropping out-of-order IMU sample"
                );
                return false;
            }
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        true
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn first(&self) -> Option<&ImuSample> {
        self.samples.front()
    }

    pub fn last(&self) -> Option<&ImuSample> {
        self.samples.back()
    }

    /// Samples covering `[t0, t1]`, with the endpoints interpolated so the
    /// returned run starts exactly at `t0` and ends exactly at `t1`.
    ///
    /// Returns an empty vector when the buffer does not cover the interval.
    pub fn range(&self, t0: f64, t1: f64) -> Vec<ImuSample> {
        if t1 <= t0 || self.samples.len() < 2 {
            return Vec::new();
        }
        let (Some(front), Some(back)) = (self.samples.front(), self.samples.back()) else {
            return Vec::new();
        };
        if t0 < front.timestamp_s || t1 > back.timestamp_s {
            return Vec::new();
        }

        // First index with timestamp > t0.
        let start = self.samples.partition_point(|s| s.timestamp_s <= t0);
        let mut out = Vec::new();
        out.push(ImuSample::lerp(&self.samples[start - 1], &self.samples[start], t0));
        let mut i = start;
        while i < self.samples.len() && self.samples[i].timestamp_s < t1 {
            out.push(self.samples[i]);
            i += 1;
        }
        if i < self.samples.len() {
            out.push(ImuSample::lerp(&self.samples[i - 1], &self.samples[i], t1));
        }
        out
    }
}

impl Default for ImuBuffer {
    fn default() -> Self {
        Self::new(200_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn ramp(n: usize) -> ImuBuffer {
        let mut buf = ImuBuffer::new(1000);
        for i in 0..n {
            let t = i as f64 * 0.1;
            buf.add(ImuSample::new(t, Vector3::new(t, 0.0, 0.0), Vector3::zeros()));
        }
        buf
    }

    #[test]
    fn test_range_interpolates_endpoints() {
        let buf = ramp(20);
        let run = buf.range(0.25, 0.95);
        assert_relative_eq!(run[0].timestamp_s, 0.25);
        assert_relative_eq!(run[0].accel.x, 0.25, epsilon = 1e-12);
        let last = run.last().unwrap();
        assert_relative_eq!(last.timestamp_s, 0.95);
        assert_relative_eq!(last.accel.x, 0.95, epsilon = 1e-12);
        // 0.3 .. 0.9 inclusive in between
        assert_eq!(run.len(), 9);
    }

    #[test]
    fn test_range_outside_buffer_is_empty() {
        let buf = ramp(5);
        assert!(buf.range(0.1, 10.0).is_empty());
        assert!(buf.range(0.3, 0.2).is_empty());
    }

    #[test]
    fn test_out_of_order_rejected() {
        let mut buf = ramp(3);
        assert!(!buf.add(ImuSample::new(0.1, Vector3::zeros(), Vector3::zeros())));
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let mut buf = ImuBuffer::new(3);
        for i in 0..5 {
            buf.add(ImuSample::new(i as f64, Vector3::zeros(), Vector3::zeros()));
        }
        assert_eq!(buf.len(), 3);
        assert_relative_eq!(buf.first().unwrap().timestamp_s, 2.0);
    }
}
