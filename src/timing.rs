use std::time::Duration;

/// Wall-clock duration of every completed cycle, in order.
#[derive(Debug, Clone, Default)]
pub struct TimingSeries {
    samples: Vec<Duration>,
}

impl TimingSeries {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
        }
    }

    pub fn record(&mut self, elapsed: Duration) {
        self.samples.push(elapsed);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[Duration] {
        &self.samples
    }

    pub fn total(&self) -> Duration {
        self.samples.iter().sum()
    }

    pub fn mean(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let nanos = self.total().as_nanos() / self.samples.len() as u128;
        Some(Duration::from_nanos(nanos as u64))
    }

    pub fn min(&self) -> Option<Duration> {
        self.samples.iter().min().copied()
    }

    pub fn max(&self) -> Option<Duration> {
        self.samples.iter().max().copied()
    }
}

pub fn as_millis_f64(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1e3
}
