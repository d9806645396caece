//! Per-request timing/status records (spec §3, §4.6).

use std::time::{Duration, Instant};

/// Stamped when a request enters preprocessing; mutated by each stage end;
/// consumed by the post-result collector for statistics.
#[derive(Debug, Clone)]
pub struct ProcessStatus {
    pub device_id: u32,
    pub valid: bool,
    starts: Vec<Instant>,
    ends: Vec<Instant>,
}

impl ProcessStatus {
    pub fn new(device_id: u32) -> Self {
        Self {
            device_id,
            valid: true,
            starts: Vec::new(),
            ends: Vec::new(),
        }
    }

    /// Opens a new stage timing span, stamping `start == end` until `end()`
    /// is called (mirrors the original's `start()`, which pushes the same
    /// instant to both vectors so `show()` never reads an unterminated
    /// span).
    pub fn start(&mut self) {
        let now = Instant::now();
        self.starts.push(now);
        self.ends.push(now);
    }

    /// Closes the most recently opened span.
    pub fn end(&mut self) {
        if let Some(last) = self.ends.last_mut() {
            *last = Instant::now();
        }
    }

    pub fn stage_durations(&self) -> Vec<Duration> {
        self.starts
            .iter()
            .zip(self.ends.iter())
            .map(|(s, e)| e.saturating_duration_since(*s))
            .collect()
    }

    pub fn total_duration(&self) -> Duration {
        match (self.starts.first(), self.ends.last()) {
            (Some(s), Some(e)) => e.saturating_duration_since(*s),
            _ => Duration::ZERO,
        }
    }
}

/// Aggregate statistics across many requests, fed by the post-result
/// collector (`runner_show_status` / `get_runner_durations` in the C ABI).
#[derive(Debug)]
pub struct ProcessStatInfo {
    pub name: String,
    pub num_samples: u64,
    pub total_duration: Duration,
    pub per_stage_duration: Vec<Duration>,
    pub per_device_count: std::collections::HashMap<u32, u64>,
    started_at: Instant,
}

impl ProcessStatInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            num_samples: 0,
            total_duration: Duration::ZERO,
            per_stage_duration: Vec::new(),
            per_device_count: std::collections::HashMap::new(),
            started_at: Instant::now(),
        }
    }

    pub fn update(&mut self, status: &ProcessStatus) {
        if !status.valid {
            return;
        }
        self.num_samples += 1;
        self.total_duration += status.total_duration();
        let durations = status.stage_durations();
        if self.per_stage_duration.len() < durations.len() {
            self.per_stage_duration
                .resize(durations.len(), Duration::ZERO);
        }
        for (acc, d) in self.per_stage_duration.iter_mut().zip(durations.iter()) {
            *acc += *d;
        }
        *self.per_device_count.entry(status.device_id).or_insert(0) += 1;
    }

    pub fn show(&self) {
        let wall = self.started_at.elapsed();
        tracing::info!(
            model = %self.name,
            samples = self.num_samples,
            wall_ms = wall.as_millis() as u64,
            serialized_ms = self.total_duration.as_millis() as u64,
            "process stats"
        );
        for (i, d) in self.per_stage_duration.iter().enumerate() {
            tracing::info!(stage = i, total_ms = d.as_millis() as u64, "stage duration");
        }
        for (device_id, count) in &self.per_device_count {
            tracing::info!(device_id, count, "device processed samples");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_accumulates_stage_durations() {
        let mut status = ProcessStatus::new(0);
        status.start();
        std::thread::sleep(Duration::from_millis(5));
        status.end();
        status.start();
        std::thread::sleep(Duration::from_millis(5));
        status.end();
        assert_eq!(status.stage_durations().len(), 2);
        assert!(status.total_duration() >= Duration::from_millis(5));
    }

    #[test]
    fn stat_info_ignores_invalid_status() {
        let mut info = ProcessStatInfo::new("test");
        let mut status = ProcessStatus::new(1);
        status.valid = false;
        status.start();
        status.end();
        info.update(&status);
        assert_eq!(info.num_samples, 0);
    }
}
