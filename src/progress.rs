//! Progress tracking for one in-flight generation job.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

/// Point-in-time view of a job's progress.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    /// Overall completion, 0..=100.
    pub percent: u8,
    /// Completed workflow nodes.
    pub current: u32,
    /// Total workflow nodes.
    pub total: u32,
    /// Latest log line.
    pub log: String,
}

impl ProgressSnapshot {
    fn recompute(&mut self) {
        if self.total > 0 {
            let pct = u64::from(self.current) * 100 / u64::from(self.total);
            self.percent = pct.min(100) as u8;
        }
    }
}

/// Receives every progress change.
#[async_trait]
pub trait ProgressListener: Send + Sync {
    async fn on_update(&self, snapshot: &ProgressSnapshot);
}

/// Progress sink fed by protocol events.
///
/// Percent is derived from completed/total node counts; `on_progress` can
/// also set it directly (used once the backend reports completion).
pub struct Progress {
    state: Mutex<ProgressSnapshot>,
    listener: Option<Arc<dyn ProgressListener>>,
}

impl Progress {
    /// A sink that only keeps state.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProgressSnapshot::default()),
            listener: None,
        }
    }

    /// A sink that forwards every change to `listener`.
    pub fn with_listener(listener: Arc<dyn ProgressListener>) -> Self {
        Self {
            state: Mutex::new(ProgressSnapshot::default()),
            listener: Some(listener),
        }
    }

    pub async fn snapshot(&self) -> ProgressSnapshot {
        self.state.lock().await.clone()
    }

    pub async fn current(&self) -> u32 {
        self.state.lock().await.current
    }

    pub async fn set_total(&self, total: u32) {
        self.update(|s| {
            s.total = total;
            s.recompute();
        })
        .await;
    }

    pub async fn set_current(&self, current: u32) {
        self.update(|s| {
            s.current = current;
            s.recompute();
        })
        .await;
    }

    /// Mark one more node as completed.
    pub async fn advance(&self) {
        self.update(|s| {
            s.current = s.current.saturating_add(1);
            s.recompute();
        })
        .await;
    }

    pub async fn on_log(&self, log: impl Into<String>) {
        let log = log.into();
        self.update(|s| s.log = log).await;
    }

    pub async fn on_progress(&self, percent: u8, log: impl Into<String>) {
        let log = log.into();
        self.update(|s| {
            s.percent = percent.min(100);
            s.log = log;
        })
        .await;
    }

    async fn update(&self, f: impl FnOnce(&mut ProgressSnapshot) + Send) {
        let snapshot = {
            let mut state = self.state.lock().await;
            f(&mut state);
            state.clone()
        };
        if let Some(listener) = &self.listener {
            listener.on_update(&snapshot).await;
        }
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder(StdMutex<Vec<ProgressSnapshot>>);

    #[async_trait]
    impl ProgressListener for Recorder {
        async fn on_update(&self, snapshot: &ProgressSnapshot) {
            self.0.lock().unwrap().push(snapshot.clone());
        }
    }

    #[tokio::test]
    async fn percent_follows_node_counts() {
        let progress = Progress::new();
        progress.set_total(4).await;
        progress.advance().await;
        assert_eq!(progress.snapshot().await.percent, 25);
        progress.set_current(3).await;
        assert_eq!(progress.snapshot().await.percent, 75);
    }

    #[tokio::test]
    async fn percent_is_capped() {
        let progress = Progress::new();
        progress.set_total(2).await;
        for _ in 0..5 {
            progress.advance().await;
        }
        let snap = progress.snapshot().await;
        assert_eq!(snap.current, 5);
        assert_eq!(snap.percent, 100);
    }

    #[tokio::test]
    async fn zero_total_leaves_percent_alone() {
        let progress = Progress::new();
        progress.advance().await;
        assert_eq!(progress.snapshot().await.percent, 0);
    }

    #[tokio::test]
    async fn listener_sees_every_change() {
        let recorder = Arc::new(Recorder::default());
        let progress = Progress::with_listener(recorder.clone());
        progress.set_total(10).await;
        progress.on_log("node 3 started").await;
        progress.on_progress(100, "done").await;

        let seen = recorder.0.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[1].log, "node 3 started");
        assert_eq!(seen[2].percent, 100);
        assert_eq!(seen[2].log, "done");
    }
}
