///! Scheduled task manager - periodic maintenance
///!
///! - Enrichment cache purge (stale and negative entries)
///! - Stats report line in the log
///!
///! Both run on interval boundaries counted from midnight UTC.

use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::MaintenanceConfig;
use crate::service::DxClusterService;

/// Configuration for scheduled tasks
#[derive(Debug, Clone)]
pub struct ScheduledTaskConfig {
    /// Interval for enrichment cache purges (in minutes)
    pub enrichment_purge_interval_minutes: u64,

    /// Interval for the stats log line (in minutes), 0 disables it
    pub stats_report_interval_minutes: u64,
}

impl Default for ScheduledTaskConfig {
    fn default() -> Self {
        Self::from(&MaintenanceConfig::default())
    }
}

impl From<&MaintenanceConfig> for ScheduledTaskConfig {
    fn from(config: &MaintenanceConfig) -> Self {
        Self {
            enrichment_purge_interval_minutes: config.enrichment_purge_interval_minutes,
            stats_report_interval_minutes: config.stats_report_interval_minutes,
        }
    }
}

/// Scheduled task manager
pub struct ScheduledTaskManager {
    config: ScheduledTaskConfig,
    service: Arc<DxClusterService>,
    task_handles: Vec<JoinHandle<()>>,
}

impl ScheduledTaskManager {
    pub fn new(config: ScheduledTaskConfig, service: Arc<DxClusterService>) -> Self {
        Self {
            config,
            service,
            task_handles: Vec::new(),
        }
    }

    /// Start all scheduled tasks
    pub fn start_all(&mut self) {
        tracing::info!("Starting scheduled task manager...");

        if let Some(handle) = self.start_enrichment_purge_task() {
            self.task_handles.push(handle);
        }
        if let Some(handle) = self.start_stats_report_task() {
            self.task_handles.push(handle);
        }

        tracing::info!(
            "Started {} scheduled tasks (enrichment purge every {} min, stats every {} min)",
            self.task_handles.len(),
            self.config.enrichment_purge_interval_minutes,
            self.config.stats_report_interval_minutes
        );
    }

    pub fn task_count(&self) -> usize {
        self.task_handles.len()
    }

    /// Nothing to purge when enrichment is disabled.
    fn start_enrichment_purge_task(&self) -> Option<JoinHandle<()>> {
        let interval_minutes = self.config.enrichment_purge_interval_minutes;
        if interval_minutes == 0 {
            return None;
        }
        let cache = self.service.enrichment_cache()?;

        tracing::info!("Scheduling enrichment purge task (interval: {} minutes)", interval_minutes);

        Some(tokio::spawn(async move {
            loop {
                Self::sleep_until_next_run(interval_minutes, "enrichment purge").await;

                let removed = cache.purge_expired().await;
                if removed > 0 {
                    tracing::info!("Enrichment purge removed {} expired entries", removed);
                } else {
                    tracing::debug!("Enrichment purge: nothing expired");
                }
            }
        }))
    }

    fn start_stats_report_task(&self) -> Option<JoinHandle<()>> {
        let interval_minutes = self.config.stats_report_interval_minutes;
        if interval_minutes == 0 {
            return None;
        }
        let service = self.service.clone();

        tracing::info!("Scheduling stats report task (interval: {} minutes)", interval_minutes);

        Some(tokio::spawn(async move {
            loop {
                Self::sleep_until_next_run(interval_minutes, "stats report").await;

                let stats = service.stats().await;
                tracing::info!(
                    "Stats: state={} spots={} parse_failures={} synthetic={} cached={} reconnects={} lookups={} lookup_failures={}",
                    stats.state,
                    stats.total_spots_received,
                    stats.total_parse_failures,
                    stats.synthetic_spots,
                    stats.cache_size,
                    stats.reconnect_count,
                    stats.enrichment_lookups,
                    stats.enrichment_failures
                );
            }
        }))
    }

    async fn sleep_until_next_run(interval_minutes: u64, name: &str) {
        let now = Utc::now();
        let next_trigger = Self::calculate_next_run(now, interval_minutes);
        let sleep_duration = (next_trigger - now)
            .to_std()
            .unwrap_or(Duration::from_secs(60));

        tracing::debug!(
            "Next {} at: {} (in {:.1} min)",
            name,
            next_trigger.format("%Y-%m-%d %H:%M:%S UTC"),
            sleep_duration.as_secs_f64() / 60.0
        );

        tokio::time::sleep(sleep_duration).await;
    }

    /// Next multiple of `interval_minutes` after `now`, counted from midnight UTC.
    fn calculate_next_run(now: DateTime<Utc>, interval_minutes: u64) -> DateTime<Utc> {
        let interval = ChronoDuration::minutes(interval_minutes.clamp(1, 24 * 60) as i64);
        let day_start = now.duration_trunc(ChronoDuration::days(1)).unwrap_or(now);

        let elapsed = (now - day_start).num_seconds();
        let step = interval.num_seconds();
        let next = day_start + ChronoDuration::seconds((elapsed / step + 1) * step);

        // Intervals that do not divide a day still fire at midnight
        let midnight = day_start + ChronoDuration::days(1);
        next.min(midnight)
    }

    /// Gracefully shutdown all tasks
    pub fn shutdown(self) {
        tracing::info!("Shutting down scheduled task manager...");

        for handle in self.task_handles {
            handle.abort();
        }

        tracing::info!("All scheduled tasks stopped");
    }
}
