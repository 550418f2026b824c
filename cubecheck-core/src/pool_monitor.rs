//! Connection pool observation, health assessment and tuning suggestions.
//!
//! An [`EventRecorder`] wraps pool acquisition so every lease produces
//! lifecycle events in a bounded ring buffer. [`ConnectionPoolMonitor`]
//! combines those events with the pool's live gauges.

use crate::models::{HealthStatus, Severity};
use crate::{DiagnosticError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lifecycle events kept before the oldest are evicted
pub const DEFAULT_EVENT_CAPACITY: usize = 1000;
/// Events considered by [`ConnectionPoolMonitor::pool_metrics`]
pub const METRICS_WINDOW: Duration = Duration::from_secs(5 * 60);
/// Events considered by optimization and reports
pub const ANALYSIS_WINDOW: Duration = Duration::from_secs(60 * 60);
/// Hold time above which a lease counts as a slow query
pub const SLOW_QUERY_THRESHOLD_MS: u64 = 5000;
/// Period of metrics polling while monitoring is active
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(30);

const HIGH_UTILIZATION: f64 = 0.8;

/// Kind of lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventType {
    Created,
    Acquired,
    Released,
    Destroyed,
    Error,
}

impl std::fmt::Display for LifecycleEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Acquired => write!(f, "acquired"),
            Self::Released => write!(f, "released"),
            Self::Destroyed => write!(f, "destroyed"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One pool lifecycle event.
///
/// `duration_ms` is the wait time for `Acquired` and the hold time for
/// `Released`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionLifecycleEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: LifecycleEventType,
    pub connection_id: String,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

impl ConnectionLifecycleEvent {
    /// Creates an event stamped now
    pub fn new(event_type: LifecycleEventType, connection_id: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            connection_id: connection_id.into(),
            duration_ms: None,
            error: None,
        }
    }

    /// Builder method to attach a duration.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = Some(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Builder method to attach an error message.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Message delivered to monitoring subscribers
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// A lifecycle event as it was recorded
    Lifecycle(ConnectionLifecycleEvent),
    /// A periodic metrics sample
    Metrics(ConnectionPoolMetrics),
}

#[derive(Debug)]
struct RecorderInner {
    events: Mutex<VecDeque<ConnectionLifecycleEvent>>,
    capacity: usize,
    counter: AtomicU64,
    waiting: AtomicU32,
    monitoring: AtomicBool,
    sender: broadcast::Sender<MonitorEvent>,
}

/// Bounded, shared log of pool lifecycle events.
///
/// Cloning is cheap; clones share the same buffer.
#[derive(Debug, Clone)]
pub struct EventRecorder {
    inner: Arc<RecorderInner>,
}

impl Default for EventRecorder {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }
}

/// Decrements the waiting gauge when an acquisition finishes or is dropped.
struct WaitingGuard<'a>(&'a AtomicU32);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        let _ = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
    }
}

impl EventRecorder {
    /// Creates a recorder with the default capacity
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a recorder keeping at most `capacity` events
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(RecorderInner {
                events: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_EVENT_CAPACITY))),
                capacity: capacity.max(1),
                counter: AtomicU64::new(0),
                waiting: AtomicU32::new(0),
                monitoring: AtomicBool::new(false),
                sender,
            }),
        }
    }

    fn events_lock(&self) -> std::sync::MutexGuard<'_, VecDeque<ConnectionLifecycleEvent>> {
        self.inner.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates an id of the form `conn_{n}_{unix_millis}`
    pub fn next_connection_id(&self) -> String {
        let n = self.inner.counter.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        format!("conn_{}_{}", n, Utc::now().timestamp_millis())
    }

    /// Appends an event, evicting the oldest past capacity.
    pub fn record(&self, event: ConnectionLifecycleEvent) {
        {
            let mut events = self.events_lock();
            events.push_back(event.clone());
            while events.len() > self.inner.capacity {
                events.pop_front();
            }
        }
        if self.is_monitoring() {
            // No subscribers is not an error
            let _ = self.inner.sender.send(MonitorEvent::Lifecycle(event));
        }
    }

    /// Tasks currently waiting for a connection
    pub fn waiting(&self) -> u32 {
        self.inner.waiting.load(Ordering::SeqCst)
    }

    /// Events recorded within `window` of now, oldest first
    pub fn events_since(&self, window: Duration) -> Vec<ConnectionLifecycleEvent> {
        let cutoff = chrono::Duration::from_std(window)
            .ok()
            .and_then(|w| Utc::now().checked_sub_signed(w));
        self.events_lock()
            .iter()
            .filter(|e| cutoff.is_none_or(|c| e.timestamp >= c))
            .cloned()
            .collect()
    }

    /// Number of buffered events
    pub fn len(&self) -> usize {
        self.events_lock().len()
    }

    /// Whether no events are buffered
    pub fn is_empty(&self) -> bool {
        self.events_lock().is_empty()
    }

    /// Subscribes to events emitted while monitoring is active
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.inner.sender.subscribe()
    }

    fn is_monitoring(&self) -> bool {
        self.inner.monitoring.load(Ordering::SeqCst)
    }

    fn emit(&self, event: MonitorEvent) {
        let _ = self.inner.sender.send(event);
    }

    /// Awaits an acquisition future, recording wait time, failures and the
    /// eventual release of the returned connection.
    ///
    /// # Errors
    /// Returns the acquisition error unchanged after recording it.
    pub async fn acquire<C, E, F>(&self, acquisition: F) -> std::result::Result<Lease<C>, E>
    where
        F: Future<Output = std::result::Result<C, E>>,
        E: std::fmt::Display,
    {
        let connection_id = self.next_connection_id();
        let started = Instant::now();

        self.inner.waiting.fetch_add(1, Ordering::SeqCst);
        let result = {
            let _guard = WaitingGuard(&self.inner.waiting);
            acquisition.await
        };

        match result {
            Ok(conn) => {
                self.record(
                    ConnectionLifecycleEvent::new(LifecycleEventType::Acquired, &connection_id)
                        .with_duration(started.elapsed()),
                );
                Ok(Lease {
                    conn,
                    recorder: self.clone(),
                    connection_id,
                    acquired_at: Instant::now(),
                })
            }
            Err(e) => {
                self.record(
                    ConnectionLifecycleEvent::new(LifecycleEventType::Error, &connection_id)
                        .with_error(e.to_string()),
                );
                Err(e)
            }
        }
    }
}

/// A connection obtained through [`EventRecorder::acquire`].
///
/// Dropping the lease records a `Released` event carrying the hold time.
#[derive(Debug)]
pub struct Lease<C> {
    conn: C,
    recorder: EventRecorder,
    connection_id: String,
    acquired_at: Instant,
}

impl<C> Lease<C> {
    /// Id shared by the `Acquired` and `Released` events of this lease
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }
}

impl<C> Deref for Lease<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C> DerefMut for Lease<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}

impl<C> Drop for Lease<C> {
    fn drop(&mut self) {
        self.recorder.record(
            ConnectionLifecycleEvent::new(LifecycleEventType::Released, &self.connection_id)
                .with_duration(self.acquired_at.elapsed()),
        );
    }
}

/// Live pool gauges
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolGauges {
    pub total: u32,
    pub idle: u32,
    pub waiting: u32,
}

/// Pool configuration as seen by the optimizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout_ms: u64,
    pub idle_timeout_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 0,
            connection_timeout_ms: 10_000,
            idle_timeout_ms: 30_000,
        }
    }
}

/// A pool whose gauges can be observed
pub trait PoolSource: Send + Sync {
    /// Current gauges
    fn gauges(&self) -> PoolGauges;
    /// Configured limits and timeouts
    fn settings(&self) -> PoolSettings;
}

/// A [`PoolSource`] with externally set gauges.
///
/// Used where no real pool exists, such as in-memory catalogs.
#[derive(Debug, Default)]
pub struct FixedPoolSource {
    gauges: Mutex<PoolGauges>,
    settings: PoolSettings,
}

impl FixedPoolSource {
    /// Creates a source reporting `gauges` under `settings`
    pub fn new(gauges: PoolGauges, settings: PoolSettings) -> Self {
        Self {
            gauges: Mutex::new(gauges),
            settings,
        }
    }

    /// Replaces the reported gauges
    pub fn set_gauges(&self, gauges: PoolGauges) {
        *self.gauges.lock().unwrap_or_else(PoisonError::into_inner) = gauges;
    }
}

impl PoolSource for FixedPoolSource {
    fn gauges(&self) -> PoolGauges {
        *self.gauges.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settings(&self) -> PoolSettings {
        self.settings
    }
}

/// Point-in-time pool metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionPoolMetrics {
    pub timestamp: DateTime<Utc>,
    pub total_connections: u32,
    pub active_connections: u32,
    pub idle_connections: u32,
    pub waiting_connections: u32,
    pub max_connections: u32,
    pub connection_errors: u32,
    pub average_connection_time_ms: f64,
    pub average_query_time_ms: f64,
    pub slow_queries: u32,
    pub pool_utilization: f64,
}

impl Default for ConnectionPoolMetrics {
    fn default() -> Self {
        Self {
            timestamp: Utc::now(),
            total_connections: 0,
            active_connections: 0,
            idle_connections: 0,
            waiting_connections: 0,
            max_connections: 10,
            connection_errors: 0,
            average_connection_time_ms: 0.0,
            average_query_time_ms: 0.0,
            slow_queries: 0,
            pool_utilization: 0.0,
        }
    }
}

/// Kind of pool issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolIssueType {
    HighUtilization,
    ConnectionErrors,
    SlowQueries,
    PoolExhaustion,
    ConnectionLeaks,
}

/// One detected pool problem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionPoolIssue {
    #[serde(rename = "type")]
    pub issue_type: PoolIssueType,
    pub severity: Severity,
    pub description: String,
    pub recommendation: String,
    pub detected_at: DateTime<Utc>,
    pub count: u32,
}

/// Pool health verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionPoolHealth {
    pub timestamp: DateTime<Utc>,
    pub status: HealthStatus,
    pub metrics: ConnectionPoolMetrics,
    pub issues: Vec<ConnectionPoolIssue>,
    pub recommendations: Vec<String>,
}

/// Kind of configuration change suggested by the optimizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationKind {
    IncreaseMaxConnections,
    DecreaseMaxConnections,
    IncreaseConnectionTimeout,
    DecreaseIdleTimeout,
}

/// One suggested parameter change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRecommendation {
    #[serde(rename = "type")]
    pub kind: OptimizationKind,
    pub current: u64,
    pub suggested: u64,
    pub reason: String,
}

/// Optimizer output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolOptimization {
    pub timestamp: DateTime<Utc>,
    pub current_config: PoolSettings,
    pub recommendations: Vec<PoolRecommendation>,
}

/// Summary statistics over event durations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DurationStats {
    pub average: f64,
    pub max: u64,
    pub min: u64,
    pub count: usize,
}

/// Event counts and durations over a window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventStatistics {
    pub total_events: usize,
    pub event_counts: BTreeMap<LifecycleEventType, u32>,
    pub duration_stats: DurationStats,
}

/// Headline numbers of a pool report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolReportSummary {
    pub status: HealthStatus,
    pub total_connections: u32,
    pub utilization: f64,
    pub issue_count: usize,
    pub recommendation_count: usize,
}

/// Latency figures of a pool report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub average_connection_time_ms: f64,
    pub average_query_time_ms: f64,
    pub slow_queries: u32,
    pub connection_errors: u32,
}

/// Full pool report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolReport {
    pub timestamp: DateTime<Utc>,
    pub summary: PoolReportSummary,
    pub health: ConnectionPoolHealth,
    pub optimization: PoolOptimization,
    pub event_statistics: EventStatistics,
    pub performance_metrics: PerformanceMetrics,
}

fn average(values: &[u64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().map(|v| *v as f64).sum::<f64>() / values.len() as f64
}

fn durations_of(events: &[ConnectionLifecycleEvent], kind: LifecycleEventType) -> Vec<u64> {
    events
        .iter()
        .filter(|e| e.event_type == kind)
        .filter_map(|e| e.duration_ms)
        .collect()
}

fn count_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Computes metrics from gauges and the recorder's recent events.
pub fn collect_metrics(source: &dyn PoolSource, recorder: &EventRecorder) -> ConnectionPoolMetrics {
    let gauges = source.gauges();
    let settings = source.settings();
    let recent = recorder.events_since(METRICS_WINDOW);

    let connection_errors = recent
        .iter()
        .filter(|e| e.event_type == LifecycleEventType::Error)
        .count();
    let hold_times = durations_of(&recent, LifecycleEventType::Released);
    let slow_queries = hold_times
        .iter()
        .filter(|d| **d > SLOW_QUERY_THRESHOLD_MS)
        .count();

    let max_connections = settings.max_connections;
    let pool_utilization = if max_connections > 0 {
        f64::from(gauges.total) / f64::from(max_connections)
    } else {
        0.0
    };

    ConnectionPoolMetrics {
        timestamp: Utc::now(),
        total_connections: gauges.total,
        active_connections: gauges.total.saturating_sub(gauges.idle),
        idle_connections: gauges.idle,
        waiting_connections: gauges.waiting,
        max_connections,
        connection_errors: count_u32(connection_errors),
        average_connection_time_ms: average(&durations_of(&recent, LifecycleEventType::Acquired)),
        average_query_time_ms: average(&hold_times),
        slow_queries: count_u32(slow_queries),
        pool_utilization,
    }
}

/// Runs the threshold battery over a metrics sample.
pub fn assess_pool_health(metrics: &ConnectionPoolMetrics) -> ConnectionPoolHealth {
    let now = Utc::now();
    let mut issues = Vec::new();
    let mut issue = |issue_type, severity, description: String, recommendation: &str, count| {
        issues.push(ConnectionPoolIssue {
            issue_type,
            severity,
            description,
            recommendation: recommendation.to_string(),
            detected_at: now,
            count,
        });
    };

    if metrics.pool_utilization > HIGH_UTILIZATION {
        issue(
            PoolIssueType::HighUtilization,
            if metrics.pool_utilization > 0.95 { Severity::Critical } else { Severity::High },
            format!("Pool utilization is {:.1}%", metrics.pool_utilization * 100.0),
            "Consider increasing max connections or optimizing query performance",
            1,
        );
    }

    if metrics.connection_errors > 0 {
        issue(
            PoolIssueType::ConnectionErrors,
            if metrics.connection_errors > 5 { Severity::High } else { Severity::Medium },
            format!("{} connection errors in recent period", metrics.connection_errors),
            "Check database connectivity and network stability",
            metrics.connection_errors,
        );
    }

    if metrics.slow_queries > 0 {
        issue(
            PoolIssueType::SlowQueries,
            if metrics.slow_queries > 10 { Severity::High } else { Severity::Medium },
            format!("{} slow queries detected", metrics.slow_queries),
            "Optimize query performance or increase query timeout",
            metrics.slow_queries,
        );
    }

    if metrics.waiting_connections > 0 {
        issue(
            PoolIssueType::PoolExhaustion,
            if metrics.waiting_connections > 5 { Severity::Critical } else { Severity::High },
            format!(
                "{} connections waiting for availability",
                metrics.waiting_connections
            ),
            "Increase max connections or reduce connection hold time",
            metrics.waiting_connections,
        );
    }

    let expected_active = metrics.total_connections.min(5);
    if metrics.active_connections > expected_active.saturating_mul(2) {
        issue(
            PoolIssueType::ConnectionLeaks,
            Severity::Medium,
            format!(
                "Unusually high number of active connections: {}",
                metrics.active_connections
            ),
            "Check for connection leaks in application code",
            metrics.active_connections,
        );
    }

    let recommendations = health_recommendations(&issues, metrics);
    let status = if issues.iter().any(|i| i.severity == Severity::Critical) {
        HealthStatus::Critical
    } else if issues.iter().any(|i| i.severity == Severity::High) || metrics.pool_utilization > 0.9
    {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };

    ConnectionPoolHealth {
        timestamp: now,
        status,
        metrics: metrics.clone(),
        issues,
        recommendations,
    }
}

fn health_recommendations(
    issues: &[ConnectionPoolIssue],
    metrics: &ConnectionPoolMetrics,
) -> Vec<String> {
    if issues.is_empty() {
        return vec!["Connection pool is operating normally".to_string()];
    }

    let mut recommendations: Vec<String> = Vec::new();
    let mut push = |text: &str| {
        if !recommendations.iter().any(|r| r == text) {
            recommendations.push(text.to_string());
        }
    };
    for issue in issues {
        push(&issue.recommendation);
    }
    if metrics.average_connection_time_ms > 1000.0 {
        push("Consider optimizing database connection setup or network latency");
    }
    if metrics.average_query_time_ms > 2000.0 {
        push("Review and optimize slow-running queries");
    }
    recommendations
}

/// Proposes parameter changes from metrics and an hour of events.
pub fn optimize_settings(
    metrics: &ConnectionPoolMetrics,
    settings: PoolSettings,
    recent_events: &[ConnectionLifecycleEvent],
) -> PoolOptimization {
    let mut recommendations = Vec::new();
    let max = u64::from(settings.max_connections);

    if metrics.pool_utilization > 0.9 {
        recommendations.push(PoolRecommendation {
            kind: OptimizationKind::IncreaseMaxConnections,
            current: max,
            suggested: (max as f64 * 1.5).ceil() as u64,
            reason: "High pool utilization detected".to_string(),
        });
    }

    if metrics.pool_utilization < 0.3 && max > 5 {
        recommendations.push(PoolRecommendation {
            kind: OptimizationKind::DecreaseMaxConnections,
            current: max,
            suggested: ((max as f64 * 0.7).floor() as u64).max(5),
            reason: "Low pool utilization detected".to_string(),
        });
    }

    let acquisition_times = durations_of(recent_events, LifecycleEventType::Acquired);
    if !acquisition_times.is_empty() && average(&acquisition_times) > 1000.0 {
        let current = settings.connection_timeout_ms;
        recommendations.push(PoolRecommendation {
            kind: OptimizationKind::IncreaseConnectionTimeout,
            current,
            suggested: ((current as f64 * 1.5) as u64).max(30_000),
            reason: "Slow connection acquisition detected".to_string(),
        });
    }

    if metrics.idle_connections > metrics.active_connections.saturating_mul(2) {
        let current = settings.idle_timeout_ms;
        recommendations.push(PoolRecommendation {
            kind: OptimizationKind::DecreaseIdleTimeout,
            current,
            suggested: ((current as f64 * 0.7) as u64).max(10_000),
            reason: "Many idle connections detected".to_string(),
        });
    }

    PoolOptimization {
        timestamp: Utc::now(),
        current_config: settings,
        recommendations,
    }
}

/// Counts by type and duration statistics over a set of events.
pub fn event_statistics(events: &[ConnectionLifecycleEvent]) -> EventStatistics {
    let mut event_counts = BTreeMap::new();
    for event in events {
        let count: &mut u32 = event_counts.entry(event.event_type).or_default();
        *count = count.saturating_add(1);
    }

    let durations: Vec<u64> = events.iter().filter_map(|e| e.duration_ms).collect();
    let duration_stats = DurationStats {
        average: average(&durations),
        max: durations.iter().copied().max().unwrap_or(0),
        min: durations.iter().copied().min().unwrap_or(0),
        count: durations.len(),
    };

    EventStatistics {
        total_events: events.len(),
        event_counts,
        duration_stats,
    }
}

/// Observes one pool through its gauges and an [`EventRecorder`].
pub struct ConnectionPoolMonitor {
    source: Arc<dyn PoolSource>,
    recorder: EventRecorder,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ConnectionPoolMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPoolMonitor")
            .field("settings", &self.source.settings())
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl ConnectionPoolMonitor {
    /// Creates a monitor polling every [`MONITOR_INTERVAL`] while active
    pub fn new(source: Arc<dyn PoolSource>, recorder: EventRecorder) -> Self {
        Self {
            source,
            recorder,
            interval: MONITOR_INTERVAL,
            task: Mutex::new(None),
        }
    }

    /// Builder method to change the polling interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// The recorder fed by the monitored pool
    pub fn recorder(&self) -> &EventRecorder {
        &self.recorder
    }

    /// Gauges plus the last five minutes of events.
    pub fn pool_metrics(&self) -> ConnectionPoolMetrics {
        let metrics = collect_metrics(self.source.as_ref(), &self.recorder);
        debug!(
            total = metrics.total_connections,
            active = metrics.active_connections,
            idle = metrics.idle_connections,
            waiting = metrics.waiting_connections,
            utilization = metrics.pool_utilization,
            "Connection pool metrics collected"
        );
        metrics
    }

    /// Current health verdict.
    pub fn get_pool_health(&self) -> ConnectionPoolHealth {
        let health = assess_pool_health(&self.pool_metrics());
        info!(
            status = %health.status,
            issue_count = health.issues.len(),
            utilization = health.metrics.pool_utilization,
            "Connection pool health assessed"
        );
        health
    }

    /// Suggested configuration changes.
    pub fn optimize_pool_configuration(&self) -> PoolOptimization {
        let optimization = optimize_settings(
            &self.pool_metrics(),
            self.source.settings(),
            &self.recorder.events_since(ANALYSIS_WINDOW),
        );
        info!(
            recommendation_count = optimization.recommendations.len(),
            "Pool configuration optimization completed"
        );
        optimization
    }

    /// Health, optimization and event statistics for the last hour.
    pub fn generate_pool_report(&self) -> PoolReport {
        let health = self.get_pool_health();
        let optimization = self.optimize_pool_configuration();
        let event_statistics = event_statistics(&self.recorder.events_since(ANALYSIS_WINDOW));

        let report = PoolReport {
            timestamp: Utc::now(),
            summary: PoolReportSummary {
                status: health.status,
                total_connections: health.metrics.total_connections,
                utilization: health.metrics.pool_utilization,
                issue_count: health.issues.len(),
                recommendation_count: optimization.recommendations.len(),
            },
            performance_metrics: PerformanceMetrics {
                average_connection_time_ms: health.metrics.average_connection_time_ms,
                average_query_time_ms: health.metrics.average_query_time_ms,
                slow_queries: health.metrics.slow_queries,
                connection_errors: health.metrics.connection_errors,
            },
            health,
            optimization,
            event_statistics,
        };

        info!(
            status = %report.summary.status,
            issue_count = report.summary.issue_count,
            "Pool performance report generated"
        );
        report
    }

    /// Whether lifecycle monitoring is active
    pub fn is_monitoring(&self) -> bool {
        self.recorder.is_monitoring()
    }

    /// Starts forwarding lifecycle events to subscribers and polling metrics
    /// on the configured interval.
    ///
    /// Calling this while already monitoring only adds a subscriber.
    ///
    /// # Errors
    /// Returns a configuration error when called outside a Tokio runtime.
    pub fn start_lifecycle_monitoring(&self) -> Result<broadcast::Receiver<MonitorEvent>> {
        let receiver = self.recorder.subscribe();
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);

        if task.is_some() {
            warn!("Connection pool monitoring is already active");
            return Ok(receiver);
        }

        let handle = tokio::runtime::Handle::try_current().map_err(|e| {
            DiagnosticError::configuration(format!(
                "Pool monitoring requires a Tokio runtime: {}",
                e
            ))
        })?;

        self.recorder.inner.monitoring.store(true, Ordering::SeqCst);
        info!(interval_ms = self.interval.as_millis(), "Starting connection pool lifecycle monitoring");

        let source = Arc::clone(&self.source);
        let recorder = self.recorder.clone();
        let period = self.interval;
        *task = Some(handle.spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let metrics = collect_metrics(source.as_ref(), &recorder);
                debug!(utilization = metrics.pool_utilization, "Pool metrics sampled");
                recorder.emit(MonitorEvent::Metrics(metrics));
            }
        }));

        Ok(receiver)
    }

    /// Stops monitoring. Existing receivers see no further events.
    pub fn stop_lifecycle_monitoring(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        match task.take() {
            Some(handle) => {
                handle.abort();
                self.recorder.inner.monitoring.store(false, Ordering::SeqCst);
                info!("Stopping connection pool lifecycle monitoring");
            }
            None => warn!("Connection pool monitoring is not active"),
        }
    }
}

impl Drop for ConnectionPoolMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
            self.recorder.inner.monitoring.store(false, Ordering::SeqCst);
            error!("Connection pool monitor dropped while monitoring; polling stopped");
        }
    }
}
