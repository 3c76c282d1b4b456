//! Metrics collection with Prometheus
//!
//! This module provides Prometheus metrics for Switchyard:
//! - Selection counts (by channel type and source) and selection failures
//! - Attempt reports, channel bans and credential cooldowns
//! - Group budget exhaustion
//! - Streaming relay outcomes, event counts and durations

use prometheus::{
    Counter, CounterVec, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Metrics collector for Switchyard
#[derive(Clone)]
pub struct Metrics {
    /// Prometheus registry
    registry: Arc<Registry>,

    // Selection metrics
    /// Concrete selections handed out
    pub selections_total: CounterVec,
    /// Selection attempts that produced no upstream
    pub selection_failures_total: CounterVec,

    // Feedback metrics
    /// Attempt outcomes reported back to the scheduler
    pub reports_total: CounterVec,
    /// Channel bans imposed
    pub channel_bans_total: CounterVec,
    /// Credential cooldowns imposed
    pub credential_cooldowns_total: CounterVec,
    /// Requests whose group attempt budget ran out
    pub group_exhausted_total: Counter,

    // Streaming metrics
    /// Terminal conditions of relayed streams
    pub stream_outcomes_total: CounterVec,
    /// SSE events forwarded to callers
    pub stream_events_total: Counter,
    /// Wall time of relayed streams
    pub stream_duration_seconds: Histogram,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let selections_total = CounterVec::new(
            Opts::new(
                "switchyard_selections_total",
                "Total number of upstream selections",
            ),
            &["channel_type", "source"],
        )?;

        let selection_failures_total = CounterVec::new(
            Opts::new(
                "switchyard_selection_failures_total",
                "Total number of selection attempts without a usable upstream",
            ),
            &["reason"],
        )?;

        let reports_total = CounterVec::new(
            Opts::new(
                "switchyard_reports_total",
                "Total number of attempt outcomes reported",
            ),
            &["outcome", "error_class"],
        )?;

        let channel_bans_total = CounterVec::new(
            Opts::new("switchyard_channel_bans_total", "Total number of channel bans"),
            &["mode"],
        )?;

        let credential_cooldowns_total = CounterVec::new(
            Opts::new(
                "switchyard_credential_cooldowns_total",
                "Total number of credential cooldowns",
            ),
            &["status"],
        )?;

        let group_exhausted_total = Counter::with_opts(Opts::new(
            "switchyard_group_exhausted_total",
            "Total number of requests that exhausted their group budget",
        ))?;

        let stream_outcomes_total = CounterVec::new(
            Opts::new(
                "switchyard_stream_outcomes_total",
                "Terminal conditions of relayed SSE streams",
            ),
            &["error_class"],
        )?;

        let stream_events_total = Counter::with_opts(Opts::new(
            "switchyard_stream_events_total",
            "Total number of SSE events forwarded",
        ))?;

        let stream_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "switchyard_stream_duration_seconds",
                "Relayed stream duration in seconds",
            )
            .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
        )?;

        registry.register(Box::new(selections_total.clone()))?;
        registry.register(Box::new(selection_failures_total.clone()))?;
        registry.register(Box::new(reports_total.clone()))?;
        registry.register(Box::new(channel_bans_total.clone()))?;
        registry.register(Box::new(credential_cooldowns_total.clone()))?;
        registry.register(Box::new(group_exhausted_total.clone()))?;
        registry.register(Box::new(stream_outcomes_total.clone()))?;
        registry.register(Box::new(stream_events_total.clone()))?;
        registry.register(Box::new(stream_duration_seconds.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            selections_total,
            selection_failures_total,
            reports_total,
            channel_bans_total,
            credential_cooldowns_total,
            group_exhausted_total,
            stream_outcomes_total,
            stream_events_total,
            stream_duration_seconds,
        })
    }

    /// Get the Prometheus registry for exporting metrics
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every registered metric in the text exposition format
    pub fn gather_text(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    /// Record a concrete selection
    pub fn record_selection(&self, channel_type: &str, source: SelectionSource) {
        self.selections_total
            .with_label_values(&[channel_type, source.as_str()])
            .inc();
    }

    /// Record a selection attempt that found nothing usable
    pub fn record_selection_failure(&self, reason: &str) {
        self.selection_failures_total
            .with_label_values(&[reason])
            .inc();
    }

    /// Record an attempt outcome
    pub fn record_report(&self, success: bool, error_class: Option<&str>) {
        let outcome = if success { "success" } else { "failure" };
        self.reports_total
            .with_label_values(&[outcome, error_class.unwrap_or("none")])
            .inc();
    }

    /// Record a channel ban
    pub fn record_channel_ban(&self, mode: BanMode) {
        self.channel_bans_total
            .with_label_values(&[mode.as_str()])
            .inc();
    }

    /// Record a credential cooldown, labelled by HTTP status (or "none")
    pub fn record_credential_cooldown(&self, status_code: Option<u16>) {
        let status = status_code.map_or_else(|| "none".to_string(), |s| s.to_string());
        self.credential_cooldowns_total
            .with_label_values(&[status.as_str()])
            .inc();
    }

    pub fn record_group_exhausted(&self) {
        self.group_exhausted_total.inc();
    }

    /// Record the end of a relayed stream
    pub fn record_stream_outcome(
        &self,
        error_class: Option<&str>,
        events: u64,
        duration_secs: f64,
    ) {
        self.stream_outcomes_total
            .with_label_values(&[error_class.unwrap_or("eof")])
            .inc();
        self.stream_events_total.inc_by(events as f64);
        self.stream_duration_seconds.observe(duration_secs);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics")
    }
}

/// Where a selection came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionSource {
    /// Reused a session binding
    Binding,
    /// Fresh walk over the catalog
    Fresh,
    /// Group router attempt
    Group,
}

impl SelectionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Binding => "binding",
            Self::Fresh => "fresh",
            Self::Group => "group",
        }
    }
}

/// How a channel ban was imposed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanMode {
    /// Failure streak reached the threshold
    Streak,
    /// Channel-wide error class banned on first failure
    Immediate,
}

impl BanMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Streak => "streak",
            Self::Immediate => "immediate",
        }
    }
}
