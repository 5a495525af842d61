use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Installs the Prometheus recorder and serves `/metrics` on `addr`.
///
/// # Errors
///
/// Returns an error if the recorder is already installed or the listener
/// cannot be bound.
pub fn install_exporter(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics exporter listening on {}", addr);
    Ok(())
}

/// Slot and connection gauges.
pub mod gauges {
    /// Increment the busy-slots gauge.
    pub fn inc_slots_busy() {
        metrics::gauge!("tether_slots_busy").increment(1.0);
    }

    /// Decrement the busy-slots gauge.
    pub fn dec_slots_busy() {
        metrics::gauge!("tether_slots_busy").decrement(1.0);
    }

    /// Increment the active connections gauge.
    pub fn inc_connections_active() {
        metrics::gauge!("tether_connections_active").increment(1.0);
    }

    /// Decrement the active connections gauge.
    pub fn dec_connections_active() {
        metrics::gauge!("tether_connections_active").decrement(1.0);
    }
}

/// Event counters.
pub mod counters {
    /// Record a concluded task with its outcome label.
    pub fn tasks_total(outcome: &'static str) {
        metrics::counter!("tether_tasks_total", "outcome" => outcome).increment(1);
    }

    /// Record a task refused before it ran, with the reason label.
    pub fn tasks_refused_total(reason: &'static str) {
        metrics::counter!("tether_tasks_refused_total", "reason" => reason).increment(1);
    }

    /// Record an inbound envelope rejected by the security policy.
    pub fn security_rejections_total(tag: &'static str) {
        metrics::counter!("tether_security_rejections_total", "tag" => tag).increment(1);
    }

    /// Increment the hard-killed slots counter.
    pub fn slots_killed_total() {
        metrics::counter!("tether_slots_killed_total").increment(1);
    }

    /// Increment the yanked slots counter.
    pub fn slots_yanked_total() {
        metrics::counter!("tether_slots_yanked_total").increment(1);
    }
}

/// Latency histograms.
pub mod histograms {
    /// Record a task run time in seconds.
    pub fn task_duration_seconds(value: f64) {
        metrics::histogram!("tether_task_duration_seconds").record(value);
    }
}
