use prometheus::{IntCounter, IntGauge, Opts, Registry};

/// Engine-level prometheus metrics.
pub struct EngineMetrics {
    /// Requests currently awaiting a reply.
    pub inflight_requests: IntGauge,
    /// Replies matched to a pending call.
    pub replies_delivered_total: IntCounter,
    /// Calls completed by their timeout timer.
    pub timeouts_total: IntCounter,
    /// Requests retransmitted after the resend threshold.
    pub resends_total: IntCounter,
    /// Calls re-issued because of a forward-to-others redirect.
    pub redirects_total: IntCounter,
    /// Retries performed by the URI resolution layer.
    pub uri_retries_total: IntCounter,
    /// Inbound requests handed to a handler.
    pub requests_dispatched_total: IntCounter,
    /// Requests forwarded to another node.
    pub forwards_total: IntCounter,
    /// Messages dropped by fault injection.
    pub dropped_messages_total: IntCounter,
}

impl EngineMetrics {
    /// Create metrics and register them with the given prometheus registry.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self::build()?;
        registry.register(Box::new(metrics.inflight_requests.clone()))?;
        registry.register(Box::new(metrics.replies_delivered_total.clone()))?;
        registry.register(Box::new(metrics.timeouts_total.clone()))?;
        registry.register(Box::new(metrics.resends_total.clone()))?;
        registry.register(Box::new(metrics.redirects_total.clone()))?;
        registry.register(Box::new(metrics.uri_retries_total.clone()))?;
        registry.register(Box::new(metrics.requests_dispatched_total.clone()))?;
        registry.register(Box::new(metrics.forwards_total.clone()))?;
        registry.register(Box::new(metrics.dropped_messages_total.clone()))?;
        Ok(metrics)
    }

    /// Create metrics without registering them anywhere; used by tests and
    /// embedders that scrape nothing.
    pub fn unregistered() -> Self {
        Self::build().expect("metric construction cannot fail")
    }

    fn build() -> Result<Self, prometheus::Error> {
        Ok(Self {
            inflight_requests: IntGauge::with_opts(Opts::new(
                "rpc_inflight_requests",
                "Requests currently awaiting a reply",
            ))?,
            replies_delivered_total: IntCounter::with_opts(Opts::new(
                "rpc_replies_delivered_total",
                "Replies matched to a pending call",
            ))?,
            timeouts_total: IntCounter::with_opts(Opts::new(
                "rpc_timeouts_total",
                "Calls completed by their timeout timer",
            ))?,
            resends_total: IntCounter::with_opts(Opts::new(
                "rpc_resends_total",
                "Requests retransmitted after the resend threshold",
            ))?,
            redirects_total: IntCounter::with_opts(Opts::new(
                "rpc_redirects_total",
                "Calls re-issued because of a forward-to-others redirect",
            ))?,
            uri_retries_total: IntCounter::with_opts(Opts::new(
                "rpc_uri_retries_total",
                "Retries performed by the URI resolution layer",
            ))?,
            requests_dispatched_total: IntCounter::with_opts(Opts::new(
                "rpc_requests_dispatched_total",
                "Inbound requests handed to a handler",
            ))?,
            forwards_total: IntCounter::with_opts(Opts::new(
                "rpc_forwards_total",
                "Requests forwarded to another node",
            ))?,
            dropped_messages_total: IntCounter::with_opts(Opts::new(
                "rpc_dropped_messages_total",
                "Messages dropped by fault injection",
            ))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_against_a_registry() {
        let registry = Registry::new();
        let metrics = EngineMetrics::new(&registry).unwrap();
        metrics.inflight_requests.inc();
        metrics.timeouts_total.inc();
        assert_eq!(registry.gather().len(), 9);
    }
}
