use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

/// Counter registry of the core.
///
/// The scrape endpoint itself lives on the management API, this only owns
/// the instruments.
pub struct Metrics {
    pub registry: Registry,

    pub invites_received: IntCounter,
    pub calls_connected: IntCounter,
    pub calls_terminated: IntCounter,
    pub active_calls: IntGauge,
    pub errors: IntCounterVec,
    pub relay_requests: IntCounterVec,
    pub call_setup_seconds: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let invites_received =
            IntCounter::with_opts(Opts::new("invites_received_total", "Initial INVITEs received"))
                .unwrap();
        let calls_connected =
            IntCounter::with_opts(Opts::new("calls_connected_total", "Calls reaching Connected"))
                .unwrap();
        let calls_terminated =
            IntCounter::with_opts(Opts::new("calls_terminated_total", "Calls torn down")).unwrap();
        let active_calls =
            IntGauge::with_opts(Opts::new("active_calls", "Currently tracked calls")).unwrap();
        let errors = IntCounterVec::new(
            Opts::new("errors_total", "Errors by kind"),
            &["kind"],
        )
        .unwrap();
        let relay_requests = IntCounterVec::new(
            Opts::new("relay_requests_total", "Media relay commands by outcome"),
            &["command", "outcome"],
        )
        .unwrap();
        let call_setup_seconds = Histogram::with_opts(HistogramOpts::new(
            "call_setup_seconds",
            "Time from INVITE to Connected",
        ))
        .unwrap();

        for collector in [
            Box::new(invites_received.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(calls_connected.clone()),
            Box::new(calls_terminated.clone()),
            Box::new(active_calls.clone()),
            Box::new(errors.clone()),
            Box::new(relay_requests.clone()),
            Box::new(call_setup_seconds.clone()),
        ] {
            registry.register(collector).unwrap();
        }

        Self {
            registry,
            invites_received,
            calls_connected,
            calls_terminated,
            active_calls,
            errors,
            relay_requests,
            call_setup_seconds,
        }
    }

    pub fn record_error(&self, kind: &str) {
        self.errors.with_label_values(&[kind]).inc();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
