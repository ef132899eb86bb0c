use std::time::Duration;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

const LATENCY_BUCKETS: [f64; 6] = [0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

fn latency_histogram() -> Histogram {
	Histogram::new(LATENCY_BUCKETS.into_iter())
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HandlerLabels {
	pub handler: String,
	pub code: u64,
}

/// Request-latency histograms keyed by `{handler, code}`. Owned by the proxy
/// instance rather than living in process-wide statics, so tests stay
/// isolated.
pub struct Metrics {
	registry: Registry,
	request_duration: Family<HandlerLabels, Histogram>,
}

impl std::fmt::Debug for Metrics {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str("Metrics")
	}
}

impl Default for Metrics {
	fn default() -> Self {
		Self::new()
	}
}

impl Metrics {
	pub fn new() -> Self {
		let request_duration =
			Family::<HandlerLabels, Histogram>::new_with_constructor(latency_histogram as fn() -> Histogram);
		let mut registry = Registry::default();
		registry.register(
			"http_request_duration_seconds",
			"A histogram of latencies for requests",
			request_duration.clone(),
		);
		Self {
			registry,
			request_duration,
		}
	}

	pub fn observe(&self, handler: &str, code: http::StatusCode, elapsed: Duration) {
		self
			.request_duration
			.get_or_create(&HandlerLabels {
				handler: handler.to_string(),
				code: code.as_u16() as u64,
			})
			.observe(elapsed.as_secs_f64());
	}

	/// Prometheus text exposition of everything registered.
	pub fn encode(&self) -> String {
		let mut out = String::new();
		// Encoding only fails on a formatter error, which String never yields.
		let _ = prometheus_client::encoding::text::encode(&mut out, &self.registry);
		out
	}
}
