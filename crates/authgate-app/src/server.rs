use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;
use tracing::{debug, info};

use authgate::proxy::{OAuthProxy, RemoteAddr};

/// Bind the HTTP listener and serve requests until ctrl-c. TLS termination is
/// left to whatever fronts the proxy.
pub async fn serve(
	proxy: Arc<OAuthProxy>,
	address: String,
	request_logging: bool,
) -> anyhow::Result<()> {
	let address = address
		.strip_prefix("http://")
		.unwrap_or(&address)
		.to_string();
	let listener = TcpListener::bind(&address)
		.await
		.map_err(|e| anyhow::anyhow!("failed to bind {address}: {e}"))?;
	info!(%address, "listening");

	loop {
		let (stream, peer) = tokio::select! {
			accepted = listener.accept() => accepted?,
			_ = tokio::signal::ctrl_c() => {
				info!("received interrupt, shutting down");
				return Ok(());
			},
		};
		let proxy = proxy.clone();
		tokio::spawn(async move {
			let io = TokioIo::new(stream);
			let service = service_fn(move |req: hyper::Request<Incoming>| {
				let proxy = proxy.clone();
				async move {
					let start = Instant::now();
					let method = req.method().clone();
					let uri = req.uri().clone();
					let mut req = req.map(authgate::incoming);
					req.extensions_mut().insert(RemoteAddr(peer));
					let response = proxy.serve(req).await;
					if request_logging {
						info!(
							remote = %peer,
							method = %method,
							uri = %uri,
							status = response.status().as_u16(),
							elapsed = ?start.elapsed(),
							"request"
						);
					}
					Ok::<_, Infallible>(response)
				}
			});
			if let Err(err) = auto::Builder::new(TokioExecutor::new())
				.serve_connection_with_upgrades(io, service)
				.await
			{
				debug!(error = %err, "connection closed with error");
			}
		});
	}
}
