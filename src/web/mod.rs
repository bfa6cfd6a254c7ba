//! Web server module: landing page, cached metrics and on-demand probes.

mod handlers;
mod metrics;

use crate::cache::ResultCache;
use crate::config::ExporterConfig;
use crate::probe::MeasurementRunner;

use axum::{routing::get, Router};
use std::future::Future;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ExporterConfig>,
    pub cache: Arc<ResultCache>,
    pub runner: Arc<dyn MeasurementRunner>,
}

/// HTTP server for the exporter.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(
        config: Arc<ExporterConfig>,
        cache: Arc<ResultCache>,
        runner: Arc<dyn MeasurementRunner>,
    ) -> Self {
        Self {
            state: AppState {
                config,
                cache,
                runner,
            },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let config = &self.state.config;

        Router::new()
            .route("/", get(handlers::handle_landing))
            .route(&config.metrics_path, get(handlers::handle_metrics))
            .route(&config.probe_path, get(handlers::handle_probe))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.state.config.listen_address;
        let router = self.routes();

        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Web server listening on {}", addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Cli, FileConfig};
    use crate::probe::{MeasurementResult, ProbeError, TargetSpec, ThroughputStats};
    use crate::web::metrics::tests::sample;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use clap::Parser;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;

    #[derive(Default)]
    struct CountingRunner {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MeasurementRunner for CountingRunner {
        async fn run(&self, target: &TargetSpec) -> Result<ThroughputStats, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if target.host == "unreachable.example.com" {
                return Err(ProbeError::Tool(
                    "unable to connect to server: Connection refused".to_string(),
                ));
            }
            Ok(ThroughputStats {
                sent_bytes: 4096.0,
                received_bytes: 4000.0,
                ..Default::default()
            })
        }
    }

    fn server(runner: Arc<CountingRunner>, cache: Arc<ResultCache>) -> Server {
        let cli = Cli::try_parse_from(["iperf3_exporter"]).unwrap();
        let config = ExporterConfig::merge(cli, FileConfig::default()).unwrap();
        Server::new(Arc::new(config), cache, runner)
    }

    async fn get(server: &Server, uri: &str) -> (StatusCode, String) {
        let response = server
            .routes()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_probe_without_target_is_rejected() {
        let runner = Arc::new(CountingRunner::default());
        let server = server(runner.clone(), Arc::new(ResultCache::new()));

        let (status, body) = get(&server, "/probe?port=5202").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("'target' parameter must be specified"));
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_probe_runs_once_and_bypasses_cache() {
        let runner = Arc::new(CountingRunner::default());
        let cache = Arc::new(ResultCache::new());
        let server = server(runner.clone(), cache.clone());

        let (status, body) = get(&server, "/probe?target=example.com&port=5202&protocol=udp").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(sample(&body, "iperf3_up", "example.com"), Some(1.0));
        assert_eq!(sample(&body, "iperf3_sent_bytes", "example.com"), Some(4096.0));
        assert!(body.contains(r#"port="5202""#));
        assert!(body.contains(r#"protocol="udp""#));
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
        assert!(cache.gather().await.is_empty());
    }

    #[tokio::test]
    async fn test_probe_failure_is_a_result() {
        let runner = Arc::new(CountingRunner::default());
        let server = server(runner, Arc::new(ResultCache::new()));

        let (status, body) = get(&server, "/probe?target=unreachable.example.com").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(sample(&body, "iperf3_up", "unreachable.example.com"), Some(0.0));
    }

    #[tokio::test]
    async fn test_probe_invalid_parameter() {
        let runner = Arc::new(CountingRunner::default());
        let server = server(runner.clone(), Arc::new(ResultCache::new()));

        let (status, _) = get(&server, "/probe?target=example.com&bitrate=lots").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = get(&server, "/probe?target=example.com&period=1e300").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("invalid 'period' parameter"));
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_metrics_serves_cache() {
        let runner = Arc::new(CountingRunner::default());
        let cache = Arc::new(ResultCache::new());
        let server = server(runner.clone(), cache.clone());

        let up = TargetSpec::new("up.example.com").key();
        let down = TargetSpec::new("down.example.com").key();
        cache
            .update(
                up.clone(),
                MeasurementResult::success(up, ThroughputStats::default(), Duration::from_secs(5)),
            )
            .await;
        cache
            .update(
                down.clone(),
                MeasurementResult::failure(down, "probe timed out after 30s", Duration::from_secs(30)),
            )
            .await;

        let (status, body) = get(&server, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(sample(&body, "iperf3_up", "up.example.com"), Some(1.0));
        assert_eq!(sample(&body, "iperf3_up", "down.example.com"), Some(0.0));
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_landing_page() {
        let server = server(Arc::new(CountingRunner::default()), Arc::new(ResultCache::new()));

        let (status, body) = get(&server, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains(r#"<a href="/metrics">"#));
        assert!(body.contains("/probe?target=example.com"));
        assert!(!body.contains("{{"));
    }
}
