use anyhow::{Context, Result};
use futures::future::BoxFuture;
use prometheus::{
    CounterVec, Encoder, Gauge, HistogramVec, TextEncoder, register_counter_vec, register_gauge,
    register_histogram_vec,
};
use std::sync::OnceLock;
use std::task::{Context as TaskContext, Poll};
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tower::{Layer, Service};

// gRPC metrics
pub static GRPC_STARTED: OnceLock<CounterVec> = OnceLock::new();
pub static GRPC_HANDLED: OnceLock<CounterVec> = OnceLock::new();
pub static GRPC_HANDLING_SECONDS: OnceLock<HistogramVec> = OnceLock::new();

// Store metrics
pub static MICROVMS_STORED: OnceLock<Gauge> = OnceLock::new();

// Thread-safe initialization result
static INIT_RESULT: OnceLock<Result<()>> = OnceLock::new();

/// Times a single gRPC call from request arrival to response headers.
#[derive(Debug)]
pub struct CallTimer {
    start: Instant,
    service: String,
    method: String,
}

impl CallTimer {
    /// Start timing the call addressed to `path` (`/package.Service/Method`).
    pub fn start(path: &str) -> Self {
        let (service, method) = split_method_path(path);

        if let Some(started) = GRPC_STARTED.get() {
            started.with_label_values(&[service, method]).inc();
        }

        Self {
            start: Instant::now(),
            service: service.to_string(),
            method: method.to_string(),
        }
    }

    pub fn complete(self, code: &str) {
        let duration = self.start.elapsed().as_secs_f64();

        if let Some(handled) = GRPC_HANDLED.get() {
            handled
                .with_label_values(&[self.service.as_str(), self.method.as_str(), code])
                .inc();
        }
        if let Some(handling) = GRPC_HANDLING_SECONDS.get() {
            handling
                .with_label_values(&[self.service.as_str(), self.method.as_str()])
                .observe(duration);
        }
    }
}

/// Record the current number of stored microvms.
pub fn set_stored_microvms(count: usize) {
    if let Some(stored) = MICROVMS_STORED.get() {
        #[allow(clippy::cast_precision_loss, reason = "record counts stay far below 2^52")]
        stored.set(count as f64);
    }
}

fn split_method_path(path: &str) -> (&str, &str) {
    path.trim_start_matches('/')
        .split_once('/')
        .unwrap_or(("unknown", "unknown"))
}

pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    // If encoding fails, return empty metrics rather than panic
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_else(|_| String::new())
}

// Thread-safe metrics initialization with proper synchronization
pub fn init_metrics() -> Result<()> {
    match INIT_RESULT.get_or_init(init_metrics_internal) {
        Ok(()) => Ok(()),
        Err(e) => Err(anyhow::anyhow!("Metrics initialization failed: {}", e)),
    }
}

// Internal initialization function - only called once
fn init_metrics_internal() -> Result<()> {
    let grpc_started = register_counter_vec!(
        "safety_grpc_server_started_total",
        "Total number of RPCs started on the server",
        &["grpc_service", "grpc_method"]
    )
    .context("Failed to register GRPC_STARTED metric")?;

    let grpc_handled = register_counter_vec!(
        "safety_grpc_server_handled_total",
        "Total number of RPCs completed on the server, regardless of success or failure",
        &["grpc_service", "grpc_method", "grpc_code"]
    )
    .context("Failed to register GRPC_HANDLED metric")?;

    let grpc_handling_seconds = register_histogram_vec!(
        "safety_grpc_server_handling_seconds",
        "Response latency of RPCs handled by the server",
        &["grpc_service", "grpc_method"]
    )
    .context("Failed to register GRPC_HANDLING_SECONDS metric")?;

    let microvms_stored = register_gauge!(
        "safety_microvms_stored",
        "Number of microvm records currently held in memory"
    )
    .context("Failed to register MICROVMS_STORED metric")?;

    GRPC_STARTED
        .set(grpc_started)
        .map_err(|_| anyhow::anyhow!("Failed to set GRPC_STARTED"))?;
    GRPC_HANDLED
        .set(grpc_handled)
        .map_err(|_| anyhow::anyhow!("Failed to set GRPC_HANDLED"))?;
    GRPC_HANDLING_SECONDS
        .set(grpc_handling_seconds)
        .map_err(|_| anyhow::anyhow!("Failed to set GRPC_HANDLING_SECONDS"))?;
    MICROVMS_STORED
        .set(microvms_stored)
        .map_err(|_| anyhow::anyhow!("Failed to set MICROVMS_STORED"))?;

    Ok(())
}

/// Tower layer recording call counts, result codes and latency for every
/// gRPC call, unary or streaming.
///
/// The code label is read from the response headers only. Errors returned
/// before any message carry `grpc-status` there; every other call, including
/// all streaming calls and successful unary calls, is recorded as `0` before
/// its trailers arrive. Latency is likewise measured to the response headers.
#[derive(Debug, Clone)]
pub struct GrpcMetricsLayer;

impl GrpcMetricsLayer {
    pub fn new() -> Self {
        if let Err(e) = init_metrics() {
            tracing::warn!("Failed to initialize metrics: {}", e);
        }
        Self
    }
}

impl Default for GrpcMetricsLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Layer<S> for GrpcMetricsLayer {
    type Service = GrpcMetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GrpcMetricsService { inner }
    }
}

#[derive(Debug, Clone)]
pub struct GrpcMetricsService<S> {
    inner: S,
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for GrpcMetricsService<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<ReqBody>) -> Self::Future {
        let inner = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, inner);
        let timer = CallTimer::start(req.uri().path());

        Box::pin(async move {
            let result = inner.call(req).await;
            // Errors arrive as trailers-only responses carrying grpc-status in
            // the headers; otherwise the status is sent later in trailers.
            let code = match &result {
                Ok(response) => response
                    .headers()
                    .get("grpc-status")
                    .and_then(|v| v.to_str().ok())
                    .map_or_else(|| "0".to_string(), str::to_string),
                Err(_) => "transport".to_string(),
            };
            timer.complete(&code);
            result
        })
    }
}

// Start metrics server with proper error handling
pub async fn start_metrics_server(port: u16) -> Result<()> {
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    // Initialize metrics before starting server
    init_metrics().context("Failed to initialize metrics")?;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind metrics server")?;

    tracing::info!("Metrics server listening on http://0.0.0.0:{}", port);

    loop {
        match listener.accept().await {
            Ok((mut stream, _)) => {
                tokio::spawn(async move {
                    let body = get_metrics();
                    let resp = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    if let Err(e) = stream.write_all(resp.as_bytes()).await {
                        tracing::error!("Metrics write error: {:?}", e);
                    }
                    let _ = stream.shutdown().await;
                });
            }
            Err(e) => {
                tracing::error!("Failed to accept connection: {:?}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_method_path() {
        assert_eq!(
            split_method_path("/microvm.services.api.v1alpha1.MicroVM/GetMicroVM"),
            ("microvm.services.api.v1alpha1.MicroVM", "GetMicroVM")
        );
        assert_eq!(split_method_path("/"), ("unknown", "unknown"));
    }

    #[test]
    fn test_timer_records_handled_call() {
        init_metrics().unwrap();

        let timer = CallTimer::start("/test.Service/Timed");
        timer.complete("0");

        let output = get_metrics();
        assert!(output.contains("safety_grpc_server_handled_total"));
        assert!(output.contains("grpc_method=\"Timed\""));
    }
}
