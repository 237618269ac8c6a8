//! Server lifecycle: start over TCP or in-memory pipes, stop, seed state.

use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::{TcpListenerStream, UnboundedReceiverStream};
use tonic::service::interceptor::InterceptedService;
use tonic::transport::server::Router;
use tonic::transport::{Channel, Endpoint, Server, Uri};
use tower::layer::util::{Identity, Stack};
use tower::util::{Either, option_layer};
use tracing::{info, warn};

use crate::auth::{self, GateOptions};
use crate::error::{SafetyError, SafetyResult};
use crate::metrics::{self, GrpcMetricsLayer};
use crate::proto;
use crate::proto::services::micro_vm_server::MicroVmServer;
use crate::proto::types::MicroVmSpec;
use crate::service::{MicroVmServiceImpl, SharedStore};
use crate::store::MicroVmStore;

/// Buffer size of each in-memory pipe
const IN_MEMORY_BUF_SIZE: usize = 1024 * 1024;

/// How long `stop` waits for in-flight calls before aborting the server task
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type GatedRouter = Router<Stack<Either<GrpcMetricsLayer, Identity>, Identity>>;

struct RunningServer {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<Result<(), tonic::transport::Error>>,
}

/// A mock microVM server owning its record store.
pub struct SafetyServer {
    store: SharedStore,
    running: Option<RunningServer>,
}

impl std::fmt::Debug for SafetyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafetyServer")
            .field("records", &self.store.lock().len())
            .field("running", &self.running.is_some())
            .finish()
    }
}

impl Default for SafetyServer {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyServer {
    pub fn new() -> Self {
        Self::with_store(MicroVmStore::new())
    }

    pub fn with_store(store: MicroVmStore) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
            running: None,
        }
    }

    /// Handle to the store served by this server.
    pub fn store(&self) -> SharedStore {
        Arc::clone(&self.store)
    }

    /// Overwrite the stored microvms. Meant for test setup.
    pub fn load(&self, specs: impl IntoIterator<Item = MicroVmSpec>) {
        let mut store = self.store.lock();
        store.load(specs);
        metrics::set_stored_microvms(store.len());
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Serve on an ephemeral localhost port and return its address.
    ///
    /// Use this when the client under test takes the server address as a
    /// flag; use [`Self::start_in_memory`] when the client is built in code.
    pub async fn start(&mut self, token: &str) -> SafetyResult<String> {
        self.ensure_stopped()?;

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let router = build_router(self.store(), token)?;

        let (shutdown, signal) = oneshot::channel();
        let handle = tokio::spawn(router.serve_with_incoming_shutdown(
            TcpListenerStream::new(listener),
            shutdown_signal(signal),
        ));
        self.running = Some(RunningServer { shutdown, handle });

        info!(%addr, "Mock microvm server started");
        Ok(addr.to_string())
    }

    /// Serve over in-memory pipes; no socket is opened.
    pub fn start_in_memory(&mut self, token: &str) -> SafetyResult<InMemoryConnector> {
        self.ensure_stopped()?;

        let router = build_router(self.store(), token)?;
        let (tx, rx) = mpsc::unbounded_channel::<DuplexStream>();
        let incoming = UnboundedReceiverStream::new(rx).map(Ok::<_, std::io::Error>);

        let (shutdown, signal) = oneshot::channel();
        let handle = tokio::spawn(
            router.serve_with_incoming_shutdown(incoming, shutdown_signal(signal)),
        );
        self.running = Some(RunningServer { shutdown, handle });

        info!("Mock microvm server started in memory");
        Ok(InMemoryConnector { tx })
    }

    /// Serve on `listener` until `signal` resolves. Used by the binary.
    pub async fn serve(
        &self,
        listener: TcpListener,
        token: &str,
        signal: impl Future<Output = ()>,
    ) -> SafetyResult<()> {
        build_router(self.store(), token)?
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal)
            .await?;
        Ok(())
    }

    /// Shut down a started server. Stopping a server that is not running is a no-op.
    pub async fn stop(&mut self) -> SafetyResult<()> {
        let Some(RunningServer {
            shutdown,
            mut handle,
        }) = self.running.take()
        else {
            return Ok(());
        };

        // The task may already have exited; a closed receiver is fine.
        let _ = shutdown.send(());

        match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
            Ok(joined) => {
                joined.map_err(|e| SafetyError::InternalError(format!("Server task failed: {e}")))??;
            }
            Err(_) => {
                warn!("Mock microvm server did not drain in time, aborting");
                handle.abort();
            }
        }

        info!("Mock microvm server stopped");
        Ok(())
    }

    fn ensure_stopped(&self) -> SafetyResult<()> {
        if self.running.is_some() {
            return Err(SafetyError::Transport("server already started".to_string()));
        }
        Ok(())
    }
}

impl Drop for SafetyServer {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown.send(());
        }
    }
}

/// Dials in-memory connections to a server started with
/// [`SafetyServer::start_in_memory`].
#[derive(Debug, Clone)]
pub struct InMemoryConnector {
    tx: mpsc::UnboundedSender<DuplexStream>,
}

impl InMemoryConnector {
    /// Open a raw connection to the server.
    pub fn dial(&self) -> SafetyResult<DuplexStream> {
        let (client, server) = tokio::io::duplex(IN_MEMORY_BUF_SIZE);
        self.tx
            .send(server)
            .map_err(|e| SafetyError::Transport(format!("In-memory listener closed: {e}")))?;
        Ok(client)
    }

    /// A gRPC channel whose connections are in-memory pipes.
    pub async fn connect(&self) -> SafetyResult<Channel> {
        let connector = self.clone();
        let channel = Endpoint::from_static("http://in-memory.safety")
            .connect_with_connector(tower::service_fn(move |_: Uri| {
                let dialed = connector
                    .dial()
                    .map(TokioIo::new)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::BrokenPipe, e.to_string()));
                async move { dialed }
            }))
            .await?;
        Ok(channel)
    }
}

async fn shutdown_signal(signal: oneshot::Receiver<()>) {
    // A dropped sender also means shut down.
    let _ = signal.await;
}

fn build_router(store: SharedStore, token: &str) -> SafetyResult<GatedRouter> {
    let GateOptions {
        interceptors,
        metrics,
    } = auth::with_opts(token);

    let reflection = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(proto::FILE_DESCRIPTOR_SET)
        .build_v1()
        .map_err(|e| SafetyError::InternalError(format!("Failed to build reflection service: {e}")))?;

    // Reflection sits behind the same gate as the microvm service.
    let reflection = InterceptedService::new(reflection, interceptors.clone());
    let microvms = MicroVmServer::with_interceptor(MicroVmServiceImpl::new(store), interceptors);

    Ok(Server::builder()
        .layer(option_layer(metrics))
        .add_service(microvms)
        .add_service(reflection))
}
