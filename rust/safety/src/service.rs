//! gRPC handlers for the `MicroVM` service, backed by [`MicroVmStore`].

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use crate::error::SafetyError;
use crate::metrics;
use crate::proto::services::micro_vm_server::{MicroVm, MicroVmServer};
use crate::proto::services::{
    CreateMicroVmRequest, CreateMicroVmResponse, DeleteMicroVmRequest, GetMicroVmRequest,
    GetMicroVmResponse, ListMessage, ListMicroVMsRequest, ListMicroVMsResponse,
};
use crate::store::MicroVmStore;

/// Store shared between the server handle and the handlers.
///
/// The lock is held for one store operation at a time, never across an await.
pub type SharedStore = Arc<Mutex<MicroVmStore>>;

#[derive(Debug, Clone)]
pub struct MicroVmServiceImpl {
    store: SharedStore,
}

impl MicroVmServiceImpl {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Create a tonic service.
    pub fn into_service(self) -> MicroVmServer<Self> {
        MicroVmServer::new(self)
    }
}

#[tonic::async_trait]
impl MicroVm for MicroVmServiceImpl {
    async fn create_micro_vm(
        &self,
        request: Request<CreateMicroVmRequest>,
    ) -> Result<Response<CreateMicroVmResponse>, Status> {
        let spec = request
            .into_inner()
            .microvm
            .ok_or_else(|| SafetyError::InvalidRequest("microvm spec is required".to_string()))?;

        let (microvm, stored) = {
            let mut store = self.store.lock();
            let microvm = store.create(spec)?;
            (microvm, store.len())
        };
        metrics::set_stored_microvms(stored);

        Ok(Response::new(CreateMicroVmResponse {
            microvm: Some(microvm),
        }))
    }

    async fn delete_micro_vm(
        &self,
        request: Request<DeleteMicroVmRequest>,
    ) -> Result<Response<()>, Status> {
        let req = request.into_inner();

        let (removed, stored) = {
            let mut store = self.store.lock();
            (store.delete(&req.uid), store.len())
        };
        metrics::set_stored_microvms(stored);

        if removed == 0 {
            debug!(uid = %req.uid, "Delete of unknown microvm ignored");
        }

        Ok(Response::new(()))
    }

    async fn get_micro_vm(
        &self,
        request: Request<GetMicroVmRequest>,
    ) -> Result<Response<GetMicroVmResponse>, Status> {
        let req = request.into_inner();
        let microvm = self.store.lock().get(&req.uid)?;

        Ok(Response::new(GetMicroVmResponse {
            microvm: Some(microvm),
        }))
    }

    async fn list_micro_v_ms(
        &self,
        request: Request<ListMicroVMsRequest>,
    ) -> Result<Response<ListMicroVMsResponse>, Status> {
        let req = request.into_inner();
        let microvm = self
            .store
            .lock()
            .list(req.name.as_deref(), &req.namespace);

        debug!(
            namespace = %req.namespace,
            name = req.name.as_deref().unwrap_or_default(),
            count = microvm.len(),
            "Listed microvms"
        );

        Ok(Response::new(ListMicroVMsResponse { microvm }))
    }

    type ListMicroVMsStreamStream = ReceiverStream<Result<ListMessage, Status>>;

    /// Not implemented: the stream closes without yielding any item.
    async fn list_micro_v_ms_stream(
        &self,
        request: Request<ListMicroVMsRequest>,
    ) -> Result<Response<Self::ListMicroVMsStreamStream>, Status> {
        let req = request.into_inner();
        info!(
            namespace = %req.namespace,
            "Streaming list is not implemented, closing stream"
        );

        // Dropping the sender ends the stream immediately.
        let (_tx, rx) = mpsc::channel(1);
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
