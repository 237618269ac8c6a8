//! Integration tests for the MicroVM service handlers.
//!
//! Handlers are called directly through the generated trait, without a
//! transport, to cover the store semantics seen by clients.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tonic::{Code, Request};

use safety::proto::services::micro_vm_server::MicroVm;
use safety::proto::services::*;
use safety::proto::types::micro_vm_status::MicroVmState;
use safety::proto::types::{Kernel, MicroVmSpec, MicroVmStatus};
use safety::service::MicroVmServiceImpl;
use safety::store::MicroVmStore;

/// Helper to create a service over a fresh store
fn create_test_service() -> (MicroVmServiceImpl, Arc<Mutex<MicroVmStore>>) {
    let store = Arc::new(Mutex::new(MicroVmStore::new()));
    (MicroVmServiceImpl::new(Arc::clone(&store)), store)
}

fn spec(id: &str, namespace: &str) -> MicroVmSpec {
    MicroVmSpec {
        id: id.to_string(),
        namespace: namespace.to_string(),
        ..Default::default()
    }
}

async fn create(service: &MicroVmServiceImpl, spec: MicroVmSpec) -> String {
    let resp = service
        .create_micro_vm(Request::new(CreateMicroVmRequest {
            microvm: Some(spec),
            ..Default::default()
        }))
        .await
        .unwrap();
    resp.into_inner().microvm.unwrap().spec.unwrap().uid.unwrap()
}

async fn list(service: &MicroVmServiceImpl, name: Option<&str>, namespace: &str) -> Vec<String> {
    let resp = service
        .list_micro_v_ms(Request::new(ListMicroVMsRequest {
            namespace: namespace.to_string(),
            name: name.map(str::to_string),
        }))
        .await
        .unwrap();
    resp.into_inner()
        .microvm
        .into_iter()
        .map(|vm| {
            let spec = vm.spec.unwrap();
            format!("{}/{}", spec.namespace, spec.id)
        })
        .collect()
}

mod create_and_get {
    use super::*;

    #[tokio::test]
    async fn test_create_then_get_roundtrip() {
        let (service, _) = create_test_service();

        let mut original = spec("vm1", "ns1");
        original.vcpu = 2;
        original.memory_in_mb = 512;
        original.labels.insert("env".to_string(), "test".to_string());
        original.kernel = Some(Kernel {
            image: "ghcr.io/example/kernel:5.10".to_string(),
            filename: Some("vmlinux".to_string()),
            ..Default::default()
        });

        let resp = service
            .create_micro_vm(Request::new(CreateMicroVmRequest {
                microvm: Some(original.clone()),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();

        let created = resp.microvm.unwrap();
        assert_eq!(created.version, 0);
        assert_eq!(created.status, Some(MicroVmStatus::default()));
        let uid = created.spec.unwrap().uid.unwrap();
        assert!(!uid.is_empty());

        let got = service
            .get_micro_vm(Request::new(GetMicroVmRequest { uid: uid.clone() }))
            .await
            .unwrap()
            .into_inner()
            .microvm
            .unwrap();

        assert_eq!(got.status.unwrap().state(), MicroVmState::Created);
        let expected = MicroVmSpec {
            uid: Some(uid),
            ..original
        };
        assert_eq!(got.spec.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_every_create_gets_a_new_uid() {
        let (service, _) = create_test_service();

        let mut uids = HashSet::new();
        for _ in 0..20 {
            // same caller-supplied id each time
            assert!(uids.insert(create(&service, spec("vm", "ns")).await));
        }
    }

    #[tokio::test]
    async fn test_get_unknown_uid_is_not_found() {
        let (service, _) = create_test_service();
        create(&service, spec("vm1", "ns1")).await;

        let status = service
            .get_micro_vm(Request::new(GetMicroVmRequest {
                uid: "does-not-exist".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);
    }
}

mod delete {
    use super::*;

    #[tokio::test]
    async fn test_delete_removes_from_get_and_list() {
        let (service, _) = create_test_service();
        let keep = create(&service, spec("keep", "ns")).await;
        let gone = create(&service, spec("gone", "ns")).await;

        service
            .delete_micro_vm(Request::new(DeleteMicroVmRequest { uid: gone.clone() }))
            .await
            .unwrap();

        let status = service
            .get_micro_vm(Request::new(GetMicroVmRequest { uid: gone }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);

        assert!(
            service
                .get_micro_vm(Request::new(GetMicroVmRequest { uid: keep }))
                .await
                .is_ok()
        );
        assert_eq!(list(&service, None, "").await, vec!["ns/keep"]);
    }

    #[tokio::test]
    async fn test_delete_unknown_uid_is_silent() {
        let (service, store) = create_test_service();
        create(&service, spec("vm1", "ns1")).await;
        create(&service, spec("vm2", "ns1")).await;
        let before = store.lock().specs().to_vec();

        service
            .delete_micro_vm(Request::new(DeleteMicroVmRequest {
                uid: "does-not-exist".to_string(),
            }))
            .await
            .expect("delete of an unknown uid should not fail");

        assert_eq!(store.lock().specs(), before.as_slice());
    }

    #[tokio::test]
    async fn test_delete_on_empty_store() {
        let (service, store) = create_test_service();

        service
            .delete_micro_vm(Request::new(DeleteMicroVmRequest {
                uid: "anything".to_string(),
            }))
            .await
            .unwrap();
        assert!(store.lock().is_empty());
    }
}

mod listing {
    use super::*;

    async fn seeded() -> MicroVmServiceImpl {
        let (service, _) = create_test_service();
        create(&service, spec("vm1", "ns1")).await;
        create(&service, spec("vm2", "ns1")).await;
        create(&service, spec("vm1", "ns2")).await;
        service
    }

    #[tokio::test]
    async fn test_empty_namespace_returns_everything() {
        let service = seeded().await;

        let all = vec!["ns1/vm1", "ns1/vm2", "ns2/vm1"];
        assert_eq!(list(&service, None, "").await, all);
        assert_eq!(list(&service, Some("vm2"), "").await, all);
    }

    #[tokio::test]
    async fn test_namespace_only() {
        let service = seeded().await;

        assert_eq!(list(&service, None, "ns1").await, vec!["ns1/vm1", "ns1/vm2"]);
        assert_eq!(list(&service, Some(""), "ns2").await, vec!["ns2/vm1"]);
        assert!(list(&service, None, "ns3").await.is_empty());
    }

    #[tokio::test]
    async fn test_namespace_and_name() {
        let service = seeded().await;

        assert_eq!(list(&service, Some("vm1"), "ns1").await, vec!["ns1/vm1"]);
        assert!(list(&service, Some("vm2"), "ns2").await.is_empty());
    }

    #[tokio::test]
    async fn test_listed_records_are_created() {
        let service = seeded().await;

        let resp = service
            .list_micro_v_ms(Request::new(ListMicroVMsRequest::default()))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.microvm.len(), 3);
        for vm in resp.microvm {
            assert_eq!(vm.version, 0);
            assert_eq!(vm.status.unwrap().state(), MicroVmState::Created);
        }
    }
}

mod loading {
    use super::*;

    #[tokio::test]
    async fn test_load_seeds_and_clears() {
        let (service, store) = create_test_service();
        let uid = create(&service, spec("vm1", "ns1")).await;

        let got = service
            .get_micro_vm(Request::new(GetMicroVmRequest { uid }))
            .await
            .unwrap()
            .into_inner()
            .microvm
            .unwrap();
        let got_spec = got.spec.unwrap();
        assert_eq!(got_spec.id, "vm1");
        assert_eq!(got_spec.namespace, "ns1");
        assert_eq!(got.status.unwrap().state(), MicroVmState::Created);

        store.lock().load(Vec::new());
        assert!(list(&service, None, "").await.is_empty());

        store.lock().load(vec![MicroVmSpec {
            uid: Some("seeded".to_string()),
            ..spec("seed", "fixtures")
        }]);
        assert_eq!(list(&service, None, "fixtures").await, vec!["fixtures/seed"]);
        assert!(
            service
                .get_micro_vm(Request::new(GetMicroVmRequest {
                    uid: "seeded".to_string()
                }))
                .await
                .is_ok()
        );
    }
}
