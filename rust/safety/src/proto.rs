//! Generated protobuf and gRPC bindings.
//!
//! The module tree mirrors the proto packages so that cross-package
//! references in the generated code resolve.

#[allow(clippy::enum_variant_names)]
pub mod microvm {
    #[allow(clippy::enum_variant_names)]
    pub mod types {
        tonic::include_proto!("microvm.types");
    }

    pub mod services {
        pub mod api {
            pub mod v1alpha1 {
                tonic::include_proto!("microvm.services.api.v1alpha1");
            }
        }
    }
}

pub use microvm::services::api::v1alpha1 as services;
pub use microvm::types;

// Export file descriptor for reflection
pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("safety_descriptor");
