use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Ensure a usable `protoc` is available (vendored fallback)
    if std::env::var_os("PROTOC").is_none() {
        if let Ok(pb) = protoc_bin_vendored::protoc_bin_path() {
            // SAFETY: build scripts are single-threaded at this point
            unsafe { std::env::set_var("PROTOC", pb) };
        }
    }

    let proto_root = PathBuf::from("../../protos");
    let protos = [
        proto_root.join("types/microvm.proto"),
        proto_root.join("services/microvm/v1alpha1/microvms.proto"),
    ];

    let mut includes = vec![proto_root.clone()];
    if let Ok(well_known) = protoc_bin_vendored::include_path() {
        includes.push(well_known);
    }

    let out_dir = PathBuf::from(std::env::var("OUT_DIR")?);

    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .file_descriptor_set_path(out_dir.join("safety_descriptor.bin"))
        .compile_protos(&protos, &includes)?;

    for proto in &protos {
        println!("cargo:rerun-if-changed={}", proto.display());
    }

    Ok(())
}
