use std::env;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto_files = ["./proto/legacy_agent.proto"];

    // Vendored protoc so the build does not need one on PATH.
    let protoc = protoc_bin_vendored::protoc_bin_path()
        .map_err(|e| format!("vendored protoc unavailable: {e:?}"))?;
    env::set_var("PROTOC", protoc);

    let out_dir = PathBuf::from(env::var("OUT_DIR")?);

    tonic_build::configure()
        .out_dir(out_dir)
        .build_client(false)
        .build_server(true)
        .compile_protos(&proto_files, &["./proto"])?;

    rerun(&proto_files);
    Ok(())
}

fn rerun(proto_files: &[&str]) {
    for proto_file in proto_files {
        println!("cargo:rerun-if-changed={proto_file}");
    }
}
