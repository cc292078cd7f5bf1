fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The consensus core builds without protoc; only the gRPC transport
    // needs the generated service code.
    println!("cargo:rerun-if-changed=proto/raft.proto");
    if std::env::var_os("CARGO_FEATURE_GRPC").is_some() {
        tonic_build::compile_protos("proto/raft.proto")?;
    }
    Ok(())
}
