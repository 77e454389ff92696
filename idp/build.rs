//! Compiles the gRPC admin surface's wire schema (spec §6, C10) into Rust
//! types + server bindings via `tonic-build`.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        .build_client(false)
        .build_server(true)
        .compile(&["proto/admin.proto"], &["proto"])?;
    println!("cargo:rerun-if-changed=proto/admin.proto");
    Ok(())
}
