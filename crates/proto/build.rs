use std::path::PathBuf;

const PROTOS: [&str; 4] = [
    "common.proto",
    "kv.proto",
    "control.proto",
    "coordinator.proto",
];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Definitions live in specs/v1 at the repository root.
    let manifest_dir = PathBuf::from(std::env::var("CARGO_MANIFEST_DIR")?);
    let proto_dir = manifest_dir
        .join("..")
        .join("..")
        .join("specs")
        .join("v1")
        .canonicalize()?;

    let protos: Vec<PathBuf> = PROTOS.iter().map(|f| proto_dir.join(f)).collect();
    for proto in &protos {
        println!("cargo:rerun-if-changed={}", proto.display());
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&protos, &[proto_dir])?;

    Ok(())
}
