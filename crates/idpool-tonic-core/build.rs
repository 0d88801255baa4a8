/// Builds the gRPC client and server code for the `idpool.proto` definition
/// using `tonic-prost-build`.
///
/// # Files and Paths
///
/// - Proto file: `proto/idpool.proto`
/// - Includes: `proto/`
/// - Descriptor set: `$OUT_DIR/idpool_descriptor.bin`, served by the
///   reflection service.
///
/// # Panics
///
/// Panics if code generation fails, including when `protoc` is not installed.
///
/// # Output
///
/// Generated code will be accessible in Rust via:
///
/// ```rust,ignore
/// pub mod proto {
///     tonic::include_proto!("idpool");
/// }
/// ```
use std::env;
use std::path::PathBuf;
fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let descriptor_path = out_dir.join("idpool_descriptor.bin");

    let mut config = tonic_prost_build::Config::new();
    config.file_descriptor_set_path(&descriptor_path);

    tonic_prost_build::configure()
        .compile_with_config(config, &["proto/idpool.proto"], &["proto"])
        .unwrap();
}
