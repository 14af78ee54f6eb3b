fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use the bundled protoc so building needs no system install.
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);

    tonic_build::configure()
        .build_server(false)
        .compile_protos(&["proto/agent.proto"], &["proto"])?;
    Ok(())
}
