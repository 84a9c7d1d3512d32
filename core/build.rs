use std::io::Result;

fn main() -> Result<()> {
    // https://github.com/hyperium/tonic/issues/908
    let mut config = prost_build::Config::new();
    config.bytes(["."]);

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_with_config(
            config,
            &["proto/objects.proto", "proto/import_service.proto"],
            &["proto"],
        )?;
    Ok(())
}