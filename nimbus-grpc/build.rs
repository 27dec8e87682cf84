fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto");

    tonic_prost_build::configure()
        .build_server(false)
        .build_client(true)
        .compile_protos(
            &["proto/control_plane.proto", "proto/input_plane.proto"],
            &["proto"],
        )?;

    Ok(())
}
