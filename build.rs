fn main() {
    std::env::set_var(
        "PROTOC",
        protoc_bin_vendored::protoc_bin_path().expect("vendored protoc binary"),
    );
    println!("cargo:rerun-if-changed=proto/csi.proto");
    if let Err(err) = tonic_build::configure()
        .build_server(true)
        .build_client(false)
        .compile(&["proto/csi.proto"], &["proto"])
    {
        panic!("failed to compile csi proto: {err}");
    }
}
