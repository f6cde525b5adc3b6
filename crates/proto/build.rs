fn main() -> anyhow::Result<()> {
    if std::env::var_os("PROTOC").is_none() {
        unsafe {
            std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
        }
    }
    prost_build::compile_protos(&["protos/envelope.proto"], &["protos"])?;
    Ok(())
}
