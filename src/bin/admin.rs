use anyhow::Result;
use bproxy::config::{Cli, Config};
use clap::Parser;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load(&Cli::parse())?;
    bproxy::startup(config).await
}
