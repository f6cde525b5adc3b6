use anyhow::Result;
use bproxy_agent::Agent;
use bproxy_agent::config::{Cli, Config};
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load(&Cli::parse())?;
    simple_logger::init_with_level(config.log.level.as_level())?;

    let agent = Agent::new(config);
    agent.run().await
}
