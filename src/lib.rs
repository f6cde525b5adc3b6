pub mod admin;
pub mod config;
pub mod pivot;

use anyhow::Result;
use log::info;

use crate::admin::Admin;
use crate::config::Config;

/// Brings an administrator up and runs it until the process is
/// killed; there is no intentional shutdown path short of that.
pub async fn startup(config: Config) -> Result<()> {
    simple_logger::init_with_level(config.log.level.as_level())?;
    info!("bproxy admin starting on {}", config.listen);

    let admin = Admin::new(config);
    admin.run().await
}
