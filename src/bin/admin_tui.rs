//! Same administrator core as `admin`, plus a periodic plain-text
//! topology dashboard on stdout. Rendering a real interactive
//! dashboard (keybindings, panes, live redraw) is outside this
//! crate's scope; this binary only proves the core runs standalone
//! from whatever front end an operator bolts on.

use anyhow::Result;
use bproxy::admin::Admin;
use bproxy::config::{Cli, Config};
use clap::Parser;
use tokio::time::{Duration, interval};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load(&Cli::parse())?;
    simple_logger::init_with_level(config.log.level.as_level())?;

    let admin = Admin::new(config);
    tokio::spawn(admin.clone().run());
    dashboard(admin).await
}

async fn dashboard(admin: std::sync::Arc<Admin>) -> Result<()> {
    let mut ticker = interval(Duration::from_secs(5));
    loop {
        ticker.tick().await;
        let nodes = admin.agents_snapshot();
        println!("--- {} known agent(s) ---", nodes.len());
        for node in &nodes {
            let status = if node.active { "up" } else { "down" };
            println!("{:<36} {:<8} parent={}", node.id, status, node.parent_id.as_deref().unwrap_or(ROOT));
        }
    }
}

const ROOT: &str = "admin";
