use anyhow::{bail, Result};
use clap::Parser;
use swagent_boss::Boss;
use swagent_hosts::HostRegistry;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "swagent",
    about = "Device agent: drives one network element on behalf of a controller"
)]
struct Cli {
    /// TCP loopback port of the controlling boss; framed JSON runs over
    /// stdin/stdout when omitted
    port: Option<u16>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // stdout belongs to the boss protocol; diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut boss = match open_boss(cli.port).await {
        Ok(boss) => boss,
        Err(err) => {
            println!("-{err:#}");
            std::process::exit(1);
        }
    };

    if let Err(err) = run(&mut boss).await {
        error!(target: "agent", "session failed: {err:#}");
        let _ = boss.send_error(&format!("{err:#}")).await;
        std::process::exit(1);
    }
}

async fn open_boss(port: Option<u16>) -> Result<Boss> {
    match port {
        Some(port) => {
            let mut boss = Boss::connect(port).await?;
            boss.send_ready().await?;
            // Some bosses watch stdout even when they handed us a TCP port;
            // the ready event goes to both.
            use std::io::Write;
            print!("{}", "{\"ready\": 1}\n}}:}}:\n");
            std::io::stdout().flush()?;
            Ok(boss)
        }
        None => {
            let mut boss = Boss::stdio();
            boss.send_ready().await?;
            Ok(boss)
        }
    }
}

async fn run(boss: &mut Boss) -> Result<()> {
    let first = boss.get_op().await?;
    let phost = first.get("host").cloned().unwrap_or_default();
    let mut host = HostRegistry::builtin().construct(&phost)?;
    info!(target: "agent", family = phost.child_data("type"), "host constructed");

    loop {
        let op = boss.get_op().await?;
        if op.child_exists("end") {
            break;
        }
        if !op.child_exists("command") {
            bail!("Command expected");
        }
        let cmd = op.child_data("command");
        info!(target: "agent", cmd, "executing");
        host.execute(boss, cmd, op.child_data("args")).await?;
    }

    host.close(boss).await?;
    boss.send_goodbye().await?;
    Ok(())
}
