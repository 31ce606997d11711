use crate::Host;
use anyhow::{bail, Result};
use async_trait::async_trait;
use swagent_boss::Boss;
use swagent_model::PropTree;
use swagent_terminal::{Protocol, Terminal};

/// Ubiquiti AirOS radio. Only raw pass-through is supported; the device
/// shell speaks over SSH with password auth.
pub struct AirOs {
    phost: PropTree,
    term: Option<Terminal>,
}

impl AirOs {
    pub fn new(phost: PropTree) -> Self {
        AirOs { phost, term: None }
    }

    async fn terminal(&mut self) -> Result<&mut Terminal> {
        let term = match self.term.take() {
            Some(term) => term,
            None => {
                let proto_ssh = self.phost.get("proto-ssh").cloned().unwrap_or_default();
                if proto_ssh.child_data("auth") != "userpass" {
                    bail!("Must use proto-ssh with auth \"userpass\" for AirOS");
                }
                let mut term = Terminal::connect(
                    Protocol::Ssh,
                    self.phost.child_data("hostname"),
                    &proto_ssh,
                    Some("[^#]+# "),
                    Some("--MORE--"),
                )
                .await?;
                term.execute("").await?;
                term
            }
        };
        Ok(self.term.insert(term))
    }
}

#[async_trait]
impl Host for AirOs {
    async fn execute(&mut self, boss: &mut Boss, cmd: &str, args: &str) -> Result<()> {
        if cmd == "passthru" {
            let lines = self.terminal().await?.execute(args).await?;
            for line in lines {
                boss.send_line(&line).await?;
            }
            boss.send_output_finished().await?;
            Ok(())
        } else {
            bail!("Not implemented: {cmd}");
        }
    }
}
