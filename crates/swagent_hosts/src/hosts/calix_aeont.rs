use crate::Host;
use anyhow::{bail, Result};
use async_trait::async_trait;
use swagent_boss::Boss;
use swagent_model::PropTree;
use swagent_terminal::{Protocol, Terminal};

/// Calix AE ONT. Pass-through only; the telnet front end walks a
/// four-step login dialog before the shell prompt appears.
pub struct CalixAeOnt {
    phost: PropTree,
    term: Option<Terminal>,
}

impl CalixAeOnt {
    pub fn new(phost: PropTree) -> Self {
        CalixAeOnt { phost, term: None }
    }

    async fn terminal(&mut self) -> Result<&mut Terminal> {
        let term = match self.term.take() {
            Some(term) => term,
            None => {
                let proto_telnet = self.phost.get("proto-telnet").cloned().unwrap_or_default();
                if proto_telnet.child_data("auth") != "userpass" {
                    bail!("Must use proto-telnet with auth \"userpass\" for Calix AE ONT");
                }
                let mut term = Terminal::connect(
                    Protocol::Telnet,
                    self.phost.child_data("hostname"),
                    &proto_telnet,
                    Some(".?Enter login name:"),
                    Some("--MORE--"),
                )
                .await?;
                term.set_prompt("Enter password:")?;
                term.execute(proto_telnet.child_data("username")).await?;
                term.set_prompt("Enter <CR> to continue:")?;
                term.execute(proto_telnet.child_data("password")).await?;
                term.set_prompt("[^>]+> ")?;
                term.execute("").await?;
                term
            }
        };
        Ok(self.term.insert(term))
    }
}

#[async_trait]
impl Host for CalixAeOnt {
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

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn passthru_streams_each_line_then_output_finished() {
        let (near, mut far) = tokio::io::duplex(4096);
        far.write_all(b"show interface\r\nA\r\nB\r\nont> ")
            .await
            .expect("device script");

        let mut host = CalixAeOnt::new(PropTree::new());
        host.term = Some(Terminal::over_stream(
            Protocol::Ssh,
            near,
            Some("[^>]+> "),
            Some("--MORE--"),
        ));
        let mut boss = Boss::capture();
        host.execute(&mut boss, "passthru", "show interface")
            .await
            .expect("passthru");

        assert_eq!(
            String::from_utf8_lossy(boss.captured()),
            "{\"line\": \"A\"}\n}}:}}:\n\
             {\"line\": \"B\"}\n}}:}}:\n\
             {\"output-finished\": 1}\n}}:}}:\n"
        );
    }
}
