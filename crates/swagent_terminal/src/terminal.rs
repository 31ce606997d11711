use crate::config;
use crate::pattern::FullMatch;
use crate::telnet::{self, TelnetDecoder};
use anyhow::{bail, Context, Result};
use async_ssh2_tokio::{AuthMethod, Client, ServerCheckMethod};
use std::collections::VecDeque;
use std::pin::Pin;
use swagent_model::PropTree;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

const NETCONF_EOM: &str = "]]>]]>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Telnet,
    Ssh,
    NetconfSsh,
}

impl Protocol {
    fn default_port(self) -> u16 {
        match self {
            Protocol::Telnet => 23,
            Protocol::Ssh => 22,
            Protocol::NetconfSsh => 830,
        }
    }

    fn tag(self) -> &'static str {
        match self {
            Protocol::Telnet => "telnet",
            Protocol::Ssh | Protocol::NetconfSsh => "SSH",
        }
    }
}

#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("Failed to connect to {ip} on port {port}")]
    Connect { ip: String, port: u16 },
    #[error("Timeout or error waiting for data ({proto})")]
    ReadTimeout { proto: &'static str },
    #[error("No more chars to read ({proto})")]
    UnexpectedEof { proto: &'static str },
}

trait TermIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T> TermIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

enum TermStream {
    Telnet {
        stream: TcpStream,
        decoder: TelnetDecoder,
    },
    Stream(Pin<Box<dyn TermIo>>),
}

/// One prompt-driven session against the target device. Interactive use
/// (telnet or SSH shell) submits a command and captures lines up to the
/// next prompt, feeding the pager a space whenever its banner appears;
/// NETCONF use exchanges `]]>]]>`-delimited XML payloads.
pub struct Terminal {
    proto: Protocol,
    stream: TermStream,
    queue: VecDeque<u8>,
    prompt: Option<FullMatch>,
    pager: Option<FullMatch>,
    _client: Option<Client>,
}

impl Terminal {
    pub async fn connect(
        proto: Protocol,
        ip: &str,
        auth: &PropTree,
        prompt: Option<&str>,
        pager: Option<&str>,
    ) -> Result<Terminal> {
        if proto != Protocol::NetconfSsh && prompt.is_none() {
            bail!("Must supply a prompt regex");
        }
        let port = auth
            .get("port")
            .and_then(|p| p.data().parse().ok())
            .unwrap_or_else(|| proto.default_port());
        let prompt = prompt.map(FullMatch::new).transpose()?;
        let pager = pager.map(FullMatch::new).transpose()?;

        let mut client = None;
        let stream = match proto {
            Protocol::Telnet => {
                let tcp = TcpStream::connect((ip, port))
                    .await
                    .map_err(|_| TerminalError::Connect {
                        ip: ip.to_string(),
                        port,
                    })?;
                TermStream::Telnet {
                    stream: tcp,
                    decoder: TelnetDecoder::default(),
                }
            }
            Protocol::Ssh | Protocol::NetconfSsh => {
                // Probe plain TCP first so unreachable hosts and failed
                // authentication report differently.
                TcpStream::connect((ip, port))
                    .await
                    .map_err(|_| TerminalError::Connect {
                        ip: ip.to_string(),
                        port,
                    })?;
                let (username, method, auth_failure) = auth_method(auth).await?;
                let connected = Client::connect(
                    (ip, port),
                    &username,
                    method,
                    ServerCheckMethod::NoCheck,
                )
                .await
                .map_err(|err| {
                    debug!(target: "terminal", %err, "ssh negotiation failed");
                    anyhow::anyhow!("{auth_failure}")
                })?;
                let channel = connected
                    .get_channel()
                    .await
                    .context("Unable to open a channel")?;
                if proto == Protocol::Ssh {
                    channel
                        .request_pty(true, "vanilla", 80, 24, 0, 0, &[])
                        .await
                        .context("Failed requesting pty on channel")?;
                    channel
                        .request_shell(true)
                        .await
                        .context("Unable to request shell on allocated pty")?;
                } else {
                    channel
                        .request_subsystem(true, "netconf")
                        .await
                        .context("Failed requesting NETCONF on channel")?;
                }
                client = Some(connected);
                TermStream::Stream(Box::pin(channel.into_stream()))
            }
        };

        let mut term = Terminal {
            proto,
            stream,
            queue: VecDeque::new(),
            prompt,
            pager,
            _client: client,
        };
        if proto != Protocol::NetconfSsh {
            term.drain_banner().await?;
        }
        info!(target: "terminal", ?proto, ip, port, "session established");
        Ok(term)
    }

    pub fn set_prompt(&mut self, pattern: &str) -> Result<()> {
        self.prompt = Some(FullMatch::new(pattern)?);
        Ok(())
    }

    pub fn set_pager(&mut self, pattern: &str) -> Result<()> {
        self.pager = Some(FullMatch::new(pattern)?);
        Ok(())
    }

    /// Submit a command and capture the reply up to the next prompt. The
    /// returned lines are the `\n`-delimited output with the command echo
    /// discarded; the prompt line (and the pager banner it replaces) never
    /// appear because prompt and pager are tested against the partial line
    /// buffer, not completed lines.
    pub async fn execute(&mut self, cmd: &str) -> Result<Vec<String>> {
        if self.proto == Protocol::NetconfSsh {
            let payload = self.rpc(cmd).await?;
            return Ok(vec![payload]);
        }
        debug!(target: "terminal", cmd, "execute");
        self.send(&format!("{cmd}\r")).await?;
        while self.get_char().await? != b'\n' {}

        let prompt = self.prompt.clone();
        let pager = self.pager.clone();
        let mut lines = Vec::new();
        let mut buf = String::new();
        loop {
            match self.get_char().await? {
                8 => {
                    buf.pop();
                }
                0 => buf.clear(),
                b'\n' => lines.push(std::mem::take(&mut buf)),
                b'\r' => {}
                c => {
                    buf.push(c as char);
                    if prompt.as_ref().is_some_and(|p| p.is_match(&buf)) {
                        return Ok(lines);
                    }
                    if pager.as_ref().is_some_and(|p| p.is_match(&buf)) {
                        self.send(" ").await?;
                    }
                }
            }
        }
    }

    /// NETCONF exchange: send the payload, read until the end-of-message
    /// sentinel, return the reply with the sentinel stripped.
    pub async fn rpc(&mut self, payload: &str) -> Result<String> {
        self.send(&format!("{payload}{NETCONF_EOM}")).await?;
        let mut buf: Vec<u8> = Vec::new();
        loop {
            buf.push(self.get_char().await?);
            if buf.ends_with(NETCONF_EOM.as_bytes()) {
                break;
            }
        }
        buf.truncate(buf.len() - NETCONF_EOM.len());
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Consume the login banner: discard input until a full line matches
    /// the prompt.
    async fn drain_banner(&mut self) -> Result<()> {
        let Some(prompt) = self.prompt.clone() else {
            return Ok(());
        };
        let mut buf = String::new();
        loop {
            if prompt.is_match(&buf) {
                return Ok(());
            }
            let c = self.get_char().await?;
            if c == b'\r' || c == b'\n' {
                buf.clear();
            } else {
                buf.push(c as char);
            }
        }
    }

    async fn send(&mut self, data: &str) -> Result<()> {
        match &mut self.stream {
            TermStream::Telnet { stream, .. } => {
                let encoded = telnet::encode(data.as_bytes());
                stream.write_all(&encoded).await?;
                stream.flush().await?;
            }
            TermStream::Stream(stream) => {
                stream.as_mut().write_all(data.as_bytes()).await?;
                stream.as_mut().flush().await?;
            }
        }
        Ok(())
    }

    async fn get_char(&mut self) -> Result<u8> {
        loop {
            if let Some(byte) = self.queue.pop_front() {
                return Ok(byte);
            }
            self.fill().await?;
        }
    }

    async fn fill(&mut self) -> Result<()> {
        let tag = self.proto.tag();
        let mut chunk = [0u8; 4096];
        match &mut self.stream {
            TermStream::Telnet { stream, decoder } => {
                let n = tokio::time::timeout(config::read_timeout(), stream.read(&mut chunk))
                    .await
                    .map_err(|_| TerminalError::ReadTimeout { proto: tag })?
                    .map_err(|_| TerminalError::UnexpectedEof { proto: tag })?;
                if n == 0 {
                    bail!(TerminalError::UnexpectedEof { proto: tag });
                }
                let mut replies = Vec::new();
                decoder.feed(&chunk[..n], &mut self.queue, &mut replies);
                if !replies.is_empty() {
                    stream.write_all(&replies).await?;
                    stream.flush().await?;
                }
            }
            TermStream::Stream(stream) => {
                let n = tokio::time::timeout(
                    config::read_timeout(),
                    stream.as_mut().read(&mut chunk),
                )
                .await
                .map_err(|_| TerminalError::ReadTimeout { proto: tag })?
                .map_err(|_| TerminalError::UnexpectedEof { proto: tag })?;
                if n == 0 {
                    bail!(TerminalError::UnexpectedEof { proto: tag });
                }
                self.queue.extend(&chunk[..n]);
            }
        }
        Ok(())
    }

    /// Test hook: a terminal speaking the interactive protocol over an
    /// arbitrary stream, skipping connect and handshake.
    #[cfg(any(test, feature = "test-util"))]
    pub fn over_stream(
        proto: Protocol,
        stream: impl AsyncRead + AsyncWrite + Send + Unpin + 'static,
        prompt: Option<&str>,
        pager: Option<&str>,
    ) -> Terminal {
        Terminal {
            proto,
            stream: TermStream::Stream(Box::pin(stream)),
            queue: VecDeque::new(),
            prompt: prompt.map(|p| FullMatch::new(p).expect("prompt pattern")),
            pager: pager.map(|p| FullMatch::new(p).expect("pager pattern")),
            _client: None,
        }
    }
}

async fn auth_method(auth: &PropTree) -> Result<(String, AuthMethod, &'static str)> {
    let username = auth.child_data("username").to_string();
    match auth.child_data("auth") {
        "userpass" => Ok((
            username,
            AuthMethod::with_password(auth.child_data("password")),
            "Authentication by password failed",
        )),
        "rsa" => {
            let key_path = auth.child_data("private-key-file");
            let key = tokio::fs::read_to_string(key_path)
                .await
                .with_context(|| format!("reading ssh key {key_path}"))?;
            Ok((
                username,
                AuthMethod::with_key(&key, None),
                "Authentication by RSA key failed",
            ))
        }
        other => bail!("Invalid auth method: '{other}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn scripted(proto: Protocol, prompt: Option<&str>, pager: Option<&str>, script: &str) -> (Terminal, tokio::io::DuplexStream) {
        let (near, mut far) = tokio::io::duplex(16 * 1024);
        far.write_all(script.as_bytes()).await.expect("script");
        (Terminal::over_stream(proto, near, prompt, pager), far)
    }

    #[tokio::test]
    async fn prompt_requires_full_line_match() {
        let (mut term, _far) = scripted(
            Protocol::Ssh,
            Some("sw-01> "),
            None,
            "show version\r\nxsw-01> looks close\r\nsw-01> ",
        )
        .await;
        let lines = term.execute("show version").await.expect("execute");
        assert_eq!(lines, vec!["xsw-01> looks close"]);
    }

    #[tokio::test]
    async fn pager_banner_is_fed_a_space_and_hidden() {
        let (mut term, mut far) = scripted(
            Protocol::Ssh,
            Some("sw-01> "),
            Some(" --More-- "),
            "show run\r\nline one\r\n --More-- \0line two\r\nsw-01> ",
        )
        .await;
        let lines = term.execute("show run").await.expect("execute");
        assert_eq!(lines, vec!["line one", "line two"]);

        let mut sent = vec![0u8; 64];
        let n = far.read(&mut sent).await.expect("sent bytes");
        assert_eq!(&sent[..n], b"show run\r ");
    }

    #[tokio::test]
    async fn backspace_edits_and_nul_clears() {
        let (mut term, _far) = scripted(
            Protocol::Ssh,
            Some("# "),
            None,
            "cmd\r\nab\x08c\r\ndiscarded\0kept\r\n# ",
        )
        .await;
        let lines = term.execute("cmd").await.expect("execute");
        assert_eq!(lines, vec!["ac", "kept"]);
    }

    #[tokio::test]
    async fn command_echo_line_is_discarded() {
        let (mut term, _far) = scripted(
            Protocol::Ssh,
            Some("> "),
            None,
            "echo of the command\r\nreal output\r\n> ",
        )
        .await;
        let lines = term.execute("anything").await.expect("execute");
        assert_eq!(lines, vec!["real output"]);
    }

    #[tokio::test]
    async fn rpc_strips_end_of_message() {
        let (mut term, mut far) = scripted(
            Protocol::NetconfSsh,
            None,
            None,
            "<rpc-reply><ok/></rpc-reply>]]>]]>",
        )
        .await;
        let reply = term.rpc("<rpc><commit/></rpc>").await.expect("rpc");
        assert_eq!(reply, "<rpc-reply><ok/></rpc-reply>");

        let mut sent = vec![0u8; 64];
        let n = far.read(&mut sent).await.expect("sent bytes");
        assert_eq!(&sent[..n], b"<rpc><commit/></rpc>]]>]]>");
    }

    #[tokio::test]
    async fn banner_drains_until_prompt_line() {
        let (mut term, _far) = scripted(
            Protocol::Ssh,
            Some("[a-z0-9-]+> "),
            None,
            "Welcome to sw-01\r\nLast login: yesterday\r\nsw-01> c\r\nout\r\nsw-01> ",
        )
        .await;
        term.drain_banner().await.expect("banner");
        let lines = term.execute("c").await.expect("execute");
        assert_eq!(lines, vec!["out"]);
    }
}
