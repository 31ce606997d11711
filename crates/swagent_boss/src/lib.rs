use anyhow::{bail, Context, Result};
use swagent_model::PropTree;
use tokio::io::{AsyncReadExt, AsyncWriteExt, Stdin, Stdout};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Six-byte frame delimiter. Each direction carries one plaintext JSON
/// document per frame, terminated by this sentinel.
pub const SENTINEL: &[u8] = b"}}:}}:";

/// The controller channel: framed JSON over stdin/stdout, or over a TCP
/// loopback connection when the agent was started with a port argument.
pub struct Boss {
    transport: Transport,
    inbuf: Vec<u8>,
}

enum Transport {
    Stdio { stdin: Stdin, stdout: Stdout },
    Tcp(TcpStream),
    #[cfg(any(test, feature = "test-util"))]
    Capture(Vec<u8>),
}

impl Boss {
    pub fn stdio() -> Self {
        Boss {
            transport: Transport::Stdio {
                stdin: tokio::io::stdin(),
                stdout: tokio::io::stdout(),
            },
            inbuf: Vec::new(),
        }
    }

    pub async fn connect(port: u16) -> Result<Self> {
        let stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .map_err(|_| anyhow::anyhow!("Failed to connect to 127.0.0.1:{port}"))?;
        Ok(Boss {
            transport: Transport::Tcp(stream),
            inbuf: Vec::new(),
        })
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self.transport, Transport::Tcp(_))
    }

    /// Test hook: a boss whose outgoing frames accumulate in memory.
    #[cfg(any(test, feature = "test-util"))]
    pub fn capture() -> Self {
        Boss {
            transport: Transport::Capture(Vec::new()),
            inbuf: Vec::new(),
        }
    }

    /// Test hook: every byte written so far by a [`Boss::capture`] channel.
    #[cfg(any(test, feature = "test-util"))]
    pub fn captured(&self) -> &[u8] {
        match &self.transport {
            Transport::Capture(buf) => buf,
            _ => &[],
        }
    }

    /// Read the next operation: bytes accumulate until the sentinel shows
    /// up, then the frame body goes through the JSON parser.
    pub async fn get_op(&mut self) -> Result<PropTree> {
        loop {
            if let Some(frame) = split_frame(&mut self.inbuf) {
                let text = String::from_utf8_lossy(&frame).into_owned();
                debug!(target: "boss", bytes = frame.len(), "received op frame");
                return PropTree::from_json(&text);
            }
            let mut chunk = [0u8; 4096];
            let read = match &mut self.transport {
                Transport::Stdio { stdin, .. } => stdin.read(&mut chunk).await,
                Transport::Tcp(stream) => stream.read(&mut chunk).await,
                #[cfg(any(test, feature = "test-util"))]
                Transport::Capture(_) => Ok(0),
            };
            match read {
                Ok(n) if n > 0 => self.inbuf.extend_from_slice(&chunk[..n]),
                _ if self.is_tcp() => bail!("EOF or error on boss TCP input"),
                _ => bail!("EOF or error on boss stdin input"),
            }
        }
    }

    pub async fn send_ready(&mut self) -> Result<()> {
        self.send_frame("{\"ready\": 1}".to_string()).await
    }

    pub async fn send_goodbye(&mut self) -> Result<()> {
        self.send_frame("{\"goodbye\": 1}".to_string()).await
    }

    pub async fn send_output_finished(&mut self) -> Result<()> {
        self.send_frame("{\"output-finished\": 1}".to_string()).await
    }

    pub async fn send_error(&mut self, message: &str) -> Result<()> {
        self.send_frame(format!("{{\"error\": {}}}", json_string(message)))
            .await
    }

    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        self.send_frame(format!("{{\"line\": {}}}", json_string(line)))
            .await
    }

    /// Emit a named PropTree payload, pretty-printed.
    pub async fn send_tree(&mut self, name: &str, tree: &PropTree) -> Result<()> {
        let mut wrapper = serde_json::Map::new();
        wrapper.insert(name.to_string(), tree.to_value());
        let body = serde_json::to_string_pretty(&serde_json::Value::Object(wrapper))
            .context("serializing result tree")?;
        self.send_frame(body).await
    }

    async fn send_frame(&mut self, body: String) -> Result<()> {
        if body.as_bytes().windows(SENTINEL.len()).any(|w| w == SENTINEL) {
            // The sentinel cannot appear in well-formed generator output
            // outside of string content; a frame tripping this would split
            // early on the boss side.
            warn!(target: "boss", "outgoing frame body contains the frame sentinel");
        }
        let mut frame = body.into_bytes();
        frame.push(b'\n');
        frame.extend_from_slice(SENTINEL);
        frame.push(b'\n');
        self.send_raw(&frame).await
    }

    async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        match &mut self.transport {
            Transport::Stdio { stdout, .. } => {
                stdout.write_all(bytes).await?;
                stdout.flush().await?;
            }
            Transport::Tcp(stream) => {
                stream.write_all(bytes).await?;
                stream.flush().await?;
            }
            #[cfg(any(test, feature = "test-util"))]
            Transport::Capture(buf) => buf.extend_from_slice(bytes),
        }
        Ok(())
    }
}

fn json_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

/// Split the first sentinel-terminated frame off the front of `buf`.
fn split_frame(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    let pos = buf
        .windows(SENTINEL.len())
        .position(|window| window == SENTINEL)?;
    let frame = buf[..pos].to_vec();
    buf.drain(..pos + SENTINEL.len());
    Some(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_frame_waits_for_sentinel() {
        let mut buf = b"{\"command\": \"list-ifaces\"}".to_vec();
        assert!(split_frame(&mut buf).is_none());
        buf.extend_from_slice(b"}}:}}:");
        let frame = split_frame(&mut buf).expect("complete frame");
        assert_eq!(frame, b"{\"command\": \"list-ifaces\"}");
        assert!(buf.is_empty());
    }

    #[test]
    fn split_frame_keeps_following_bytes() {
        let mut buf = b"{\"end\": 1}}}:}}:{\"next\":".to_vec();
        let frame = split_frame(&mut buf).expect("first frame");
        assert_eq!(frame, b"{\"end\": 1}");
        assert_eq!(buf, b"{\"next\":");
    }

    #[test]
    fn frame_body_parses_as_op() {
        let mut buf = b"{\"host\": {\"type\": \"airos\"}}\n}}:}}:\n".to_vec();
        let frame = split_frame(&mut buf).expect("frame");
        let op = PropTree::from_json(&String::from_utf8_lossy(&frame)).expect("op");
        assert_eq!(op.get("host").expect("host").child_data("type"), "airos");
        // The trailing newline after the sentinel is leading noise for the
        // next frame and disappears with it.
        buf.extend_from_slice(b"{\"end\": 1}}}:}}:");
        let frame = split_frame(&mut buf).expect("second frame");
        assert_eq!(frame, b"\n{\"end\": 1}");
    }

    #[test]
    fn json_string_escapes_conventionally() {
        assert_eq!(json_string("a\"b\\c\nd"), r#""a\"b\\c\nd""#);
    }

    #[tokio::test]
    async fn capture_channel_records_event_frames_in_order() {
        let mut boss = Boss::capture();
        boss.send_line("A").await.expect("line");
        boss.send_output_finished().await.expect("finished");
        assert_eq!(
            String::from_utf8_lossy(boss.captured()),
            "{\"line\": \"A\"}\n}}:}}:\n{\"output-finished\": 1}\n}}:}}:\n"
        );
    }
}
