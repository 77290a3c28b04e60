use crate::bridge::{AgentBridge, MentionOutcome};
use ctxlink_core::protocol::{DecodedLines, LineDecoder, DEFAULT_MAX_FRAME_BYTES};
use serde::Deserialize;
use std::future::Future;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{info, warn};

const READ_CHUNK_BYTES: usize = 8192;

/// One line of driver input: a file plus an optional 1-indexed line range.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MentionCommand {
    pub file_path: PathBuf,
    #[serde(default)]
    pub start_line: Option<u32>,
    #[serde(default)]
    pub end_line: Option<u32>,
}

/// Why [`CommandReader::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEnd {
    Closed,
    Shutdown,
    Failed,
}

/// Feeds NDJSON mention commands to a bridge as they arrive.
pub struct CommandReader {
    decoder: LineDecoder<MentionCommand>,
    accepted: usize,
    rejected: usize,
}

impl Default for CommandReader {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandReader {
    pub fn new() -> Self {
        Self::with_line_limit(DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_line_limit(max_line_bytes: usize) -> Self {
        Self {
            decoder: LineDecoder::new(max_line_bytes),
            accepted: 0,
            rejected: 0,
        }
    }

    /// Read commands until `input` closes, fails, or `shutdown` resolves.
    pub async fn run<R, S>(&mut self, bridge: &AgentBridge, mut input: R, shutdown: S) -> InputEnd
    where
        R: AsyncRead + Unpin,
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut buf = vec![0u8; READ_CHUNK_BYTES];
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(event = "shutdown_signal");
                    return InputEnd::Shutdown;
                }
                read = input.read(&mut buf) => match read {
                    Ok(0) => {
                        self.finish(bridge);
                        info!(event = "input_closed");
                        return InputEnd::Closed;
                    }
                    Ok(n) => {
                        self.push_chunk(bridge, &buf[..n]);
                    }
                    Err(err) => {
                        warn!(event = "input_error", error = %err);
                        return InputEnd::Failed;
                    }
                },
            }
        }
    }

    pub fn push_chunk(&mut self, bridge: &AgentBridge, chunk: &[u8]) -> Vec<MentionOutcome> {
        let lines = self.decoder.feed(chunk);
        self.apply(bridge, lines)
    }

    /// Flush a trailing line that had no newline.
    pub fn finish(&mut self, bridge: &AgentBridge) -> Vec<MentionOutcome> {
        let lines = self.decoder.finish();
        self.apply(bridge, lines)
    }

    pub fn accepted(&self) -> usize {
        self.accepted
    }

    pub fn rejected(&self) -> usize {
        self.rejected
    }

    fn apply(&mut self, bridge: &AgentBridge, lines: DecodedLines<MentionCommand>) -> Vec<MentionOutcome> {
        for err in lines.errors {
            self.rejected += 1;
            warn!(event = "command_invalid", error = %err);
        }
        let mut outcomes = Vec::with_capacity(lines.items.len());
        for command in lines.items {
            match bridge.send_mention(&command.file_path, command.start_line, command.end_line) {
                Ok(outcome) => {
                    self.accepted += 1;
                    info!(
                        event = "mention_command",
                        file_path = %command.file_path.display(),
                        outcome = ?outcome
                    );
                    outcomes.push(outcome);
                }
                Err(err) => {
                    self.rejected += 1;
                    warn!(
                        event = "mention_rejected",
                        file_path = %command.file_path.display(),
                        error = %err
                    );
                }
            }
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::NoopSurface;
    use ctxlink_core::config::PortRange;
    use ctxlink_core::{BridgeConfig, LockFileStore};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::oneshot;

    async fn started_bridge(workspace: &std::path::Path) -> AgentBridge {
        std::fs::write(workspace.join("a.rs"), b"").expect("a.rs");
        std::fs::write(workspace.join("b.rs"), b"").expect("b.rs");
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);
        let config = BridgeConfig {
            port_range: PortRange {
                min: port,
                max: port,
            },
            workspace: workspace.to_path_buf(),
            discovery_dir: workspace.join("ide"),
            ping_interval: Duration::ZERO,
            ..BridgeConfig::default()
        };
        let store = Arc::new(LockFileStore::new(config.discovery_dir.clone()));
        let mut bridge = AgentBridge::new(config, store, Arc::new(NoopSurface));
        bridge.start().await.expect("start");
        bridge
    }

    #[test]
    fn command_lines_default_missing_ranges() {
        let command: MentionCommand =
            serde_json::from_str(r#"{"file_path":"src/lib.rs"}"#).expect("command");
        assert_eq!(command.file_path, PathBuf::from("src/lib.rs"));
        assert_eq!(command.start_line, None);
        assert_eq!(command.end_line, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn split_commands_are_reassembled_and_bad_lines_counted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut bridge = started_bridge(dir.path()).await;

        let mut reader = CommandReader::new();
        assert!(reader.push_chunk(&bridge, br#"{"file_path":"a."#).is_empty());
        let outcomes = reader.push_chunk(&bridge, b"rs\",\"start_line\":2}\nnot json\n");
        assert_eq!(outcomes, vec![MentionOutcome::Queued]);
        let outcomes = reader.push_chunk(&bridge, br#"{"file_path":"missing.rs"}"#);
        assert!(outcomes.is_empty());
        assert!(reader.finish(&bridge).is_empty());

        assert_eq!(reader.accepted(), 1);
        assert_eq!(reader.rejected(), 2);
        assert_eq!(bridge.status().pending_mentions, 1);
        bridge.stop().await.expect("stop");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blank_and_crlf_lines_are_accepted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut bridge = started_bridge(dir.path()).await;

        let mut reader = CommandReader::new();
        let input = b"\n   \n{\"file_path\":\"a.rs\",\"start_line\":1,\"end_line\":2}\r\n\r\n{\"file_path\":\"b.rs\"}\n";
        let outcomes = reader.push_chunk(&bridge, input);

        assert_eq!(outcomes.len(), 2);
        assert_eq!(reader.accepted(), 2);
        assert_eq!(reader.rejected(), 0, "blank lines are not errors");
        bridge.stop().await.expect("stop");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overlong_command_is_rejected_without_losing_the_next() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut bridge = started_bridge(dir.path()).await;

        let mut reader = CommandReader::with_line_limit(64);
        let padded = format!(r#"{{"file_path":"{}.rs"}}"#, "x".repeat(100));
        // Runaway line split across two reads, then a normal command.
        reader.push_chunk(&bridge, &padded.as_bytes()[..80]);
        let outcomes = reader.push_chunk(
            &bridge,
            format!("{}\n{{\"file_path\":\"b.rs\"}}\n", &padded[80..]).as_bytes(),
        );

        assert_eq!(outcomes, vec![MentionOutcome::Queued]);
        assert_eq!(reader.accepted(), 1);
        assert_eq!(reader.rejected(), 1);
        bridge.stop().await.expect("stop");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn run_consumes_input_until_closed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut bridge = started_bridge(dir.path()).await;

        let input: &[u8] = b"{\"file_path\":\"a.rs\"}\n{\"file_path\":\"b.rs\",\"start_line\":3}";
        let mut reader = CommandReader::new();
        let end = reader
            .run(&bridge, input, std::future::pending::<()>())
            .await;

        assert_eq!(end, InputEnd::Closed);
        assert_eq!(reader.accepted(), 2, "unterminated last line is flushed");
        assert_eq!(bridge.status().pending_mentions, 2);
        bridge.stop().await.expect("stop");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn run_returns_on_shutdown_while_input_stays_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut bridge = started_bridge(dir.path()).await;

        let (mut writer, input) = tokio::io::duplex(256);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let mut reader = CommandReader::new();

        let drive = async {
            for _ in 0..3 {
                writer
                    .write_all(b"{\"file_path\":\"a.rs\"}\n")
                    .await
                    .expect("write");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            stop_tx.send(()).expect("signal");
        };
        let shutdown = async {
            let _ = stop_rx.await;
        };
        let (end, ()) = tokio::join!(reader.run(&bridge, input, shutdown), drive);

        assert_eq!(end, InputEnd::Shutdown);
        assert_eq!(reader.accepted(), 3);
        drop(writer);
        bridge.stop().await.expect("stop");
    }
}
