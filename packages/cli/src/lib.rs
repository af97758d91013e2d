// ABOUTME: JSON-lines tool protocol server and logging setup for the knapsack binary
// ABOUTME: Reads one ToolCall per line and writes one ToolOutput per line

use knapsack_config::constants::RUST_LOG;
use knapsack_sandbox::{ToolCall, ToolDispatcher, ToolOutput};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Install the global subscriber
///
/// Logs go to stderr; stdout carries protocol responses only.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env(RUST_LOG)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

/// Serve tool calls until `reader` reaches EOF, returning how many were answered
///
/// Blank lines are skipped. A line that is not a valid call gets an
/// `invalid_request` error response and the loop continues.
pub async fn serve<R, W>(
    reader: R,
    mut writer: W,
    dispatcher: &ToolDispatcher,
) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    let mut handled = 0;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let output = match serde_json::from_str::<ToolCall>(line) {
            Ok(call) => dispatcher.dispatch(call).await,
            Err(e) => {
                warn!("Ignoring malformed tool call: {}", e);
                ToolOutput::error("invalid_request", e)
            }
        };

        let mut encoded = serde_json::to_vec(&output).map_err(std::io::Error::other)?;
        encoded.push(b'\n');
        writer.write_all(&encoded).await?;
        writer.flush().await?;

        handled += 1;
        debug!("Answered tool call #{}", handled);
    }

    Ok(handled)
}
