//! Human-readable runs: the control stream is rendered as text instead of
//! being written raw.

use crate::coordinator::{self, BundleClient, RunOptions};
use crate::error::RunnerError;
use harness_common::protocol::parse_json_line;
use harness_common::{ControlMessage, ExitStatus, HumanRenderer};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::warn;

const PIPE_CAPACITY: usize = 64 * 1024;

/// Run tests and print a transcript to stdout.
///
/// Returns [`ExitStatus::TestFailed`] if any test reported an error.
pub async fn run_manual<C: BundleClient>(
    client: Arc<C>,
    opts: &RunOptions,
) -> Result<ExitStatus, RunnerError> {
    let (mut writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
    let render = tokio::spawn(render_stream(reader, tokio::io::stdout()));

    let result = coordinator::run(client, opts, &mut writer, true).await;
    drop(writer);
    let renderer = render.await?.map_err(RunnerError::Output)?;
    result?;

    if renderer.failed_tests().is_empty() {
        Ok(ExitStatus::Success)
    } else {
        Ok(ExitStatus::TestFailed)
    }
}

/// Render every control message read from `input` onto `out`, followed by
/// a summary once the stream ends.
pub async fn render_stream<R, W>(input: R, mut out: W) -> std::io::Result<HumanRenderer>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut renderer = HumanRenderer::new();
    let mut lines = BufReader::new(input).lines();
    let mut saw_results = false;
    while let Some(line) = lines.next_line().await? {
        let msg: ControlMessage = match parse_json_line(&line) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Unrenderable control message: {e}");
                continue;
            }
        };
        saw_results |= matches!(msg, ControlMessage::EntityEnd { .. });
        for text in renderer.render(&msg) {
            out.write_all(text.as_bytes()).await?;
            out.write_all(b"\n").await?;
        }
    }
    if saw_results {
        for text in renderer.summary() {
            out.write_all(text.as_bytes()).await?;
            out.write_all(b"\n").await?;
        }
    }
    out.flush().await?;
    Ok(renderer)
}
