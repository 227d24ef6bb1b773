use anyhow::Context;
use anyhow::Result;
use herd_core::InstanceRegistry;
use herd_core::boundary::handle_request;
use herd_core::boundary::malformed_request;
use herd_protocol::HerdRequest;
use herd_protocol::HerdResponse;
use serde_json::Value;
use tokio::io::AsyncBufRead;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::info;

use crate::ConfigArgs;
use crate::config_cmd;

/// Starts the registry, serves stdin until EOF or Ctrl-C, then stops every
/// worker.
pub async fn run(args: ConfigArgs) -> Result<()> {
    let config = config_cmd::load(&args)?;
    let registry = InstanceRegistry::start(config).context("failed to start instance registry")?;
    info!(scratch_dir = %registry.config().scratch_dir.display(), "herd serving on stdio");

    let (response_tx, response_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_responses(response_rx, tokio::io::stdout()));

    let served = tokio::select! {
        served = serve_lines(&registry, BufReader::new(tokio::io::stdin()), response_tx) => served,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            Ok(())
        }
    };

    registry.shutdown().await;
    writer.await.context("response writer panicked")??;
    served
}

/// Reads one request per line and answers each on its own task. Returns once
/// the input ends and every in-flight request has been answered.
pub async fn serve_lines<R>(
    registry: &InstanceRegistry,
    input: R,
    responses: mpsc::UnboundedSender<HerdResponse>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let mut in_flight = JoinSet::new();
    while let Some(line) = lines.next_line().await.context("failed to read request")? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<HerdRequest>(&line) {
            Ok(request) => {
                let registry = registry.clone();
                let responses = responses.clone();
                in_flight.spawn(async move {
                    let response = handle_request(&registry, request).await;
                    let _ = responses.send(response);
                });
            }
            Err(err) => {
                tracing::debug!("rejecting malformed request: {err}");
                let request_id = serde_json::from_str::<Value>(&line)
                    .ok()
                    .and_then(|value| value.get("request_id").cloned());
                let _ = responses.send(malformed_request(&err).with_request_id(request_id));
            }
        }
    }
    while in_flight.join_next().await.is_some() {}
    Ok(())
}

pub async fn write_responses<W>(
    mut responses: mpsc::UnboundedReceiver<HerdResponse>,
    mut output: W,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = responses.recv().await {
        let mut line = serde_json::to_string(&response).context("failed to encode response")?;
        line.push('\n');
        output.write_all(line.as_bytes()).await?;
        output.flush().await?;
    }
    Ok(())
}
