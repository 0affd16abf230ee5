//! Attachment to the external extract/load pipeline.
//!
//! The pipeline is a child process speaking a line-oriented JSON protocol
//! (`SCHEMA`, `RECORD`, `STATE`) on stdout. It receives its run request as a
//! JSON file passed via `--state <path>`.

use std::io::Write;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wmsync_types::state::{CursorValue, EntityName, RunId};
use wmsync_types::wire::{PipelineMessage, SyncMode};

use crate::config::PipelineCommandConfig;
use crate::error::PipelineExecutionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Lt,
    Gte,
}

/// `field <op> value` restriction on one entity's extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorFilter {
    pub field: String,
    pub op: FilterOp,
    pub value: CursorValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRequest {
    pub entity: EntityName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<CursorFilter>,
}

/// Everything the pipeline needs to extract one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub run_id: RunId,
    pub mode: SyncMode,
    pub ordering_key: String,
    pub descending: bool,
    pub page_size: u32,
    pub entities: Vec<EntityRequest>,
}

/// Decoded messages from a running pipeline, in emission order.
#[derive(Debug)]
pub struct PipelineStream {
    lines: mpsc::Receiver<Result<String, PipelineExecutionError>>,
}

impl PipelineStream {
    #[must_use]
    pub fn new(lines: mpsc::Receiver<Result<String, PipelineExecutionError>>) -> Self {
        Self { lines }
    }

    /// Next message, skipping blank lines. `None` once the pipeline has
    /// exited cleanly. Cancel-safe.
    pub async fn next_message(&mut self) -> Option<Result<PipelineMessage, PipelineExecutionError>> {
        loop {
            let line = match self.lines.recv().await? {
                Ok(line) => line,
                Err(e) => return Some(Err(e)),
            };
            match PipelineMessage::decode_line(&line) {
                Ok(Some(message)) => return Some(Ok(message)),
                Ok(None) => {}
                Err(e) => return Some(Err(PipelineExecutionError::Protocol(e.to_string()))),
            }
        }
    }
}

/// Starts a pipeline for one run.
#[async_trait]
pub trait PipelineLauncher: Send + Sync {
    /// Start extraction. Cancelling `cancel` must stop the pipeline.
    async fn launch(
        &self,
        request: &PipelineRequest,
        cancel: CancellationToken,
    ) -> Result<PipelineStream, PipelineExecutionError>;
}

/// Runs the configured command as a child process.
#[derive(Debug, Clone)]
pub struct ProcessPipelineLauncher {
    config: PipelineCommandConfig,
}

impl ProcessPipelineLauncher {
    #[must_use]
    pub fn new(config: PipelineCommandConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PipelineLauncher for ProcessPipelineLauncher {
    async fn launch(
        &self,
        request: &PipelineRequest,
        cancel: CancellationToken,
    ) -> Result<PipelineStream, PipelineExecutionError> {
        let mut request_file = tempfile::NamedTempFile::new()?;
        serde_json::to_writer(&mut request_file, request)?;
        request_file.flush()?;

        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .arg("--state")
            .arg(request_file.path())
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PipelineExecutionError::Spawn {
                command: self.config.command.clone(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PipelineExecutionError::Protocol("extractor stdout not captured".into()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "wmsync::extractor", "{line}");
                }
            });
        }

        tracing::info!(
            command = %self.config.command,
            run_id = %request.run_id,
            mode = %request.mode,
            entities = request.entities.len(),
            "Extractor started"
        );

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        tokio::spawn(async move {
            // The request file must outlive the child.
            let _request_file = request_file;
            pump(child, stdout, tx, cancel).await;
        });
        Ok(PipelineStream::new(rx))
    }
}

async fn pump(
    mut child: Child,
    stdout: ChildStdout,
    tx: mpsc::Sender<Result<String, PipelineExecutionError>>,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = tokio::select! {
            () = cancel.cancelled() => {
                tracing::warn!("Extractor cancelled, terminating process");
                kill(&mut child).await;
                return;
            }
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => {
                let sent = tokio::select! {
                    () = cancel.cancelled() => false,
                    sent = tx.send(Ok(line)) => sent.is_ok(),
                };
                if !sent {
                    kill(&mut child).await;
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = tx.send(Err(e.into())).await;
                kill(&mut child).await;
                return;
            }
        }
    }

    match child.wait().await {
        Ok(status) if status.success() => tracing::debug!("Extractor exited cleanly"),
        Ok(status) => {
            let _ = tx
                .send(Err(PipelineExecutionError::ProcessFailed {
                    status: status.to_string(),
                }))
                .await;
        }
        Err(e) => {
            let _ = tx.send(Err(e.into())).await;
        }
    }
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        tracing::debug!(error = %e, "Extractor already gone");
    }
}
