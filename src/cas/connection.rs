use std::{path::PathBuf, process::Stdio, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::debug;

use crate::config::EngineConfig;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Engine did not answer within {0:?}")]
    Timeout(Duration),
    #[error("Engine transport failure: {0}")]
    Transport(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A channel to the computation engine.
///
/// One call runs one complete program and returns everything the engine
/// printed. No state is assumed to survive between calls.
#[mockall::automock]
#[async_trait]
pub trait CasConnection: Send + Sync {
    async fn execute(&self, command: &str) -> Result<String, ConnectionError>;
}

/// Runs each program in a freshly spawned engine process.
#[derive(Debug, Clone)]
pub struct ProcessConnection {
    command: String,
    args: Vec<String>,
    timeout: Duration,
    working_dir: Option<PathBuf>,
}

impl ProcessConnection {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            timeout: config.timeout,
            working_dir: config.working_dir.clone(),
        }
    }
}

#[async_trait]
impl CasConnection for ProcessConnection {
    #[tracing::instrument(level = "debug", skip(self, command), fields(engine = %self.command))]
    async fn execute(&self, command: &str) -> Result<String, ConnectionError> {
        let mut process = Command::new(&self.command);
        process
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            process.current_dir(dir);
        }

        let mut child = process.spawn()?;
        let stdin = child.stdin.take();
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            let written: std::io::Result<()> = async {
                stdin.write_all(command.as_bytes()).await?;
                stdin.write_all(b"\n").await?;
                stdin.shutdown().await
            }
            .await;
            match written {
                // The engine may exit before reading all of its input.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                other => other,
            }
        };

        // The deadline covers feeding stdin as well as the engine's answer.
        let exchange = async {
            let (written, output) = tokio::join!(feed, child.wait_with_output());
            written?;
            output
        };
        let output = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(output) => output?,
            Err(_) => return Err(ConnectionError::Timeout(self.timeout)),
        };
        debug!(
            "Engine exited with {} after printing {} bytes",
            output.status,
            output.stdout.len()
        );

        if !output.status.success() && output.stdout.is_empty() {
            return Err(ConnectionError::Transport(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
