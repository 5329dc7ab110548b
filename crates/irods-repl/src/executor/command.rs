//! Executor that runs an iCommands tool (`irepl`, `ichksum`, `iphymv`) per batch.
//!
//! Arguments are passed as an argv vector, never through a shell. The tool's
//! stdout is scanned for batch paths as it runs; each path seen there counts
//! as completed right away. If the tool exits successfully, any path it did
//! not mention is counted too. Stdout and stderr are forwarded to the log.

use super::{BatchStatus, TransferExecutor, TransferInvocation};
use crate::config::ExecutorConfig;
use crate::error::{ReplError, Result};
use crate::operation::Operation;
use crate::progress::{CompletionEvent, CompletionSender};
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// Stderr lines kept for the failure message.
const STDERR_TAIL: usize = 5;

/// Runs the configured transfer tool as a child process.
pub struct CommandExecutor {
    config: ExecutorConfig,
}

impl CommandExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    /// Program and argv for `invocation`.
    pub fn command_line(&self, invocation: &TransferInvocation) -> (String, Vec<String>) {
        let dest = invocation.dest_resc.as_deref();
        let src = invocation.src_resc.as_deref();
        let threads = invocation.threads.to_string();
        let mut args: Vec<String> = Vec::new();

        let program = match invocation.operation {
            Operation::Replicate => {
                args.extend(["-B", "-M", "-v"].map(String::from));
                push_flag(&mut args, "-N", Some(threads.as_str()));
                push_flag(&mut args, "-R", dest);
                push_flag(&mut args, "-S", src);
                &self.config.replicate_program
            }
            Operation::Checksum => {
                args.push("-M".to_string());
                push_flag(&mut args, "-R", src);
                &self.config.checksum_program
            }
            Operation::Move => {
                args.extend(["-M", "-v"].map(String::from));
                push_flag(&mut args, "-N", Some(threads.as_str()));
                push_flag(&mut args, "-S", src);
                push_flag(&mut args, "-R", dest);
                &self.config.move_program
            }
        };

        args.extend(self.config.extra_args.iter().cloned());
        args.extend(invocation.paths.iter().cloned());
        (program.clone(), args)
    }

    fn is_connection_error(&self, line: &str) -> bool {
        self.config
            .connection_error_markers
            .iter()
            .any(|m| !m.is_empty() && line.contains(m.as_str()))
    }
}

#[async_trait]
impl TransferExecutor for CommandExecutor {
    async fn execute(
        &self,
        invocation: &TransferInvocation,
        completions: &CompletionSender,
    ) -> Result<BatchStatus> {
        if invocation.deadline.is_expired() {
            debug!("batch {}: deadline passed before start", invocation.batch_id);
            return Ok(BatchStatus::Skipped);
        }

        let (program, args) = self.command_line(invocation);
        debug!(
            "batch {}: {} {} flags, {} objects",
            invocation.batch_id,
            program,
            args.len() - invocation.paths.len(),
            invocation.paths.len()
        );

        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ReplError::Executor(format!("failed to start {}: {}", program, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ReplError::Executor("child stdout was not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ReplError::Executor("child stderr was not captured".into()))?;

        let batch_id = invocation.batch_id;
        let tx = completions.clone();
        let mut pending: HashSet<String> = invocation.paths.iter().cloned().collect();
        let stdout_task = tokio::spawn(async move {
            for_each_line(stdout, batch_id, |line| {
                debug!("batch {}: {}", batch_id, line);
                let done: Vec<String> = pending
                    .iter()
                    .filter(|p| mentions(&line, p))
                    .cloned()
                    .collect();
                for path in done {
                    pending.remove(&path);
                    let _ = tx.send(CompletionEvent::new(path));
                }
            })
            .await;
            pending
        });

        let stderr_task = tokio::spawn(async move {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL);
            for_each_line(stderr, batch_id, |line| {
                warn!("batch {}: {}", batch_id, line);
                if tail.len() == STDERR_TAIL {
                    tail.pop_front();
                }
                tail.push_back(line);
            })
            .await;
            tail
        });

        let status = child.wait().await?;
        let pending = stdout_task
            .await
            .map_err(|e| ReplError::Executor(format!("stdout reader failed: {}", e)))?;
        let tail = stderr_task
            .await
            .map_err(|e| ReplError::Executor(format!("stderr reader failed: {}", e)))?;

        if status.success() {
            for path in invocation.paths.iter().filter(|p| pending.contains(*p)) {
                let _ = completions.send(CompletionEvent::new(path.clone()));
            }
            return Ok(BatchStatus::Succeeded);
        }

        let unreachable = tail.iter().any(|l| self.is_connection_error(l));
        let message = if tail.is_empty() {
            format!("{} exited with {}", program, status)
        } else {
            tail.into_iter().collect::<Vec<_>>().join(" | ")
        };

        if unreachable {
            Ok(BatchStatus::Unreachable { message })
        } else {
            Ok(BatchStatus::Failed {
                code: status.code(),
                message,
            })
        }
    }
}

/// Read `pipe` to EOF, passing each line to `on_line` with invalid UTF-8
/// replaced. The pipe is drained even after a read error so the tool never
/// dies of SIGPIPE mid-batch.
async fn for_each_line<R, F>(pipe: R, batch_id: usize, mut on_line: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(String),
{
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                on_line(line.trim_end_matches(|c| c == '\n' || c == '\r').to_string());
            }
            Err(e) => {
                warn!("batch {}: reading tool output failed: {}", batch_id, e);
                let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
                break;
            }
        }
    }
}

fn push_flag(args: &mut Vec<String>, flag: &str, value: Option<&str>) {
    if let Some(v) = value {
        args.push(flag.to_string());
        args.push(v.to_string());
    }
}

/// Whether `line` names `path` as a whole whitespace-delimited word.
fn mentions(line: &str, path: &str) -> bool {
    line.match_indices(path).any(|(start, _)| {
        let before = line[..start].chars().next_back();
        let after = line[start + path.len()..].chars().next();
        before.map_or(true, char::is_whitespace) && after.map_or(true, char::is_whitespace)
    })
}
