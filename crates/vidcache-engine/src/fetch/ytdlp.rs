use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, warn};

use super::progress::{ToolLine, parse_line};
use super::{Cookies, FetchRequest, FetchTool, OnProgress, is_storage_full_error};
use crate::broadcast::ProgressUpdate;
use crate::cache::manifest::MEDIA_EXTENSIONS;
use crate::config::EngineConfig;
use crate::error::EngineError;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Lines of stderr kept for the failure summary
const STDERR_TAIL: usize = 20;

/// Drives a yt-dlp compatible executable
#[derive(Debug, Clone)]
pub struct YtDlp {
    path: PathBuf,
    format_selector: String,
    extractor_args: Option<String>,
    version_timeout: Duration,
    extra_args: Vec<String>,
}

impl YtDlp {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::from_config(&EngineConfig {
            tool_path: path.into(),
            ..EngineConfig::default()
        })
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            path: config.tool_path.clone(),
            format_selector: config.format_selector.clone(),
            extractor_args: config.extractor_args.clone(),
            version_timeout: config.version_timeout,
            extra_args: config.extra_args.clone(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.path);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(windows)]
        {
            cmd.creation_flags(CREATE_NO_WINDOW);
        }
        cmd
    }

    fn build_args(&self, request: &FetchRequest) -> Vec<String> {
        let template = request.output_dir.join(format!("{}.%(ext)s", request.id));
        let mut args = vec![
            "-f".to_string(),
            self.format_selector.clone(),
            "--no-playlist".to_string(),
            "--progress".to_string(),
            "--newline".to_string(),
            "--no-part".to_string(),
            "--restrict-filenames".to_string(),
        ];
        if let Some(extractor_args) = &self.extractor_args {
            args.push("--extractor-args".to_string());
            args.push(extractor_args.clone());
        }
        match &request.cookies {
            Some(Cookies::File(path)) => {
                args.push("--cookies".to_string());
                args.push(path.to_string_lossy().into_owned());
            }
            Some(Cookies::Browser(browser)) => {
                args.push("--cookies-from-browser".to_string());
                args.push(browser.clone());
            }
            None => {}
        }
        args.extend(self.extra_args.iter().cloned());
        args.push("-o".to_string());
        args.push(template.to_string_lossy().into_owned());
        args.push(request.url.clone());
        args
    }

    fn spawn(&self, mut cmd: Command) -> Result<Child, EngineError> {
        cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                EngineError::ToolMissing(format!("{}: {e}", self.path.display()))
            }
            _ => EngineError::Io(e),
        })
    }
}

#[async_trait]
impl FetchTool for YtDlp {
    async fn version(&self) -> Result<String, EngineError> {
        let mut cmd = self.command();
        cmd.arg("--version");
        let child = self.spawn(cmd)?;

        let output = tokio::time::timeout(self.version_timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                EngineError::ToolMissing(format!(
                    "{} did not answer --version within {:?}",
                    self.path.display(),
                    self.version_timeout
                ))
            })?
            .map_err(|e| EngineError::ToolMissing(format!("{}: {e}", self.path.display())))?;

        if !output.status.success() {
            return Err(EngineError::ToolMissing(format!(
                "{} --version exited with {}",
                self.path.display(),
                output.status
            )));
        }

        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(tool = ?self.path, version = %version, "Fetch tool available");
        Ok(version)
    }

    async fn fetch(
        &self,
        request: &FetchRequest,
        on_progress: OnProgress,
        cancel: CancellationToken,
    ) -> Result<PathBuf, EngineError> {
        fs::create_dir_all(&request.output_dir).await?;

        let mut cmd = self.command();
        cmd.args(self.build_args(request));
        debug!(id = %request.id, tool = ?self.path, "Spawning fetch tool");
        let mut child = self.spawn(cmd)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::DownloadFailed("fetch tool stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::DownloadFailed("fetch tool stderr unavailable".into()))?;

        let id = request.id.clone();
        // readers are aborted if we bail out early; grandchildren may keep the pipes open
        let stdout_task = AbortOnDropHandle::new(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(id = %id, "fetch tool: {}", line);
                match parse_line(&line) {
                    ToolLine::Progress(update) => on_progress(update),
                    ToolLine::PostProcessing => on_progress(ProgressUpdate::at(99.0)),
                    ToolLine::Other => {}
                }
            }
        }));
        let stderr_task =
            AbortOnDropHandle::new(tokio::spawn(collect_stderr(request.id.to_string(), stderr)));

        let status = wait_or_cancel(&mut child, &cancel).await?;

        let _ = stdout_task.await;
        let stderr_tail = stderr_task.await.unwrap_or_default();

        if !status.success() {
            let message = summarize_failure(&stderr_tail, status);
            return Err(if is_storage_full_error(&message) {
                EngineError::StorageFull(message)
            } else {
                EngineError::DownloadFailed(message)
            });
        }

        find_output(&request.output_dir).await?.ok_or_else(|| {
            EngineError::DownloadFailed("fetch tool reported success but produced no file".into())
        })
    }
}

/// Wait for the child, killing it if the fetch is cancelled.
///
/// Dropping the fetch future also kills the child (`kill_on_drop`), which is
/// how the orchestrator's timeout takes effect.
async fn wait_or_cancel(
    child: &mut Child,
    cancel: &CancellationToken,
) -> Result<ExitStatus, EngineError> {
    tokio::select! {
        status = child.wait() => Ok(status?),
        _ = cancel.cancelled() => {
            debug!("Fetch cancelled, killing tool");
            let _ = child.kill().await;
            Err(EngineError::DownloadFailed("download cancelled by shutdown".into()))
        }
    }
}

async fn collect_stderr<R: AsyncRead + Unpin>(id: String, stderr: R) -> VecDeque<String> {
    let mut tail = VecDeque::with_capacity(STDERR_TAIL);
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(id = %id, "fetch tool stderr: {}", line);
        if tail.len() == STDERR_TAIL {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail
}

fn summarize_failure(stderr_tail: &VecDeque<String>, status: ExitStatus) -> String {
    let errors: Vec<&str> = stderr_tail
        .iter()
        .map(String::as_str)
        .filter(|l| l.starts_with("ERROR"))
        .collect();
    if !errors.is_empty() {
        return errors.join("\n");
    }
    match stderr_tail.back() {
        Some(last) if !last.trim().is_empty() => last.trim().to_string(),
        _ => format!("fetch tool exited with {status}"),
    }
}

/// The finished media file inside a staging directory
async fn find_output(dir: &Path) -> Result<Option<PathBuf>, EngineError> {
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_media = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| MEDIA_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_media && entry.file_type().await?.is_file() {
            return Ok(Some(path));
        }
    }
    Ok(None)
}
