//! Spreadsheet to PDF conversion through an external engine.
//!
//! [`ConversionEngine`] is the capability the pipeline needs from the
//! renderer; [`SofficeEngine`] drives a headless LibreOffice process.
//! [`ConversionInvoker`] wraps any engine with the wall-clock bound, the
//! output checks and the staged write that makes the result appear in one
//! rename.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::storage::{SharedStorage, StorageError};

/// Default wall-clock bound for a single engine run.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Bytes of engine stderr kept in failure messages.
const STDERR_TAIL: usize = 2048;

/// Export filter options forwarded to the engine untouched.
///
/// A JSON document stays structured; any other text is forwarded as a plain
/// string, which is how LibreOffice's legacy filter option strings travel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversionOptions(Option<Value>);

impl ConversionOptions {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn new(value: Value) -> Self {
        Self(Some(value))
    }

    /// Interprets a submitted form field. Blank input means no options.
    pub fn from_form(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            None | Some("") => Self::none(),
            Some(text) => match serde_json::from_str::<Value>(text) {
                Ok(value) => Self::new(value),
                Err(_) => Self::new(Value::String(text.to_string())),
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.0, None | Some(Value::Null))
    }

    pub fn as_value(&self) -> Option<&Value> {
        self.0.as_ref()
    }

    /// The options as the engine sees them on its command line.
    pub fn to_filter_arg(&self) -> Option<String> {
        match &self.0 {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("input file is missing or unreadable: {}", path.display())]
    InputMissing { path: PathBuf },

    #[error("conversion timed out after {}s", timeout.as_secs_f32())]
    Timeout { timeout: Duration },

    #[error("conversion engine failed: {0}")]
    EngineFailure(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("conversion I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The external document renderer.
///
/// Implementations write a PDF to `output` and may leave it partially
/// written on failure; callers never expose `output` directly.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConversionEngine: Send + Sync {
    async fn convert(
        &self,
        input: &Path,
        output: &Path,
        options: &ConversionOptions,
    ) -> Result<(), ConversionError>;
}

/// Headless LibreOffice (`soffice --convert-to pdf`).
///
/// Each run gets its own output directory and user profile under
/// `work_dir`, so concurrent runs do not contend for the profile lock.
#[derive(Debug, Clone)]
pub struct SofficeEngine {
    program: String,
    leading_args: Vec<String>,
    work_dir: PathBuf,
}

impl SofficeEngine {
    pub fn new(program: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            work_dir: work_dir.into(),
        }
    }

    /// Arguments placed before the LibreOffice flags, e.g. a wrapper script.
    pub fn with_leading_args(mut self, args: Vec<String>) -> Self {
        self.leading_args = args;
        self
    }

    fn export_filter(options: &ConversionOptions) -> String {
        match options.to_filter_arg() {
            Some(opts) => format!("pdf:calc_pdf_Export:{opts}"),
            None => "pdf".to_string(),
        }
    }
}

#[async_trait]
impl ConversionEngine for SofficeEngine {
    async fn convert(
        &self,
        input: &Path,
        output: &Path,
        options: &ConversionOptions,
    ) -> Result<(), ConversionError> {
        let out_dir = tempfile::Builder::new()
            .prefix(".engine-")
            .tempdir_in(&self.work_dir)?;
        let profile = out_dir.path().join("profile");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args)
            .arg(format!("-env:UserInstallation={}", file_url(&profile)))
            .arg("--headless")
            .arg("--norestore")
            .arg("--convert-to")
            .arg(Self::export_filter(options))
            .arg("--outdir")
            .arg(out_dir.path())
            .arg(input)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(program = %self.program, input = %input.display(), "Launching conversion engine");

        let child = cmd.spawn().map_err(|e| {
            ConversionError::EngineFailure(format!("failed to launch '{}': {e}", self.program))
        })?;
        let _group = ProcessGroup::led_by(&child);
        let result = child.wait_with_output().await?;

        if !result.status.success() {
            return Err(ConversionError::EngineFailure(format!(
                "engine exited with {}: {}",
                result.status,
                stderr_tail(&result.stderr)
            )));
        }

        let stem = input
            .file_stem()
            .ok_or_else(|| ConversionError::InputMissing {
                path: input.to_path_buf(),
            })?
            .to_string_lossy();
        let produced = out_dir.path().join(format!("{stem}.pdf"));

        match tokio::fs::metadata(&produced).await {
            Ok(meta) if meta.len() > 0 => {}
            _ => {
                return Err(ConversionError::EngineFailure(format!(
                    "engine exited cleanly but produced no output: {}",
                    stderr_tail(&result.stderr)
                )))
            }
        }

        tokio::fs::rename(&produced, output).await?;
        Ok(())
    }
}

/// The process group of a spawned engine, killed as a whole on drop.
///
/// `soffice` forks `soffice.bin`, which `kill_on_drop` alone would leave
/// running after a timeout. The child must have been spawned as the leader
/// of a new group.
struct ProcessGroup {
    leader: Option<u32>,
}

impl ProcessGroup {
    fn led_by(child: &Child) -> Self {
        Self { leader: child.id() }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if let Some(leader) = self.leader.take() {
            kill_group(leader);
        }
    }
}

#[cfg(unix)]
fn kill_group(leader: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(pgid) = i32::try_from(leader) else {
        return;
    };
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        // Every member already exited.
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid, error = %e, "Failed to kill engine process group"),
    }
}

#[cfg(not(unix))]
fn kill_group(_leader: u32) {}

/// `file://` URL for an absolute local path, percent-encoding every byte
/// outside the unreserved set.
fn file_url(path: &Path) -> String {
    let mut url = String::from("file://");
    for byte in path.to_string_lossy().bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/' => {
                url.push(char::from(byte))
            }
            _ => url.push_str(&format!("%{byte:02X}")),
        }
    }
    url
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= STDERR_TAIL {
        return text.to_string();
    }
    let mut start = text.len() - STDERR_TAIL;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}

/// Runs an engine under a hard timeout and publishes its output atomically.
#[derive(Clone)]
pub struct ConversionInvoker {
    engine: Arc<dyn ConversionEngine>,
    storage: SharedStorage,
    timeout: Duration,
}

impl ConversionInvoker {
    pub fn new(engine: Arc<dyn ConversionEngine>, storage: SharedStorage, timeout: Duration) -> Self {
        Self {
            engine,
            storage,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Converts `input` into `output`.
    ///
    /// On `Ok`, `output` exists and is non-empty. On any error `output` is
    /// untouched: the engine writes to a staging file that is only renamed
    /// onto `output` after the checks pass, and is removed otherwise. A
    /// timed-out engine run is dropped, which kills its process group.
    pub async fn invoke(
        &self,
        input: &Path,
        output: &Path,
        options: &ConversionOptions,
    ) -> Result<(), ConversionError> {
        match tokio::fs::metadata(input).await {
            Ok(meta) if meta.is_file() => {}
            _ => {
                return Err(ConversionError::InputMissing {
                    path: input.to_path_buf(),
                })
            }
        }

        let staged = self.storage.stage()?;
        let started = Instant::now();

        match tokio::time::timeout(self.timeout, self.engine.convert(input, &staged, options)).await {
            Err(_) => {
                warn!(
                    input = %input.display(),
                    timeout_secs = self.timeout.as_secs_f32(),
                    "Conversion timed out, engine terminated"
                );
                return Err(ConversionError::Timeout {
                    timeout: self.timeout,
                });
            }
            Ok(Err(e)) => return Err(e),
            Ok(Ok(())) => {}
        }

        let size = tokio::fs::metadata(&staged).await.map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            return Err(ConversionError::EngineFailure(
                "engine produced an empty file".to_string(),
            ));
        }

        self.storage.commit_to(staged, output)?;

        info!(
            input = %input.display(),
            output = %output.display(),
            bytes = size,
            duration_ms = started.elapsed().as_millis() as u64,
            "Conversion complete"
        );
        Ok(())
    }
}

/// Rebuilds the system font cache after a font install. Bounded by
/// `timeout`; the child is killed if it overruns.
pub async fn refresh_font_cache(program: &str, fonts_dir: &Path, timeout: Duration) -> Result<(), ConversionError> {
    let mut cmd = Command::new(program);
    cmd.arg("-f")
        .arg(fonts_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let child = cmd
        .spawn()
        .map_err(|e| ConversionError::EngineFailure(format!("failed to launch '{program}': {e}")))?;
    let _group = ProcessGroup::led_by(&child);

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Err(_) => Err(ConversionError::Timeout { timeout }),
        Ok(Err(e)) => Err(e.into()),
        Ok(Ok(out)) if !out.status.success() => Err(ConversionError::EngineFailure(format!(
            "{program} exited with {}: {}",
            out.status,
            stderr_tail(&out.stderr)
        ))),
        Ok(Ok(_)) => Ok(()),
    }
}
