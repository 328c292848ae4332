use std::{
    ffi::OsStr,
    io::Read,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use anyhow::{bail, Context};

/// Upper bound on how much of the picker's standard output is kept.
pub const MAX_OUTPUT_LEN: usize = 64 * 1024;

const URI_PREFIX: &str = "file://";
const FALLBACK_POSTPROCESS_DIR: &str = "/tmp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Open,
    Save,
}

/// Everything the picker needs to know about a single dialog.
#[derive(Debug, Clone)]
pub struct PickerRequest {
    pub mode: Mode,
    pub multiple: bool,
    pub directory: bool,
    pub title: String,
    pub initial_path: PathBuf,
}

/// Shows a file dialog and returns the selected paths in selection order.
///
/// An empty selection means the user dismissed the dialog. Implementations
/// block until the dialog is closed.
pub trait Picker: Send + Sync {
    fn pick(&self, request: &PickerRequest) -> anyhow::Result<Vec<PathBuf>>;
}

/// Runs an external command that prints one selected path per line.
pub struct CommandPicker {
    command: Option<PathBuf>,
    postprocess_dir: PathBuf,
}

impl CommandPicker {
    pub fn new(command: Option<PathBuf>, postprocess_dir: PathBuf) -> Self {
        Self {
            command,
            postprocess_dir,
        }
    }

    fn build_command(&self, cmd: &Path, request: &PickerRequest) -> Command {
        let postprocess_dir = if self.postprocess_dir.as_os_str().is_empty() {
            Path::new(FALLBACK_POSTPROCESS_DIR)
        } else {
            self.postprocess_dir.as_path()
        };

        let mut command = Command::new(cmd);
        command
            .env("POSTPROCESS_DIR", postprocess_dir)
            .arg(flag(request.multiple))
            .arg(flag(request.directory))
            .arg(flag(request.mode == Mode::Save))
            .arg(&request.initial_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        command
    }
}

fn flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

impl Picker for CommandPicker {
    fn pick(&self, request: &PickerRequest) -> anyhow::Result<Vec<PathBuf>> {
        let cmd = match &self.command {
            Some(cmd) => cmd,
            None => bail!("cmd not specified"),
        };

        log::debug!(
            "picker: {:?} dialog \"{}\" at {}",
            request.mode,
            request.title,
            request.initial_path.display()
        );

        let mut command = self.build_command(cmd, request);
        log::trace!("executing command: {:?}", command);

        let mut child = command
            .spawn()
            .with_context(|| format!("could not execute {}", cmd.display()))?;

        let mut output = Vec::new();
        if let Some(mut stdout) = child.stdout.take() {
            stdout
                .by_ref()
                .take(MAX_OUTPUT_LEN as u64)
                .read_to_end(&mut output)
                .context("failed to read picker output")?;

            // keep draining so the picker never blocks on a full pipe
            let discarded = std::io::copy(&mut stdout, &mut std::io::sink()).unwrap_or(0);
            if discarded > 0 {
                log::warn!("picker output truncated, {} bytes discarded", discarded);
            }
        }

        let status = child.wait().context("failed to wait for picker")?;
        if !status.success() {
            log::warn!("{} exited with {}", cmd.display(), status);
        }

        if output.is_empty() {
            log::info!("picker produced no output");
            return Ok(Vec::new());
        }

        log::trace!("cmd output: {}", String::from_utf8_lossy(&output));

        Ok(parse_selection(&output))
    }
}

/// Splits picker output into paths. Only newline-terminated, non-empty lines
/// are selections.
pub fn parse_selection(output: &[u8]) -> Vec<PathBuf> {
    let terminated = match output.iter().rposition(|&b| b == b'\n') {
        Some(end) => &output[..end],
        None => return Vec::new(),
    };

    terminated
        .split(|&b| b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| PathBuf::from(OsStr::from_bytes(line)))
        .collect()
}

/// Renders a path as a `file://` URI. The path is not percent-encoded.
pub fn to_uri(path: &Path) -> String {
    String::from(URI_PREFIX) + &path.to_string_lossy()
}
