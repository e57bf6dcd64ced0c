//! ffmpeg child process management shared by the codec backends.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use vconv_core::{ConvertError, Result};

/// Lines of ffmpeg diagnostics kept for error messages.
const STDERR_TAIL_LINES: usize = 8;

/// Resolve the ffmpeg binary: an explicit path wins, otherwise the
/// location ffmpeg-sidecar would use (next to the executable or on PATH).
pub fn ffmpeg_binary(override_path: Option<&Path>) -> PathBuf {
    override_path
        .map(Path::to_path_buf)
        .unwrap_or_else(ffmpeg_sidecar::paths::ffmpeg_path)
}

/// First error raised by any pump thread of a codec.
#[derive(Debug, Clone, Default)]
pub struct Fault(Arc<Mutex<Option<String>>>);

impl Fault {
    /// Record `message` unless an earlier fault is already recorded.
    pub fn set(&self, message: impl Into<String>) {
        let mut slot = self.0.lock();
        if slot.is_none() {
            *slot = Some(message.into());
        }
    }

    /// The recorded fault message, if any.
    pub fn get(&self) -> Option<String> {
        self.0.lock().clone()
    }

    /// `Err(Codec)` carrying the recorded fault, if any.
    pub fn check(&self) -> Result<()> {
        match self.get() {
            Some(message) => Err(ConvertError::Codec(message)),
            None => Ok(()),
        }
    }
}

/// Rolling tail of a process's stderr.
#[derive(Debug, Clone, Default)]
pub struct StderrTail(Arc<Mutex<VecDeque<String>>>);

impl StderrTail {
    fn push(&self, line: String) {
        let mut lines = self.0.lock();
        if lines.len() == STDERR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// The collected lines joined with "; ", or a placeholder.
    pub fn summary(&self) -> String {
        let lines = self.0.lock();
        if lines.is_empty() {
            "no diagnostics".to_string()
        } else {
            lines.iter().cloned().collect::<Vec<_>>().join("; ")
        }
    }
}

/// A running ffmpeg process with piped stdio.
pub struct FfmpegProcess {
    label: &'static str,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr_tail: StderrTail,
    stderr_thread: Option<JoinHandle<()>>,
    exited: bool,
}

impl FfmpegProcess {
    /// Spawn `binary` with `args`. `label` names the process in logs.
    pub fn spawn(binary: &Path, args: &[String], label: &'static str) -> Result<Self> {
        debug!(label, binary = %binary.display(), args = %args.join(" "), "spawning ffmpeg");
        let mut child = Command::new(binary)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                ConvertError::CodecConfiguration(format!(
                    "Failed to spawn {} ({label}): {e}",
                    binary.display()
                ))
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr_tail = StderrTail::default();
        let stderr_thread = match child.stderr.take() {
            Some(stderr) => {
                let tail = stderr_tail.clone();
                Some(
                    std::thread::Builder::new()
                        .name(format!("{label}-stderr"))
                        .spawn(move || {
                            for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                                debug!(label, "{line}");
                                tail.push(line);
                            }
                        })?,
                )
            }
            None => None,
        };

        Ok(Self {
            label,
            child,
            stdin,
            stdout,
            stderr_tail,
            stderr_thread,
            exited: false,
        })
    }

    /// Take ownership of the child's stdin.
    pub fn take_stdin(&mut self) -> Result<ChildStdin> {
        self.stdin
            .take()
            .ok_or_else(|| ConvertError::Codec(format!("{} stdin unavailable", self.label)))
    }

    /// Take ownership of the child's stdout.
    pub fn take_stdout(&mut self) -> Result<ChildStdout> {
        self.stdout
            .take()
            .ok_or_else(|| ConvertError::Codec(format!("{} stdout unavailable", self.label)))
    }

    /// Shared handle to the last stderr lines.
    pub fn stderr_tail(&self) -> StderrTail {
        self.stderr_tail.clone()
    }

    /// Wait up to `grace` for the process to exit on its own, then kill it.
    /// A non-zero exit within the grace period is a codec error.
    pub fn finish(&mut self, grace: Duration) -> Result<()> {
        if self.exited {
            return Ok(());
        }
        self.stdin = None;
        let deadline = Instant::now() + grace;
        loop {
            if let Some(status) = self.child.try_wait()? {
                self.exited = true;
                self.join_stderr();
                if status.success() {
                    debug!(label = self.label, "ffmpeg exited");
                    return Ok(());
                }
                return Err(ConvertError::Codec(format!(
                    "{} exited with {status}: {}",
                    self.label,
                    self.stderr_tail.summary()
                )));
            }
            if Instant::now() >= deadline {
                warn!(label = self.label, ?grace, "ffmpeg did not exit in time, killing");
                self.kill();
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Terminate the process if it is still running.
    pub fn kill(&mut self) {
        if self.exited {
            return;
        }
        self.stdin = None;
        self.stdout = None;
        if let Err(e) = self.child.kill() {
            // Already exited
            if e.kind() != ErrorKind::InvalidInput {
                warn!(label = self.label, error = %e, "failed to kill ffmpeg");
            }
        }
        if let Err(e) = self.child.wait() {
            warn!(label = self.label, error = %e, "failed to reap ffmpeg");
        }
        self.exited = true;
        self.join_stderr();
    }

    fn join_stderr(&mut self) {
        if let Some(handle) = self.stderr_thread.take() {
            if handle.join().is_err() {
                warn!(label = self.label, "stderr reader panicked");
            }
        }
    }
}

impl Drop for FfmpegProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Join a pump thread, turning a panic into a codec error.
pub fn join_pump(handle: Option<JoinHandle<()>>, name: &str) -> Result<()> {
    match handle {
        Some(handle) => handle
            .join()
            .map_err(|_| ConvertError::Codec(format!("{name} thread panicked"))),
        None => Ok(()),
    }
}

/// Fill `buf` completely. Returns `Ok(false)` on a clean end of stream
/// before the first byte; a partial read is an error.
pub fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("stream ended after {filled} of {} bytes", buf.len()),
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}
