//! Clipboard access behind a trait so the engines can run against the real
//! system clipboard or an in-memory fake in tests.
//!
//! The system implementation shells out to the platform utilities:
//! - Windows: `clip` / `powershell Get-Clipboard`
//! - macOS: `pbcopy` / `pbpaste`
//! - Linux: `xclip`
//!
//! Reads are best-effort: any failure (no utility, non-text content, busy
//! clipboard) is reported as "no text". Writes surface their error so the
//! caller can retry.

use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{trace, warn};

/// The text slot the protocol runs over.
///
/// Implementations must make reads idempotent: `get_text` returns the most
/// recently published text until someone publishes again.
pub trait Clipboard: Send + Sync {
    /// Read the current clipboard text, or `None` if there is none or the
    /// clipboard cannot be read right now.
    fn get_text(&self) -> Option<String>;

    /// Replace the clipboard text. Errors are transient and retryable.
    fn set_text(&self, text: &str) -> std::io::Result<()>;
}

/// Publish `text`, retrying on failure with a fixed delay between attempts.
///
/// Returns `true` once a write succeeds, `false` after `attempts` failures.
pub async fn set_text_with_retry(
    clipboard: &dyn Clipboard,
    text: &str,
    attempts: u32,
    delay: Duration,
) -> bool {
    for attempt in 1..=attempts {
        match clipboard.set_text(text) {
            Ok(()) => return true,
            Err(e) => warn!(
                event = "clipboard_write_failure",
                attempt,
                attempts,
                error = %e,
                "Clipboard write failed"
            ),
        }
        if attempt < attempts {
            tokio::time::sleep(delay).await;
        }
    }
    false
}

// ── System clipboard ─────────────────────────────────────────────────────────

/// Clipboard backed by the operating system via platform utilities.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClipboard;

impl Clipboard for SystemClipboard {
    fn get_text(&self) -> Option<String> {
        match read_command_output() {
            Ok(text) => Some(text),
            Err(e) => {
                trace!(event = "clipboard_read_failure", error = %e, "Clipboard read failed");
                None
            }
        }
    }

    fn set_text(&self, text: &str) -> std::io::Result<()> {
        write_through_command(text)
    }
}

fn pipe_into(mut command: Command, text: &str) -> std::io::Result<()> {
    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(text.as_bytes())?;
    }
    let status = child.wait()?;
    if !status.success() {
        return Err(std::io::Error::other(format!(
            "clipboard utility exited with {status}"
        )));
    }
    Ok(())
}

fn capture_from(mut command: Command) -> std::io::Result<String> {
    let output = command
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()?;
    if !output.status.success() {
        return Err(std::io::Error::other(format!(
            "clipboard utility exited with {}",
            output.status
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(windows)]
fn write_through_command(text: &str) -> std::io::Result<()> {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x08000000;

    let mut command = Command::new("clip");
    command.creation_flags(CREATE_NO_WINDOW);
    pipe_into(command, text)
}

#[cfg(windows)]
fn read_command_output() -> std::io::Result<String> {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x08000000;

    let mut command = Command::new("powershell");
    command
        .creation_flags(CREATE_NO_WINDOW)
        .args(["-NoProfile", "-Command", "Get-Clipboard", "-Raw"]);
    capture_from(command)
}

#[cfg(target_os = "macos")]
fn write_through_command(text: &str) -> std::io::Result<()> {
    pipe_into(Command::new("pbcopy"), text)
}

#[cfg(target_os = "macos")]
fn read_command_output() -> std::io::Result<String> {
    capture_from(Command::new("pbpaste"))
}

#[cfg(all(not(windows), not(target_os = "macos")))]
fn write_through_command(text: &str) -> std::io::Result<()> {
    let mut command = Command::new("xclip");
    command.args(["-selection", "clipboard"]);
    pipe_into(command, text)
}

#[cfg(all(not(windows), not(target_os = "macos")))]
fn read_command_output() -> std::io::Result<String> {
    let mut command = Command::new("xclip");
    command.args(["-selection", "clipboard", "-o"]);
    capture_from(command)
}

// ── In-memory clipboard ──────────────────────────────────────────────────────

/// In-memory clipboard used by the test suites. Records every publish so
/// tests can replay the exact packet sequence a sender produced.
#[derive(Debug, Default, Clone)]
pub struct MemoryClipboard {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    current: Option<String>,
    history: Vec<String>,
}

impl MemoryClipboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every text ever published, in publish order.
    pub fn history(&self) -> Vec<String> {
        self.inner.lock().unwrap().history.clone()
    }
}

impl Clipboard for MemoryClipboard {
    fn get_text(&self) -> Option<String> {
        self.inner.lock().unwrap().current.clone()
    }

    fn set_text(&self, text: &str) -> std::io::Result<()> {
        let mut state = self.inner.lock().unwrap();
        state.current = Some(text.to_string());
        state.history.push(text.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_clipboard_reads_are_idempotent() {
        let clip = MemoryClipboard::new();
        assert_eq!(clip.get_text(), None);

        clip.set_text("hello").unwrap();
        assert_eq!(clip.get_text().as_deref(), Some("hello"));
        assert_eq!(clip.get_text().as_deref(), Some("hello"));

        clip.set_text("world").unwrap();
        assert_eq!(clip.get_text().as_deref(), Some("world"));
        assert_eq!(clip.history(), vec!["hello".to_string(), "world".to_string()]);
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_attempt() {
        let clip = MemoryClipboard::new();
        let ok = set_text_with_retry(&clip, "x", 3, Duration::from_millis(1)).await;
        assert!(ok);
        assert_eq!(clip.history().len(), 1);
    }
}
