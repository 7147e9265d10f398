//! Stdio plumbing for foreground attach: FIFOs, raw terminal mode, the
//! byte bridges, and the Ctrl-P Ctrl-Q detach sequence.

use crate::error::{Error, Result};
use crate::runtime::task::StdioPaths;
use crate::runtime::Runtime;
use nix::sys::stat::Mode;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Detach sequence: Ctrl-P then Ctrl-Q.
const CTRL_P: u8 = 0x10;
const CTRL_Q: u8 = 0x11;

/// Create the stdio FIFOs for a task in `dir`. Stale FIFOs from a previous
/// run are replaced. With a terminal, the PTY stream travels over the
/// stdout FIFO and stderr is unused.
pub fn create_fifos(dir: &Path, stdin: bool, terminal: bool) -> Result<StdioPaths> {
    let mut paths = StdioPaths {
        terminal,
        ..Default::default()
    };

    let mut make = |name: &str| -> Result<String> {
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        nix::unistd::mkfifo(&path, Mode::from_bits_truncate(0o600))
            .map_err(|e| Error::store(format!("mkfifo {}: {}", path.display(), e)))?;
        Ok(path.display().to_string())
    };

    if stdin {
        paths.stdin = make("stdin")?;
    }
    paths.stdout = make("stdout")?;
    if !terminal {
        paths.stderr = make("stderr")?;
    }
    Ok(paths)
}

/// Puts the controlling terminal into raw mode for the lifetime of the
/// guard. `None` when stdin is not a terminal.
pub struct RawMode {
    orig: nix::sys::termios::Termios,
}

impl RawMode {
    pub fn enable() -> Result<Option<Self>> {
        use nix::sys::termios;
        let stdin = std::io::stdin();
        if !nix::unistd::isatty(std::os::fd::AsRawFd::as_raw_fd(&stdin)).unwrap_or(false) {
            return Ok(None);
        }
        let orig = termios::tcgetattr(&stdin)
            .map_err(|e| Error::store(format!("tcgetattr: {}", e)))?;
        let mut raw = orig.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(&stdin, termios::SetArg::TCSANOW, &raw)
            .map_err(|e| Error::store(format!("tcsetattr: {}", e)))?;
        Ok(Some(Self { orig }))
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        use nix::sys::termios;
        let stdin = std::io::stdin();
        let _ = termios::tcsetattr(&stdin, termios::SetArg::TCSANOW, &self.orig);
    }
}

/// Current terminal size as (width, height).
pub fn terminal_size() -> Option<(u32, u32)> {
    let mut ws = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let rc = unsafe { libc::ioctl(libc::STDIN_FILENO, libc::TIOCGWINSZ, &mut ws) };
    if rc == 0 && ws.ws_col > 0 {
        Some((ws.ws_col as u32, ws.ws_row as u32))
    } else {
        None
    }
}

/// How a foreground attach ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// The task's output closed (it exited).
    Exited,
    /// The user typed the detach sequence.
    Detached,
}

/// Scans a stdin byte stream for Ctrl-P Ctrl-Q, forwarding everything else.
struct DetachScanner {
    pending_ctrl_p: bool,
}

impl DetachScanner {
    fn new() -> Self {
        Self {
            pending_ctrl_p: false,
        }
    }

    /// Returns the bytes to forward and whether the sequence completed.
    /// A Ctrl-P is held back until the next byte decides its fate.
    fn scan(&mut self, input: &[u8]) -> (Vec<u8>, bool) {
        let mut out = Vec::with_capacity(input.len() + 1);
        for &b in input {
            if self.pending_ctrl_p {
                if b == CTRL_Q {
                    self.pending_ctrl_p = false;
                    return (out, true);
                }
                if b == CTRL_P {
                    // Forward the held one, keep holding the newest.
                    out.push(CTRL_P);
                    continue;
                }
                self.pending_ctrl_p = false;
                out.push(CTRL_P);
                out.push(b);
            } else if b == CTRL_P {
                self.pending_ctrl_p = true;
            } else {
                out.push(b);
            }
        }
        (out, false)
    }
}

/// Attach the current terminal to a task's FIFOs until the task exits or
/// (with a TTY) the user detaches. Forwards terminal resizes.
pub async fn attach(
    runtime: &Runtime,
    id: &str,
    exec_id: &str,
    paths: &StdioPaths,
) -> Result<AttachOutcome> {
    use tokio::signal::unix::{signal, SignalKind};

    // The shim already holds the far ends open, so these opens return.
    let stdout_fifo = tokio::fs::File::open(&paths.stdout).await?;
    let stderr_fifo = if paths.stderr.is_empty() {
        None
    } else {
        Some(tokio::fs::File::open(&paths.stderr).await?)
    };

    let mut out_task = tokio::spawn(async move {
        let mut fifo = stdout_fifo;
        let mut stdout = tokio::io::stdout();
        let _ = tokio::io::copy(&mut fifo, &mut stdout).await;
        let _ = stdout.flush().await;
    });
    let mut err_task = stderr_fifo.map(|fifo| {
        tokio::spawn(async move {
            let mut fifo = fifo;
            let mut stderr = tokio::io::stderr();
            let _ = tokio::io::copy(&mut fifo, &mut stderr).await;
            let _ = stderr.flush().await;
        })
    });

    let (detach_tx, mut detach_rx) = tokio::sync::mpsc::channel::<()>(1);
    let stdin_fifo_path = paths.stdin.clone();
    let tty = paths.terminal;
    let _in_task = if stdin_fifo_path.is_empty() {
        None
    } else {
        let mut fifo = tokio::fs::OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&stdin_fifo_path)
            .await?;
        Some(tokio::spawn(async move {
            let mut stdin = tokio::io::stdin();
            let mut scanner = DetachScanner::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = match stdin.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if tty {
                    let (forward, detach) = scanner.scan(&buf[..n]);
                    if fifo.write_all(&forward).await.is_err() {
                        break;
                    }
                    if detach {
                        let _ = detach_tx.send(()).await;
                        break;
                    }
                } else if fifo.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }))
    };

    // Resize forwarding, TTY only.
    let mut winch = if paths.terminal {
        if let Some((w, h)) = terminal_size() {
            let _ = runtime.resize_pty(id, exec_id, w, h).await;
        }
        Some(signal(SignalKind::window_change())?)
    } else {
        None
    };

    loop {
        tokio::select! {
            _ = &mut out_task => {
                if let Some(t) = err_task.as_mut() {
                    let _ = t.await;
                }
                return Ok(AttachOutcome::Exited);
            }
            _ = detach_rx.recv() => {
                out_task.abort();
                if let Some(t) = err_task.as_mut() {
                    t.abort();
                }
                return Ok(AttachOutcome::Detached);
            }
            _ = async {
                match winch.as_mut() {
                    Some(w) => { w.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                if let Some((w, h)) = terminal_size() {
                    let _ = runtime.resize_pty(id, exec_id, w, h).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_fifos_layout() {
        let dir = tempfile::tempdir().unwrap();
        let paths = create_fifos(dir.path(), true, false).unwrap();
        assert!(Path::new(&paths.stdin).exists());
        assert!(Path::new(&paths.stdout).exists());
        assert!(Path::new(&paths.stderr).exists());
        assert!(!paths.terminal);
    }

    #[test]
    fn test_create_fifos_tty_has_no_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let paths = create_fifos(dir.path(), true, true).unwrap();
        assert!(paths.stderr.is_empty());
        assert!(paths.terminal);
    }

    #[test]
    fn test_create_fifos_no_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let paths = create_fifos(dir.path(), false, false).unwrap();
        assert!(paths.stdin.is_empty());
    }

    #[test]
    fn test_detach_scanner_passes_plain_bytes() {
        let mut s = DetachScanner::new();
        let (out, detach) = s.scan(b"hello");
        assert_eq!(out, b"hello");
        assert!(!detach);
    }

    #[test]
    fn test_detach_scanner_detects_sequence() {
        let mut s = DetachScanner::new();
        let (out, detach) = s.scan(&[b'a', CTRL_P, CTRL_Q, b'b']);
        assert_eq!(out, b"a");
        assert!(detach);
    }

    #[test]
    fn test_detach_scanner_sequence_split_across_reads() {
        let mut s = DetachScanner::new();
        let (out, detach) = s.scan(&[b'x', CTRL_P]);
        assert_eq!(out, b"x");
        assert!(!detach);
        let (_, detach) = s.scan(&[CTRL_Q]);
        assert!(detach);
    }

    #[test]
    fn test_detach_scanner_forwards_lone_ctrl_p() {
        let mut s = DetachScanner::new();
        let (out, detach) = s.scan(&[CTRL_P, b'z']);
        assert_eq!(out, &[CTRL_P, b'z']);
        assert!(!detach);
    }
}
