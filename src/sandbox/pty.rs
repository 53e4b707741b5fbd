use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::RawFd;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::{mpsc, oneshot};

const PTY_SIZE: PtySize = PtySize {
    rows: 30,
    cols: 100,
    pixel_width: 0,
    pixel_height: 0,
};

/// Decoded output chunks buffered between the reader thread and the supervisor
const OUTPUT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub exit_code: i32,
}

/// A child process attached to its own pseudo terminal
pub struct PtyProcess {
    pid: Option<u32>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    input: mpsc::UnboundedSender<Vec<u8>>,
    finished: Arc<AtomicBool>,
    _master: Box<dyn MasterPty + Send>,
}

/// The process plus the receiving ends of its reader and waiter threads
pub struct SpawnedPty {
    pub process: PtyProcess,
    pub output: mpsc::Receiver<String>,
    pub exit: oneshot::Receiver<ExitInfo>,
}

pub fn spawn(program: &str, args: &[String], cwd: &Path) -> anyhow::Result<SpawnedPty> {
    let pair = native_pty_system()
        .openpty(PTY_SIZE)
        .context("Failed to open a pseudo terminal")?;

    match pair.master.as_raw_fd() {
        Some(fd) => configure_line_discipline(fd)
            .context("Failed to configure the pseudo terminal")?,
        None => log::warn!("Pseudo terminal has no file descriptor, echo stays enabled"),
    }

    let mut command = CommandBuilder::new(program);
    command.args(args);
    command.cwd(cwd);
    command.env("TERM", "dumb");

    let mut child = pair
        .slave
        .spawn_command(command)
        .with_context(|| format!("Failed to spawn `{program}` in {}", cwd.display()))?;
    // The reader only sees EOF once every slave descriptor is closed
    drop(pair.slave);

    let pid = child.process_id();
    let killer = child.clone_killer();
    let reader = pair.master.try_clone_reader()?;
    let writer = pair.master.take_writer()?;

    let (output_tx, output) = mpsc::channel(OUTPUT_BUFFER);
    tokio::task::spawn_blocking(move || read_output(reader, output_tx));

    let (input, input_rx) = mpsc::unbounded_channel();
    tokio::task::spawn_blocking(move || write_input(writer, input_rx));

    let finished = Arc::new(AtomicBool::new(false));
    let (exit_tx, exit) = oneshot::channel();
    tokio::task::spawn_blocking({
        let finished = finished.clone();
        move || {
            let exit_code = match child.wait() {
                Ok(status) => status.exit_code() as i32,
                Err(e) => {
                    log::error!("Waiting for child process failed: {e}");
                    -1
                }
            };
            finished.store(true, Ordering::SeqCst);
            let _ = exit_tx.send(ExitInfo { exit_code });
        }
    });

    Ok(SpawnedPty {
        process: PtyProcess {
            pid,
            killer,
            input,
            finished,
            _master: pair.master,
        },
        output,
        exit,
    })
}

impl PtyProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Queues bytes for the child's stdin
    pub fn write(&self, bytes: Vec<u8>) {
        if self.input.send(bytes).is_err() {
            log::debug!("Input writer of process {:?} is gone", self.pid);
        }
    }

    /// Sends SIGKILL to the child's process group
    ///
    /// The group is signalled even after the leader was reaped, since
    /// descendants keep the group id alive and hold the terminal open.
    pub fn kill(&mut self) {
        if let Some(pid) = self.pid {
            // The child leads its own session, so its pid is also the group id
            // SAFETY: plain syscall on a process group we spawned
            if unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) } == 0 {
                return;
            }
            let error = io::Error::last_os_error();
            if error.raw_os_error() != Some(libc::ESRCH) {
                log::debug!("Killing process group {pid} failed: {error}");
            }
        }

        if self.finished.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.killer.kill() {
            log::warn!("Failed to kill process {:?}: {e}", self.pid);
        }
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Turns off echo and LF to CRLF translation so the stream carries exactly
/// what the program wrote
fn configure_line_discipline(fd: RawFd) -> io::Result<()> {
    let mut termios = std::mem::MaybeUninit::<libc::termios>::uninit();
    // SAFETY: fd belongs to the open pty master; termios is initialised by tcgetattr
    unsafe {
        if libc::tcgetattr(fd, termios.as_mut_ptr()) != 0 {
            return Err(io::Error::last_os_error());
        }
        let mut termios = termios.assume_init();
        termios.c_lflag &= !(libc::ECHO | libc::ECHONL);
        termios.c_oflag &= !libc::ONLCR;
        if libc::tcsetattr(fd, libc::TCSANOW, &termios) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn read_output(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<String>) {
    let mut buf = [0u8; 8192];
    let mut decoder = Utf8Decoder::default();

    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let text = decoder.decode(&buf[..n]);
                if !text.is_empty() && tx.blocking_send(text).is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            // Linux reports EIO once the slave side has been closed
            Err(_) => break,
        }
    }

    let rest = decoder.finish();
    if !rest.is_empty() {
        let _ = tx.blocking_send(rest);
    }
}

fn write_input(mut writer: Box<dyn Write + Send>, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(bytes) = rx.blocking_recv() {
        if let Err(e) = writer.write_all(&bytes).and_then(|_| writer.flush()) {
            log::debug!("Writing to pseudo terminal failed: {e}");
            break;
        }
    }
}

/// Incremental UTF-8 decoding that holds back incomplete trailing sequences
#[derive(Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut text = String::new();
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        let consumed = self.pending.len() - rest.len();
        self.pending.drain(..consumed);
        text
    }

    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}
