//! Process execution helpers for Gantry.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant};

use crate::error::UtilError;

/// Structured output from a command execution.
#[derive(Debug)]
pub struct CommandOutput {
    /// Standard output as a string.
    pub stdout: String,
    /// Standard error as a string.
    pub stderr: String,
    /// Whether the command exited successfully.
    pub success: bool,
    /// The exit code, if the process was not killed by a signal.
    pub exit_code: Option<i32>,
    /// Whether the process was killed because it exceeded its timeout.
    pub timed_out: bool,
}

/// Build a `Command` from an argv list (`["javac", "-d", "build"]`).
///
/// # Errors
/// Returns `UtilError::EmptyCommand` if `argv` is empty.
pub fn command_from_argv(argv: &[String]) -> Result<Command, UtilError> {
    let Some((program, args)) = argv.split_first() else {
        return Err(UtilError::EmptyCommand);
    };
    let mut cmd = Command::new(program);
    cmd.args(args);
    Ok(cmd)
}

/// Extra time granted to the pipe readers once the deadline has passed.
const READER_GRACE: Duration = Duration::from_millis(500);

/// Execute a command and capture its output.
///
/// When `timeout` is set the command runs in its own process group. If it is
/// still alive after `timeout`, the whole group is killed and
/// `CommandOutput::timed_out` is set. Output that descendants keep writing
/// after the kill is not waited for.
///
/// # Errors
/// Returns an error if the command cannot be spawned (e.g. binary not found).
/// A non-zero exit code is **not** an error; check `CommandOutput::success` instead.
pub fn run_command(cmd: &mut Command, timeout: Option<Duration>) -> Result<CommandOutput, UtilError> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        if timeout.is_some() {
            cmd.process_group(0);
        }
    }
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| UtilError::CommandExec {
            program: program.clone(),
            source,
        })?;

    // Drain both pipes on their own threads so a chatty child cannot block on a full pipe.
    let (tx, rx) = mpsc::channel();
    spawn_reader(Pipe::Stdout, child.stdout.take(), tx.clone());
    spawn_reader(Pipe::Stderr, child.stderr.take(), tx);

    let (status, timed_out) = wait_with_deadline(&mut child, deadline).map_err(|source| {
        UtilError::CommandExec {
            program: program.clone(),
            source,
        }
    })?;

    let collect_until = deadline.map(|d| d.max(Instant::now()) + READER_GRACE);
    let (stdout, stderr) = collect_output(&rx, collect_until);

    Ok(CommandOutput {
        stdout,
        stderr,
        success: !timed_out && status.success(),
        exit_code: status.code(),
        timed_out,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pipe {
    Stdout,
    Stderr,
}

fn spawn_reader<R: Read + Send + 'static>(pipe: Pipe, source: Option<R>, tx: Sender<(Pipe, String)>) {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut source) = source {
            let _ = source.read_to_end(&mut buf);
        }
        // The receiver is gone when the caller stopped waiting.
        let _ = tx.send((pipe, String::from_utf8_lossy(&buf).into_owned()));
    });
}

/// Gather both pipes. With `until`, readers still blocked at that instant
/// (pipes held open by surviving descendants) are abandoned.
fn collect_output(rx: &Receiver<(Pipe, String)>, until: Option<Instant>) -> (String, String) {
    let mut stdout = None;
    let mut stderr = None;
    while stdout.is_none() || stderr.is_none() {
        let received = match until {
            Some(deadline) => rx.recv_timeout(deadline.saturating_duration_since(Instant::now())).ok(),
            None => rx.recv().ok(),
        };
        match received {
            Some((Pipe::Stdout, text)) => stdout = Some(text),
            Some((Pipe::Stderr, text)) => stderr = Some(text),
            None => break,
        }
    }
    (stdout.unwrap_or_default(), stderr.unwrap_or_default())
}

fn wait_with_deadline(
    child: &mut Child,
    deadline: Option<Instant>,
) -> std::io::Result<(std::process::ExitStatus, bool)> {
    let Some(deadline) = deadline else {
        return child.wait().map(|status| (status, false));
    };

    loop {
        if let Some(status) = child.try_wait()? {
            return Ok((status, false));
        }
        if Instant::now() >= deadline {
            kill_tree(child);
            return child.wait().map(|status| (status, true));
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Kill the child's process group, then the child itself.
///
/// The child may exit between `try_wait` and the kill; that race is harmless.
fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if let Ok(pid) = i32::try_from(child.id()) {
            let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
        }
    }
    let _ = child.kill();
}
