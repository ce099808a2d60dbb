use std::{
    io::{self, IsTerminal, Read, Write},
    path::Path,
    process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, warn};

use crate::error::SupervisorError;

const REAP_POLL: Duration = Duration::from_millis(10);
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// A spawned daemon with its output pipes detached for pumping.
pub(crate) struct DaemonProcess {
    pub(crate) child: Child,
    pub(crate) stdout: ChildStdout,
    pub(crate) stderr: ChildStderr,
    /// The daemon leads its own process group.
    pub(crate) grouped: bool,
}

/// Whether the daemon should get its own process group.
///
/// Not when stdin is a terminal: the daemon then stays in the foreground group, so it can
/// read stdin and receives Ctrl-C together with the supervisor.
pub(crate) fn wants_own_group() -> bool {
    cfg!(unix) && !io::stdin().is_terminal()
}

/// Start `program` with `args` verbatim, the inherited environment and stdin, and piped
/// stdout/stderr. With `own_group` on unix the daemon leads a new process group, so
/// anything it forks can be stopped with it.
pub(crate) fn spawn_daemon(
    program: &Path,
    args: &[String],
    own_group: bool,
) -> Result<DaemonProcess, SupervisorError> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    if own_group {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    let grouped = cfg!(unix) && own_group;
    let mut child = command.spawn().map_err(|source| SupervisorError::ChildSpawn {
        program: program.to_path_buf(),
        source,
    })?;
    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        let _ = child.kill();
        let _ = child.wait();
        return Err(SupervisorError::ChildSpawn {
            program: program.to_path_buf(),
            source: io::Error::new(io::ErrorKind::BrokenPipe, "output pipes missing"),
        });
    };
    debug!(program = %program.display(), pid = child.id(), grouped, "daemon spawned");
    Ok(DaemonProcess {
        child,
        stdout,
        stderr,
        grouped,
    })
}

/// Copy `reader` into `sink` chunk by chunk until EOF.
///
/// A failing sink is reported once and the pipe keeps draining, so the child never blocks
/// on a full pipe. Returns the number of bytes read.
pub(crate) fn pump(mut reader: impl Read, sink: &mut dyn Write, stream: &str) -> u64 {
    let mut chunk = [0u8; 8192];
    let mut total = 0u64;
    let mut sink_ok = true;
    loop {
        let read = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!(stream, error = %err, "daemon output pipe failed");
                break;
            }
        };
        total += read as u64;
        if sink_ok {
            if let Err(err) = sink.write_all(&chunk[..read]).and_then(|()| sink.flush()) {
                warn!(stream, error = %err, "dropping daemon output after sink error");
                sink_ok = false;
            }
        }
    }
    total
}

/// Let the child exit on its own for up to `grace`, then kill and reap it.
///
/// For a `grouped` daemon whatever is left of its process group is killed either way, so a
/// wrapper script's children cannot keep the output pipes open.
pub(crate) fn stop_child(
    child: &mut Child,
    grouped: bool,
    grace: Duration,
) -> Result<ExitStatus, SupervisorError> {
    if let Some(status) = wait_until(child, Instant::now() + grace)? {
        if grouped {
            if let Err(err) = kill_tree(child, grouped) {
                warn!(pid = child.id(), error = %err, "failed to clean up daemon process group");
            }
        }
        return Ok(status);
    }
    warn!(pid = child.id(), grace = ?grace, "daemon still running after grace period; killing");
    kill_tree(child, grouped).map_err(|err| SupervisorError::io("failed to kill daemon", err))?;
    match wait_until(child, Instant::now() + KILL_REAP_TIMEOUT)? {
        Some(status) => Ok(status),
        None => child
            .wait()
            .map_err(|err| SupervisorError::io("failed to reap daemon", err)),
    }
}

/// SIGKILL the daemon, and its whole process group when it leads one. Something that is
/// already gone is not an error.
pub(crate) fn kill_tree(child: &mut Child, grouped: bool) -> io::Result<()> {
    #[cfg(unix)]
    if grouped {
        use nix::{
            errno::Errno,
            sys::signal::{killpg, Signal},
            unistd::Pid,
        };

        let pgid = i32::try_from(child.id())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        return match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(io::Error::from(errno)),
        };
    }
    #[cfg(not(unix))]
    let _ = grouped;
    match child.kill() {
        // Exited between the last poll and the kill.
        Err(err) if err.kind() == io::ErrorKind::InvalidInput => Ok(()),
        other => other,
    }
}

fn wait_until(child: &mut Child, deadline: Instant) -> Result<Option<ExitStatus>, SupervisorError> {
    loop {
        if let Some(status) = child
            .try_wait()
            .map_err(|err| SupervisorError::io("failed to poll daemon", err))?
        {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(REAP_POLL);
    }
}
