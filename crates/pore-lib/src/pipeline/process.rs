use super::{PipelineError, WorkerRequest};
use log::{debug, info, warn};
use std::ffi::OsString;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How to launch the detector process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// The running executable's own `detect-worker` subcommand.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?).arg("detect-worker"))
    }
}

/// Spawn the worker and keep only the read end of its stdout.
///
/// The request is written to the worker's stdin from a detached writer thread,
/// which closes stdin when done. A worker that never reads only blocks that thread.
pub(crate) fn spawn(
    command: &WorkerCommand,
    request: &WorkerRequest,
) -> Result<(Child, ChildStdout), PipelineError> {
    let payload = serde_json::to_vec(request)?;
    let mut child = Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|source| PipelineError::Spawn {
            program: command.program.clone(),
            source,
        })?;
    info!(
        "Spawned detector {} (pid {})",
        command.program.display(),
        child.id()
    );

    if let Some(mut stdin) = child.stdin.take() {
        let writer = std::thread::Builder::new()
            .name("pore-request".into())
            .spawn(move || match stdin.write_all(&payload) {
                Ok(()) => debug!("request of {} bytes sent to detector", payload.len()),
                // The worker exited without reading; its exit status tells the rest.
                Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                    debug!("detector closed stdin before reading the request");
                }
                Err(err) => warn!("failed to send request to detector: {}", err),
            });
        if let Err(err) = writer {
            let _ = terminate(&mut child, Duration::ZERO);
            return Err(err.into());
        }
    }

    let Some(stdout) = child.stdout.take() else {
        let _ = terminate(&mut child, Duration::ZERO);
        return Err(PipelineError::Io(io::Error::new(
            io::ErrorKind::Other,
            "detector stdout was not captured",
        )));
    };
    Ok((child, stdout))
}

fn wait_until(child: &mut Child, deadline: Instant) -> io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Send SIGTERM without waiting. A no-op where there are no signals.
pub(crate) fn request_stop(child: &Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let pid = Pid::from_raw(child.id() as i32);
        if let Err(err) = kill(pid, Signal::SIGTERM) {
            debug!("SIGTERM to {} failed: {}", pid, err);
        }
    }
    #[cfg(not(unix))]
    let _ = child;
}

/// Hard-kill the worker and reap it.
pub(crate) fn kill(child: &mut Child) -> io::Result<ExitStatus> {
    if let Err(err) = child.kill() {
        // InvalidInput means it exited in the meantime
        if err.kind() != io::ErrorKind::InvalidInput {
            return Err(err);
        }
    }
    child.wait()
}

/// Ask the worker to stop, escalating to a hard kill after `grace`, and reap it.
pub(crate) fn terminate(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }
    request_stop(child);
    if let Some(status) = wait_until(child, Instant::now() + grace)? {
        debug!("detector {} exited after terminate: {}", child.id(), status);
        return Ok(status);
    }
    warn!(
        "detector {} ignored termination for {:?}; killing",
        child.id(),
        grace
    );
    kill(child)
}
