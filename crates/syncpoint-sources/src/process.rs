use std::io::Read;
use std::os::fd::{AsRawFd, RawFd};
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};

use syncpoint_engine::{Deferred, Firing, Interest, IoToken, Source, SourceCtx, from_source};
use syncpoint_types::{ErrorKind, Failure};
use tracing::debug;

/// Captured outcome of a finished external process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
}

/// Runs `command` under the barrier's event loop, capturing its stdout.
///
/// The stdout pipe is read non-blockingly as it becomes readable and the
/// exit is observed through a process-exit watch; the deferred fulfils once
/// both have completed. A non-zero exit still fulfils; callers inspect
/// [`ProcessOutput::status`]. Cancellation kills and reaps the process.
pub fn run_command(command: Command) -> Deferred<ProcessOutput> {
    from_source(ProcessSource {
        command: Some(command),
        child: None,
        stdout: None,
        io_token: None,
        buf: Vec::new(),
        eof: false,
        status: None,
    })
}

struct ProcessSource {
    command: Option<Command>,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    io_token: Option<IoToken>,
    buf: Vec<u8>,
    eof: bool,
    status: Option<ExitStatus>,
}

impl ProcessSource {
    fn kill_child(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    /// Reads whatever the pipe holds. Sets `eof` at end of stream; leaves
    /// the watch armed otherwise.
    fn drain_stdout(&mut self, ctx: &mut SourceCtx<'_>) {
        let Some(stdout) = self.stdout.as_mut() else {
            return;
        };
        let mut chunk = [0_u8; 4096];
        loop {
            match stdout.read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    if let Some(token) = self.io_token.take() {
                        ctx.cancel_io(token);
                    }
                    return;
                }
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    ctx.reject(Failure::new(
                        ErrorKind::User,
                        format!("failed to read process stdout: {err}"),
                    ));
                    self.kill_child();
                    return;
                }
            }
        }
    }

    fn try_finish(&mut self, ctx: &mut SourceCtx<'_>) {
        if self.eof
            && let Some(status) = self.status
        {
            ctx.fulfil(ProcessOutput {
                status,
                stdout: std::mem::take(&mut self.buf),
            });
        }
    }
}

impl Source for ProcessSource {
    fn start(&mut self, ctx: &mut SourceCtx<'_>) {
        let Some(mut command) = self.command.take() else {
            return;
        };
        command.stdin(Stdio::null()).stdout(Stdio::piped());
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                ctx.reject(Failure::new(
                    ErrorKind::User,
                    format!("failed to spawn process: {err}"),
                ));
                return;
            }
        };
        let Some(stdout) = child.stdout.take() else {
            ctx.reject(Failure::new(
                ErrorKind::User,
                "spawned process has no stdout pipe",
            ));
            self.child = Some(child);
            self.kill_child();
            return;
        };

        if let Err(err) = set_nonblocking(stdout.as_raw_fd()) {
            ctx.reject(Failure::new(
                ErrorKind::User,
                format!("failed to prepare stdout pipe: {err}"),
            ));
            self.child = Some(child);
            self.kill_child();
            return;
        }
        match ctx.register_io(stdout.as_raw_fd(), Interest::Readable) {
            Ok(token) => self.io_token = Some(token),
            Err(err) => {
                ctx.reject(Failure::new(
                    ErrorKind::User,
                    format!("failed to watch stdout pipe: {err}"),
                ));
                self.child = Some(child);
                self.kill_child();
                return;
            }
        }
        if let Err(err) = ctx.register_wait(child.id()) {
            ctx.reject(Failure::new(
                ErrorKind::User,
                format!("failed to watch process exit: {err}"),
            ));
            self.child = Some(child);
            self.kill_child();
            return;
        }

        debug!(pid = child.id(), "spawned external process");
        self.stdout = Some(stdout);
        self.child = Some(child);
    }

    fn on_ready(&mut self, firing: Firing, ctx: &mut SourceCtx<'_>) {
        match firing {
            Firing::Io { .. } => self.drain_stdout(ctx),
            Firing::ProcessExit(_) => {
                if let Some(child) = self.child.as_mut() {
                    match child.wait() {
                        Ok(status) => self.status = Some(status),
                        Err(err) => {
                            ctx.reject(Failure::new(
                                ErrorKind::User,
                                format!("failed to reap process: {err}"),
                            ));
                            return;
                        }
                    }
                }
                // Exit closed the write side; what remains in the pipe now
                // ends with EOF.
                self.drain_stdout(ctx);
            }
            Firing::Timer(_) => {}
        }
        self.try_finish(ctx);
    }

    fn abort(&mut self, _ctx: &mut SourceCtx<'_>) {
        self.kill_child();
    }
}

fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
