//! Pseudo-terminal allocation and worker spawn.
//!
//! The worker gets the PTY slave as stdin/stdout and its controlling
//! terminal, while stderr stays a separate pipe so crash markers can be read
//! independently of the screen output. The master is non-blocking and driven
//! through tokio's `AsyncFd`.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::unix::AsyncFd;
use tokio::process::{Child, ChildStderr, Command};
use tracing::info;
use ttycast_core::{CastError, CastResult};

/// Everything needed to launch one worker.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Whitelisted environment; nothing else is inherited.
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub cols: u16,
    pub rows: u16,
}

/// A spawned worker and the broker's ends of its I/O.
pub struct SpawnedWorker {
    pub child: Child,
    pub pid: u32,
    pub master: AsyncFd<OwnedFd>,
    pub stderr: ChildStderr,
}

struct PtyPair {
    master: OwnedFd,
    slave: OwnedFd,
}

fn open_pty(cols: u16, rows: u16) -> io::Result<PtyPair> {
    let mut master: libc::c_int = -1;
    let mut slave: libc::c_int = -1;
    let mut size = libc::winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    // SAFETY: all pointers are valid for the duration of the call; name and
    // termios are optional and passed as null.
    let rc = unsafe {
        libc::openpty(
            &mut master,
            &mut slave,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            &mut size,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: openpty succeeded, so both descriptors are open and owned by us.
    let pair = unsafe {
        PtyPair {
            master: OwnedFd::from_raw_fd(master),
            slave: OwnedFd::from_raw_fd(slave),
        }
    };
    set_nonblocking_cloexec(pair.master.as_raw_fd())?;
    Ok(pair)
}

fn set_nonblocking_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Highest descriptor number worth marking close-on-exec in the child.
fn max_inherited_fd() -> libc::c_int {
    // SAFETY: sysconf has no preconditions.
    let max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    if max <= 0 {
        1024
    } else {
        max.min(65_536) as libc::c_int
    }
}

/// Spawn a worker on a fresh PTY.
pub fn spawn(spec: &SpawnSpec) -> CastResult<SpawnedWorker> {
    let pair = open_pty(spec.cols, spec.rows)
        .map_err(|e| CastError::Spawn(format!("failed to open PTY: {e}")))?;
    let stdin = pair
        .slave
        .try_clone()
        .map_err(|e| CastError::Spawn(format!("failed to dup PTY slave: {e}")))?;

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .env_clear()
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .env("COLUMNS", spec.cols.to_string())
        .env("LINES", spec.rows.to_string())
        .env("TERM", "linux")
        .stdin(Stdio::from(stdin))
        .stdout(Stdio::from(pair.slave))
        .stderr(Stdio::piped());
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }

    let max_fd = max_inherited_fd();
    // SAFETY: the closure only calls async-signal-safe functions.
    unsafe {
        cmd.pre_exec(move || {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            if libc::ioctl(0, libc::TIOCSCTTY as _, 0) == -1 {
                return Err(io::Error::last_os_error());
            }
            for fd in 3..max_fd {
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(|e| {
        CastError::Spawn(format!("failed to spawn {}: {e}", spec.program.display()))
    })?;
    // The slave ends were moved into `cmd`; dropping it closes our copies so
    // the master sees EOF/EIO once the worker exits.
    drop(cmd);

    let pid = child
        .id()
        .ok_or_else(|| CastError::Spawn("worker exited before its pid was read".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| CastError::Spawn("worker stderr not captured".into()))?;
    let master = AsyncFd::new(pair.master)
        .map_err(|e| CastError::Spawn(format!("failed to register PTY master: {e}")))?;

    info!(
        pid,
        program = %spec.program.display(),
        cols = spec.cols,
        rows = spec.rows,
        "worker spawned"
    );

    Ok(SpawnedWorker {
        child,
        pid,
        master,
        stderr,
    })
}

/// Non-blocking read from the PTY master.
pub fn read_master(fd: &OwnedFd, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: buf is valid for writes of buf.len() bytes.
    let n = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Non-blocking write to the PTY master; may write fewer bytes than given.
pub fn write_master(fd: &OwnedFd, data: &[u8]) -> io::Result<usize> {
    // SAFETY: data is valid for reads of data.len() bytes.
    let n = unsafe { libc::write(fd.as_raw_fd(), data.as_ptr().cast(), data.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// EIO on the master means the slave side has been closed.
pub fn is_hangup(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EIO)
}
