//! Detach from the controlling terminal.
//!
//! Must run while the process is still single-threaded: before the tokio
//! runtime and any registry clock thread exist.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;

use anyhow::{Context, Result};
use nix::sys::stat::{umask, Mode};
use nix::unistd::{chdir, fork, setsid, ForkResult};

const DEV_NULL: &str = "/dev/null";

/// Fork into the background. The parent exits with status 0; the child
/// returns as a session leader in `/` with stdin on `/dev/null` and
/// stdout/stderr on `log_file` (or `/dev/null` if `None`).
pub fn daemonize(log_file: Option<&Path>) -> Result<()> {
    // SAFETY: called before any other thread is started.
    match unsafe { fork() }.context("fork()")? {
        ForkResult::Parent { child } => {
            tracing::info!(pid = child.as_raw(), "detached");
            std::process::exit(0);
        }
        ForkResult::Child => {}
    }

    umask(Mode::empty());

    let stdin = File::open(DEV_NULL).context("failed to open /dev/null")?;
    let out = open_sink(log_file)?;
    redirect(&stdin, libc::STDIN_FILENO).context("failed to redirect stdin")?;
    redirect(&out, libc::STDOUT_FILENO).context("failed to redirect stdout")?;
    redirect(&out, libc::STDERR_FILENO).context("failed to redirect stderr")?;

    setsid().context("setsid()")?;
    chdir("/").context("chdir(/)")?;
    Ok(())
}

/// Where stdout/stderr go once detached. A log file is truncated.
fn open_sink(log_file: Option<&Path>) -> Result<File> {
    match log_file {
        Some(path) => OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display())),
        None => OpenOptions::new()
            .write(true)
            .open(DEV_NULL)
            .context("failed to open /dev/null"),
    }
}

fn redirect(file: &File, target: libc::c_int) -> io::Result<()> {
    // SAFETY: both descriptors are valid for the duration of the call.
    if unsafe { libc::dup2(file.as_raw_fd(), target) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
