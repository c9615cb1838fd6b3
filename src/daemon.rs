//! Detach from the controlling terminal.
//!
//! Must run before any other thread is started: only the calling thread
//! survives `fork`.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::AsRawFd;

/// Fork, let the parent exit, start a new session in the child, move to `/`
/// and point stdin/stdout/stderr at `/dev/null`.
pub fn daemonize() -> io::Result<()> {
    // SAFETY: no other threads exist yet, so the child inherits a consistent
    // address space.
    match unsafe { libc::fork() } {
        -1 => return Err(io::Error::last_os_error()),
        0 => {}
        _ => std::process::exit(0),
    }

    // SAFETY: plain syscall with no pointer arguments.
    if unsafe { libc::setsid() } < 0 {
        return Err(io::Error::last_os_error());
    }

    std::env::set_current_dir("/")?;

    let devnull = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        // SAFETY: both descriptors are valid for the duration of the call.
        if unsafe { libc::dup2(devnull.as_raw_fd(), target) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(())
}
