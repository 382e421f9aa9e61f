use std::{
    env, io,
    os::fd::{FromRawFd, OwnedFd, RawFd},
    path::{Path, PathBuf},
    sync::{Condvar, Mutex, OnceLock},
    time::{Duration, Instant},
};

use nix::{
    fcntl::{fcntl, FcntlArg, FdFlag},
    unistd::dup2,
};

fn errno(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

pub(crate) fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFD).map_err(errno)?;
    let flags = FdFlag::from_bits_retain(flags) | FdFlag::FD_CLOEXEC;
    fcntl(fd, FcntlArg::F_SETFD(flags)).map_err(errno)?;
    Ok(())
}

/// Duplicates `fd` with close-on-exec set, landing above the stdio range.
pub(crate) fn dup_cloexec(fd: RawFd) -> io::Result<OwnedFd> {
    let new = fcntl(fd, FcntlArg::F_DUPFD_CLOEXEC(3)).map_err(errno)?;
    Ok(unsafe { OwnedFd::from_raw_fd(new) })
}

/// Moves `sources` onto the contiguous fd range starting at 3, in order.
///
/// Runs between fork and exec, so only fcntl/dup2 are allowed and `scratch`
/// must be preallocated by the caller (same length as `sources`). Every
/// source is first duplicated above the target range so a source sitting on
/// a target slot is never clobbered; the dup2 copies lose close-on-exec and
/// survive the exec, the scratch copies keep it and die with it.
pub(crate) fn remap_fds(sources: &[RawFd], scratch: &mut [RawFd]) -> io::Result<()> {
    const BASE: RawFd = 3;
    let ceiling = BASE + sources.len() as RawFd;

    for (i, &fd) in sources.iter().enumerate() {
        scratch[i] = fcntl(fd, FcntlArg::F_DUPFD_CLOEXEC(ceiling)).map_err(errno)?;
    }
    for (i, &fd) in scratch.iter().enumerate() {
        dup2(fd, BASE + i as RawFd).map_err(errno)?;
    }
    Ok(())
}

/// The working directory the process started in, captured on first use.
///
/// A successor may be exec'd after the application has chdir'd somewhere
/// else, so both the child launcher and the PID file writer anchor on this
/// instead of the current directory. Callers must touch it before any
/// chdir; `Upgrader::new` does.
pub(crate) fn initial_working_dir() -> Option<&'static Path> {
    static INITIAL_WD: OnceLock<Option<PathBuf>> = OnceLock::new();
    INITIAL_WD.get_or_init(|| env::current_dir().ok()).as_deref()
}

/// One-shot gate: released exactly once, observable by any number of
/// waiters.
pub(crate) struct Latch {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    pub(crate) fn new() -> Self {
        Self {
            fired: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn release(&self) {
        *self.fired.lock().unwrap() = true;
        self.cond.notify_all();
    }

    pub(crate) fn has_fired(&self) -> bool {
        *self.fired.lock().unwrap()
    }

    pub(crate) fn wait(&self) {
        let mut fired = self.fired.lock().unwrap();
        while !*fired {
            fired = self.cond.wait(fired).unwrap();
        }
    }

    /// Returns true if the latch fired before the timeout.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut fired = self.fired.lock().unwrap();
        while !*fired {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.cond.wait_timeout(fired, deadline - now).unwrap();
            fired = guard;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::{os::fd::AsRawFd, sync::Arc, thread};

    use super::*;

    fn cloexec(fd: RawFd) -> bool {
        let flags = fcntl(fd, FcntlArg::F_GETFD).unwrap();
        FdFlag::from_bits_retain(flags).contains(FdFlag::FD_CLOEXEC)
    }

    #[test]
    fn dup_cloexec_sets_the_flag() {
        let (reader, _writer) = os_pipe::pipe().unwrap();
        let dup = dup_cloexec(reader.as_raw_fd()).unwrap();
        assert!(cloexec(dup.as_raw_fd()));
        assert_ne!(dup.as_raw_fd(), reader.as_raw_fd());
    }

    #[test]
    fn set_cloexec_is_idempotent() {
        let (reader, _writer) = os_pipe::pipe().unwrap();
        set_cloexec(reader.as_raw_fd()).unwrap();
        set_cloexec(reader.as_raw_fd()).unwrap();
        assert!(cloexec(reader.as_raw_fd()));
    }

    #[test]
    fn latch_fires_once_for_all_waiters() {
        let latch = Arc::new(Latch::new());
        assert!(!latch.has_fired());
        assert!(!latch.wait_timeout(Duration::from_millis(10)));

        let waiter = {
            let latch = latch.clone();
            thread::spawn(move || latch.wait_timeout(Duration::from_secs(5)))
        };
        latch.release();
        assert!(waiter.join().unwrap());
        assert!(latch.has_fired());
        assert!(latch.wait_timeout(Duration::from_millis(1)));
    }
}
