use std::{
    env,
    io::{self, Read},
    os::fd::{AsRawFd, RawFd},
    os::unix::process::CommandExt,
    process::Command,
    sync::mpsc::{self, SyncSender},
    thread,
};

use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};

use crate::{
    names,
    parent::{NOTIFY_READY, SENTINEL_ENV, SENTINEL_VALUE},
    utils::{initial_working_dir, remap_fds},
    Event,
};

/// A forked successor. Its readiness, exit status and the retained name
/// pipe all arrive through the controller's event inbox; the handle itself
/// only knows how to identify and kill the process.
pub(crate) struct Child {
    pid: u32,
}

impl Child {
    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    /// No grace period: this is only called once the upgrade has already
    /// failed.
    pub(crate) fn kill(&self) -> io::Result<()> {
        kill(Pid::from_raw(self.pid as i32), Signal::SIGKILL)
            .map_err(|e| io::Error::from_raw_os_error(e as i32))
    }
}

/// Forks and execs a successor from our own invocation: same executable,
/// same arguments, the initial working directory, inherited stdio, plus the
/// sentinel env var and the handover fds.
///
/// The handover reaches the child as extra open files on fixed positions:
/// fd 3 the readiness pipe's write end, fd 4 the name pipe's read end, fds
/// 5.. the `handoff` entries in order. Their names go out on the name pipe
/// in that same order (an empty handover still sends a valid empty list).
///
/// Returns as soon as the child is spawned. Three helper threads deliver
/// the rest asynchronously, each tagged with `attempt` so the controller
/// can discard reports from attempts it has already written off:
/// one encodes the names, one watches for the readiness byte and passes the
/// name pipe's write end on, one reaps the process and reports its exit.
/// Child death unblocks the other two through EOF and EPIPE.
pub(crate) fn fork_child(
    handoff: Vec<(String, RawFd)>,
    events: SyncSender<Event>,
    attempt: u64,
) -> io::Result<Child> {
    let (mut ready_read, ready_write) = os_pipe::pipe()?;
    let (name_read, mut name_write) = os_pipe::pipe()?;

    let mut names = Vec::with_capacity(handoff.len());
    let mut sources = Vec::with_capacity(handoff.len() + 2);
    sources.push(ready_write.as_raw_fd());
    sources.push(name_read.as_raw_fd());
    for (name, fd) in handoff {
        names.push(name);
        sources.push(fd);
    }

    let mut argv = env::args_os();
    let exe = argv
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "empty argv"))?;
    let cwd = initial_working_dir()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no initial working directory"))?;

    let mut cmd = Command::new(&exe);
    cmd.args(argv)
        .current_dir(cwd)
        .env(SENTINEL_ENV, SENTINEL_VALUE);

    // Runs in the forked child before exec, so it is restricted to
    // fcntl/dup2 on buffers allocated out here.
    let mut scratch = vec![0 as RawFd; sources.len()];
    unsafe {
        cmd.pre_exec(move || remap_fds(&sources, &mut scratch));
    }

    let mut proc = cmd.spawn()?;
    let pid = proc.id();
    log::debug!("spawned successor {pid} with {} handover fds", names.len());

    // Our copies of the child's ends; the child has its own by now.
    drop(ready_write);
    drop(name_read);

    // The name pipe's write end outlives the encoding: once the child is
    // ready it is parked here for the controller to retain until process
    // exit, whose implicit close tells the successor we are gone.
    let (park, claim) = mpsc::sync_channel(1);
    thread::spawn(move || match names::encode_names(&mut name_write, &names) {
        Ok(()) => {
            let _ = park.send(name_write);
        }
        Err(e) => log::warn!("can't send fd names to successor {pid}: {e}"),
    });

    let ready_events = events.clone();
    thread::spawn(move || {
        let mut byte = [0u8; 1];
        match ready_read.read(&mut byte) {
            Ok(1) if byte[0] == NOTIFY_READY => {
                // Readiness implies the child decoded the name list, so the
                // encoder has finished and parked the pipe.
                if let Ok(exit_pipe) = claim.recv() {
                    let _ = ready_events.send(Event::ChildReady { attempt, exit_pipe });
                }
            }
            // Anything else means the child died or wrote garbage; the
            // reaper reports the details.
            _ => {}
        }
    });

    thread::spawn(move || {
        let status = proc.wait();
        let _ = events.send(Event::ChildExited { attempt, status });
    });

    Ok(Child { pid })
}
