#![doc = include_str!("../README.md")]

mod child;
mod names;
mod parent;
mod pidfile;
mod registry;
mod utils;

use std::{
    collections::HashMap,
    io,
    ops::Deref,
    path::PathBuf,
    process::ExitStatus,
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, SyncSender},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use derive_more::{Display, From};

pub use crate::{names::DecodeError, parent::AdoptError, registry::Registry};

/// Time a forked successor gets to call [`Upgrader::ready`] before it is
/// killed and the attempt is reported as failed.
pub const DEFAULT_UPGRADE_TIMEOUT: Duration = Duration::from_secs(60);

/// Behaviour of the [`Upgrader`].
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Time after which an upgrade attempt is considered failed. Zero means
    /// [`DEFAULT_UPGRADE_TIMEOUT`].
    pub upgrade_timeout: Duration,
    /// The PID of the ready process is published here, if set.
    pub pid_file: Option<PathBuf>,
    /// Create listening sockets with `SO_REUSEADDR` and `SO_REUSEPORT`, and
    /// leave the listening fd inheritable across the exec so the kernel
    /// keeps the reuseport group together between generations.
    pub reuseport: bool,
}

#[derive(Debug, Display, From)]
pub enum InitError {
    #[display("only a single Upgrader allowed per process")]
    AlreadyRunning,
    #[display("couldn't determine initial working directory")]
    NoWorkingDirectory,
    #[display("{_0}")]
    #[from]
    Adopt(AdoptError),
}

impl std::error::Error for InitError {}

#[derive(Debug, Display, From)]
pub enum UpgradeError {
    #[display("process is not ready yet")]
    NotReady,
    #[display("parent hasn't exited")]
    ParentAlive,
    #[display("upgrade in progress")]
    InProgress,
    #[display("terminating")]
    Terminating,
    #[display("successor {_0} timed out")]
    TimedOut(u32),
    #[display("successor {pid} exited: {detail}")]
    ChildExited { pid: u32, detail: String },
    #[display("can't start successor: {_0}")]
    #[from]
    Io(io::Error),
}

impl std::error::Error for UpgradeError {}

/// Everything the controller thread and its producers share.
pub(crate) enum Event {
    ParentExited,
    Ready,
    Upgrade(SyncSender<Result<(), UpgradeError>>),
    Shutdown,
    ChildReady {
        attempt: u64,
        exit_pipe: os_pipe::PipeWriter,
    },
    ChildExited {
        attempt: u64,
        status: io::Result<ExitStatus>,
    },
}

// One controller per process, retained for the life of the process so the
// stashed name-pipe write end is never dropped early: its implicit close is
// the successor's signal that this generation has exited.
static CURRENT: Mutex<Option<Arc<Inner>>> = Mutex::new(None);

struct Inner {
    opts: Options,
    fds: Registry,
    parent: Option<parent::Parent>,
    events: SyncSender<Event>,
    ready_once: Mutex<bool>,
    exit: Arc<utils::Latch>,
    exit_fd: Mutex<Option<os_pipe::PipeWriter>>,
}

/// Coordinates zero-downtime swaps of the running binary.
///
/// There is at most one per process. On construction it detects whether
/// this process is itself a freshly exec'd successor and, if so, adopts the
/// previous generation's sockets; registry calls like
/// [`Registry::listen_tcp`] (available directly on the upgrader) then hand
/// those sockets back out by name.
///
/// Lifecycle of a generation: construct, claim or create sockets, call
/// [`Upgrader::ready`], serve. A later [`Upgrader::upgrade`] forks the
/// successor and blocks until it is ready or written off; on success the
/// [`Upgrader::exit`] handle fires and this process drains and leaves.
pub struct Upgrader {
    inner: Arc<Inner>,
}

impl Upgrader {
    /// Creates the process's upgrader. Only the first call in a process can
    /// succeed.
    pub fn new(opts: Options) -> Result<Upgrader, InitError> {
        let mut current = CURRENT.lock().unwrap();
        if current.is_some() {
            return Err(InitError::AlreadyRunning);
        }

        if utils::initial_working_dir().is_none() {
            return Err(InitError::NoWorkingDirectory);
        }
        let adopted = parent::find_parent()?;

        let upgrader = Upgrader::assemble(opts, adopted);
        *current = Some(upgrader.inner.clone());
        Ok(upgrader)
    }

    fn assemble(mut opts: Options, adopted: Option<parent::Adopted>) -> Upgrader {
        if opts.upgrade_timeout.is_zero() {
            opts.upgrade_timeout = DEFAULT_UPGRADE_TIMEOUT;
        }

        let (events, inbox) = mpsc::sync_channel(0);

        let (parent, inherited) = match adopted {
            Some(adopted) => {
                parent::spawn_exit_watcher(adopted.name_pipe, events.clone());
                (Some(adopted.parent), adopted.inherited)
            }
            None => (None, HashMap::new()),
        };
        let parent_alive = parent.is_some();

        let inner = Arc::new(Inner {
            fds: Registry::new(inherited, opts.reuseport),
            parent,
            events,
            ready_once: Mutex::new(false),
            exit: Arc::new(utils::Latch::new()),
            exit_fd: Mutex::new(None),
            opts,
        });

        let controller = inner.clone();
        thread::spawn(move || run(controller, inbox, parent_alive));

        Upgrader { inner }
    }

    /// Test construction that sidesteps the process-wide singleton.
    #[cfg(test)]
    fn new_detached(opts: Options, adopted: Option<parent::Adopted>) -> Upgrader {
        Upgrader::assemble(opts, adopted)
    }

    /// Declares this generation ready to serve. Must be called to finish an
    /// upgrade: the parent won't step down before it.
    ///
    /// The first call discards all inherited fds nothing claimed and lifts
    /// the gate on future upgrades. Every call rewrites the PID file (if
    /// one is configured) and then notifies the parent process, if any.
    pub fn ready(&self) -> io::Result<()> {
        {
            let mut done = self.inner.ready_once.lock().unwrap();
            if !*done {
                *done = true;
                self.inner.fds.close_inherited();
                let _ = self.inner.events.send(Event::Ready);
            }
        }

        self.write_pid_file()?;

        if let Some(parent) = &self.inner.parent {
            parent.send_ready()?;
        }
        Ok(())
    }

    /// Forks an exec'd successor, hands it the used fds and blocks until
    /// the attempt resolves.
    ///
    /// Fails immediately before [`Upgrader::ready`], while a previous
    /// generation is still alive, or while another upgrade is in flight; a
    /// successor that doesn't become ready within the configured timeout is
    /// killed and reported. On success the [`Upgrader::exit`] handle fires
    /// and this process should drain and terminate. Safe to call from any
    /// thread, including signal-driven ones.
    pub fn upgrade(&self) -> Result<(), UpgradeError> {
        if self.inner.exit.has_fired() {
            return Err(UpgradeError::Terminating);
        }
        let (reply, response) = mpsc::sync_channel(1);
        self.inner
            .events
            .send(Event::Upgrade(reply))
            .map_err(|_| UpgradeError::Terminating)?;
        response.recv().map_err(|_| UpgradeError::Terminating)?
    }

    /// Handle that fires exactly once, when this process should shut down:
    /// after a successful handoff, or after [`Upgrader::stop`].
    pub fn exit(&self) -> Exit {
        Exit {
            latch: self.inner.exit.clone(),
        }
    }

    /// Terminates this generation without upgrading: every registered fd is
    /// closed and the [`Upgrader::exit`] handle fires. An upgrade in flight
    /// is aborted and its successor killed.
    pub fn stop(&self) {
        let _ = self.inner.events.send(Event::Shutdown);
    }

    fn write_pid_file(&self) -> io::Result<()> {
        let Some(path) = &self.inner.opts.pid_file else {
            return Ok(());
        };
        let wd = utils::initial_working_dir().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no initial working directory")
        })?;
        pidfile::write_pid_file(path, wd)
    }
}

/// Socket registration happens directly on the upgrader.
impl Deref for Upgrader {
    type Target = Registry;

    fn deref(&self) -> &Registry {
        &self.inner.fds
    }
}

/// Cloneable handle on the process's termination signal.
#[derive(Clone)]
pub struct Exit {
    latch: Arc<utils::Latch>,
}

impl Exit {
    /// Blocks until the process should terminate.
    pub fn wait(&self) {
        self.latch.wait();
    }

    /// Like [`Exit::wait`], but gives up after `timeout`. Returns whether
    /// the signal fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.latch.wait_timeout(timeout)
    }

    pub fn has_fired(&self) -> bool {
        self.latch.has_fired()
    }
}

fn run(inner: Arc<Inner>, inbox: Receiver<Event>, parent_alive: bool) {
    run_loop(&inner, &inbox, parent_alive);
    inner.exit.release();
}

/// The controller: sole owner of the upgrade state machine. Everything else
/// (readiness, the parent watcher, upgrade requests, the per-child helper
/// threads) reports in through the inbox.
fn run_loop(inner: &Inner, inbox: &Receiver<Event>, mut parent_alive: bool) {
    let mut ready = false;
    let mut attempt: u64 = 0;

    loop {
        let event = match inbox.recv() {
            Ok(event) => event,
            Err(_) => return,
        };

        match event {
            Event::ParentExited => parent_alive = false,
            Event::Ready => ready = true,
            Event::Shutdown => {
                inner.fds.close_used();
                return;
            }
            // Stragglers from an attempt that was already written off.
            Event::ChildReady { .. } | Event::ChildExited { .. } => {}
            Event::Upgrade(reply) => {
                if !ready {
                    let _ = reply.send(Err(UpgradeError::NotReady));
                    continue;
                }
                if parent_alive {
                    let _ = reply.send(Err(UpgradeError::ParentAlive));
                    continue;
                }

                attempt += 1;
                match do_upgrade(inner, inbox, attempt) {
                    Outcome::Ready(exit_pipe) => {
                        let _ = reply.send(Ok(()));
                        // Held until the process dies; the close the OS then
                        // performs is what tells the successor its parent is
                        // gone.
                        *inner.exit_fd.lock().unwrap() = Some(exit_pipe);
                        inner.fds.close_used();
                        return;
                    }
                    Outcome::Failed(err) => {
                        log::warn!("upgrade failed: {err}");
                        let _ = reply.send(Err(err));
                        // Point tooling back at the process that is still
                        // serving; nothing to do about a failure here.
                        if let (Some(path), Some(wd)) =
                            (&inner.opts.pid_file, utils::initial_working_dir())
                        {
                            let _ = pidfile::write_pid_file(path, wd);
                        }
                    }
                    Outcome::Terminated(err) => {
                        let _ = reply.send(Err(err));
                        inner.fds.close_used();
                        return;
                    }
                }
            }
        }
    }
}

enum Outcome {
    /// The successor took over; retain the name pipe's write end.
    Ready(os_pipe::PipeWriter),
    /// The attempt failed; this generation keeps serving.
    Failed(UpgradeError),
    /// Shutdown was requested mid-attempt; stop serving too.
    Terminated(UpgradeError),
}

/// A single upgrade attempt: fork the successor, then wait out the race
/// between its readiness, its death, the timeout and a shutdown request.
/// Upgrade requests arriving meanwhile are refused without disturbing the
/// attempt.
fn do_upgrade(inner: &Inner, inbox: &Receiver<Event>, attempt: u64) -> Outcome {
    let snapshot = inner.fds.snapshot();
    let child = match child::fork_child(snapshot, inner.events.clone(), attempt) {
        Ok(child) => child,
        Err(e) => return Outcome::Failed(UpgradeError::Io(e)),
    };
    log::warn!("starting upgrade, successor is {}", child.pid());

    let deadline = Instant::now() + inner.opts.upgrade_timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let event = match inbox.recv_timeout(remaining) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => {
                let _ = child.kill();
                return Outcome::Failed(UpgradeError::TimedOut(child.pid()));
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = child.kill();
                return Outcome::Terminated(UpgradeError::Terminating);
            }
        };

        match event {
            Event::Upgrade(other) => {
                let _ = other.send(Err(UpgradeError::InProgress));
            }
            Event::Shutdown => {
                let _ = child.kill();
                return Outcome::Terminated(UpgradeError::Terminating);
            }
            Event::ChildExited { attempt: a, status } if a == attempt => {
                let detail = match status {
                    Ok(status) => status.to_string(),
                    Err(e) => e.to_string(),
                };
                return Outcome::Failed(UpgradeError::ChildExited {
                    pid: child.pid(),
                    detail,
                });
            }
            Event::ChildReady { attempt: a, exit_pipe } if a == attempt => {
                return Outcome::Ready(exit_pipe);
            }
            // Earlier attempts reporting late, and states that can no
            // longer change mid-attempt.
            Event::ChildExited { .. } | Event::ChildReady { .. } => {}
            Event::ParentExited | Event::Ready => {}
        }
    }
}
