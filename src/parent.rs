use std::{
    collections::HashMap,
    env,
    io::{self, Read, Write},
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    sync::{mpsc::SyncSender, Mutex},
    thread,
};

use derive_more::{Display, From};

use crate::{names, utils::set_cloexec, Event};

/// Set (to a non-empty value) in a successor's environment. The exact
/// spelling is part of the handover protocol and shared with already
/// deployed binaries, so it never changes.
pub(crate) const SENTINEL_ENV: &str = "TABLEFLIP_HAS_PARENT_7DIU3";
pub(crate) const SENTINEL_VALUE: &str = "yes";

/// The one byte a successor writes on the readiness pipe.
pub(crate) const NOTIFY_READY: u8 = 42;

/// Fixed fd positions a successor finds its handover on: the readiness
/// pipe's write end, the name pipe's read end, then the inherited fds in
/// name-list order.
const READY_PIPE_FD: RawFd = 3;
const NAME_PIPE_FD: RawFd = 4;
const INHERITED_FD_START: RawFd = 5;

#[derive(Debug, Display, From)]
pub enum AdoptError {
    #[display("can't decode fd names from parent: {_0}")]
    #[from]
    Names(names::DecodeError),
    #[display("parent handed over duplicate fd name {_0:?}")]
    DuplicateName(String),
    #[display("can't flag inherited fd: {_0}")]
    #[from]
    Flags(io::Error),
}

impl std::error::Error for AdoptError {}

/// Handle on the previous generation, present only in a successor.
pub(crate) struct Parent {
    ready_pipe: Mutex<Option<os_pipe::PipeWriter>>,
}

/// Everything recovered from the environment at successor startup.
pub(crate) struct Adopted {
    pub(crate) parent: Parent,
    pub(crate) name_pipe: os_pipe::PipeReader,
    pub(crate) inherited: HashMap<String, OwnedFd>,
}

impl Parent {
    pub(crate) fn new(ready_pipe: os_pipe::PipeWriter) -> Self {
        Self {
            ready_pipe: Mutex::new(Some(ready_pipe)),
        }
    }

    /// Tells the parent we are serving: one readiness byte, then close our
    /// end of the pipe. Both are one-shot; later calls do nothing.
    pub(crate) fn send_ready(&self) -> io::Result<()> {
        if let Some(mut pipe) = self.ready_pipe.lock().unwrap().take() {
            pipe.write_all(&[NOTIFY_READY])?;
        }
        Ok(())
    }
}

/// Detects whether this process was launched as a successor and, if so,
/// recovers the handover: the readiness pipe, the name pipe, and the
/// inherited fds keyed by the names announced on the name pipe.
pub(crate) fn find_parent() -> Result<Option<Adopted>, AdoptError> {
    match env::var_os(SENTINEL_ENV) {
        Some(value) if !value.is_empty() => {}
        _ => return Ok(None),
    }

    // The handover contract owns fds 3 and 4 at this point; nothing else in
    // the process has touched them yet.
    let ready_pipe = unsafe { os_pipe::PipeWriter::from_raw_fd(READY_PIPE_FD) };
    let mut name_pipe = unsafe { os_pipe::PipeReader::from_raw_fd(NAME_PIPE_FD) };

    let names = names::decode_names(&mut name_pipe)?;
    log::info!("adopting {} fds handed over by the parent", names.len());

    let mut inherited = HashMap::with_capacity(names.len());
    for (i, name) in names.into_iter().enumerate() {
        // Take ownership of the fd before anything can fail, so every
        // bail-out below closes it along with the entries already in the
        // map.
        let fd = unsafe { OwnedFd::from_raw_fd(INHERITED_FD_START + i as RawFd) };
        // Inherited fds arrive without close-on-exec (they had to survive
        // the exec); reinstate it so they can't leak into unrelated
        // children. The next handover's launcher clears it again on the
        // child side only.
        set_cloexec(fd.as_raw_fd())?;
        if inherited.contains_key(&name) {
            return Err(AdoptError::DuplicateName(name));
        }
        inherited.insert(name, fd);
    }

    Ok(Some(Adopted {
        parent: Parent::new(ready_pipe),
        name_pipe,
        inherited,
    }))
}

/// Drains the name pipe until the parent's write end closes, which can only
/// mean the parent process is gone, then tells the controller. The read end
/// is closed on the way out.
pub(crate) fn spawn_exit_watcher(mut name_pipe: os_pipe::PipeReader, events: SyncSender<Event>) {
    thread::spawn(move || {
        let mut sink = [0u8; 256];
        loop {
            match name_pipe.read(&mut sink) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
        drop(name_pipe);
        log::info!("parent process has exited");
        let _ = events.send(Event::ParentExited);
    });
}
