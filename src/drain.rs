//! The background worker that moves trace bytes out of the AUX ring.
//!
//! One drain thread exists per trace session. It maps the ring, releases
//! the controller blocked in `start()`, then sleeps in `poll(2)` until the
//! kernel signals data (or hangs up) or the controller closes its end of
//! the cancellation pipe. Every wake drains first and checks for
//! termination second, so bytes produced ahead of a shutdown are never
//! lost.

use std::fs::File;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::perf::PtEvent;
use crate::ring::AuxRing;

/// Everything the drain thread owns for the life of the session.
pub(crate) struct DrainTask {
    pub event: Arc<PtEvent>,

    /// Read end of the cancellation pipe. It never carries data; the
    /// controller closing the write end is the sole cancellation trigger,
    /// observed here as a hang-up.
    pub cancel: OwnedFd,

    pub out: Arc<File>,

    pub data_pages: usize,
    pub aux_pages: usize,
}

/// Drain thread body.
///
/// `ready` is the one-shot handshake with `start()`: posted exactly once,
/// on success and on failure alike, so the controller never hangs. `true`
/// means the ring is mapped and the hardware may be enabled.
pub(crate) fn run(task: DrainTask, ready: Sender<bool>) -> Result<()> {
    let ring = match AuxRing::map(&task.event, task.data_pages, task.aux_pages) {
        Ok(ring) => {
            let _ = ready.send(true);
            ring
        }
        Err(err) => {
            let _ = ready.send(false);
            return Err(err);
        }
    };

    let mut wakes = 0usize;
    let res = drain_loop(&task, &ring, &mut wakes);

    debug!(wakes, ok = res.is_ok(), "drain loop exited");

    res
}

fn drain_loop(task: &DrainTask, ring: &AuxRing, wakes: &mut usize) -> Result<()> {
    let mut out = &*task.out;

    loop {
        let mut fds = [
            PollFd::new(task.event.as_fd(), PollFlags::POLLIN | PollFlags::POLLHUP),
            PollFd::new(task.cancel.as_fd(), PollFlags::POLLHUP),
        ];

        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(source) => return Err(Error::Wait { source }),
        }
        *wakes += 1;

        let data = fds[0].revents().unwrap_or(PollFlags::empty());
        let cancel = fds[1].revents().unwrap_or(PollFlags::empty());

        // Drain before acting on termination: bytes produced ahead of a
        // cancellation or hang-up must still reach the output file.
        let moved = ring.drain_into(&mut out)?;
        trace!(moved, "drained aux bytes");

        if cancel.contains(PollFlags::POLLHUP) || data.contains(PollFlags::POLLHUP) {
            return Ok(());
        }
    }
}
