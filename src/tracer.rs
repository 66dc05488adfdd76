//! Trace session lifecycle: ordered, all-or-nothing resource acquisition
//! in [`TraceSession::start`], best-effort teardown in
//! [`TraceSession::stop`].
//!
//! A session involves exactly two threads: the caller's, which sets
//! resources up and later tears them down, and the drain thread of
//! [`crate::drain`]. The one-shot handshake in `start` guarantees the ring
//! buffers are mapped before the hardware is enabled or a session is
//! returned; cancel-then-join in `stop` guarantees the drain thread has
//! exited and unmapped before the shared descriptors are closed.

use std::fs::{File, OpenOptions};
use std::os::fd::{IntoRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use nix::unistd;
use tracing::{debug, warn};

use crate::drain::{self, DrainTask};
use crate::error::{Error, Result};
use crate::maps;
use crate::perf::PtEvent;

pub use nix::unistd::Pid;

/// Default data-region size, in pages. The region itself is unused by the
/// tracer, but the mapping contract requires it; keep it small.
pub const DEFAULT_DATA_PAGES: usize = 64;

/// Default AUX (trace packet) region size, in pages. PT produces packets
/// far faster than a disk accepts them, so the default is generous.
pub const DEFAULT_AUX_PAGES: usize = 1024;

/// Configuration of one trace run, consumed by [`TraceSession::start`].
#[derive(Clone, Debug)]
pub struct TraceConfig {
    pid: Pid,
    trace_path: PathBuf,
    maps_path: PathBuf,
    data_pages: usize,
    aux_pages: usize,
}

impl TraceConfig {
    /// Configure tracing of `pid`, writing trace packets to `trace_path`
    /// and the memory-map snapshot to `maps_path`.
    ///
    /// Neither output path may already exist.
    pub fn new(pid: Pid, trace_path: impl Into<PathBuf>, maps_path: impl Into<PathBuf>) -> Self {
        Self {
            pid,
            trace_path: trace_path.into(),
            maps_path: maps_path.into(),
            data_pages: DEFAULT_DATA_PAGES,
            aux_pages: DEFAULT_AUX_PAGES,
        }
    }

    /// Set the data-region size in pages. Must be a nonzero power of two.
    pub fn data_pages(mut self, pages: usize) -> Self {
        self.data_pages = pages;
        self
    }

    /// Set the AUX-region size in pages. Must be a nonzero power of two.
    /// A larger region tolerates longer stalls of the drain thread before
    /// the hardware runs out of ring space.
    pub fn aux_pages(mut self, pages: usize) -> Self {
        self.aux_pages = pages;
        self
    }

    fn validate(&self) -> Result<()> {
        if !self.data_pages.is_power_of_two() {
            return Err(Error::Config {
                reason: "data-region pages must be a nonzero power of two",
            });
        }
        if !self.aux_pages.is_power_of_two() {
            return Err(Error::Config {
                reason: "aux-region pages must be a nonzero power of two",
            });
        }
        Ok(())
    }
}

/// A running trace session.
///
/// Exists only between a successful [`start`](TraceSession::start) and the
/// [`stop`](TraceSession::stop) that consumes it, so a session can neither
/// be stopped twice nor stopped without having started. Dropping a session
/// without stopping it tears it down best-effort, reporting failures only
/// to the log.
#[derive(Debug)]
pub struct TraceSession {
    inner: Option<Inner>,
}

#[derive(Debug)]
struct Inner {
    event: Arc<PtEvent>,

    /// Write end of the cancellation pipe; closing it is the sole stop
    /// signal the drain thread observes.
    cancel: OwnedFd,

    out: Arc<File>,

    drain: JoinHandle<Result<()>>,
}

impl TraceSession {
    /// Start tracing.
    ///
    /// Acquisition is strictly ordered and all-or-nothing: on any failure
    /// every resource acquired so far is released, in reverse order, and
    /// no session is returned. The memory-map snapshot is taken before any
    /// hardware resource is touched.
    pub fn start(config: TraceConfig) -> Result<TraceSession> {
        config.validate()?;

        debug!(
            pid = %config.pid,
            trace = %config.trace_path.display(),
            maps = %config.maps_path.display(),
            data_pages = config.data_pages,
            aux_pages = config.aux_pages,
            "starting trace session"
        );

        maps::snapshot(config.pid, &config.maps_path)?;

        let event = Arc::new(PtEvent::open(config.pid)?);

        // Nothing ever flows through this pipe; only its closure matters.
        let (cancel_rx, cancel_tx) =
            unistd::pipe().map_err(|source| Error::CancelPipe { source })?;

        let (ready_tx, ready_rx) = mpsc::channel();

        let out = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&config.trace_path)
            .map(Arc::new)
            .map_err(|source| Error::Output {
                path: config.trace_path.clone(),
                source,
            })?;

        let task = DrainTask {
            event: Arc::clone(&event),
            cancel: cancel_rx,
            out: Arc::clone(&out),
            data_pages: config.data_pages,
            aux_pages: config.aux_pages,
        };
        let drain = thread::Builder::new()
            .name("ptcap-drain".into())
            .spawn(move || drain::run(task, ready_tx))
            .map_err(|source| Error::Spawn { source })?;

        // The drain thread posts exactly once, mapped or not; a recv error
        // means it died before it could.
        match ready_rx.recv() {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                // The thread is already on its way out. Reap it before the
                // perf descriptor and output file unwind underneath it.
                drop(cancel_tx);
                let err = match drain.join() {
                    Ok(Err(err)) => err,
                    _ => Error::DrainPanicked,
                };
                return Err(err);
            }
        }

        if let Err(err) = event.enable() {
            // The thread holds clones of the descriptors; it must exit
            // before they can be considered released.
            drop(cancel_tx);
            match drain.join() {
                Ok(Ok(())) => {}
                Ok(Err(drain_err)) => warn!(%drain_err, "drain thread failed during unwind"),
                Err(_) => warn!("drain thread panicked during unwind"),
            }
            return Err(err);
        }

        debug!("trace session started");

        Ok(TraceSession {
            inner: Some(Inner {
                event,
                cancel: cancel_tx,
                out,
                drain,
            }),
        })
    }

    /// Stop tracing and release every session resource.
    ///
    /// Teardown is best-effort: every step runs regardless of earlier
    /// failures. If any step fails the individual errors are returned in
    /// [`Error::Teardown`]; the session is consumed either way.
    pub fn stop(mut self) -> Result<()> {
        debug!("stopping trace session");

        match self.inner.take() {
            Some(inner) => inner.teardown(),
            // `stop` consumes the session, so the state cannot be taken twice.
            None => Ok(()),
        }
    }
}

impl Drop for TraceSession {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            warn!("trace session dropped without stop(); tearing down");
            if let Err(err) = inner.teardown() {
                warn!(%err, "implicit teardown failed");
            }
        }
    }
}

impl Inner {
    /// Disable the hardware, cancel and reap the drain thread, close the
    /// descriptors. Runs every step and aggregates the failures.
    fn teardown(self) -> Result<()> {
        let mut errors = Vec::new();

        if let Err(err) = self.event.disable() {
            errors.push(err);
        }

        // Sole cancellation trigger: the drain thread sees a hang-up.
        if let Err(source) = unistd::close(self.cancel.into_raw_fd()) {
            errors.push(Error::Close {
                what: "cancellation pipe",
                source,
            });
        }

        match self.drain.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => errors.push(err),
            Err(_) => errors.push(Error::DrainPanicked),
        }

        // The drain thread has exited, so these are the last owners.
        match Arc::try_unwrap(self.event) {
            Ok(event) => {
                if let Err(source) = event.close() {
                    errors.push(Error::Close {
                        what: "trace event descriptor",
                        source,
                    });
                }
            }
            Err(event) => {
                warn!("trace event descriptor still shared at teardown");
                drop(event);
            }
        }

        match Arc::try_unwrap(self.out) {
            Ok(out) => {
                if let Err(source) = unistd::close(out.into_raw_fd()) {
                    errors.push(Error::Close {
                        what: "trace output file",
                        source,
                    });
                }
            }
            Err(out) => {
                warn!("trace output file still shared at teardown");
                drop(out);
            }
        }

        if errors.is_empty() {
            debug!("trace session stopped");
            Ok(())
        } else {
            Err(Error::Teardown { errors })
        }
    }
}
