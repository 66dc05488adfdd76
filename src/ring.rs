//! Mapping of the perf ring buffer, and the wraparound-aware extraction of
//! trace bytes from its AUX region.
//!
//! The mapping is two-part. The first covers one kernel-managed control
//! page plus the ordinary perf data region; this tracer keeps the data
//! region only because the mapping contract requires it. The second covers
//! the AUX region, where the PT hardware deposits trace packets. Mapping
//! the AUX region read-write tells the kernel to treat it as a reclaimable
//! ring rather than to drop data once it fills.
//!
//! The ring has one producer (the kernel) and one consumer (the drain
//! thread), so no lock is involved: the kernel publishes `aux_head` and we
//! publish `aux_tail`, paired acquire/release. Both cursors live in the
//! shared control page and are reachable only through the fenced accessors
//! here.

use std::io::{self, Write};
use std::num::NonZeroUsize;
use std::ops::Range;
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use tracing::warn;

use crate::error::{Error, Result};
use crate::perf::{PerfEventMmapPage, PtEvent};

fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// The mapped ring buffer of one PT event.
///
/// Lives entirely on the drain thread: created after the thread starts,
/// unmapped (via `Drop`) before it exits.
pub struct AuxRing {
    base: NonNull<libc::c_void>,
    base_len: usize,
    aux: NonNull<libc::c_void>,
    aux_len: usize,
}

impl AuxRing {
    /// Map the control header, data region and AUX region of `event`.
    ///
    /// `data_pages` and `aux_pages` must be nonzero powers of two; the
    /// kernel rejects the mapping otherwise.
    pub fn map(event: &PtEvent, data_pages: usize, aux_pages: usize) -> Result<Self> {
        let page_size = page_size();

        // One control page precedes the data region.
        let base_len = nonzero((1 + data_pages) * page_size)?;

        // SAFETY: mapping a perf event fd at offset 0; the kernel validates
        // the length against the event's configuration.
        let base = unsafe {
            mmap(
                None,
                base_len,
                ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                event,
                0,
            )
        }
        .map_err(|source| Error::RingMap { source })?;

        let header = base.as_ptr() as *mut PerfEventMmapPage;

        // The AUX area follows the data region. Its placement and size must
        // be published in the header before the second mapping.
        //
        // SAFETY: `header` points at the live control page; volatile access
        // because the page is shared with the kernel.
        let (aux_offset, aux_size) = unsafe {
            let data_offset = ptr::read_volatile(ptr::addr_of!((*header).data_offset));
            let data_size = ptr::read_volatile(ptr::addr_of!((*header).data_size));

            let aux_offset = data_offset + data_size;
            let aux_size = (aux_pages * page_size) as u64;

            ptr::write_volatile(ptr::addr_of_mut!((*header).aux_offset), aux_offset);
            ptr::write_volatile(ptr::addr_of_mut!((*header).aux_size), aux_size);

            (aux_offset, aux_size)
        };

        let aux_len = match nonzero(aux_size as usize) {
            Ok(len) => len,
            Err(err) => {
                unmap(base, base_len.get(), "ring header");
                return Err(err);
            }
        };

        // Read-write, so the kernel runs the AUX area as a reclaimable ring.
        //
        // SAFETY: offset and length were just published in the header.
        let aux = match unsafe {
            mmap(
                None,
                aux_len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                event,
                aux_offset as libc::off_t,
            )
        } {
            Ok(aux) => aux,
            Err(source) => {
                unmap(base, base_len.get(), "ring header");
                return Err(Error::RingMap { source });
            }
        };

        Ok(Self {
            base,
            base_len: base_len.get(),
            aux,
            aux_len: aux_len.get(),
        })
    }

    /// Move every byte the kernel has produced since the last drain to
    /// `out`, reclaiming the ring space on success.
    ///
    /// Returns the number of bytes moved. On a write failure the tail is
    /// left untouched, so no partial progress is recorded and the same
    /// span is extracted again by the next drain.
    pub fn drain_into<W: Write>(&self, out: &mut W) -> Result<usize> {
        let head = self.head();
        let tail = self.tail();

        let (new_tail, moved) = drain_once(self.bytes(), self.size(), head, tail, out)
            .map_err(|source| Error::Write { source })?;

        self.set_tail(new_tail);

        Ok(moved)
    }

    fn size(&self) -> u64 {
        self.aux_len as u64
    }

    fn header(&self) -> *mut PerfEventMmapPage {
        self.base.as_ptr() as *mut PerfEventMmapPage
    }

    fn head_cursor(&self) -> &AtomicU64 {
        // SAFETY: `aux_head` is a u64 in the live, shared control page, and
        // atomic access is the only way either side touches it.
        unsafe { &*(ptr::addr_of!((*self.header()).aux_head) as *const AtomicU64) }
    }

    fn tail_cursor(&self) -> &AtomicU64 {
        // SAFETY: as `head_cursor`.
        unsafe { &*(ptr::addr_of!((*self.header()).aux_tail) as *const AtomicU64) }
    }

    /// Producer position: a monotonic byte count, wrapped by the consumer.
    ///
    /// Acquire pairs with the kernel's release, so the trace bytes below
    /// `head` are visible before the load returns.
    fn head(&self) -> u64 {
        self.head_cursor().load(Ordering::Acquire)
    }

    /// Consumer position, `0 <= tail < size`. We are its only writer.
    fn tail(&self) -> u64 {
        self.tail_cursor().load(Ordering::Relaxed)
    }

    /// Publish reclaimed space. Release, so the kernel cannot observe the
    /// new tail before our reads of the reclaimed span have completed.
    fn set_tail(&self, tail: u64) {
        self.tail_cursor().store(tail, Ordering::Release);
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: the AUX mapping is live for the life of `self`, and the
        // single-producer discipline keeps the kernel out of the
        // `[tail, head)` span until `set_tail` reclaims it.
        unsafe { slice::from_raw_parts(self.aux.as_ptr() as *const u8, self.aux_len) }
    }
}

impl Drop for AuxRing {
    fn drop(&mut self) {
        // Reverse of mapping order. Unmap failure is recorded, not raised:
        // the drain result must reflect drains, not teardown.
        unmap(self.aux, self.aux_len, "aux region");
        unmap(self.base, self.base_len, "ring header");
    }
}

fn unmap(addr: NonNull<libc::c_void>, len: usize, what: &str) {
    // SAFETY: `addr`/`len` came from a successful mmap and are unmapped
    // exactly once.
    if let Err(err) = unsafe { munmap(addr, len) } {
        warn!(%err, what, "failed to unmap ring region");
    }
}

fn nonzero(len: usize) -> Result<NonZeroUsize> {
    NonZeroUsize::new(len).ok_or(Error::Config {
        reason: "ring mapping has zero size",
    })
}

/// The byte ranges to persist, oldest first, for a ring of `size` bytes
/// with monotonic head counter `head` and wrapped tail cursor `tail`.
fn spans(size: u64, head: u64, tail: u64) -> (Range<u64>, Option<Range<u64>>) {
    // The head counts bytes ever produced and must be wrapped manually.
    let head = head % size;

    if tail <= head {
        (tail..head, None)
    } else {
        (tail..size, Some(0..head))
    }
}

/// Write the outstanding spans of `aux` to `out`, in production order.
///
/// Returns the new tail and the number of bytes written. Callers must not
/// advance the tail on failure; a short extraction is retried whole.
fn drain_once<W: Write>(
    aux: &[u8],
    size: u64,
    head: u64,
    tail: u64,
    out: &mut W,
) -> io::Result<(u64, usize)> {
    let (first, second) = spans(size, head, tail);

    let mut written = 0;
    for span in std::iter::once(first).chain(second) {
        let (start, end) = (span.start as usize, span.end as usize);
        out.write_all(&aux[start..end])?;
        written += end - start;
    }

    Ok((head % size, written))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: u64 = 4096;

    fn ring_bytes() -> Vec<u8> {
        (0..SIZE).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_spans_no_wrap() {
        let (first, second) = spans(SIZE, 500, 100);
        assert_eq!(first, 100..500);
        assert_eq!(second, None);
    }

    #[test]
    fn test_spans_wrap() {
        // A head that has lapped the ring wraps to offset 100.
        let (first, second) = spans(SIZE, SIZE + 100, 4000);
        assert_eq!(first, 4000..SIZE);
        assert_eq!(second, Some(0..100));
    }

    #[test]
    fn test_spans_empty() {
        let (first, second) = spans(SIZE, SIZE + 700, 700);
        assert_eq!(first, 700..700);
        assert_eq!(second, None);
    }

    #[test]
    fn test_drain_no_wrap() {
        let aux = ring_bytes();
        let mut out = Vec::new();

        let (tail, moved) = drain_once(&aux, SIZE, 500, 100, &mut out).unwrap();

        assert_eq!(tail, 500);
        assert_eq!(moved, 400);
        assert_eq!(out, &aux[100..500]);
    }

    #[test]
    fn test_drain_wrap() {
        let aux = ring_bytes();
        let mut out = Vec::new();

        let (tail, moved) = drain_once(&aux, SIZE, SIZE + 100, 4000, &mut out).unwrap();

        assert_eq!(tail, 100);
        assert_eq!(moved, 96 + 100);

        let mut expected = aux[4000..].to_vec();
        expected.extend_from_slice(&aux[..100]);
        assert_eq!(out, expected);
    }

    #[test]
    fn test_drain_nothing_outstanding() {
        let aux = ring_bytes();
        let mut out = Vec::new();

        let (tail, moved) = drain_once(&aux, SIZE, 2 * SIZE + 9, 9, &mut out).unwrap();

        assert_eq!(tail, 9);
        assert_eq!(moved, 0);
        assert!(out.is_empty());
    }

    /// Repeated drains reassemble the produced byte stream exactly, across
    /// several lappings of the ring.
    #[test]
    fn test_drains_concatenate() {
        let mut aux = vec![0u8; SIZE as usize];
        let mut out = Vec::new();
        let mut produced = Vec::new();

        let mut head: u64 = 0;
        let mut tail: u64 = 0;

        for step in [10u64, 700, 3386, 1, 4095, 2048, 517] {
            // Produce `step` bytes the way the hardware would: into the
            // ring at the wrapped head, never past the tail. A full lap is
            // indistinguishable from an empty ring, so each step stays
            // short of one.
            assert!(step < SIZE);
            for _ in 0..step {
                let byte = (head % 249) as u8;
                aux[(head % SIZE) as usize] = byte;
                produced.push(byte);
                head += 1;
            }

            let (new_tail, moved) = drain_once(&aux, SIZE, head, tail, &mut out).unwrap();
            assert_eq!(moved as u64, step);
            tail = new_tail;
        }

        assert_eq!(out, produced);
    }

    struct FailingWriter {
        accept: usize,
    }

    impl Write for FailingWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.accept == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            let n = buf.len().min(self.accept);
            self.accept -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// A failed extraction commits nothing: retrying with a working writer
    /// yields every outstanding byte.
    #[test]
    fn test_failed_drain_is_retried_whole() {
        let aux = ring_bytes();
        let tail = 4000;
        let head = SIZE + 100;

        // Fails midway through the second span.
        let mut failing = FailingWriter { accept: 150 };
        assert!(drain_once(&aux, SIZE, head, tail, &mut failing).is_err());

        // The tail was not advanced, so the retry sees the full span.
        let mut out = Vec::new();
        let (new_tail, moved) = drain_once(&aux, SIZE, head, tail, &mut out).unwrap();

        assert_eq!(new_tail, 100);
        assert_eq!(moved, 196);

        let mut expected = aux[4000..].to_vec();
        expected.extend_from_slice(&aux[..100]);
        assert_eq!(out, expected);
    }
}
