//! The kernel event descriptor backing one Intel PT tracing session.
//!
//! PT shows up in `perf_event_open(2)` as a dynamic PMU: its event type is
//! an integer published in sysfs, not a fixed `PERF_TYPE_*` constant. The
//! descriptor opened here serves two purposes: control (enable/disable
//! ioctls) and the backing object for the ring buffer mappings in
//! [`crate::ring`].

use std::fs;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use bitfield::bitfield;
use nix::errno::Errno;
use nix::ioctl_none;
use nix::unistd::{self, Pid};
use tracing::debug;

use crate::error::{Error, Result};

/// Sysfs attribute holding the dynamic PMU type of the local Intel PT
/// implementation.
pub const PT_TYPE_PATH: &str = "/sys/bus/event_source/devices/intel_pt/type";

bitfield! {
    /// The `perf_event_attr` bit-flags word.
    #[repr(transparent)]
    pub struct PerfEventAttrFlags(u64);
    impl Debug;
    pub disabled, set_disabled: 0, 0;
    pub inherit, set_inherit: 1, 1;
    pub pinned, set_pinned: 2, 2;
    pub exclusive, set_exclusive: 3, 3;
    pub exclude_user, set_exclude_user: 4, 4;
    pub exclude_kernel, set_exclude_kernel: 5, 5;
    pub exclude_hv, set_exclude_hv: 6, 6;
    pub exclude_idle, set_exclude_idle: 7, 7;
    pub mmap, set_mmap: 8, 8;
    pub comm, set_comm: 9, 9;
    pub freq, set_freq: 10, 10;
    pub inherit_stat, set_inherit_stat: 11, 11;
    pub enable_on_exec, set_enable_on_exec: 12, 12;
    pub task, set_task: 13, 13;
    pub watermark, set_watermark: 14, 14;
    pub precise_ip, set_precise_ip: 16, 15;
    pub mmap_data, set_mmap_data: 17, 17;
    pub sample_id_all, set_sample_id_all: 18, 18;
    pub __reserved_1, _: 63, 19;
}

/// Mirror of the kernel's `perf_event_attr`, through `aux_sample_size`
/// (`PERF_ATTR_SIZE_VER6`). Union members this tracer never sets are
/// declared as one plain field of the same width.
#[repr(C)]
pub struct PerfEventAttr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: PerfEventAttrFlags,
    pub wakeup_events: u32,
    pub bp_type: u32,
    pub config1: u64,
    pub config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub __reserved_2: u16,
    pub aux_sample_size: u32,
    pub __reserved_3: u32,
}

impl Default for PerfEventAttr {
    fn default() -> Self {
        // SAFETY: every field is a plain integer; all-zero is the kernel's
        // own baseline for unused attr fields.
        unsafe { mem::zeroed() }
    }
}

/// Mirror of the kernel's `perf_event_mmap_page`.
///
/// Only the cursor fields at the tail of the struct are used; the reserved
/// block keeps them at their fixed kernel offsets.
#[repr(C)]
pub struct PerfEventMmapPage {
    pub version: u32,
    pub compat_version: u32,
    pub lock: u32,
    pub index: u32,
    pub offset: i64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub capabilities: u64,
    pub pmc_width: u16,
    pub time_shift: u16,
    pub time_mult: u32,
    pub time_offset: u64,
    pub time_zero: u64,
    pub size: u32,
    pub __reserved_1: u32,
    pub time_cycles: u64,
    pub time_mask: u64,
    pub __reserved: [u8; 116 * 8],
    pub data_head: u64,
    pub data_tail: u64,
    pub data_offset: u64,
    pub data_size: u64,
    pub aux_head: u64,
    pub aux_tail: u64,
    pub aux_offset: u64,
    pub aux_size: u64,
}

const PERF_IOC_MAGIC: u8 = b'$';
ioctl_none!(perf_event_ioc_enable, PERF_IOC_MAGIC, 0);
ioctl_none!(perf_event_ioc_disable, PERF_IOC_MAGIC, 1);

/// Read the local Intel PT event type from sysfs.
///
/// A stateless read, performed once per trace run. A missing attribute
/// means the hardware or kernel lacks PT support.
fn intel_pt_type() -> Result<u32> {
    let raw = fs::read_to_string(PT_TYPE_PATH).map_err(|source| Error::Unsupported { source })?;

    raw.trim().parse().map_err(|_| Error::PmuType {
        value: raw.trim().to_owned(),
    })
}

fn pt_attr(pmu_type: u32) -> PerfEventAttr {
    let mut attr = PerfEventAttr::default();
    attr.type_ = pmu_type;
    attr.size = mem::size_of::<PerfEventAttr>() as u32;

    // Trace user-space execution of the target only.
    attr.flags.set_exclude_kernel(1);
    attr.flags.set_exclude_hv(1);

    // The controller enables the event once the ring is mapped.
    attr.flags.set_disabled(1);

    // Maximum timing precision: no instruction skid.
    attr.flags.set_precise_ip(3);

    attr
}

/// An open, process-scoped Intel PT event.
#[derive(Debug)]
pub struct PtEvent {
    fd: OwnedFd,
}

impl PtEvent {
    /// Open a disabled PT event scoped to `pid`, on any CPU.
    pub fn open(pid: Pid) -> Result<Self> {
        let attr = pt_attr(intel_pt_type()?);

        debug!(%pid, pmu_type = attr.type_, "opening intel pt event");

        // No nix or libc wrapper exists for perf_event_open.
        let res = unsafe {
            libc::syscall(
                libc::SYS_perf_event_open,
                &attr as *const PerfEventAttr,
                pid.as_raw(),
                -1 as libc::c_int,
                -1 as libc::c_int,
                0 as libc::c_ulong,
            )
        };
        if res < 0 {
            return Err(Error::EventOpen {
                pid,
                source: Errno::last(),
            });
        }

        // SAFETY: the syscall succeeded and returned a descriptor we own.
        let fd = unsafe { OwnedFd::from_raw_fd(res as RawFd) };

        Ok(Self { fd })
    }

    /// Turn the tracing hardware on.
    pub fn enable(&self) -> Result<()> {
        // SAFETY: `self.fd` is a live perf event descriptor.
        unsafe { perf_event_ioc_enable(self.fd.as_raw_fd()) }
            .map(drop)
            .map_err(|source| Error::EventControl {
                op: "enable",
                source,
            })
    }

    /// Turn the tracing hardware off.
    pub fn disable(&self) -> Result<()> {
        // SAFETY: `self.fd` is a live perf event descriptor.
        unsafe { perf_event_ioc_disable(self.fd.as_raw_fd()) }
            .map(drop)
            .map_err(|source| Error::EventControl {
                op: "disable",
                source,
            })
    }

    /// Close the descriptor, surfacing the close error.
    pub fn close(self) -> nix::Result<()> {
        unistd::close(self.fd.into_raw_fd())
    }
}

impl AsFd for PtEvent {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for PtEvent {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use memoffset::offset_of;

    use super::*;

    #[test]
    fn test_pt_attr_flags() {
        let attr = pt_attr(9);

        assert_eq!(attr.type_, 9);
        assert_eq!(attr.size as usize, mem::size_of::<PerfEventAttr>());

        assert_eq!(attr.flags.disabled(), 1);
        assert_eq!(attr.flags.exclude_kernel(), 1);
        assert_eq!(attr.flags.exclude_hv(), 1);
        assert_eq!(attr.flags.precise_ip(), 3);

        // The target's own user-space execution must not be filtered.
        assert_eq!(attr.flags.exclude_user(), 0);
        assert_eq!(attr.flags.exclude_idle(), 0);
        assert_eq!(attr.flags.inherit(), 0);
    }

    #[test]
    fn test_attr_abi_size() {
        // PERF_ATTR_SIZE_VER6: through aux_sample_size.
        assert_eq!(mem::size_of::<PerfEventAttr>(), 120);
    }

    #[test]
    fn test_mmap_page_abi_offsets() {
        // Fixed offsets from linux/perf_event.h: the reserved block pads to
        // the kilobyte boundary, where the cursor fields begin.
        assert_eq!(offset_of!(PerfEventMmapPage, data_head), 1024);
        assert_eq!(offset_of!(PerfEventMmapPage, data_tail), 1032);
        assert_eq!(offset_of!(PerfEventMmapPage, data_offset), 1040);
        assert_eq!(offset_of!(PerfEventMmapPage, data_size), 1048);
        assert_eq!(offset_of!(PerfEventMmapPage, aux_head), 1056);
        assert_eq!(offset_of!(PerfEventMmapPage, aux_tail), 1064);
        assert_eq!(offset_of!(PerfEventMmapPage, aux_offset), 1072);
        assert_eq!(offset_of!(PerfEventMmapPage, aux_size), 1080);
    }
}
