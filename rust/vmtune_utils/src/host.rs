// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Hypervisor capability contract.
//!
//! The daemons never talk to a hypervisor library directly; they are written
//! against [`Hypervisor`], a bundle of the handful of operations the control
//! loops need. Deployments inject the libvirt transport (feature `libvirt`),
//! tests inject [`crate::scenario::ScenarioHost`].
//!
//! The idle-time and run-time counters returned by `pcpu_idle_ns` and
//! `vcpu_info` are monotonically non-decreasing; a regression observed by a
//! caller is a sampling artifact, not an adapter error.

use std::fmt;

use crate::mask::IdMask;

/// Opaque handle for an active guest, issued by a [`Hypervisor`]
/// implementation and only meaningful to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GuestId(u32);

impl GuestId {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

/// Placement and accounting for one vCPU.
#[derive(Clone, Copy, Debug)]
pub struct VcpuInfo {
    /// pCPU the vCPU last ran on.
    pub pcpu: usize,
    /// Cumulative run time since guest start, in nanoseconds.
    pub cpu_time_ns: u64,
}

/// Tags of interest in a guest's balloon statistics list. Everything else the
/// balloon driver publishes is reported as `Other` and skipped by the
/// coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemStatTag {
    /// Current balloon size: the memory actually assigned to the guest.
    ActualBalloon,
    /// Memory unused inside the guest.
    Unused,
    Other,
}

/// One tagged entry of a guest's balloon statistics list.
#[derive(Clone, Copy, Debug)]
pub struct MemStat {
    pub tag: MemStatTag,
    pub val_kib: u64,
}

/// Typed failures of the host interface. `code()` yields the daemon's
/// numeric exit code for the failure class.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostError {
    /// Opening the hypervisor session failed.
    Conn(String),
    /// The host has no active guests to manage.
    NoGuests,
    /// Retrieving the guest list failed.
    GuestList(String),
    /// The internal tables cannot hold the host's guests or pCPUs.
    Capacity(String),
    /// A per-guest query or command failed.
    GuestInfo(String),
    /// A host-level query (free memory, pCPU idle time) failed.
    HostStats(String),
}

impl HostError {
    pub fn code(&self) -> i32 {
        match self {
            HostError::Conn(_) => -1,
            HostError::NoGuests => -2,
            HostError::GuestList(_) => -3,
            HostError::Capacity(_) => -4,
            HostError::GuestInfo(_) => -5,
            HostError::HostStats(_) => -6,
        }
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostError::Conn(msg) => write!(f, "hypervisor connection failed: {}", msg),
            HostError::NoGuests => write!(f, "no active guests"),
            HostError::GuestList(msg) => write!(f, "guest list retrieval failed: {}", msg),
            HostError::Capacity(msg) => write!(f, "host exceeds supported capacity: {}", msg),
            HostError::GuestInfo(msg) => write!(f, "guest query failed: {}", msg),
            HostError::HostStats(msg) => write!(f, "host stats query failed: {}", msg),
        }
    }
}

impl std::error::Error for HostError {}

/// The capability bundle the control loops run against.
///
/// Implementations own the session and the guest handles; callers release
/// every handle during teardown and close the session by dropping the
/// implementation.
pub trait Hypervisor {
    /// Handles for the guests currently running, in a stable order. An empty
    /// host is reported as [`HostError::NoGuests`].
    fn list_active_guests(&mut self) -> Result<Vec<GuestId>, HostError>;

    /// Guest name for traces; placeholder when unknown.
    fn guest_name(&self, guest: GuestId) -> String;

    /// Host free memory in KiB.
    fn host_free_kib(&mut self) -> Result<u64, HostError>;

    /// Host total memory in KiB.
    fn host_total_kib(&mut self) -> Result<u64, HostError>;

    fn num_pcpus(&mut self) -> Result<usize, HostError>;

    /// Monotonic idle-time counter of one pCPU, in nanoseconds.
    fn pcpu_idle_ns(&mut self, pcpu: usize) -> Result<u64, HostError>;

    fn vcpu_info(&mut self, guest: GuestId) -> Result<VcpuInfo, HostError>;

    /// Restrict `vcpu` of `guest` to the pCPUs set in `pcpus`.
    fn pin_vcpu(&mut self, guest: GuestId, vcpu: u32, pcpus: IdMask) -> Result<(), HostError>;

    /// Ask the guest's balloon driver to publish statistics every
    /// `period_secs` seconds.
    fn set_mem_stats_period(&mut self, guest: GuestId, period_secs: u32)
        -> Result<(), HostError>;

    /// The guest's current balloon statistics, as a tagged list in no
    /// particular order.
    fn mem_stats(&mut self, guest: GuestId) -> Result<Vec<MemStat>, HostError>;

    /// Configured maximum memory of the guest, in KiB.
    fn max_mem_kib(&mut self, guest: GuestId) -> Result<u64, HostError>;

    /// Request a new current memory size for the guest, in KiB.
    fn set_memory_kib(&mut self, guest: GuestId, kib: u64) -> Result<(), HostError>;

    /// Release one guest handle. Infallible; releasing an unknown or
    /// already-released handle is a no-op.
    fn release_guest(&mut self, guest: GuestId);
}
