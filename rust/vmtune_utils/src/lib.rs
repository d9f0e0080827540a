// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # vmtune utils
//!
//! Shared infrastructure for the vmtune daemons: the hypervisor capability
//! contract both control loops are written against, the fixed 32-slot index
//! mask used by the classifiers and for vCPU affinity maps, the common
//! control-loop driver, and a deterministic scripted backend for tests.
//!
//! The real libvirt transport lives behind the `libvirt` cargo feature since
//! it links against the libvirt C library.

pub mod control;
pub mod host;
#[cfg(feature = "libvirt")]
pub mod libvirt;
pub mod mask;
pub mod scenario;

pub use control::run_control_loop;
pub use host::{GuestId, HostError, Hypervisor, MemStat, MemStatTag, VcpuInfo};
pub use mask::IdMask;

/// Upper bound on guests and on pCPUs, fixed by the 32-bit mask domain.
pub const MAX_SLOTS: usize = 32;

pub const NSEC_PER_SEC: u64 = 1_000_000_000;
