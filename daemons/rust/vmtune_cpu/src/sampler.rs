// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Utilization sampling and hot/cold classification.
//!
//! Counters are cached per entity and refreshed last-writes-win every cycle.
//! A counter that moves backwards is a sampling artifact: the entity keeps
//! its refreshed counter but goes unclassified for the tick, so neither mask
//! can select it.

use log::warn;

use vmtune_utils::host::{GuestId, HostError, Hypervisor};
use vmtune_utils::mask::IdMask;

use crate::pin_table::PinTable;

/// Utilization thresholds, in percent of one pCPU.
#[derive(Clone, Copy, Debug)]
pub struct CpuThresholds {
    /// Above this a pCPU is a migration source (if it hosts more than one
    /// vCPU).
    pub high: u32,
    /// Below this a pCPU may receive vCPUs.
    pub low: u32,
    /// Best-fit placement aims for this.
    pub target: u32,
}

impl Default for CpuThresholds {
    fn default() -> Self {
        Self {
            high: 90,
            low: 70,
            target: 80,
        }
    }
}

/// Per-pCPU sampling state.
#[derive(Clone, Copy, Debug)]
pub struct PcpuStats {
    pub id: usize,
    /// Single-bit affinity map for pinning onto this pCPU.
    pub cpumap: IdMask,
    pub last_idle_ns: u64,
    /// Utilization over the last cycle; `None` until sampled, or when the
    /// idle counter regressed.
    pub util: Option<u32>,
}

impl PcpuStats {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            cpumap: IdMask::single(id),
            last_idle_ns: 0,
            util: None,
        }
    }
}

/// Per-vCPU sampling state. One per guest: single-vCPU guests only.
#[derive(Clone, Copy, Debug)]
pub struct VcpuStats {
    pub guest: GuestId,
    pub last_time_ns: u64,
    pub util: Option<u32>,
}

/// pCPU utilization over one cycle: the complement of its idle share,
/// clamped to 0..=100.
pub fn pcpu_util(idle_delta_ns: u64, cycle_ns: u64) -> u32 {
    let idle_pct = idle_delta_ns.saturating_mul(100) / cycle_ns;
    100u64.saturating_sub(idle_pct) as u32
}

/// vCPU utilization over one cycle: its run-time share, clamped to 0..=100.
pub fn vcpu_util(run_delta_ns: u64, cycle_ns: u64) -> u32 {
    (run_delta_ns.saturating_mul(100) / cycle_ns).min(100) as u32
}

/// Refresh every pCPU's idle counter and utilization.
pub fn sample_pcpus<H: Hypervisor>(
    conn: &mut H,
    pcpus: &mut [PcpuStats],
    cycle_ns: u64,
) -> Result<(), HostError> {
    for pcpu in pcpus.iter_mut() {
        let idle = conn.pcpu_idle_ns(pcpu.id)?;
        let prev = std::mem::replace(&mut pcpu.last_idle_ns, idle);

        if idle < prev {
            warn!(
                "pcpu {} idle counter regressed ({} -> {}), skipping classification",
                pcpu.id, prev, idle
            );
            pcpu.util = None;
            continue;
        }

        pcpu.util = Some(pcpu_util(idle - prev, cycle_ns));
    }
    Ok(())
}

/// Refresh every vCPU's run-time counter and utilization.
pub fn sample_vcpus<H: Hypervisor>(
    conn: &mut H,
    vcpus: &mut [VcpuStats],
    cycle_ns: u64,
) -> Result<(), HostError> {
    for vcpu in vcpus.iter_mut() {
        let time = conn.vcpu_info(vcpu.guest)?.cpu_time_ns;
        let prev = std::mem::replace(&mut vcpu.last_time_ns, time);

        if time < prev {
            warn!(
                "guest {} run-time counter regressed ({} -> {}), skipping classification",
                vcpu.guest.raw(),
                prev,
                time
            );
            vcpu.util = None;
            continue;
        }

        vcpu.util = Some(vcpu_util(time - prev, cycle_ns));
    }
    Ok(())
}

/// Rebuild the hot and cold masks from scratch.
///
/// A pCPU with a single pinned vCPU is never hot: migrating its only vCPU
/// cannot relieve it.
pub fn classify_pcpus(
    pcpus: &[PcpuStats],
    table: &PinTable,
    th: CpuThresholds,
) -> (IdMask, IdMask) {
    let mut high = IdMask::new();
    let mut low = IdMask::new();

    for pcpu in pcpus {
        let Some(util) = pcpu.util else {
            continue;
        };

        if util > th.high {
            if table.num_pinned(pcpu.id) > 1 {
                high.set(pcpu.id);
            }
        } else if util < th.low {
            low.set(pcpu.id);
        }
    }

    (high, low)
}
