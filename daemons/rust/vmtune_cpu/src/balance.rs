// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Best-fit vCPU migration.
//!
//! Cold pCPUs are drained from a working copy of the low mask in ascending
//! index order. For each one, every vCPU on every hot pCPU is considered and
//! the one whose projected destination utilization lands closest to the
//! target wins, provided the projection stays below the high threshold.
//! Strict comparisons make the first candidate found win ties, following
//! ring order and ascending hot-pCPU index.
//!
//! A migration clears the origin's bit from the authoritative hot mask, so
//! one hot pCPU gives up at most one vCPU per cycle. When no admissible
//! candidate exists the cycle performs no repinning at all: the system has
//! reached a stable state and must not oscillate.

use log::debug;

use vmtune_utils::host::{GuestId, HostError, Hypervisor};
use vmtune_utils::mask::IdMask;

use crate::pin_table::PinTable;
use crate::sampler::{CpuThresholds, PcpuStats, VcpuStats};

/// Pin `vcpu` onto `pcpu`: issue the affinity change first and leave the
/// ownership graph untouched if the hypervisor refuses it.
pub fn pin<H: Hypervisor>(
    conn: &mut H,
    guests: &[GuestId],
    table: &mut PinTable,
    vcpu: usize,
    pcpu: usize,
    cpumap: IdMask,
) -> Result<(), HostError> {
    conn.pin_vcpu(guests[vcpu], 0, cpumap)?;
    table.link(vcpu, pcpu);
    Ok(())
}

/// One balancing pass. Returns the number of migrations performed.
pub fn rebalance<H: Hypervisor>(
    conn: &mut H,
    guests: &[GuestId],
    pcpus: &[PcpuStats],
    vcpus: &[VcpuStats],
    table: &mut PinTable,
    high_mask: &mut IdMask,
    low_mask: IdMask,
    th: CpuThresholds,
) -> Result<usize, HostError> {
    let mut moved = 0;
    let mut low = low_mask;

    while !low.is_empty() && !high_mask.is_empty() {
        let cold = low.lowest_set().unwrap();
        let Some(cold_util) = pcpus[cold].util else {
            // Unsampled pCPUs are never classified; tolerate a caller-built
            // mask anyway.
            low.clear(cold);
            continue;
        };

        let mut best: Option<usize> = None;
        let mut best_delta = 100i64;

        // Fresh working copy: every still-hot pCPU offers candidates to
        // every cold pCPU.
        let mut high = *high_mask;
        while let Some(hot) = high.lowest_set() {
            for vcpu in table.ring(hot) {
                let Some(vcpu_util) = vcpus[vcpu].util else {
                    continue;
                };

                let projected = (cold_util + vcpu_util) as i64;
                let delta = (th.target as i64 - projected).abs();
                if delta < best_delta && projected < th.high as i64 {
                    best_delta = delta;
                    best = Some(vcpu);
                }
            }
            high.clear(hot);
        }

        low.clear(cold);

        if let Some(vcpu) = best {
            let origin = table.pcpu_of(vcpu).unwrap();
            high_mask.clear(origin);
            pin(conn, guests, table, vcpu, cold, pcpus[cold].cpumap)?;
            moved += 1;
            debug!(
                "migrated guest {} from pcpu {} to pcpu {} (delta {})",
                guests[vcpu].raw(),
                origin,
                cold,
                best_delta
            );
        }
    }

    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmtune_utils::scenario::ScenarioHost;

    fn setup(
        num_pcpus: usize,
        placements: &[usize],
        pcpu_utils: &[u32],
        vcpu_utils: &[u32],
    ) -> (
        ScenarioHost,
        Vec<GuestId>,
        Vec<PcpuStats>,
        Vec<VcpuStats>,
        PinTable,
    ) {
        let mut host = ScenarioHost::new(num_pcpus, 1_000_000);
        let guests: Vec<GuestId> = (0..placements.len() as u32)
            .map(|raw| {
                host.add_guest(&format!("vm{}", raw), 1_000_000);
                GuestId::new(raw)
            })
            .collect();

        let mut table = PinTable::new(placements.len(), num_pcpus);
        for (vcpu, &pcpu) in placements.iter().enumerate() {
            table.link(vcpu, pcpu);
        }

        let pcpus: Vec<PcpuStats> = pcpu_utils
            .iter()
            .enumerate()
            .map(|(id, &util)| {
                let mut stats = PcpuStats::new(id);
                stats.util = Some(util);
                stats
            })
            .collect();

        let vcpus: Vec<VcpuStats> = vcpu_utils
            .iter()
            .zip(&guests)
            .map(|(&util, &guest)| VcpuStats {
                guest,
                last_time_ns: 0,
                util: Some(util),
            })
            .collect();

        (host, guests, pcpus, vcpus, table)
    }

    #[test]
    fn first_found_wins_ties() {
        // Guests 0 and 2 both project to 70 on the cold pCPU; ring order
        // puts guest 0 first.
        let (mut host, guests, pcpus, vcpus, mut table) =
            setup(2, &[0, 1, 0, 1], &[95, 30], &[40, 10, 40, 10]);
        let mut high = IdMask::single(0);
        let low = IdMask::single(1);

        let moved = rebalance(
            &mut host,
            &guests,
            &pcpus,
            &vcpus,
            &mut table,
            &mut high,
            low,
            CpuThresholds::default(),
        )
        .unwrap();

        assert_eq!(moved, 1);
        assert_eq!(table.pcpu_of(0), Some(1));
        assert_eq!(table.ring(1), vec![1, 3, 0]);
        assert!(high.is_empty());
        assert!(table.is_consistent());
    }

    #[test]
    fn closest_projection_wins() {
        // Projections onto the cold pCPU: guest 0 -> 90 (inadmissible),
        // guest 2 -> 75 (delta 5). Guest 2 must win despite ring order.
        let (mut host, guests, pcpus, vcpus, mut table) =
            setup(2, &[0, 1, 0, 1], &[95, 30], &[60, 10, 45, 10]);
        let mut high = IdMask::single(0);
        let low = IdMask::single(1);

        let moved = rebalance(
            &mut host,
            &guests,
            &pcpus,
            &vcpus,
            &mut table,
            &mut high,
            low,
            CpuThresholds::default(),
        )
        .unwrap();

        assert_eq!(moved, 1);
        assert_eq!(table.pcpu_of(2), Some(1));
        assert_eq!(table.pcpu_of(0), Some(0));
    }

    #[test]
    fn overshoot_means_stable() {
        // Any migration would push the cold pCPU to or past the high
        // threshold, so nothing moves.
        let (mut host, guests, pcpus, vcpus, mut table) =
            setup(2, &[0, 1, 0, 1], &[95, 60], &[40, 10, 50, 10]);
        let mut high = IdMask::single(0);
        let low = IdMask::single(1);

        let moved = rebalance(
            &mut host,
            &guests,
            &pcpus,
            &vcpus,
            &mut table,
            &mut high,
            low,
            CpuThresholds::default(),
        )
        .unwrap();

        assert_eq!(moved, 0);
        assert!(host.pins.is_empty());
        // The hot pCPU keeps its mark: nothing was migrated off it.
        assert!(high.test(0));
    }

    #[test]
    fn one_migration_per_hot_pcpu() {
        // Two cold pCPUs, one hot pCPU: the hot bit is consumed by the
        // first migration, so the second cold pCPU gets nothing.
        let (mut host, guests, pcpus, vcpus, mut table) =
            setup(3, &[0, 0, 0], &[95, 30, 30], &[40, 40, 15]);
        let mut high = IdMask::single(0);
        let mut low = IdMask::new();
        low.set(1);
        low.set(2);

        let moved = rebalance(
            &mut host,
            &guests,
            &pcpus,
            &vcpus,
            &mut table,
            &mut high,
            low,
            CpuThresholds::default(),
        )
        .unwrap();

        assert_eq!(moved, 1);
        assert_eq!(host.pins.len(), 1);
        assert_eq!(table.num_pinned(0), 2);
    }

    #[test]
    fn pin_failure_leaves_table_untouched() {
        use vmtune_utils::scenario::FailOp;

        let (mut host, guests, pcpus, vcpus, mut table) =
            setup(2, &[0, 1, 0, 1], &[95, 30], &[40, 10, 40, 10]);
        host.fail_next(FailOp::Pin);
        let mut high = IdMask::single(0);
        let low = IdMask::single(1);

        let res = rebalance(
            &mut host,
            &guests,
            &pcpus,
            &vcpus,
            &mut table,
            &mut high,
            low,
            CpuThresholds::default(),
        );

        assert!(res.is_err());
        assert_eq!(table.pcpu_of(0), Some(0));
        assert_eq!(table.num_pinned(0), 2);
        assert!(table.is_consistent());
    }
}
