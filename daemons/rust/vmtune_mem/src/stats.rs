// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Guest balloon sampling and hungry/excess classification.

use vmtune_utils::host::{GuestId, MemStat, MemStatTag};
use vmtune_utils::mask::IdMask;

/// Memory thresholds, in percent of the respective total.
#[derive(Clone, Copy, Debug)]
pub struct MemThresholds {
    /// Below this percent of free host memory the host is considered low:
    /// no grants, and reclaim when also under the host target.
    pub host_low: u64,
    /// Percent of host memory the fair reclaim steers free memory back to.
    pub host_tgt: u64,
    /// Guests with less percent available than this are hungry.
    pub guest_low: u64,
    /// Percent of available memory grants and reclaims steer guests to.
    pub guest_tgt: u64,
    /// Guests with more percent available than this hold excess.
    pub guest_high: u64,
}

impl Default for MemThresholds {
    fn default() -> Self {
        Self {
            host_low: 10,
            host_tgt: 15,
            guest_low: 25,
            guest_tgt: 30,
            guest_high: 33,
        }
    }
}

/// Per-guest balloon state, refreshed every cycle.
#[derive(Clone, Copy, Debug)]
pub struct GuestMem {
    pub guest: GuestId,
    /// Current balloon size in KiB; the value adjustments are computed from
    /// and applied to.
    pub mem_total: u64,
    /// Unused memory inside the guest, in KiB.
    pub mem_free: u64,
    /// Configured maximum in KiB; balloons never grow past this.
    pub mem_max: u64,
    /// `100 * mem_free / mem_total`, clamped to 0..=100. `None` until the
    /// balloon has reported a non-zero size.
    pub percent_avail: Option<u64>,
}

impl GuestMem {
    pub fn new(guest: GuestId, mem_max: u64) -> Self {
        Self {
            guest,
            mem_total: 0,
            mem_free: 0,
            mem_max,
            percent_avail: None,
        }
    }
}

/// Percent of the balloon currently unused inside the guest. The balloon
/// moves underneath the (non-atomic) stats collection, so the raw ratio can
/// exceed 100 and is clamped.
pub fn percent_avail(mem_free: u64, mem_total: u64) -> u64 {
    (100 * mem_free / mem_total).min(100)
}

/// Fold one balloon statistics list into the guest record. Matching is by
/// tag; list order and unknown tags are irrelevant. A tag that is absent
/// leaves the previous reading in place.
pub fn apply_mem_stats(guest: &mut GuestMem, stats: &[MemStat]) {
    for stat in stats {
        match stat.tag {
            MemStatTag::ActualBalloon => guest.mem_total = stat.val_kib,
            MemStatTag::Unused => guest.mem_free = stat.val_kib,
            MemStatTag::Other => {}
        }
    }

    guest.percent_avail = if guest.mem_total > 0 {
        Some(percent_avail(guest.mem_free, guest.mem_total))
    } else {
        None
    };
}

/// Rebuild the hungry and excess masks from scratch.
///
/// A guest already at its configured maximum is never hungry: there is
/// nothing to grant it.
pub fn classify_guests(guests: &[GuestMem], th: MemThresholds) -> (IdMask, IdMask) {
    let mut high = IdMask::new();
    let mut low = IdMask::new();

    for (idx, guest) in guests.iter().enumerate() {
        let Some(pct) = guest.percent_avail else {
            continue;
        };

        if pct < th.guest_low && guest.mem_total < guest.mem_max {
            low.set(idx);
        } else if pct > th.guest_high {
            high.set(idx);
        }
    }

    (high, low)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guest(mem_total: u64, mem_free: u64, mem_max: u64) -> GuestMem {
        let mut g = GuestMem::new(GuestId::new(0), mem_max);
        apply_mem_stats(
            &mut g,
            &[
                MemStat {
                    tag: MemStatTag::ActualBalloon,
                    val_kib: mem_total,
                },
                MemStat {
                    tag: MemStatTag::Unused,
                    val_kib: mem_free,
                },
            ],
        );
        g
    }

    #[test]
    fn percent_clamps_at_100() {
        assert_eq!(percent_avail(500_000, 1_000_000), 50);
        assert_eq!(percent_avail(1_500_000, 1_000_000), 100);
        assert_eq!(percent_avail(0, 1_000_000), 0);
    }

    #[test]
    fn stats_match_by_tag_not_position() {
        let mut g = GuestMem::new(GuestId::new(0), 2_000_000);
        apply_mem_stats(
            &mut g,
            &[
                MemStat {
                    tag: MemStatTag::Other,
                    val_kib: 7,
                },
                MemStat {
                    tag: MemStatTag::Unused,
                    val_kib: 250_000,
                },
                MemStat {
                    tag: MemStatTag::ActualBalloon,
                    val_kib: 1_000_000,
                },
            ],
        );
        assert_eq!(g.mem_total, 1_000_000);
        assert_eq!(g.mem_free, 250_000);
        assert_eq!(g.percent_avail, Some(25));
    }

    #[test]
    fn missing_tag_keeps_previous_reading() {
        let mut g = guest(1_000_000, 500_000, 2_000_000);
        apply_mem_stats(
            &mut g,
            &[MemStat {
                tag: MemStatTag::Unused,
                val_kib: 100_000,
            }],
        );
        assert_eq!(g.mem_total, 1_000_000);
        assert_eq!(g.percent_avail, Some(10));
    }

    #[test]
    fn zero_balloon_stays_unclassified() {
        let mut g = GuestMem::new(GuestId::new(0), 2_000_000);
        apply_mem_stats(
            &mut g,
            &[MemStat {
                tag: MemStatTag::Unused,
                val_kib: 100_000,
            }],
        );
        assert_eq!(g.percent_avail, None);

        let (high, low) = classify_guests(&[g], MemThresholds::default());
        assert!(high.is_empty());
        assert!(low.is_empty());
    }

    #[test]
    fn classification_bands() {
        let guests = [
            guest(1_000_000, 500_000, 2_000_000), // 50% -> excess
            guest(1_000_000, 100_000, 2_000_000), // 10% -> hungry
            guest(1_000_000, 300_000, 2_000_000), // 30% -> neither
        ];
        let (high, low) = classify_guests(&guests, MemThresholds::default());
        assert!(high.test(0));
        assert!(low.test(1));
        assert!(!high.test(2));
        assert!(!low.test(2));
        assert_eq!(high.as_raw() & low.as_raw(), 0);
    }

    #[test]
    fn guest_at_max_is_not_hungry() {
        let g = guest(1_000_000, 100_000, 1_000_000);
        let (high, low) = classify_guests(&[g], MemThresholds::default());
        assert!(low.is_empty());
        assert!(high.is_empty());
    }

    #[test]
    fn boundary_values_are_unmarked() {
        // Exactly at the thresholds: strict comparisons on both sides.
        let guests = [
            guest(1_000_000, 250_000, 2_000_000), // 25%
            guest(1_000_000, 330_000, 2_000_000), // 33%
        ];
        let (high, low) = classify_guests(&guests, MemThresholds::default());
        assert!(high.is_empty());
        assert!(low.is_empty());
    }
}
