// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Coordinator context and control cycle.

use std::sync::atomic::AtomicBool;
use std::time::Duration;

use log::{debug, info, warn};

use vmtune_utils::host::{HostError, Hypervisor};
use vmtune_utils::mask::IdMask;
use vmtune_utils::{run_control_loop, MAX_SLOTS};

use crate::adjust;
use crate::stats::{self, GuestMem, MemThresholds};

/// All state of the memory coordinator: the hypervisor session, the guests
/// captured at startup with their balloon readings, and host memory
/// telemetry. Created by [`Coordinator::init`], mutated only by the loop,
/// consumed by [`Coordinator::teardown`].
#[derive(Debug)]
pub struct Coordinator<H: Hypervisor> {
    conn: H,
    guests: Vec<GuestMem>,
    host_total: u64,
    host_tgt: u64,
    host_free: u64,
    high_mask: IdMask,
    low_mask: IdMask,
    th: MemThresholds,
    interval: Duration,
    dump_stats: bool,
}

impl<H: Hypervisor> Coordinator<H> {
    /// Connect the context: enumerate guests, capture host memory capacity,
    /// ask every balloon driver for 1 Hz statistics, and record each
    /// guest's configured maximum.
    pub fn init(
        mut conn: H,
        interval_secs: u64,
        th: MemThresholds,
        dump_stats: bool,
    ) -> Result<Self, HostError> {
        let handles = conn.list_active_guests()?;
        if handles.is_empty() {
            return Err(HostError::NoGuests);
        }
        if handles.len() > MAX_SLOTS {
            return Err(HostError::Capacity(format!(
                "{} active guests, at most {} supported",
                handles.len(),
                MAX_SLOTS
            )));
        }

        let host_free = conn.host_free_kib()?;
        if host_free == 0 {
            return Err(HostError::HostStats(
                "host reports no free memory".to_string(),
            ));
        }

        let host_total = conn.host_total_kib()?;
        let host_tgt = th.host_tgt * host_total / 100;

        let mut guests = Vec::with_capacity(handles.len());
        for &handle in &handles {
            conn.set_mem_stats_period(handle, 1)?;

            let mem_max = conn.max_mem_kib(handle)?;
            if mem_max == 0 {
                return Err(HostError::GuestInfo(format!(
                    "guest {} reports no maximum memory",
                    conn.guest_name(handle)
                )));
            }
            guests.push(GuestMem::new(handle, mem_max));
        }

        info!(
            "managing {} guests, host total {} KiB, host target {} KiB",
            guests.len(),
            host_total,
            host_tgt
        );

        Ok(Self {
            conn,
            guests,
            host_total,
            host_tgt,
            host_free,
            high_mask: IdMask::new(),
            low_mask: IdMask::new(),
            th,
            interval: Duration::from_secs(interval_secs),
            dump_stats,
        })
    }

    /// One sense/decide/act cycle.
    pub fn tick(&mut self) -> Result<(), HostError> {
        self.collect()?;
        self.excess_pass()?;
        self.hungry_pass()?;

        if self.dump_stats {
            self.dump();
        }

        Ok(())
    }

    /// Refresh host free memory and every guest's balloon reading, then
    /// rebuild both classification masks.
    fn collect(&mut self) -> Result<(), HostError> {
        self.host_free = self.conn.host_free_kib()?;

        for guest in self.guests.iter_mut() {
            let mem_stats = self.conn.mem_stats(guest.guest)?;
            stats::apply_mem_stats(guest, &mem_stats);
        }

        let (high, low) = stats::classify_guests(&self.guests, self.th);
        self.high_mask = high;
        self.low_mask = low;
        debug!(
            "host free {} KiB, excess mask {}, hungry mask {}",
            self.host_free, self.high_mask, self.low_mask
        );

        Ok(())
    }

    /// Reclaim from over-endowed guests first so the freed memory can back
    /// grants in the same cycle.
    fn excess_pass(&mut self) -> Result<(), HostError> {
        while let Some(idx) = self.high_mask.lowest_set() {
            let guest = &mut self.guests[idx];
            let Some(pct) = guest.percent_avail else {
                // Only sampled guests get classified; tolerate a stale mask.
                self.high_mask.clear(idx);
                continue;
            };

            let adj = adjust::shrink_adjust(guest.mem_total, pct, self.th.guest_tgt);
            guest.mem_total -= adj;
            debug!(
                "shrinking {} by {} KiB to {} KiB",
                self.conn.guest_name(guest.guest),
                adj,
                guest.mem_total
            );

            self.conn.set_memory_kib(guest.guest, guest.mem_total)?;
            self.high_mask.clear(idx);
        }
        Ok(())
    }

    /// Grow hungry guests while the host stays above its low-water mark;
    /// when it cannot, and the host is below target, take memory back from
    /// every guest in proportion to its share of host memory.
    fn hungry_pass(&mut self) -> Result<(), HostError> {
        while !self.low_mask.is_empty() {
            // The excess pass and earlier grants moved host memory; decide
            // each grant against a fresh reading.
            self.host_free = self.conn.host_free_kib()?;

            let idx = self.low_mask.lowest_set().unwrap();
            let guest = &mut self.guests[idx];
            let Some(pct) = guest.percent_avail else {
                self.low_mask.clear(idx);
                continue;
            };

            let adj = adjust::grow_adjust(guest.mem_total, pct, self.th.guest_tgt);
            let free_after = adjust::host_free_after_pct(self.host_free, adj, self.host_total);

            if free_after > self.th.host_low {
                guest.mem_total = (guest.mem_total + adj).min(guest.mem_max);
                debug!(
                    "growing {} by {} KiB to {} KiB",
                    self.conn.guest_name(guest.guest),
                    adj,
                    guest.mem_total
                );

                self.conn.set_memory_kib(guest.guest, guest.mem_total)?;
                self.low_mask.clear(idx);
            } else if self.host_free < self.host_tgt {
                self.fair_reclaim();
                self.low_mask.clear_all();
            } else {
                // The grant would dip under the low-water mark but the host
                // is not critical: deny it and move on.
                self.low_mask.clear(idx);
            }
        }
        Ok(())
    }

    /// Every guest surrenders memory proportional to its share of host
    /// memory until the host would be back at target. Per-guest set-memory
    /// failures are deliberately ignored: one refusing guest must not block
    /// host-wide reclaim.
    fn fair_reclaim(&mut self) {
        let shortfall = self.host_tgt - self.host_free;
        info!(
            "host low ({} KiB free, target {} KiB), reclaiming {} KiB proportionally",
            self.host_free, self.host_tgt, shortfall
        );

        for guest in self.guests.iter_mut() {
            let take = adjust::fair_share_take(guest.mem_total, shortfall, self.host_total);
            guest.mem_total = guest.mem_total.saturating_sub(take);

            if let Err(e) = self.conn.set_memory_kib(guest.guest, guest.mem_total) {
                warn!(
                    "reclaim from {} failed, continuing: {}",
                    self.conn.guest_name(guest.guest),
                    e
                );
            }
        }
    }

    /// Run until shutdown is raised or a tick fails.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<(), HostError> {
        let interval = self.interval;
        run_control_loop(interval, shutdown, || self.tick())
    }

    /// Release every guest handle and hand the session back to the caller,
    /// which closes it by dropping.
    pub fn teardown(mut self) -> H {
        for guest in std::mem::take(&mut self.guests) {
            self.conn.release_guest(guest.guest);
        }
        self.conn
    }

    fn dump(&self) {
        println!("\nMemory stats");
        println!("============");
        println!("Host free memory = {} MiB\n", self.host_free / 1024);

        for guest in &self.guests {
            println!("VM name          = {}", self.conn.guest_name(guest.guest));
            println!("    Balloon size = {} MiB", guest.mem_total / 1024);
            println!("    Avail size   = {} MiB", guest.mem_free / 1024);
            match guest.percent_avail {
                Some(pct) => println!("    Percent avail= {}\n", pct),
                None => println!("    Percent avail= <unsampled>\n"),
            }
        }
    }

    pub fn guest(&self, idx: usize) -> &GuestMem {
        &self.guests[idx]
    }

    pub fn high_mask(&self) -> IdMask {
        self.high_mask
    }

    pub fn low_mask(&self) -> IdMask {
        self.low_mask
    }

    pub fn host_free(&self) -> u64 {
        self.host_free
    }

    pub fn host(&self) -> &H {
        &self.conn
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.conn
    }
}
