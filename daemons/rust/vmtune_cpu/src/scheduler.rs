// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Scheduler context and control cycle.

use std::sync::atomic::AtomicBool;
use std::time::Duration;

use log::{debug, info};

use vmtune_utils::host::{GuestId, HostError, Hypervisor};
use vmtune_utils::mask::IdMask;
use vmtune_utils::{run_control_loop, MAX_SLOTS, NSEC_PER_SEC};

use crate::balance;
use crate::pin_table::PinTable;
use crate::sampler::{self, CpuThresholds, PcpuStats, VcpuStats};

/// All state of the vCPU scheduler: the hypervisor session, the guests
/// captured at startup, sampling caches, and the ownership graph. Created by
/// [`Scheduler::init`], mutated only by the loop, consumed by
/// [`Scheduler::teardown`].
#[derive(Debug)]
pub struct Scheduler<H: Hypervisor> {
    conn: H,
    guests: Vec<GuestId>,
    pcpus: Vec<PcpuStats>,
    vcpus: Vec<VcpuStats>,
    table: PinTable,
    high_mask: IdMask,
    low_mask: IdMask,
    th: CpuThresholds,
    interval: Duration,
    cycle_ns: u64,
    dump_stats: bool,
}

impl<H: Hypervisor> Scheduler<H> {
    /// Connect the context: enumerate guests and pCPUs, seed the counter
    /// caches, and spread guest *i* onto pCPU `i mod num_pcpus` for a
    /// balanced start.
    pub fn init(
        mut conn: H,
        interval_secs: u64,
        th: CpuThresholds,
        dump_stats: bool,
    ) -> Result<Self, HostError> {
        let guests = conn.list_active_guests()?;
        if guests.is_empty() {
            return Err(HostError::NoGuests);
        }
        if guests.len() > MAX_SLOTS {
            return Err(HostError::Capacity(format!(
                "{} active guests, at most {} supported",
                guests.len(),
                MAX_SLOTS
            )));
        }

        let num_pcpus = conn.num_pcpus()?;
        if num_pcpus == 0 || num_pcpus > MAX_SLOTS {
            return Err(HostError::Capacity(format!(
                "{} pcpus, between 1 and {} supported",
                num_pcpus, MAX_SLOTS
            )));
        }

        let mut pcpus: Vec<PcpuStats> = (0..num_pcpus).map(PcpuStats::new).collect();
        for pcpu in pcpus.iter_mut() {
            pcpu.last_idle_ns = conn.pcpu_idle_ns(pcpu.id)?;
        }

        let mut table = PinTable::new(guests.len(), num_pcpus);
        let mut vcpus = Vec::with_capacity(guests.len());
        for (idx, &guest) in guests.iter().enumerate() {
            let pcpu = idx % num_pcpus;
            balance::pin(&mut conn, &guests, &mut table, idx, pcpu, pcpus[pcpu].cpumap)?;

            let info = conn.vcpu_info(guest)?;
            vcpus.push(VcpuStats {
                guest,
                last_time_ns: info.cpu_time_ns,
                util: None,
            });
        }

        info!(
            "managing {} guests across {} pcpus (high {}%, low {}%, target {}%)",
            guests.len(),
            num_pcpus,
            th.high,
            th.low,
            th.target
        );

        Ok(Self {
            conn,
            guests,
            pcpus,
            vcpus,
            table,
            high_mask: IdMask::new(),
            low_mask: IdMask::new(),
            th,
            interval: Duration::from_secs(interval_secs),
            cycle_ns: interval_secs * NSEC_PER_SEC,
            dump_stats,
        })
    }

    /// One sense/decide/act cycle.
    pub fn tick(&mut self) -> Result<(), HostError> {
        sampler::sample_pcpus(&mut self.conn, &mut self.pcpus, self.cycle_ns)?;
        sampler::sample_vcpus(&mut self.conn, &mut self.vcpus, self.cycle_ns)?;

        let (high, low) = sampler::classify_pcpus(&self.pcpus, &self.table, self.th);
        self.high_mask = high;
        self.low_mask = low;
        debug!("hot mask {} cold mask {}", self.high_mask, self.low_mask);

        balance::rebalance(
            &mut self.conn,
            &self.guests,
            &self.pcpus,
            &self.vcpus,
            &mut self.table,
            &mut self.high_mask,
            self.low_mask,
            self.th,
        )?;

        if self.dump_stats {
            self.dump();
        }

        Ok(())
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
            self.conn.release_guest(guest);
        }
        self.conn
    }

    fn dump(&self) {
        println!("\npCPU stats");
        println!("==========");
        for pcpu in &self.pcpus {
            println!("pCPU = {}", pcpu.id);
            match pcpu.util {
                Some(util) => println!("    cpu util = {}", util),
                None => println!("    cpu util = <unsampled>"),
            }
        }

        println!("\nvCPU stats");
        println!("==========");
        for (idx, vcpu) in self.vcpus.iter().enumerate() {
            println!("VM name  = {}", self.conn.guest_name(vcpu.guest));
            match self.table.pcpu_of(idx) {
                Some(pcpu) => println!("    pCPU pin = {}", pcpu),
                None => println!("    pCPU pin = <none>"),
            }
            match vcpu.util {
                Some(util) => println!("    cpu util = {}", util),
                None => println!("    cpu util = <unsampled>"),
            }
        }
    }

    pub fn table(&self) -> &PinTable {
        &self.table
    }

    pub fn pcpu_util(&self, pcpu: usize) -> Option<u32> {
        self.pcpus[pcpu].util
    }

    pub fn vcpu_util(&self, vcpu: usize) -> Option<u32> {
        self.vcpus[vcpu].util
    }

    pub fn high_mask(&self) -> IdMask {
        self.high_mask
    }

    pub fn low_mask(&self) -> IdMask {
        self.low_mask
    }

    pub fn num_guests(&self) -> usize {
        self.guests.len()
    }

    pub fn host(&self) -> &H {
        &self.conn
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.conn
    }
}
