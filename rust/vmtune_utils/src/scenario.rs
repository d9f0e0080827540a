// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Deterministic scripted hypervisor.
//!
//! [`ScenarioHost`] replays pre-scripted telemetry and records every command
//! the daemons issue, so a whole control cycle can be driven offline and its
//! decisions asserted exactly. Counter scripts are consumed one value per
//! read; an exhausted script keeps returning its last value, which makes
//! "init plus N ticks" scenarios easy to write.
//!
//! Failure injection is one-shot and per-operation: the next call of the
//! armed operation fails with the matching [`HostError`], later calls
//! succeed again.

use crate::host::{GuestId, HostError, Hypervisor, MemStat, MemStatTag, VcpuInfo};
use crate::mask::IdMask;

/// Sequence of scripted values, replaying the last one once exhausted.
#[derive(Clone, Debug, Default)]
struct Script {
    values: Vec<u64>,
    cursor: usize,
}

impl Script {
    fn push(&mut self, values: &[u64]) {
        self.values.extend_from_slice(values);
    }

    fn next(&mut self) -> Option<u64> {
        if self.values.is_empty() {
            return None;
        }
        let idx = self.cursor.min(self.values.len() - 1);
        self.cursor += 1;
        Some(self.values[idx])
    }
}

/// Operations that can be armed to fail once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailOp {
    ListGuests,
    /// Report an empty guest list instead of an error.
    EmptyList,
    HostFree,
    HostTotal,
    NumPcpus,
    PcpuIdle,
    VcpuInfo,
    Pin,
    MemStatsPeriod,
    MemStats,
    MaxMem,
    SetMemory,
}

/// One recorded `pin_vcpu` command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PinCall {
    pub guest: usize,
    pub vcpu: u32,
    pub pcpus: IdMask,
}

#[derive(Clone, Debug)]
struct ScenarioGuest {
    name: String,
    max_mem_kib: u64,
    cur_pcpu: usize,
    vcpu_time: Script,
    mem_stats: Vec<Vec<MemStat>>,
    mem_cursor: usize,
    released: bool,
}

/// Scripted in-memory [`Hypervisor`].
#[derive(Debug, Default)]
pub struct ScenarioHost {
    guests: Vec<ScenarioGuest>,
    num_pcpus: usize,
    host_total_kib: u64,
    host_free: Script,
    pcpu_idle: Vec<Script>,
    fails: Vec<FailOp>,

    /// Every successful `pin_vcpu`, in issue order.
    pub pins: Vec<PinCall>,
    /// Every successful `set_memory_kib`, in issue order.
    pub mem_sets: Vec<(usize, u64)>,
    /// Every `set_mem_stats_period`, in issue order.
    pub stats_periods: Vec<(usize, u32)>,
}

impl ScenarioHost {
    pub fn new(num_pcpus: usize, host_total_kib: u64) -> Self {
        Self {
            num_pcpus,
            host_total_kib,
            pcpu_idle: vec![Script::default(); num_pcpus],
            ..Default::default()
        }
    }

    /// Add a guest; returns its index, which doubles as its handle value.
    pub fn add_guest(&mut self, name: &str, max_mem_kib: u64) -> usize {
        self.guests.push(ScenarioGuest {
            name: name.to_string(),
            max_mem_kib,
            cur_pcpu: 0,
            vcpu_time: Script::default(),
            mem_stats: Vec::new(),
            mem_cursor: 0,
            released: false,
        });
        self.guests.len() - 1
    }

    /// Script successive `pcpu_idle_ns` readings for one pCPU.
    pub fn script_pcpu_idle(&mut self, pcpu: usize, values: &[u64]) {
        self.pcpu_idle[pcpu].push(values);
    }

    /// Script successive cumulative vCPU run-time readings for one guest.
    pub fn script_vcpu_time(&mut self, guest: usize, values: &[u64]) {
        self.guests[guest].vcpu_time.push(values);
    }

    /// Script successive `host_free_kib` readings.
    pub fn script_host_free(&mut self, values: &[u64]) {
        self.host_free.push(values);
    }

    /// Script one raw balloon statistics list for a guest. Lists are
    /// consumed in order; the last one repeats.
    pub fn script_mem_stats(&mut self, guest: usize, stats: Vec<MemStat>) {
        self.guests[guest].mem_stats.push(stats);
    }

    /// Convenience: script (balloon size, unused) pairs, padded with an
    /// unrelated tag the way a real balloon driver interleaves entries.
    pub fn script_balloon(&mut self, guest: usize, readings: &[(u64, u64)]) {
        for &(actual, unused) in readings {
            self.script_mem_stats(
                guest,
                vec![
                    MemStat {
                        tag: MemStatTag::Other,
                        val_kib: 0,
                    },
                    MemStat {
                        tag: MemStatTag::Unused,
                        val_kib: unused,
                    },
                    MemStat {
                        tag: MemStatTag::ActualBalloon,
                        val_kib: actual,
                    },
                ],
            );
        }
    }

    /// Arm `op` to fail on its next invocation.
    pub fn fail_next(&mut self, op: FailOp) {
        self.fails.push(op);
    }

    pub fn released(&self, guest: usize) -> bool {
        self.guests[guest].released
    }

    pub fn all_released(&self) -> bool {
        self.guests.iter().all(|g| g.released)
    }

    fn take_fail(&mut self, op: FailOp) -> bool {
        match self.fails.iter().position(|&f| f == op) {
            Some(idx) => {
                self.fails.remove(idx);
                true
            }
            None => false,
        }
    }

    fn guest_idx(&self, guest: GuestId) -> usize {
        guest.raw() as usize
    }
}

impl Hypervisor for ScenarioHost {
    fn list_active_guests(&mut self) -> Result<Vec<GuestId>, HostError> {
        if self.take_fail(FailOp::ListGuests) {
            return Err(HostError::GuestList("scripted failure".into()));
        }
        if self.take_fail(FailOp::EmptyList) || self.guests.is_empty() {
            return Err(HostError::NoGuests);
        }
        Ok((0..self.guests.len() as u32).map(GuestId::new).collect())
    }

    fn guest_name(&self, guest: GuestId) -> String {
        self.guests[self.guest_idx(guest)].name.clone()
    }

    fn host_free_kib(&mut self) -> Result<u64, HostError> {
        if self.take_fail(FailOp::HostFree) {
            return Err(HostError::HostStats("scripted failure".into()));
        }
        self.host_free
            .next()
            .ok_or_else(|| HostError::HostStats("host free memory not scripted".into()))
    }

    fn host_total_kib(&mut self) -> Result<u64, HostError> {
        if self.take_fail(FailOp::HostTotal) {
            return Err(HostError::HostStats("scripted failure".into()));
        }
        Ok(self.host_total_kib)
    }

    fn num_pcpus(&mut self) -> Result<usize, HostError> {
        if self.take_fail(FailOp::NumPcpus) {
            return Err(HostError::HostStats("scripted failure".into()));
        }
        Ok(self.num_pcpus)
    }

    fn pcpu_idle_ns(&mut self, pcpu: usize) -> Result<u64, HostError> {
        if self.take_fail(FailOp::PcpuIdle) {
            return Err(HostError::HostStats("scripted failure".into()));
        }
        self.pcpu_idle
            .get_mut(pcpu)
            .and_then(|script| script.next())
            .ok_or_else(|| HostError::HostStats(format!("pcpu {} idle time not scripted", pcpu)))
    }

    fn vcpu_info(&mut self, guest: GuestId) -> Result<VcpuInfo, HostError> {
        if self.take_fail(FailOp::VcpuInfo) {
            return Err(HostError::GuestInfo("scripted failure".into()));
        }
        let idx = self.guest_idx(guest);
        let pcpu = self.guests[idx].cur_pcpu;
        self.guests[idx]
            .vcpu_time
            .next()
            .map(|cpu_time_ns| VcpuInfo { pcpu, cpu_time_ns })
            .ok_or_else(|| HostError::GuestInfo(format!("guest {} run time not scripted", idx)))
    }

    fn pin_vcpu(&mut self, guest: GuestId, vcpu: u32, pcpus: IdMask) -> Result<(), HostError> {
        if self.take_fail(FailOp::Pin) {
            return Err(HostError::GuestInfo("scripted pin failure".into()));
        }
        let idx = self.guest_idx(guest);
        if let Some(pcpu) = pcpus.lowest_set() {
            self.guests[idx].cur_pcpu = pcpu;
        }
        self.pins.push(PinCall {
            guest: idx,
            vcpu,
            pcpus,
        });
        Ok(())
    }

    fn set_mem_stats_period(
        &mut self,
        guest: GuestId,
        period_secs: u32,
    ) -> Result<(), HostError> {
        if self.take_fail(FailOp::MemStatsPeriod) {
            return Err(HostError::GuestInfo("scripted failure".into()));
        }
        let idx = self.guest_idx(guest);
        self.stats_periods.push((idx, period_secs));
        Ok(())
    }

    fn mem_stats(&mut self, guest: GuestId) -> Result<Vec<MemStat>, HostError> {
        if self.take_fail(FailOp::MemStats) {
            return Err(HostError::GuestInfo("scripted failure".into()));
        }
        let idx = self.guest_idx(guest);
        let g = &mut self.guests[idx];
        if g.mem_stats.is_empty() {
            return Err(HostError::GuestInfo(format!(
                "guest {} balloon stats not scripted",
                idx
            )));
        }
        let list = g.mem_stats[g.mem_cursor.min(g.mem_stats.len() - 1)].clone();
        g.mem_cursor += 1;
        Ok(list)
    }

    fn max_mem_kib(&mut self, guest: GuestId) -> Result<u64, HostError> {
        if self.take_fail(FailOp::MaxMem) {
            return Err(HostError::GuestInfo("scripted failure".into()));
        }
        Ok(self.guests[self.guest_idx(guest)].max_mem_kib)
    }

    fn set_memory_kib(&mut self, guest: GuestId, kib: u64) -> Result<(), HostError> {
        if self.take_fail(FailOp::SetMemory) {
            return Err(HostError::GuestInfo("scripted set-memory failure".into()));
        }
        let idx = self.guest_idx(guest);
        self.mem_sets.push((idx, kib));
        Ok(())
    }

    fn release_guest(&mut self, guest: GuestId) {
        let idx = self.guest_idx(guest);
        if let Some(g) = self.guests.get_mut(idx) {
            g.released = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripts_replay_last_value() {
        let mut host = ScenarioHost::new(1, 1_000_000);
        host.script_pcpu_idle(0, &[100, 200]);
        assert_eq!(host.pcpu_idle_ns(0).unwrap(), 100);
        assert_eq!(host.pcpu_idle_ns(0).unwrap(), 200);
        assert_eq!(host.pcpu_idle_ns(0).unwrap(), 200);
    }

    #[test]
    fn fail_is_one_shot() {
        let mut host = ScenarioHost::new(1, 1_000_000);
        host.script_host_free(&[500_000]);
        host.fail_next(FailOp::HostFree);
        assert!(host.host_free_kib().is_err());
        assert_eq!(host.host_free_kib().unwrap(), 500_000);
    }

    #[test]
    fn fail_only_hits_matching_op() {
        let mut host = ScenarioHost::new(2, 1_000_000);
        host.script_host_free(&[500_000]);
        host.fail_next(FailOp::PcpuIdle);
        assert_eq!(host.host_free_kib().unwrap(), 500_000);
        assert!(host.pcpu_idle_ns(0).is_err());
    }

    #[test]
    fn pins_update_reported_placement() {
        let mut host = ScenarioHost::new(2, 1_000_000);
        let g = host.add_guest("vm0", 1_000_000);
        host.script_vcpu_time(g, &[0]);
        host.pin_vcpu(GuestId::new(g as u32), 0, IdMask::single(1))
            .unwrap();
        let info = host.vcpu_info(GuestId::new(g as u32)).unwrap();
        assert_eq!(info.pcpu, 1);
        assert_eq!(host.pins.len(), 1);
    }

    #[test]
    fn empty_host_reports_no_guests() {
        let mut host = ScenarioHost::new(1, 1_000_000);
        assert_eq!(host.list_active_guests(), Err(HostError::NoGuests));
    }
}
