// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! libvirt transport for the [`Hypervisor`] contract.
//!
//! Compiled only with the `libvirt` cargo feature, since the `virt` crate
//! links against the libvirt C library. Node CPU statistics and guest balloon
//! statistics go through the raw `virt::sys` bindings; the typed-parameter
//! probing they need is not worth wrapping further.

use std::mem::MaybeUninit;

use libc::c_int;

use virt::connect::Connect;
use virt::domain::Domain;
use virt::sys;

use crate::host::{GuestId, HostError, Hypervisor, MemStat, MemStatTag, VcpuInfo};
use crate::mask::IdMask;

const IDLE_FIELD: &[u8] = b"idle\0";

pub struct LibvirtHost {
    conn: Connect,
    domains: Vec<Option<Domain>>,
    names: Vec<String>,
}

impl LibvirtHost {
    /// Open a read/write session against `uri`, e.g. `qemu:///system`.
    pub fn open(uri: &str) -> Result<Self, HostError> {
        let conn = Connect::open(Some(uri)).map_err(|e| HostError::Conn(e.to_string()))?;
        Ok(Self {
            conn,
            domains: Vec::new(),
            names: Vec::new(),
        })
    }

    fn domain(&self, guest: GuestId) -> Result<&Domain, HostError> {
        self.domains
            .get(guest.raw() as usize)
            .and_then(|d| d.as_ref())
            .ok_or_else(|| HostError::GuestInfo(format!("unknown guest handle {}", guest.raw())))
    }
}

impl Hypervisor for LibvirtHost {
    fn list_active_guests(&mut self) -> Result<Vec<GuestId>, HostError> {
        let domains = self
            .conn
            .list_all_domains(sys::VIR_CONNECT_LIST_DOMAINS_ACTIVE)
            .map_err(|e| HostError::GuestList(e.to_string()))?;
        if domains.is_empty() {
            return Err(HostError::NoGuests);
        }

        self.names = domains
            .iter()
            .map(|d| d.get_name().unwrap_or_else(|_| "<unknown>".to_string()))
            .collect();
        self.domains = domains.into_iter().map(Some).collect();

        Ok((0..self.domains.len() as u32).map(GuestId::new).collect())
    }

    fn guest_name(&self, guest: GuestId) -> String {
        self.names
            .get(guest.raw() as usize)
            .cloned()
            .unwrap_or_else(|| "<unknown>".to_string())
    }

    fn host_free_kib(&mut self) -> Result<u64, HostError> {
        // libvirt reports bytes here, unlike every other memory value.
        let bytes = self
            .conn
            .get_free_memory()
            .map_err(|e| HostError::HostStats(e.to_string()))?;
        Ok(bytes / 1024)
    }

    fn host_total_kib(&mut self) -> Result<u64, HostError> {
        let info = self
            .conn
            .get_node_info()
            .map_err(|e| HostError::HostStats(e.to_string()))?;
        Ok(info.memory)
    }

    fn num_pcpus(&mut self) -> Result<usize, HostError> {
        let info = self
            .conn
            .get_node_info()
            .map_err(|e| HostError::HostStats(e.to_string()))?;
        Ok(info.cpus as usize)
    }

    fn pcpu_idle_ns(&mut self, pcpu: usize) -> Result<u64, HostError> {
        // Two-call pattern: probe the parameter count, then fetch and scan
        // for the "idle" field.
        unsafe {
            let mut nparams: c_int = 0;
            if sys::virNodeGetCPUStats(
                self.conn.as_ptr(),
                pcpu as c_int,
                std::ptr::null_mut(),
                &mut nparams,
                0,
            ) < 0
                || nparams <= 0
            {
                return Err(HostError::HostStats(format!(
                    "probing cpu stats of pcpu {} failed",
                    pcpu
                )));
            }

            let mut params: Vec<sys::virNodeCPUStats> =
                vec![MaybeUninit::zeroed().assume_init(); nparams as usize];
            if sys::virNodeGetCPUStats(
                self.conn.as_ptr(),
                pcpu as c_int,
                params.as_mut_ptr(),
                &mut nparams,
                0,
            ) < 0
            {
                return Err(HostError::HostStats(format!(
                    "reading cpu stats of pcpu {} failed",
                    pcpu
                )));
            }

            for param in params.iter().take(nparams as usize) {
                let field: &[u8] =
                    std::slice::from_raw_parts(param.field.as_ptr() as *const u8, IDLE_FIELD.len());
                if field == IDLE_FIELD {
                    return Ok(param.value);
                }
            }
        }

        Err(HostError::HostStats(format!(
            "pcpu {} reported no idle counter",
            pcpu
        )))
    }

    fn vcpu_info(&mut self, guest: GuestId) -> Result<VcpuInfo, HostError> {
        let vcpus = self
            .domain(guest)?
            .get_vcpus()
            .map_err(|e| HostError::GuestInfo(e.to_string()))?;
        let vcpu = vcpus
            .first()
            .ok_or_else(|| HostError::GuestInfo("guest reports no vcpus".to_string()))?;
        Ok(VcpuInfo {
            pcpu: vcpu.cpu.max(0) as usize,
            cpu_time_ns: vcpu.cpu_time,
        })
    }

    fn pin_vcpu(&mut self, guest: GuestId, vcpu: u32, pcpus: IdMask) -> Result<(), HostError> {
        let cpumap = pcpus.as_raw().to_le_bytes();
        self.domain(guest)?
            .pin_vcpu(vcpu, &cpumap)
            .map_err(|e| HostError::GuestInfo(e.to_string()))?;
        Ok(())
    }

    fn set_mem_stats_period(
        &mut self,
        guest: GuestId,
        period_secs: u32,
    ) -> Result<(), HostError> {
        self.domain(guest)?
            .set_memory_stats_period(period_secs as i32, sys::VIR_DOMAIN_AFFECT_LIVE)
            .map_err(|e| HostError::GuestInfo(e.to_string()))?;
        Ok(())
    }

    fn mem_stats(&mut self, guest: GuestId) -> Result<Vec<MemStat>, HostError> {
        let dom = self.domain(guest)?;
        let nr = sys::VIR_DOMAIN_MEMORY_STAT_NR as usize;
        let mut raw: Vec<sys::virDomainMemoryStatStruct> =
            vec![unsafe { MaybeUninit::zeroed().assume_init() }; nr];

        let count = unsafe {
            sys::virDomainMemoryStats(dom.as_ptr(), raw.as_mut_ptr(), nr as u32, 0)
        };
        if count <= 0 {
            return Err(HostError::GuestInfo(format!(
                "balloon stats of guest {} unavailable",
                self.guest_name(guest)
            )));
        }

        Ok(raw
            .iter()
            .take(count as usize)
            .map(|stat| MemStat {
                tag: match stat.tag as u32 {
                    sys::VIR_DOMAIN_MEMORY_STAT_ACTUAL_BALLOON => MemStatTag::ActualBalloon,
                    sys::VIR_DOMAIN_MEMORY_STAT_UNUSED => MemStatTag::Unused,
                    _ => MemStatTag::Other,
                },
                val_kib: stat.val,
            })
            .collect())
    }

    fn max_mem_kib(&mut self, guest: GuestId) -> Result<u64, HostError> {
        self.domain(guest)?
            .get_max_memory()
            .map_err(|e| HostError::GuestInfo(e.to_string()))
    }

    fn set_memory_kib(&mut self, guest: GuestId, kib: u64) -> Result<(), HostError> {
        self.domain(guest)?
            .set_memory(kib)
            .map_err(|e| HostError::GuestInfo(e.to_string()))?;
        Ok(())
    }

    fn release_guest(&mut self, guest: GuestId) {
        if let Some(slot) = self.domains.get_mut(guest.raw() as usize) {
            // Dropping the Domain frees the underlying handle.
            slot.take();
        }
    }
}

impl Drop for LibvirtHost {
    fn drop(&mut self) {
        self.domains.clear();
        if let Err(e) = self.conn.close() {
            log::warn!("closing hypervisor session failed: {}", e);
        }
    }
}
