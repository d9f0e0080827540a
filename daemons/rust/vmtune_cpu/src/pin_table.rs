// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! vCPU-to-pCPU ownership graph.
//!
//! Each pCPU owns a circular ring of the vCPUs pinned to it; the ring is
//! stored as an index arena (flat slot vectors with `prev`/`next` indices)
//! so membership is checkable and unlinking is O(1). vCPUs and guests are
//! one-to-one, so a vCPU is identified by its guest's index.
//!
//! Invariants kept at all times once every vCPU has been linked:
//! - a vCPU is linked to exactly one pCPU, and the per-pCPU pin counts sum
//!   to the number of vCPUs;
//! - a pCPU's ring is empty iff its head is unset iff its pin count is 0,
//!   and otherwise forms a closed cycle in both directions.

/// Link state of one vCPU slot.
#[derive(Clone, Copy, Debug, Default)]
struct VcpuLink {
    prev: Option<usize>,
    next: Option<usize>,
    pcpu: Option<usize>,
}

/// Ring state of one pCPU.
#[derive(Clone, Copy, Debug, Default)]
struct PcpuRing {
    head: Option<usize>,
    num_pinned: usize,
}

#[derive(Debug)]
pub struct PinTable {
    vcpus: Vec<VcpuLink>,
    pcpus: Vec<PcpuRing>,
}

impl PinTable {
    pub fn new(num_vcpus: usize, num_pcpus: usize) -> Self {
        Self {
            vcpus: vec![VcpuLink::default(); num_vcpus],
            pcpus: vec![PcpuRing::default(); num_pcpus],
        }
    }

    /// pCPU the vCPU is currently linked to, if any.
    pub fn pcpu_of(&self, vcpu: usize) -> Option<usize> {
        self.vcpus[vcpu].pcpu
    }

    pub fn num_pinned(&self, pcpu: usize) -> usize {
        self.pcpus[pcpu].num_pinned
    }

    /// Link `vcpu` at the tail of `pcpu`'s ring (just before the head),
    /// unlinking it from its current ring first.
    pub fn link(&mut self, vcpu: usize, pcpu: usize) {
        self.unlink(vcpu);

        match self.pcpus[pcpu].head {
            None => {
                self.vcpus[vcpu].prev = Some(vcpu);
                self.vcpus[vcpu].next = Some(vcpu);
                self.pcpus[pcpu].head = Some(vcpu);
            }
            Some(head) => {
                let tail = self.vcpus[head].prev.unwrap();
                self.vcpus[vcpu].prev = Some(tail);
                self.vcpus[vcpu].next = Some(head);
                self.vcpus[tail].next = Some(vcpu);
                self.vcpus[head].prev = Some(vcpu);
            }
        }

        self.pcpus[pcpu].num_pinned += 1;
        self.vcpus[vcpu].pcpu = Some(pcpu);
    }

    /// Remove `vcpu` from its ring. No-op when unlinked.
    pub fn unlink(&mut self, vcpu: usize) {
        let Some(pcpu) = self.vcpus[vcpu].pcpu else {
            return;
        };

        self.pcpus[pcpu].num_pinned -= 1;

        if self.vcpus[vcpu].prev == Some(vcpu) {
            // Sole member.
            self.pcpus[pcpu].head = None;
        } else {
            let prev = self.vcpus[vcpu].prev.unwrap();
            let next = self.vcpus[vcpu].next.unwrap();
            self.vcpus[prev].next = Some(next);
            self.vcpus[next].prev = Some(prev);
            if self.pcpus[pcpu].head == Some(vcpu) {
                self.pcpus[pcpu].head = Some(next);
            }
        }

        self.vcpus[vcpu] = VcpuLink::default();
    }

    /// Ring members of `pcpu`, starting at the head and following the
    /// forward links, i.e. in insertion order.
    pub fn ring(&self, pcpu: usize) -> Vec<usize> {
        let mut members = Vec::with_capacity(self.pcpus[pcpu].num_pinned);
        let Some(head) = self.pcpus[pcpu].head else {
            return members;
        };

        let mut cur = head;
        loop {
            members.push(cur);
            cur = self.vcpus[cur].next.unwrap();
            if cur == head {
                break;
            }
        }
        members
    }

    /// Check the structural invariants; used by tests and debug assertions.
    pub fn is_consistent(&self) -> bool {
        let mut linked = 0;

        for (pcpu, ring) in self.pcpus.iter().enumerate() {
            if (ring.head.is_none()) != (ring.num_pinned == 0) {
                return false;
            }

            let members = self.ring(pcpu);
            if members.len() != ring.num_pinned {
                return false;
            }
            for &vcpu in &members {
                if self.vcpus[vcpu].pcpu != Some(pcpu) {
                    return false;
                }
                let next = self.vcpus[vcpu].next.unwrap();
                if self.vcpus[next].prev != Some(vcpu) {
                    return false;
                }
            }
            linked += members.len();
        }

        linked == self.vcpus.iter().filter(|v| v.pcpu.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_link_forms_self_ring() {
        let mut table = PinTable::new(1, 2);
        table.link(0, 1);
        assert_eq!(table.pcpu_of(0), Some(1));
        assert_eq!(table.num_pinned(1), 1);
        assert_eq!(table.ring(1), vec![0]);
        assert!(table.is_consistent());
    }

    #[test]
    fn links_append_at_tail() {
        let mut table = PinTable::new(3, 1);
        table.link(0, 0);
        table.link(1, 0);
        table.link(2, 0);
        assert_eq!(table.ring(0), vec![0, 1, 2]);
        assert_eq!(table.num_pinned(0), 3);
        assert!(table.is_consistent());
    }

    #[test]
    fn relink_moves_between_rings() {
        let mut table = PinTable::new(4, 2);
        for vcpu in 0..4 {
            table.link(vcpu, vcpu % 2);
        }
        // Mirrors the overloaded-pCPU scenario: the migrated vCPU lands at
        // the tail of the destination ring.
        table.link(0, 1);
        assert_eq!(table.ring(0), vec![2]);
        assert_eq!(table.ring(1), vec![1, 3, 0]);
        assert_eq!(table.num_pinned(0), 1);
        assert_eq!(table.num_pinned(1), 3);
        assert!(table.is_consistent());
    }

    #[test]
    fn unlink_head_promotes_next() {
        let mut table = PinTable::new(3, 1);
        for vcpu in 0..3 {
            table.link(vcpu, 0);
        }
        table.unlink(0);
        assert_eq!(table.ring(0), vec![1, 2]);
        assert_eq!(table.pcpu_of(0), None);
        assert!(table.is_consistent());
    }

    #[test]
    fn unlink_last_empties_ring() {
        let mut table = PinTable::new(1, 1);
        table.link(0, 0);
        table.unlink(0);
        assert_eq!(table.ring(0), Vec::<usize>::new());
        assert_eq!(table.num_pinned(0), 0);
        assert!(table.is_consistent());
    }

    #[test]
    fn unlink_unlinked_is_noop() {
        let mut table = PinTable::new(2, 1);
        table.link(0, 0);
        table.unlink(1);
        assert_eq!(table.num_pinned(0), 1);
        assert!(table.is_consistent());
    }

    #[test]
    fn relink_same_pcpu_keeps_count() {
        let mut table = PinTable::new(2, 1);
        table.link(0, 0);
        table.link(1, 0);
        table.link(0, 0);
        assert_eq!(table.num_pinned(0), 2);
        assert_eq!(table.ring(0), vec![1, 0]);
        assert!(table.is_consistent());
    }

    #[test]
    fn shuffle_preserves_invariants() {
        let mut table = PinTable::new(8, 3);
        for vcpu in 0..8 {
            table.link(vcpu, vcpu % 3);
        }
        for (vcpu, pcpu) in [(0, 2), (4, 0), (7, 0), (2, 1), (0, 1), (5, 2)] {
            table.link(vcpu, pcpu);
            assert!(table.is_consistent());
        }
        let total: usize = (0..3).map(|p| table.num_pinned(p)).sum();
        assert_eq!(total, 8);
    }
}
