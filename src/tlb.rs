//! Per-regime TLB store: a range-lookup structure over cached translations
//! plus an intrusive free list for entry reuse, grounded on
//! `riscv-vm::mmu::{TlbEntry, Tlb}` but generalized from the teacher's
//! direct-mapped 64-way cache to the spec's range-keyed, ASID-aware store
//! (the teacher's modulo-indexed scheme can't represent overlapping
//! superpages from two different guests at once, which this spec requires).

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::asid::{SimAsid, SimAsidMask};
use crate::csr::{Mode, Regime};

/// Permission bit masks, packed the way `riscv-vm::mmu` packs them into a
/// single byte (`PERM_R`..`PERM_G`).
pub const PERM_R: u8 = 1 << 0;
pub const PERM_W: u8 = 1 << 1;
pub const PERM_X: u8 = 1 << 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrivMask(pub u8);

impl PrivMask {
    pub const NONE: PrivMask = PrivMask(0);
    pub const RWX: PrivMask = PrivMask(PERM_R | PERM_W | PERM_X);

    pub fn contains(self, required: PrivMask) -> bool {
        self.0 & required.0 == required.0
    }

    pub fn r(self) -> bool {
        self.0 & PERM_R != 0
    }
    pub fn w(self) -> bool {
        self.0 & PERM_W != 0
    }
    pub fn x(self) -> bool {
        self.0 & PERM_X != 0
    }

    pub fn union(self, other: PrivMask) -> PrivMask {
        PrivMask(self.0 | other.0)
    }
    pub fn intersect(self, other: PrivMask) -> PrivMask {
        PrivMask(self.0 & other.0)
    }
    pub fn with_r(self) -> PrivMask {
        PrivMask(self.0 | PERM_R)
    }
    pub fn without_x(self) -> PrivMask {
        PrivMask(self.0 & !PERM_X)
    }
}

/// Bitmask over base privilege modes (`User`/`Supervisor`/`Machine`) in
/// which an entry is currently aliased into a virtual domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MappedMask(pub u8);

impl MappedMask {
    pub const EMPTY: MappedMask = MappedMask(0);

    fn bit(mode: Mode) -> u8 {
        1 << mode.level()
    }

    pub fn is_mapped(self, mode: Mode) -> bool {
        self.0 & Self::bit(mode) != 0
    }

    pub fn set(&mut self, mode: Mode) {
        self.0 |= Self::bit(mode);
    }

    pub fn clear(&mut self, mode: Mode) {
        self.0 &= !Self::bit(mode);
    }

    pub fn any(self) -> bool {
        self.0 != 0
    }
}

/// An opaque handle into a [`Tlb`]'s range table, stored back on the entry
/// it indexes. Never constructed by hand outside this module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

/// One cached translation (spec §3 "TLB Entry").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbEntry {
    pub low_va: u64,
    pub high_va: u64,
    pub pa: u64,
    pub regime: Regime,
    pub perm: PrivMask,
    pub user: bool,
    pub global: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub mapped: MappedMask,
    /// Created by a non-architectural probe (debug read); never survives
    /// into host mappings and is deleted the next time it is encountered.
    pub artifact: bool,
    pub sim_asid: SimAsid,
    pub asid_mask: SimAsidMask,
    lut_entry: Option<NodeId>,
}

impl TlbEntry {
    /// Construct an entry not yet linked into any range table (`lut_entry`
    /// is private and only ever set by [`Tlb::insert`]).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        low_va: u64,
        high_va: u64,
        pa: u64,
        regime: Regime,
        perm: PrivMask,
        user: bool,
        global: bool,
        accessed: bool,
        dirty: bool,
        mapped: MappedMask,
        artifact: bool,
        sim_asid: SimAsid,
        asid_mask: SimAsidMask,
    ) -> TlbEntry {
        TlbEntry {
            low_va,
            high_va,
            pa,
            regime,
            perm,
            user,
            global,
            accessed,
            dirty,
            mapped,
            artifact,
            sim_asid,
            asid_mask,
            lut_entry: None,
        }
    }

    pub fn size(&self) -> u64 {
        self.high_va - self.low_va + 1
    }
}

enum Slot {
    Free { next: Option<usize> },
    Used(TlbEntry),
}

/// Interval store keyed by `low_va`. A `BTreeMap` gives `O(log n)` access to
/// the predecessor of a query point; candidates are then walked downward and
/// filtered by containment. The spec explicitly does not mandate a
/// particular tree (§9 Design Notes), so this trades worst-case overlap
/// fan-out for the simplicity of reusing `std::collections::BTreeMap`.
struct RangeTable {
    by_low: BTreeMap<u64, Vec<NodeId>>,
    nodes: Vec<Option<(u64, u64, usize)>>, // (low, high, slot)
    free_ids: Vec<usize>,
}

impl RangeTable {
    fn new() -> Self {
        Self {
            by_low: BTreeMap::new(),
            nodes: Vec::new(),
            free_ids: Vec::new(),
        }
    }

    fn insert(&mut self, low: u64, high: u64, slot: usize) -> NodeId {
        let id = if let Some(id) = self.free_ids.pop() {
            self.nodes[id] = Some((low, high, slot));
            id
        } else {
            self.nodes.push(Some((low, high, slot)));
            self.nodes.len() - 1
        };
        self.by_low.entry(low).or_default().push(NodeId(id));
        NodeId(id)
    }

    fn remove(&mut self, id: NodeId) {
        if let Some((low, _, _)) = self.nodes[id.0].take() {
            if let Some(bucket) = self.by_low.get_mut(&low) {
                bucket.retain(|n| *n != id);
                if bucket.is_empty() {
                    self.by_low.remove(&low);
                }
            }
            self.free_ids.push(id.0);
        }
    }

    fn slot_of(&self, id: NodeId) -> usize {
        self.nodes[id.0].expect("dangling range-table handle").2
    }

    /// First node (by descending `low`) whose range contains `point`.
    fn first_overlap(&self, point: u64) -> Option<NodeId> {
        for (&low, bucket) in self.by_low.range(..=point).rev() {
            for &id in bucket {
                if let Some((l, h, _)) = self.nodes[id.0] {
                    if l == low && point <= h {
                        return Some(id);
                    }
                }
            }
        }
        None
    }

    /// Every node overlapping `[low, high]`, in no particular order.
    fn overlapping(&self, low: u64, high: u64) -> Vec<NodeId> {
        let mut out = Vec::new();
        for (&node_low, bucket) in self.by_low.range(..=high).rev() {
            for &id in bucket {
                if let Some((l, h, _)) = self.nodes[id.0] {
                    if l == node_low && l <= high && h >= low {
                        out.push(id);
                    }
                }
            }
        }
        out
    }
}

/// One TLB (HS, VS1, or VS2). Owns a range-lookup structure and a singly
/// linked free list of reusable entry slots.
pub struct Tlb {
    regime: Regime,
    pool: Vec<Slot>,
    free_head: Option<usize>,
    ranges: RangeTable,
}

impl Tlb {
    pub fn new(regime: Regime) -> Self {
        Self {
            regime,
            pool: Vec::new(),
            free_head: None,
            ranges: RangeTable::new(),
        }
    }

    pub fn regime(&self) -> Regime {
        self.regime
    }

    fn alloc_slot(&mut self, entry: TlbEntry) -> usize {
        if let Some(idx) = self.free_head {
            match self.pool[idx] {
                Slot::Free { next } => self.free_head = next,
                Slot::Used(_) => unreachable!("free list pointed at a used slot"),
            }
            self.pool[idx] = Slot::Used(entry);
            idx
        } else {
            self.pool.push(Slot::Used(entry));
            self.pool.len() - 1
        }
    }

    fn free_slot(&mut self, idx: usize) -> TlbEntry {
        let prev = std::mem::replace(
            &mut self.pool[idx],
            Slot::Free {
                next: self.free_head,
            },
        );
        self.free_head = Some(idx);
        match prev {
            Slot::Used(entry) => entry,
            Slot::Free { .. } => unreachable!("double free of TLB slot"),
        }
    }

    /// Link a fully populated entry into the range structure. The entry's
    /// `lut_entry` back-reference is filled in.
    pub fn insert(&mut self, mut entry: TlbEntry) {
        let low = entry.low_va;
        let high = entry.high_va;
        entry.lut_entry = None;
        let slot = self.alloc_slot(entry);
        let node = self.ranges.insert(low, high, slot);
        if let Slot::Used(e) = &mut self.pool[slot] {
            e.lut_entry = Some(node);
        }
        log::trace!(
            "tlb[{:?}] insert [{:#x},{:#x}] -> pa {:#x}",
            self.regime,
            low,
            high,
            slot_entry_pa(&self.pool[slot])
        );
    }

    /// Range-overlap point lookup: returns the first non-artifact entry
    /// overlapping `va` whose key matches `caller_key` under its own mask.
    /// Artifact entries encountered while scanning are deleted in place and
    /// skipped, matching spec §4.4. Different ASIDs may legitimately map
    /// the same VA range at once, so a key mismatch on one candidate keeps
    /// scanning rather than reporting an immediate miss.
    pub fn find(&mut self, va: u64, caller_key: SimAsid) -> Option<TlbEntry> {
        loop {
            let candidates = self.ranges.overlapping(va, va);
            if candidates.is_empty() {
                return None;
            }
            let mut found = None;
            let mut deleted_artifact = false;
            for id in candidates {
                let slot = self.ranges.slot_of(id);
                let is_artifact = matches!(&self.pool[slot], Slot::Used(e) if e.artifact);
                if is_artifact {
                    self.delete_node(id);
                    deleted_artifact = true;
                    continue;
                }
                if let Slot::Used(e) = &self.pool[slot] {
                    if e.sim_asid.matches(caller_key, e.asid_mask) {
                        found = Some(*e);
                        break;
                    }
                }
            }
            if let Some(entry) = found {
                return Some(entry);
            }
            if deleted_artifact {
                // An artifact entry was removed this pass; re-scan in case
                // it was shadowing a matching entry underneath.
                continue;
            }
            return None;
        }
    }

    /// Mutable access to an entry by the VA it covers, for in-place A/D and
    /// `mapped`-bitmask updates performed by the orchestrator.
    pub fn get_mut(&mut self, va: u64) -> Option<&mut TlbEntry> {
        let id = self.ranges.first_overlap(va)?;
        let slot = self.ranges.slot_of(id);
        match &mut self.pool[slot] {
            Slot::Used(e) => Some(e),
            Slot::Free { .. } => None,
        }
    }

    fn delete_node(&mut self, id: NodeId) -> TlbEntry {
        let slot = self.ranges.slot_of(id);
        self.ranges.remove(id);
        self.free_slot(slot)
    }

    /// Delete every overlapping entry matching the invalidation mode,
    /// returning the removed entries so the caller (orchestrator) can tear
    /// down their host-side aliases.
    pub fn invalidate(
        &mut self,
        low: u64,
        high: u64,
        scope: InvalidateScope,
        current_vmid: Option<u16>,
    ) -> Vec<TlbEntry> {
        let mut removed = Vec::new();
        for id in self.ranges.overlapping(low, high) {
            let slot = self.ranges.slot_of(id);
            let matches = match &self.pool[slot] {
                Slot::Used(e) => match scope {
                    InvalidateScope::Any => true,
                    InvalidateScope::Asid(asid) => {
                        !e.global
                            && e.sim_asid.asid_hs() == asid
                            && current_vmid
                                .map(|vmid| e.sim_asid.vmid() == vmid)
                                .unwrap_or(true)
                    }
                },
                Slot::Free { .. } => false,
            };
            if matches {
                removed.push(self.delete_node(id));
            }
        }
        log::debug!(
            "tlb[{:?}] invalidate [{:#x},{:#x}] scope={:?}: {} removed",
            self.regime,
            low,
            high,
            scope,
            removed.len()
        );
        removed
    }

    /// Every live, non-artifact entry, in no particular order. Used by
    /// [`crate::save::save_tlb`]; artifact entries never persist (spec §4.4).
    pub fn dump_entries(&self) -> Vec<TlbEntry> {
        self.pool
            .iter()
            .filter_map(|slot| match slot {
                Slot::Used(e) if !e.artifact => Some(*e),
                _ => None,
            })
            .collect()
    }

    /// Human-readable listing for the debug `dumpTLB` family of commands.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for slot in &self.pool {
            if let Slot::Used(e) = slot {
                let _ = write!(
                    out,
                    "[{:#018x},{:#018x}] -> {:#018x} r{}w{}x{} u{} g{} a{} d{}",
                    e.low_va,
                    e.high_va,
                    e.pa,
                    e.perm.r() as u8,
                    e.perm.w() as u8,
                    e.perm.x() as u8,
                    e.user as u8,
                    e.global as u8,
                    e.accessed as u8,
                    e.dirty as u8,
                );
                if !e.global {
                    let _ = write!(out, " asid={:#x}", e.sim_asid.asid_hs());
                }
                out.push('\n');
            }
        }
        out
    }
}

fn slot_entry_pa(slot: &Slot) -> u64 {
    match slot {
        Slot::Used(e) => e.pa,
        Slot::Free { .. } => 0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidateScope {
    Any,
    Asid(u16),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csr::Regime;

    fn entry(low: u64, high: u64, asid: u16, global: bool) -> TlbEntry {
        TlbEntry {
            low_va: low,
            high_va: high,
            pa: low,
            regime: Regime::Hs,
            perm: PrivMask::RWX,
            user: false,
            global,
            accessed: true,
            dirty: false,
            mapped: MappedMask::EMPTY,
            artifact: false,
            sim_asid: SimAsid::pack(asid, 0, 0, false, false, false, false, false, false),
            asid_mask: SimAsidMask(0xFFFF),
            lut_entry: None,
        }
    }

    #[test]
    fn insert_then_find_hits() {
        let mut tlb = Tlb::new(Regime::Hs);
        tlb.insert(entry(0x1000, 0x1FFF, 3, false));
        let key = SimAsid::pack(3, 0, 0, false, false, false, false, false, false);
        let found = tlb.find(0x1800, key).expect("expected hit");
        assert_eq!(found.low_va, 0x1000);
    }

    #[test]
    fn mismatched_asid_misses() {
        let mut tlb = Tlb::new(Regime::Hs);
        tlb.insert(entry(0x1000, 0x1FFF, 3, false));
        let key = SimAsid::pack(4, 0, 0, false, false, false, false, false, false);
        assert!(tlb.find(0x1800, key).is_none());
    }

    #[test]
    fn global_entry_matches_any_asid() {
        let mut tlb = Tlb::new(Regime::Hs);
        tlb.insert(entry(0x1000, 0x1FFF, 3, true));
        let key = SimAsid::pack(99, 0, 0, false, false, false, false, false, false);
        // asid_mask for a global entry should not include ASID bits; the
        // fixture above sets a full mask for simplicity, so mimic a real
        // global mask instead.
        let mut tlb2 = Tlb::new(Regime::Hs);
        let mut e = entry(0x1000, 0x1FFF, 3, true);
        e.asid_mask = SimAsidMask(0); // global: nothing participates
        tlb2.insert(e);
        assert!(tlb2.find(0x1800, key).is_some());
    }

    #[test]
    fn invalidate_any_clears_entry() {
        let mut tlb = Tlb::new(Regime::Hs);
        tlb.insert(entry(0x1000, 0x1FFF, 3, false));
        let removed = tlb.invalidate(0x0, u64::MAX, InvalidateScope::Any, None);
        assert_eq!(removed.len(), 1);
        let key = SimAsid::pack(3, 0, 0, false, false, false, false, false, false);
        assert!(tlb.find(0x1800, key).is_none());
    }

    #[test]
    fn freed_slot_is_reused() {
        let mut tlb = Tlb::new(Regime::Hs);
        tlb.insert(entry(0x1000, 0x1FFF, 1, false));
        tlb.invalidate(0x0, u64::MAX, InvalidateScope::Any, None);
        tlb.insert(entry(0x2000, 0x2FFF, 2, false));
        assert_eq!(tlb.pool.len(), 1, "second insert should reuse the freed slot");
    }
}
