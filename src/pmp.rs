//! Physical memory protection: register bank, region geometry, grain
//! masking, lock semantics, overlap-safe invalidation, and per-access
//! privilege refinement (spec §4.7).
//!
//! No teacher module implements PMP — `riscv-vm`'s PMP support had not
//! landed in the retrieved snapshot — so this is grounded on spec §4.7
//! directly and shaped like the teacher's other fixed-size register banks
//! (`riscv-vm::cpu::csr::CsrFile`'s `[u64; N]` storage with privilege-aware
//! accessors) and its `thiserror`-based leaf error type
//! (`riscv-vm::dram::MemoryError`).

use crate::bits::{PmpAMode, PmpCfgByte};
use crate::csr::Mode;
use crate::error::PmpError;
use crate::tlb::PrivMask;

pub const MAX_PMP_REGIONS: usize = 64;

/// A region's active `[low, high]` physical-address bounds, inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionBounds {
    pub low: u64,
    pub high: u64,
}

/// PMP register bank: up to `n` config bytes and address words. Grain `g`
/// (log2 bytes, offset by 2, per spec glossary) controls both read-back
/// masking and which address bits `WritePMPAddr` accepts.
pub struct PmpState {
    cfg: Vec<u8>,
    addr: Vec<u64>,
    n: usize,
    grain: u32,
    /// Width of the implemented physical address space, for address masking.
    pa_bits: u32,
}

impl PmpState {
    pub fn new(n: usize, grain: u32, pa_bits: u32) -> PmpState {
        assert!(n <= MAX_PMP_REGIONS);
        PmpState {
            cfg: vec![0; n],
            addr: vec![0; n],
            n,
            grain,
            pa_bits,
        }
    }

    pub fn region_count(&self) -> usize {
        self.n
    }

    /// Power-on reset: all config/address words zeroed.
    pub fn reset(&mut self) {
        self.cfg.fill(0);
        self.addr.fill(0);
    }

    fn addr_mask(&self) -> u64 {
        if self.pa_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << self.pa_bits) - 1
        }
    }

    /// Read back a config byte, canonicalized per spec §8 property 3: NA4
    /// reads back as whatever mode preceded it when `grain >= 1` (since
    /// `write_cfg_byte` already refuses to select NA4 in that case, the
    /// stored byte is always canonical and this is a plain read).
    pub fn read_cfg(&self, i: usize) -> Result<u8, PmpError> {
        self.cfg.get(i).copied().ok_or(PmpError::IndexOutOfRange(i))
    }

    pub fn read_addr(&self, i: usize) -> Result<u64, PmpError> {
        let raw = *self.addr.get(i).ok_or(PmpError::IndexOutOfRange(i))?;
        let cfg = PmpCfgByte::decode(self.cfg[i]);
        Ok(self.mask_addr_for_readback(raw, cfg.mode))
    }

    /// Spec §4, "effective address read back": NAPOT forces bits `[G-2:0]`
    /// to one when `G >= 2`; OFF/TOR force bits `[G-1:0]` to zero when
    /// `G >= 1`.
    fn mask_addr_for_readback(&self, raw: u64, mode: PmpAMode) -> u64 {
        match mode {
            PmpAMode::Napot if self.grain >= 2 => raw | ((1u64 << (self.grain - 1)) - 1),
            PmpAMode::Napot => raw,
            _ if self.grain >= 1 => raw & !((1u64 << self.grain) - 1),
            _ => raw,
        }
    }

    /// Config write at word index (4 or 8 bytes depending on XLEN). Bytes
    /// are processed highest-index-to-lowest within the word; each byte
    /// that actually changes triggers invalidation under its old spec, the
    /// update, then invalidation under the new spec (spec §4.7).
    pub fn write_cfg_word(&mut self, base_index: usize, bytes_per_word: usize, value: u64) -> Vec<Invalidation> {
        let mut invalidations = Vec::new();
        for offset in (0..bytes_per_word).rev() {
            let i = base_index + offset;
            if i >= self.n {
                continue;
            }
            let new_byte = ((value >> (offset * 8)) & 0xFF) as u8;
            if let Some(inv) = self.write_one_cfg_byte(i, new_byte) {
                invalidations.push(inv);
            }
        }
        invalidations
    }

    fn write_one_cfg_byte(&mut self, i: usize, mut new_byte: u8) -> Option<Invalidation> {
        let old_cfg = PmpCfgByte::decode(self.cfg[i]);
        if old_cfg.locked {
            return None;
        }

        let mut new_cfg = PmpCfgByte::decode(new_byte);
        if new_cfg.mode == PmpAMode::Na4 && self.grain >= 1 {
            // NA4 unselectable at this grain: preserve the old mode.
            new_cfg.mode = old_cfg.mode;
            new_byte = new_cfg.encode();
        }

        if new_byte == self.cfg[i] {
            return None;
        }

        let old_spec = self.region_spec(i);
        self.cfg[i] = new_byte;
        let new_spec = self.region_spec(i);
        log::debug!("pmp cfg[{i}] {:#04x} -> {:#04x}", old_cfg.encode(), new_byte);
        Some(Invalidation {
            index: i,
            old: old_spec,
            new: new_spec,
        })
    }

    /// Address write at index `i`: masked to implemented bits and the
    /// grain, rejected if `i` or `i+1` (when `i+1` is a locked TOR entry) is
    /// locked.
    pub fn write_addr(&mut self, i: usize, value: u64) -> Result<(), PmpError> {
        if i >= self.n {
            return Err(PmpError::IndexOutOfRange(i));
        }
        let cfg = PmpCfgByte::decode(self.cfg[i]);
        if cfg.locked {
            return Err(PmpError::Locked(i));
        }
        if let Some(next) = self.cfg.get(i + 1) {
            let next_cfg = PmpCfgByte::decode(*next);
            if next_cfg.locked && next_cfg.mode == PmpAMode::Tor {
                return Err(PmpError::Locked(i + 1));
            }
        }
        let mut masked = value & self.addr_mask();
        if self.grain >= 1 {
            masked &= !((1u64 << (self.grain - 1)) - 1);
        }
        self.addr[i] = masked;
        Ok(())
    }

    /// Region geometry for index `i` (spec §4.7 "Region geometry").
    pub fn region_bounds(&self, i: usize) -> Option<RegionBounds> {
        let cfg = PmpCfgByte::decode(self.cfg[i]);
        match cfg.mode {
            PmpAMode::Off => None,
            PmpAMode::Na4 => {
                let base = self.addr[i] << 2;
                Some(RegionBounds {
                    low: base,
                    high: base + 3,
                })
            }
            PmpAMode::Napot => {
                let a = (self.addr[i] << 2) | 3;
                let lowest_clear = (!a).trailing_zeros();
                let mask = (1u64 << lowest_clear) - 1;
                let base = self.addr[i] << 2;
                Some(RegionBounds {
                    low: base & !mask,
                    high: base | mask,
                })
            }
            PmpAMode::Tor => {
                let low = if i == 0 { 0 } else { self.addr[i - 1] << 2 };
                let high = (self.addr[i] << 2).wrapping_sub(1);
                if self.grain >= 1 {
                    let gmask = !((1u64 << self.grain) - 1);
                    let low = low & gmask;
                    if low > high {
                        return None;
                    }
                    return Some(RegionBounds { low, high });
                }
                if low > high {
                    None
                } else {
                    Some(RegionBounds { low, high })
                }
            }
        }
    }

    /// Whether any region with lower priority than `i` (i.e. index `> i`) is
    /// locked, per spec §4.7 "Invalidation": such a region's visibility
    /// could be revealed or concealed by a change at `i`, so machine-mode
    /// access must be stripped over `i`'s old range too.
    pub fn any_locked_after(&self, i: usize) -> bool {
        (i + 1..self.n).any(|j| PmpCfgByte::decode(self.cfg[j]).locked)
    }

    fn region_spec(&self, i: usize) -> RegionSpec {
        RegionSpec {
            bounds: self.region_bounds(i),
            locked: PmpCfgByte::decode(self.cfg[i]).locked,
            priv_mask: region_priv(self.cfg[i]),
        }
    }

    /// Privilege refinement for a physical access to `[access_low,
    /// access_high]` by `mode` (spec §4.7 "Privilege refinement").
    pub fn refine(&self, access_low: u64, access_high: u64, mode: Mode) -> Refinement {
        // No region implemented at all: PMP is absent, every mode has full
        // access (the architectural default this spec's worked examples
        // assume when no pmp*cfg/addr setup is mentioned).
        if self.n == 0 {
            return Refinement {
                priv_mask: PrivMask::RWX,
                matching_region: None,
                low_map: 0,
                high_map: u64::MAX,
                covers_full_extent: true,
            };
        }

        let mut low_map = 0u64;
        let mut high_map = u64::MAX;
        let mut priv_mask = if mode.is_machine() { PrivMask::RWX } else { PrivMask::NONE };
        let mut matching_region = None;

        for i in (0..self.n).rev() {
            let Some(bounds) = self.region_bounds(i) else {
                continue;
            };
            let cfg = PmpCfgByte::decode(self.cfg[i]);

            let inside = access_low >= bounds.low && access_high <= bounds.high;
            if inside {
                matching_region = Some(i);
                low_map = bounds.low;
                high_map = bounds.high;
                priv_mask = if !mode.is_machine() || cfg.locked {
                    region_priv(self.cfg[i])
                } else {
                    PrivMask::RWX
                };
                continue;
            }

            // Region strictly above the access: clamp high_map down.
            if bounds.low > access_high && bounds.low <= high_map {
                high_map = bounds.low - 1;
            }
            // Region strictly below the access: clamp low_map up.
            if bounds.high < access_low && bounds.high >= low_map {
                low_map = bounds.high + 1;
            }
        }

        let required_covers_full_extent = low_map <= access_low && high_map >= access_high;

        Refinement {
            priv_mask,
            matching_region,
            low_map,
            high_map,
            covers_full_extent: required_covers_full_extent,
        }
    }
}

fn region_priv(cfg_byte: u8) -> PrivMask {
    let cfg = PmpCfgByte::decode(cfg_byte);
    let mut p = PrivMask(0);
    if cfg.r {
        p = p.union(PrivMask(crate::tlb::PERM_R));
    }
    if cfg.w {
        p = p.union(PrivMask(crate::tlb::PERM_W));
    }
    if cfg.x {
        p = p.union(PrivMask(crate::tlb::PERM_X));
    }
    p
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RegionSpec {
    bounds: Option<RegionBounds>,
    locked: bool,
    priv_mask: PrivMask,
}

/// What changed when a config byte write altered a region's spec, and what
/// the caller (orchestrator/domain layer) must invalidate in response
/// (spec §4.7 "Invalidation").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Invalidation {
    /// Region index that changed, for [`PmpState::any_locked_after`].
    pub index: usize,
    old: RegionSpec,
    new: RegionSpec,
}

impl Invalidation {
    /// The old region's bounds, over which supervisor-mode access must
    /// always be revoked.
    pub fn strip_supervisor(&self) -> Option<RegionBounds> {
        self.old.bounds
    }

    /// Whether machine-mode access must also be revoked over the old
    /// region: only when the entry itself was locked, or when any
    /// lower-priority locked entry exists whose visibility this change
    /// could affect. The orchestrator supplies that second condition since
    /// it requires scanning the whole bank; `any_lower_priority_locked`
    /// captures that external fact.
    pub fn strip_machine(&self, any_lower_priority_locked: bool) -> bool {
        self.old.locked || any_lower_priority_locked
    }
}

/// Outcome of [`PmpState::refine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Refinement {
    pub priv_mask: PrivMask,
    pub matching_region: Option<usize>,
    pub low_map: u64,
    pub high_map: u64,
    pub covers_full_extent: bool,
}

impl Refinement {
    pub fn grants(&self, required: PrivMask) -> bool {
        self.priv_mask.contains(required) && self.covers_full_extent
    }
}
