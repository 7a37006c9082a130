//! Simulated ASID: the packed 64-bit key a TLB entry is validated against,
//! so the memory runtime can confirm a cached host mapping is still live
//! without re-walking the page tables.
//!
//! Field layout (spec §3):
//!
//! ```text
//! bits  0..16  ASID_HS
//! bits 16..32  ASID_VS
//! bits 32..48  VMID
//! bit      48  MXR_HS
//! bit      49  SUM_HS
//! bit      50  MXR_VS
//! bit      51  SUM_VS
//! bit      52  S1
//! bit      53  S2
//! bits 54..64  reserved, always zero
//! ```

use crate::csr::{Mode, Regime};

const ASID_HS_SHIFT: u32 = 0;
const ASID_VS_SHIFT: u32 = 16;
const VMID_SHIFT: u32 = 32;
const MXR_HS_BIT: u32 = 48;
const SUM_HS_BIT: u32 = 49;
const MXR_VS_BIT: u32 = 50;
const SUM_VS_BIT: u32 = 51;
const S1_BIT: u32 = 52;
const S2_BIT: u32 = 53;

/// The packed key itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SimAsid(pub u64);

/// Which fields of a [`SimAsid`] participate in an equality comparison for
/// one particular TLB entry; same bit layout as `SimAsid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SimAsidMask(pub u64);

impl SimAsid {
    #[allow(clippy::too_many_arguments)]
    pub fn pack(
        asid_hs: u16,
        asid_vs: u16,
        vmid: u16,
        mxr_hs: bool,
        sum_hs: bool,
        mxr_vs: bool,
        sum_vs: bool,
        s1: bool,
        s2: bool,
    ) -> SimAsid {
        let mut v = (asid_hs as u64) << ASID_HS_SHIFT;
        v |= (asid_vs as u64) << ASID_VS_SHIFT;
        v |= (vmid as u64) << VMID_SHIFT;
        v |= (mxr_hs as u64) << MXR_HS_BIT;
        v |= (sum_hs as u64) << SUM_HS_BIT;
        v |= (mxr_vs as u64) << MXR_VS_BIT;
        v |= (sum_vs as u64) << SUM_VS_BIT;
        v |= (s1 as u64) << S1_BIT;
        v |= (s2 as u64) << S2_BIT;
        SimAsid(v)
    }

    pub fn asid_hs(self) -> u16 {
        (self.0 >> ASID_HS_SHIFT) as u16
    }

    pub fn asid_vs(self) -> u16 {
        (self.0 >> ASID_VS_SHIFT) as u16
    }

    pub fn vmid(self) -> u16 {
        (self.0 >> VMID_SHIFT) as u16
    }

    /// Equality under `mask`: only the bits set in `mask` must match.
    pub fn matches(self, other: SimAsid, mask: SimAsidMask) -> bool {
        (self.0 ^ other.0) & mask.0 == 0
    }
}

impl SimAsidMask {
    fn bit(position: u32) -> u64 {
        1u64 << position
    }

    fn field(shift: u32, width: u32) -> u64 {
        ((1u64 << width) - 1) << shift
    }

    /// Derive the mask that applies when comparing against a TLB entry with
    /// the given properties (spec §3):
    ///
    /// - `MXR_HS` always participates.
    /// - `ASID_HS`/`ASID_VS` participate when the entry is not global, for
    ///   whichever TLB (HS vs. VS1) contains it.
    /// - `SUM_HS`/`SUM_VS` participate when the entry is user-accessible and
    ///   the caller is supervisor.
    /// - `VMID`, `MXR_VS`, `S1`, `S2` participate whenever the caller is
    ///   virtualized.
    ///
    /// Stage-2 entries ignore SUM entirely (they are always evaluated as
    /// user-mode accesses), so `caller_mode` is treated as irrelevant for
    /// `Regime::Vs2`.
    pub fn derive(
        regime: Regime,
        entry_global: bool,
        entry_user: bool,
        caller_mode: Mode,
        caller_virt: bool,
    ) -> SimAsidMask {
        let mut mask = Self::bit(MXR_HS_BIT);

        if !entry_global {
            match regime {
                Regime::Hs => mask |= Self::field(ASID_HS_SHIFT, 16),
                Regime::Vs1 => mask |= Self::field(ASID_VS_SHIFT, 16),
                Regime::Vs2 => {}
            }
        }

        if regime != Regime::Vs2 && entry_user && caller_mode == Mode::Supervisor {
            match regime {
                Regime::Hs => mask |= Self::bit(SUM_HS_BIT),
                Regime::Vs1 => mask |= Self::bit(SUM_VS_BIT),
                Regime::Vs2 => {}
            }
        }

        if caller_virt {
            mask |= Self::field(VMID_SHIFT, 16);
            mask |= Self::bit(MXR_VS_BIT);
            mask |= Self::bit(S1_BIT);
            mask |= Self::bit(S2_BIT);
        }

        SimAsidMask(mask)
    }
}
