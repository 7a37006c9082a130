//! Translation orchestrator: `vmMiss`'s per-span resolution loop (spec
//! §4.5), grounded on `riscv-vm::cpu::core::Cpu`'s translate-then-execute
//! call site — the teacher calls a single `mmu::translate` per access; this
//! spec composes up to two walks, two TLBs, and a PMP refinement pass around
//! that same call site.

use crate::asid::{SimAsid, SimAsidMask};
use crate::bits::{WalkShape, PAGE_SHIFT, SV32, SV39, SV48};
use crate::csr::{CsrSource, Mode, Regime};
use crate::domain::{AliasRuntime, DomainId, DomainMatch, DomainStack, ExceptionSink, MemoryDomain, ModeDomains};
use crate::error::{AccessType, Trap};
use crate::perm::PermCheck;
use crate::pmp::PmpState;
use crate::ptw::{self, AccessAttrs, AdConfig, WalkResult};
use crate::tlb::{PrivMask, Tlb, TlbEntry};

pub const SATP_MODE_BARE: u64 = 0;
pub const SATP_MODE_SV32: u64 = 1;
pub const SATP_MODE_SV39: u64 = 8;
pub const SATP_MODE_SV48: u64 = 9;

/// Cap on a single `aliasMemoryVM` installation, per spec §4.5 step 2.
const MAX_ALIAS_CHUNK: u64 = 1 << 32;

fn shape_for_mode(mode: u64) -> Option<&'static WalkShape> {
    match mode {
        SATP_MODE_SV32 => Some(&SV32),
        SATP_MODE_SV39 => Some(&SV39),
        SATP_MODE_SV48 => Some(&SV48),
        _ => None,
    }
}

/// The regime (and root tables) governing the current access, per spec §4.3.
enum ActiveRegime {
    /// `satp.MODE == 0` (or, under virtualization, neither `vsatp` nor
    /// `hgatp` is active): identity VA=PA passthrough, no TLB involved.
    Bare,
    Hs {
        shape: &'static WalkShape,
        root: u64,
    },
    Vs1 {
        shape: &'static WalkShape,
        root: u64,
        stage2: Option<(&'static WalkShape, u64)>,
    },
    Vs2Only {
        shape: &'static WalkShape,
        root_no_extra: u64,
    },
}

fn select_regime(csr: &dyn CsrSource) -> ActiveRegime {
    if !csr.virt() {
        let satp = csr.satp();
        return match shape_for_mode(satp.mode) {
            Some(shape) => ActiveRegime::Hs {
                shape,
                root: satp.ppn << PAGE_SHIFT,
            },
            None => ActiveRegime::Bare,
        };
    }

    let vsatp = csr.vsatp();
    if let Some(shape) = shape_for_mode(vsatp.mode) {
        let hgatp = csr.hgatp();
        let stage2 = shape_for_mode(hgatp.mode).map(|s2| (s2, hgatp.ppn << PAGE_SHIFT));
        return ActiveRegime::Vs1 {
            shape,
            root: vsatp.ppn << PAGE_SHIFT,
            stage2,
        };
    }

    let hgatp = csr.hgatp();
    match shape_for_mode(hgatp.mode) {
        Some(shape) => ActiveRegime::Vs2Only {
            shape,
            root_no_extra: hgatp.ppn << PAGE_SHIFT,
        },
        None => ActiveRegime::Bare,
    }
}

/// A fully resolved VA range ready for installation, after stage-1/stage-2
/// composition (spec §4.5 step 2, "Merge the two mappings").
struct ComposedMapping {
    low_va: u64,
    high_va: u64,
    pa_offset: u64,
    perm: PrivMask,
    user: bool,
    global: bool,
    /// The TLB whose bookkeeping (ASID/VMID, mask) governs this mapping:
    /// VS1 when stage-2 composed, otherwise whichever stage actually ran.
    key_regime: Regime,
    sim_asid: SimAsid,
    asid_mask: SimAsidMask,
}

impl ComposedMapping {
    fn pa_at(&self, va: u64) -> u64 {
        va.wrapping_add(self.pa_offset)
    }
}

fn perm_check_for(csr: &dyn CsrSource, regime: Regime) -> PermCheck {
    PermCheck {
        caller_mode: csr.mode(),
        regime,
        hs_status: csr.mstatus(),
        vs_status: csr.vsstatus(),
        priv_version: csr.priv_version(),
    }
}

/// Owns the three per-regime TLBs. One per hart.
pub struct Orchestrator {
    hs: Tlb,
    vs1: Tlb,
    vs2: Tlb,
}

impl Default for Orchestrator {
    fn default() -> Orchestrator {
        Orchestrator::new()
    }
}

impl Orchestrator {
    pub fn new() -> Orchestrator {
        Orchestrator {
            hs: Tlb::new(Regime::Hs),
            vs1: Tlb::new(Regime::Vs1),
            vs2: Tlb::new(Regime::Vs2),
        }
    }

    pub fn tlb(&mut self, regime: Regime) -> &mut Tlb {
        match regime {
            Regime::Hs => &mut self.hs,
            Regime::Vs1 => &mut self.vs1,
            Regime::Vs2 => &mut self.vs2,
        }
    }

    pub fn tlbs_mut(&mut self) -> (&mut Tlb, &mut Tlb, &mut Tlb) {
        (&mut self.hs, &mut self.vs1, &mut self.vs2)
    }

    pub fn tlb_ref(&self, regime: Regime) -> &Tlb {
        match regime {
            Regime::Hs => &self.hs,
            Regime::Vs1 => &self.vs1,
            Regime::Vs2 => &self.vs2,
        }
    }

    /// `vmMiss(domain, priv, VA, bytes, attrs) -> miss?`, spec §4.5.
    #[allow(clippy::too_many_arguments)]
    pub fn miss(
        &mut self,
        domains: &DomainStack,
        pmp: &PmpState,
        ptw_domain: &dyn MemoryDomain,
        csr: &dyn CsrSource,
        runtime: &dyn AliasRuntime,
        exceptions: &dyn ExceptionSink,
        ad: AdConfig,
        split_code_data: bool,
        domain: DomainId,
        access: AccessType,
        va: u64,
        bytes: u64,
        attrs: AccessAttrs,
    ) -> bool {
        let Some(matched) = domains.classify(domain) else {
            exceptions.take_memory_exception(Trap::UnmappedDomain);
            return false;
        };

        let mode = match matched {
            DomainMatch::PhysicalLike(mode) => mode,
            DomainMatch::Virtual(mode) => mode,
        };
        let access_high = va + bytes - 1;

        if let DomainMatch::PhysicalLike(_) = matched {
            let mode_domains = domains.for_mode(mode);
            return self.refine_physical(
                pmp,
                mode,
                mode_domains,
                runtime,
                split_code_data,
                va,
                access_high,
                access,
                va,
                exceptions,
            );
        }

        let mut low_va = va;
        while low_va <= access_high {
            let mapping = match self.resolve_span(csr, ptw_domain, ad, access, low_va, attrs, exceptions, va) {
                Some(m) => m,
                None => return false,
            };

            let mut span_high = mapping.high_va.min(access_high);
            if span_high - mapping.low_va + 1 > MAX_ALIAS_CHUNK {
                span_high = mapping.low_va + MAX_ALIAS_CHUNK - 1;
            }

            let mode_domains = domains.for_mode(mode);
            let pa_low = mapping.pa_at(mapping.low_va);
            let pa_high = mapping.pa_at(span_high);

            runtime.alias_memory_vm(
                mode_domains.pmp,
                mode_domains.virt,
                pa_low,
                pa_high,
                mapping.low_va,
                mapping.perm,
                mapping.asid_mask,
                mapping.sim_asid,
            );

            let access_pa_low = mapping.pa_at(low_va);
            let access_pa_high = mapping.pa_at(span_high);
            if !self.refine_physical(
                pmp,
                mode,
                mode_domains,
                runtime,
                split_code_data,
                access_pa_low,
                access_pa_high,
                access,
                va,
                exceptions,
            ) {
                return false;
            }

            low_va = span_high + 1;
        }

        true
    }

    /// Resolve the stage-1 (and, when active, stage-2) mapping covering
    /// `va`, consulting each TLB before walking, and applying the
    /// dirty-bit-missing re-walk rule (spec §4.5 step 3).
    #[allow(clippy::too_many_arguments)]
    fn resolve_span(
        &mut self,
        csr: &dyn CsrSource,
        ptw_domain: &dyn MemoryDomain,
        ad: AdConfig,
        access: AccessType,
        va: u64,
        attrs: AccessAttrs,
        exceptions: &dyn ExceptionSink,
        original_va: u64,
    ) -> Option<ComposedMapping> {
        match select_regime(csr) {
            ActiveRegime::Bare => {
                let page = va & !(crate::bits::PAGE_SIZE - 1);
                Some(ComposedMapping {
                    low_va: page,
                    high_va: page + crate::bits::PAGE_SIZE - 1,
                    pa_offset: 0,
                    perm: PrivMask::RWX,
                    user: true,
                    global: true,
                    key_regime: Regime::Hs,
                    sim_asid: SimAsid::default(),
                    asid_mask: SimAsidMask::default(),
                })
            }
            ActiveRegime::Hs { shape, root } => {
                let entry = self.find_or_walk(
                    Regime::Hs,
                    shape,
                    root,
                    ptw_domain,
                    csr,
                    access,
                    va,
                    attrs,
                    ad,
                    exceptions,
                    original_va,
                )?;
                Some(ComposedMapping {
                    low_va: entry.low_va,
                    high_va: entry.high_va,
                    pa_offset: entry.pa.wrapping_sub(entry.low_va),
                    perm: entry.perm,
                    user: entry.user,
                    global: entry.global,
                    key_regime: Regime::Hs,
                    sim_asid: entry.sim_asid,
                    asid_mask: entry.asid_mask,
                })
            }
            ActiveRegime::Vs2Only { shape, root_no_extra } => {
                let entry = self.find_or_walk_stage2(
                    shape,
                    root_no_extra,
                    ptw_domain,
                    csr,
                    access,
                    va,
                    attrs,
                    ad,
                    exceptions,
                    original_va,
                )?;
                Some(ComposedMapping {
                    low_va: entry.low_va,
                    high_va: entry.high_va,
                    pa_offset: entry.pa.wrapping_sub(entry.low_va),
                    perm: entry.perm,
                    user: entry.user,
                    global: entry.global,
                    key_regime: Regime::Vs2,
                    sim_asid: entry.sim_asid,
                    asid_mask: entry.asid_mask,
                })
            }
            ActiveRegime::Vs1 { shape, root, stage2 } => {
                let s1 = self.find_or_walk(
                    Regime::Vs1,
                    shape,
                    root,
                    ptw_domain,
                    csr,
                    access,
                    va,
                    attrs,
                    ad,
                    exceptions,
                    original_va,
                )?;

                let Some((s2_shape, s2_root)) = stage2 else {
                    return Some(ComposedMapping {
                        low_va: s1.low_va,
                        high_va: s1.high_va,
                        pa_offset: s1.pa.wrapping_sub(s1.low_va),
                        perm: s1.perm,
                        user: s1.user,
                        global: s1.global,
                        key_regime: Regime::Vs1,
                        sim_asid: s1.sim_asid,
                        asid_mask: s1.asid_mask,
                    });
                };

                let off1 = s1.pa.wrapping_sub(s1.low_va);
                let gpa = va.wrapping_add(off1);
                let s2 = self.find_or_walk_stage2(
                    s2_shape, s2_root, ptw_domain, csr, access, gpa, attrs, ad, exceptions, original_va,
                )?;

                let off2 = s2.pa.wrapping_sub(s2.low_va);
                // Preimage of the stage-2 range through the stage-1 offset,
                // intersected with the stage-1 range itself: "take the
                // tighter bounds" (spec §4.5 step 2).
                let preimage_low = s2.low_va.wrapping_sub(off1);
                let preimage_high = s2.high_va.wrapping_sub(off1);
                let low_va = s1.low_va.max(preimage_low);
                let high_va = s1.high_va.min(preimage_high);

                Some(ComposedMapping {
                    low_va,
                    high_va,
                    pa_offset: off1.wrapping_add(off2),
                    perm: s1.perm.intersect(s2.perm),
                    user: s1.user,
                    global: s1.global,
                    key_regime: Regime::Vs1,
                    sim_asid: s1.sim_asid,
                    asid_mask: s1.asid_mask,
                })
            }
        }
    }

    /// Stage-1 find-or-walk with the dirty-bit-missing re-walk rule: if a
    /// cached entry exists but lacks `D` while the access is a write, delete
    /// it and re-walk so the rewrite sets `D` (spec §4.5 step 3).
    #[allow(clippy::too_many_arguments)]
    fn find_or_walk(
        &mut self,
        regime: Regime,
        shape: &WalkShape,
        root: u64,
        domain: &dyn MemoryDomain,
        csr: &dyn CsrSource,
        access: AccessType,
        va: u64,
        attrs: AccessAttrs,
        ad: AdConfig,
        exceptions: &dyn ExceptionSink,
        original_va: u64,
    ) -> Option<TlbEntry> {
        let caller_key = current_sim_asid(csr, regime);
        let tlb = self.tlb(regime);

        if let Some(found) = tlb.find(va, caller_key) {
            if access == AccessType::Store && !found.dirty {
                tlb.invalidate(found.low_va, found.high_va, crate::tlb::InvalidateScope::Any, None);
            } else {
                return Some(found);
            }
        }

        let perm_ctx = perm_check_for(csr, regime);
        match ptw::walk(shape, root, domain, &perm_ctx, va, access, attrs, ad) {
            Ok(result) => {
                let entry = build_entry(regime, csr, &result);
                if !attrs.artifact {
                    self.tlb(regime).insert(entry);
                }
                Some(entry)
            }
            Err(err) => {
                if !attrs.artifact {
                    exceptions.take_memory_exception(Trap::from_ptw_error(err, access, original_va, regime));
                }
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn find_or_walk_stage2(
        &mut self,
        shape: &WalkShape,
        root_no_extra: u64,
        domain: &dyn MemoryDomain,
        csr: &dyn CsrSource,
        access: AccessType,
        gpa: u64,
        attrs: AccessAttrs,
        ad: AdConfig,
        exceptions: &dyn ExceptionSink,
        original_va: u64,
    ) -> Option<TlbEntry> {
        let caller_key = current_sim_asid(csr, Regime::Vs2);
        let tlb = self.tlb(Regime::Vs2);

        if let Some(found) = tlb.find(gpa, caller_key) {
            if access == AccessType::Store && !found.dirty {
                tlb.invalidate(found.low_va, found.high_va, crate::tlb::InvalidateScope::Any, None);
            } else {
                return Some(found);
            }
        }

        let perm_ctx = perm_check_for(csr, Regime::Vs2);
        match ptw::walk_stage2(shape, root_no_extra, gpa, domain, &perm_ctx, access, attrs, ad) {
            Ok(result) => {
                let entry = build_entry(Regime::Vs2, csr, &result);
                if !attrs.artifact {
                    self.tlb(Regime::Vs2).insert(entry);
                }
                Some(entry)
            }
            Err(err) => {
                if !attrs.artifact {
                    exceptions.take_memory_exception(Trap::from_ptw_error(err, access, original_va, Regime::Vs2));
                }
                None
            }
        }
    }

    /// PMP/PMA refinement over a resolved physical span (spec §4.5 step 1
    /// and the tail of step 2; spec §4.7 "Privilege refinement").
    #[allow(clippy::too_many_arguments)]
    fn refine_physical(
        &self,
        pmp: &PmpState,
        mode: Mode,
        mode_domains: &ModeDomains,
        runtime: &dyn AliasRuntime,
        split_code_data: bool,
        pa_low: u64,
        pa_high: u64,
        access: AccessType,
        original_va: u64,
        exceptions: &dyn ExceptionSink,
    ) -> bool {
        let refinement = pmp.refine(pa_low, pa_high, mode);
        let required = match access {
            AccessType::Instruction => PrivMask(crate::tlb::PERM_X),
            AccessType::Load => PrivMask(crate::tlb::PERM_R),
            AccessType::Store => PrivMask(crate::tlb::PERM_W),
        };
        if !refinement.grants(required) {
            exceptions.take_memory_exception(Trap::PmpAccessFault(original_va, access));
            return false;
        }

        // Protect exactly the refined range, with boundary-byte guards, so a
        // straddling access past it re-triggers refinement instead of
        // inheriting this grant (spec §4.7). `split_code_data` (config
        // `VmemConfig::split_code_data_pmp`) decides whether RW is split
        // from X across the mode's distinct code/data physical domains.
        if split_code_data {
            runtime.protect_memory(mode_domains.physical, pa_low, pa_high, refinement.priv_mask.without_x());
            let x_mask = refinement.priv_mask.intersect(PrivMask(crate::tlb::PERM_X));
            runtime.protect_memory(mode_domains.code, pa_low, pa_high, x_mask);
        } else {
            runtime.protect_memory(mode_domains.physical, pa_low, pa_high, refinement.priv_mask);
        }

        true
    }
}

/// Publicized for [`crate::VmemUnit::vm_set_asid`], which recomputes the
/// caller's current key for diagnostics — the live key is otherwise derived
/// fresh from [`CsrSource`] on every TLB lookup, so there is no separate
/// runtime channel to push it through.
pub(crate) fn current_sim_asid(csr: &dyn CsrSource, regime: Regime) -> SimAsid {
    let satp = csr.satp();
    let vsatp = csr.vsatp();
    let hgatp = csr.hgatp();
    let hs_status = csr.mstatus();
    let vs_status = csr.vsstatus();
    SimAsid::pack(
        satp.asid,
        vsatp.asid,
        hgatp.vmid,
        hs_status.mxr,
        hs_status.sum,
        vs_status.mxr,
        vs_status.sum,
        regime != Regime::Vs2,
        regime == Regime::Vs2 || csr.virt(),
    )
}

fn build_entry(regime: Regime, csr: &dyn CsrSource, result: &WalkResult) -> TlbEntry {
    let sim_asid = current_sim_asid(csr, regime);
    let asid_mask = SimAsidMask::derive(regime, result.global, result.user, csr.mode(), csr.virt());
    TlbEntry::new(
        result.low_va,
        result.high_va,
        result.pa,
        regime,
        result.perm,
        result.user,
        result.global,
        result.accessed,
        result.dirty,
        crate::tlb::MappedMask::EMPTY,
        false,
        sim_asid,
        asid_mask,
    )
}
