//! Virtual-memory subsystem facade: page-table walking, per-regime TLBs,
//! PMP, and the layered memory-domain plumbing that joins them into the
//! processor-facing `vm*` entry points (spec §6), grounded on
//! `riscv-vm::lib`'s flat `pub mod` listing and `riscv-vm::mmu`'s
//! init/miss/invalidate surface.

pub mod asid;
pub mod bits;
pub mod csr;
pub mod domain;
pub mod error;
pub mod orchestrator;
pub mod perm;
pub mod pmp;
pub mod ptw;
pub mod save;
pub mod tlb;

use asid::SimAsid;
use csr::{CsrSource, Mode, Regime};
use domain::{AliasRuntime, DomainId, DomainStack, ExceptionSink, MemoryDomain};
use error::{AccessType, ConfigError};
use orchestrator::Orchestrator;
use pmp::PmpState;
use ptw::{AccessAttrs, AdConfig};
use tlb::TlbEntry;

/// Implementation-defined knobs fixed at `vmInit` time (spec §6, §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmemConfig {
    pub pmp_regions: usize,
    /// Grain `G`, log2 bytes offset by 2 (spec glossary).
    pub pmp_grain: u32,
    /// Implemented physical address width, for PMP address masking.
    pub pa_bits: u32,
    pub hw_a_update: bool,
    pub hw_d_update: bool,
    /// When false, every leaf is forced global (no ASID feature).
    pub asid_implemented: bool,
    /// Whether the code and data PMP domains are distinct. When set,
    /// `vmMiss`'s physical-access refinement and `vmWritePMPCFG`'s
    /// invalidation both split RW from X across the two domains instead of
    /// protecting a single combined one (spec §4.7).
    pub split_code_data_pmp: bool,
}

impl VmemConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pmp_regions > pmp::MAX_PMP_REGIONS {
            return Err(ConfigError::TooManyRegions(self.pmp_regions));
        }
        if self.pmp_grain > self.pa_bits {
            return Err(ConfigError::GrainTooWide(self.pmp_grain));
        }
        Ok(())
    }

    fn ad_config(&self) -> AdConfig {
        AdConfig {
            hw_a_update: self.hw_a_update,
            hw_d_update: self.hw_d_update,
            asid_implemented: self.asid_implemented,
        }
    }
}

/// The active stage-1 regime for the caller's current virtualization state
/// (spec §6: "scope invalidation to the currently active stage-1 regime").
fn active_stage1_regime(csr: &dyn CsrSource) -> Regime {
    if csr.virt() {
        Regime::Vs1
    } else {
        Regime::Hs
    }
}

/// Tear down the host-side alias of every entry `invalidate` returned,
/// across whichever base privilege modes it was mapped into (spec §4.4,
/// §4.6).
fn teardown_aliases(removed: &[TlbEntry], domains: &DomainStack, runtime: &dyn AliasRuntime) {
    for entry in removed {
        for mode in [Mode::User, Mode::Supervisor, Mode::Machine] {
            if entry.mapped.is_mapped(mode) {
                let virt_domain = domains.for_mode(mode).virt;
                runtime.unalias_memory_vm(virt_domain, entry.low_va, entry.high_va);
            }
        }
    }
}

/// One hart's virtual-memory subsystem: the HS/VS1/VS2 TLBs (owned by
/// [`Orchestrator`]), the PMP register bank, and the domain stack built at
/// `vmInit`.
pub struct VmemUnit {
    orchestrator: Orchestrator,
    domains: DomainStack,
    pmp: PmpState,
    config: VmemConfig,
}

impl VmemUnit {
    /// `vmInit`: construct the PMA/PMP/Physical/Virtual domain stack per
    /// mode, plus the HS/VS1/VS2 TLBs and the PMP register bank.
    pub fn vm_init(
        config: VmemConfig,
        runtime: &dyn AliasRuntime,
        code_domains: [DomainId; 3],
        data_domains: [DomainId; 3],
    ) -> Result<VmemUnit, ConfigError> {
        config.validate()?;
        Ok(VmemUnit {
            orchestrator: Orchestrator::new(),
            domains: DomainStack::build(runtime, code_domains, data_domains),
            pmp: PmpState::new(config.pmp_regions, config.pmp_grain, config.pa_bits),
            config,
        })
    }

    /// `vmFree`: tear down every live TLB entry's host-side alias and
    /// discard the TLBs. The domain stack itself belongs to the surrounding
    /// processor's `newDomain` bookkeeping and is not released here.
    pub fn vm_free(&mut self, runtime: &dyn AliasRuntime) {
        for regime in [Regime::Hs, Regime::Vs1, Regime::Vs2] {
            let removed = self.orchestrator.tlb(regime).invalidate(0, u64::MAX, tlb::InvalidateScope::Any, None);
            teardown_aliases(&removed, &self.domains, runtime);
        }
    }

    /// `vmMiss(domain, priv, VA, bytes, attrs) -> miss?`.
    #[allow(clippy::too_many_arguments)]
    pub fn vm_miss(
        &mut self,
        ptw_domain: &dyn MemoryDomain,
        csr: &dyn CsrSource,
        runtime: &dyn AliasRuntime,
        exceptions: &dyn ExceptionSink,
        domain: DomainId,
        access: AccessType,
        va: u64,
        bytes: u64,
        attrs: AccessAttrs,
    ) -> bool {
        self.orchestrator.miss(
            &self.domains,
            &self.pmp,
            ptw_domain,
            csr,
            runtime,
            exceptions,
            self.config.ad_config(),
            self.config.split_code_data_pmp,
            domain,
            access,
            va,
            bytes,
            attrs,
        )
    }

    /// `vmInvalidateAll`.
    pub fn vm_invalidate_all(&mut self, csr: &dyn CsrSource, runtime: &dyn AliasRuntime) {
        let regime = active_stage1_regime(csr);
        let removed = self.orchestrator.tlb(regime).invalidate(0, u64::MAX, tlb::InvalidateScope::Any, None);
        teardown_aliases(&removed, &self.domains, runtime);
    }

    /// `vmInvalidateAllASID`.
    pub fn vm_invalidate_all_asid(&mut self, csr: &dyn CsrSource, runtime: &dyn AliasRuntime, asid: u16) {
        let regime = active_stage1_regime(csr);
        let vmid = csr.virt().then(|| csr.hgatp().vmid);
        let removed = self.orchestrator.tlb(regime).invalidate(0, u64::MAX, tlb::InvalidateScope::Asid(asid), vmid);
        teardown_aliases(&removed, &self.domains, runtime);
    }

    /// `vmInvalidateVA`.
    pub fn vm_invalidate_va(&mut self, csr: &dyn CsrSource, runtime: &dyn AliasRuntime, va: u64) {
        let regime = active_stage1_regime(csr);
        let removed = self.orchestrator.tlb(regime).invalidate(va, va, tlb::InvalidateScope::Any, None);
        teardown_aliases(&removed, &self.domains, runtime);
    }

    /// `vmInvalidateVAASID`.
    pub fn vm_invalidate_va_asid(&mut self, csr: &dyn CsrSource, runtime: &dyn AliasRuntime, va: u64, asid: u16) {
        let regime = active_stage1_regime(csr);
        let vmid = csr.virt().then(|| csr.hgatp().vmid);
        let removed = self.orchestrator.tlb(regime).invalidate(va, va, tlb::InvalidateScope::Asid(asid), vmid);
        teardown_aliases(&removed, &self.domains, runtime);
    }

    /// `vmSetASID`: recompute the caller's current simulated-ASID key.
    /// There is no separate runtime channel to publish it through — every
    /// TLB lookup derives the live key fresh from [`CsrSource`] — so this
    /// exists for parity with the processor-facing surface and for
    /// diagnostics (e.g. logging the key a `sfence.vma` will compare
    /// against).
    pub fn vm_set_asid(&self, csr: &dyn CsrSource) -> SimAsid {
        let regime = active_stage1_regime(csr);
        orchestrator::current_sim_asid(csr, regime)
    }

    /// `vmRefreshMPRVDomain`: the data-access domain to use given the
    /// current `mstatus.MPRV`/`MPP`, honoring that MPRV only takes effect in
    /// debug mode when `dcsr.mprven` is set.
    pub fn vm_refresh_mprv_domain(&self, csr: &dyn CsrSource) -> DomainId {
        let status = csr.mstatus();
        let mprv_effective = status.mprv && (!csr.debug_mode() || csr.dcsr_mprven());
        let mode = if mprv_effective {
            status.mpp.unwrap_or_else(|| csr.mode())
        } else {
            csr.mode()
        };
        self.domains.for_mode(mode).virt
    }

    pub fn vm_read_pmpcfg(&self, i: usize) -> Result<u8, error::PmpError> {
        self.pmp.read_cfg(i)
    }

    /// `vmWritePMPCFG`: update the config word and propagate the
    /// invalidation consequences (spec §4.7 "Invalidation") to the
    /// per-mode physical domains.
    pub fn vm_write_pmpcfg(&mut self, runtime: &dyn AliasRuntime, base_index: usize, bytes_per_word: usize, value: u64) {
        let invalidations = self.pmp.write_cfg_word(base_index, bytes_per_word, value);
        for inv in &invalidations {
            let Some(bounds) = inv.strip_supervisor() else {
                continue;
            };
            for mode in [Mode::User, Mode::Supervisor] {
                let d = self.domains.for_mode(mode);
                runtime.protect_memory(d.physical, bounds.low, bounds.high, tlb::PrivMask::NONE);
                if self.config.split_code_data_pmp {
                    runtime.protect_memory(d.code, bounds.low, bounds.high, tlb::PrivMask::NONE);
                }
            }
            if inv.strip_machine(self.pmp.any_locked_after(inv.index)) {
                let d = self.domains.for_mode(Mode::Machine);
                runtime.protect_memory(d.physical, bounds.low, bounds.high, tlb::PrivMask::NONE);
                if self.config.split_code_data_pmp {
                    runtime.protect_memory(d.code, bounds.low, bounds.high, tlb::PrivMask::NONE);
                }
            }
        }
    }

    pub fn vm_read_pmpaddr(&self, i: usize) -> Result<u64, error::PmpError> {
        self.pmp.read_addr(i)
    }

    pub fn vm_write_pmpaddr(&mut self, i: usize, value: u64) -> Result<(), error::PmpError> {
        self.pmp.write_addr(i, value)
    }

    /// `vmResetPMP`: power-on reset of the register bank.
    pub fn vm_reset_pmp(&mut self) {
        self.pmp.reset();
    }

    /// `vmNewPMP`: (re)allocate the register bank with a new region count,
    /// grain, and address width.
    pub fn vm_new_pmp(&mut self, regions: usize, grain: u32, pa_bits: u32) -> Result<(), ConfigError> {
        let config = VmemConfig {
            pmp_regions: regions,
            pmp_grain: grain,
            pa_bits,
            ..self.config
        };
        config.validate()?;
        self.pmp = PmpState::new(regions, grain, pa_bits);
        self.config = config;
        Ok(())
    }

    /// `vmFreePMP`: release the register bank back to a zero-region state.
    pub fn vm_free_pmp(&mut self) {
        self.pmp = PmpState::new(0, self.config.pmp_grain, self.config.pa_bits);
        self.config.pmp_regions = 0;
    }

    /// `vmSave`: stream the HS/VS1/VS2 TLBs, in that order (spec §6).
    pub fn vm_save<W: std::io::Write>(&self, writer: &mut W) -> Result<(), save::SaveError> {
        save::save_all(
            self.orchestrator.tlb_ref(Regime::Hs),
            self.orchestrator.tlb_ref(Regime::Vs1),
            self.orchestrator.tlb_ref(Regime::Vs2),
            writer,
        )?;
        Ok(())
    }

    /// `vmRestore`: clear every TLB, then reinsert each record.
    pub fn vm_restore<R: std::io::Read>(&mut self, reader: &mut R) -> Result<(), save::SaveError> {
        let (hs, vs1, vs2) = self.orchestrator.tlbs_mut();
        save::restore_all(hs, vs1, vs2, reader)?;
        Ok(())
    }

    pub fn dump_tlb(&self) -> String {
        self.orchestrator.tlb_ref(Regime::Hs).dump()
    }

    pub fn dump_vs1_tlb(&self) -> String {
        self.orchestrator.tlb_ref(Regime::Vs1).dump()
    }

    pub fn dump_vs2_tlb(&self) -> String {
        self.orchestrator.tlb_ref(Regime::Vs2).dump()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csr::{HgatpView, PrivVersion, SatpView, StatusView};
    use crate::domain::DomainKind;
    use crate::error::DomainError;
    use std::sync::Mutex;

    fn base_config() -> VmemConfig {
        VmemConfig {
            pmp_regions: 8,
            pmp_grain: 0,
            pa_bits: 34,
            hw_a_update: true,
            hw_d_update: true,
            asid_implemented: true,
            split_code_data_pmp: false,
        }
    }

    struct NullRuntime {
        next: Mutex<u64>,
        protects: Mutex<Vec<(DomainId, u64, u64, tlb::PrivMask)>>,
    }

    impl NullRuntime {
        fn new() -> Self {
            NullRuntime {
                next: Mutex::new(0),
                protects: Mutex::new(Vec::new()),
            }
        }
    }

    impl AliasRuntime for NullRuntime {
        fn new_domain(&self, _kind: DomainKind, _mode: Option<Mode>) -> DomainId {
            let mut next = self.next.lock().unwrap();
            let id = DomainId(*next);
            *next += 1;
            id
        }
        fn alias_memory(&self, _target: DomainId, _source: DomainId, _low: u64, _high: u64) {}
        fn alias_memory_vm(
            &self,
            _pmp_domain: DomainId,
            _virtual_domain: DomainId,
            _low_pa: u64,
            _high_pa: u64,
            _low_va: u64,
            _priv_mask: tlb::PrivMask,
            _asid_mask: asid::SimAsidMask,
            _sim_asid: SimAsid,
        ) {
        }
        fn unalias_memory_vm(&self, _virtual_domain: DomainId, _low_va: u64, _high_va: u64) {}
        fn protect_memory(&self, domain: DomainId, low_pa: u64, high_pa: u64, priv_mask: tlb::PrivMask) {
            self.protects.lock().unwrap().push((domain, low_pa, high_pa, priv_mask));
        }
    }

    struct NullDomain;
    impl MemoryDomain for NullDomain {
        fn read(&self, _addr: u64, _size: u64) -> Result<u64, DomainError> {
            Err(DomainError::Bus(0))
        }
        fn write(&self, _addr: u64, _size: u64, _value: u64) -> Result<(), DomainError> {
            Ok(())
        }
    }

    struct NullSink;
    impl ExceptionSink for NullSink {
        fn take_memory_exception(&self, _trap: error::Trap) {}
    }

    struct FixedCsr {
        mode: Mode,
        virt: bool,
    }

    impl CsrSource for FixedCsr {
        fn mode(&self) -> Mode {
            self.mode
        }
        fn virt(&self) -> bool {
            self.virt
        }
        fn min_mode(&self) -> Mode {
            Mode::User
        }
        fn priv_version(&self) -> PrivVersion {
            PrivVersion::V1_12
        }
        fn satp(&self) -> SatpView {
            SatpView::default()
        }
        fn vsatp(&self) -> SatpView {
            SatpView::default()
        }
        fn hgatp(&self) -> HgatpView {
            HgatpView::default()
        }
        fn mstatus(&self) -> StatusView {
            StatusView::default()
        }
        fn vsstatus(&self) -> StatusView {
            StatusView::default()
        }
        fn debug_mode(&self) -> bool {
            false
        }
        fn dcsr_mprven(&self) -> bool {
            false
        }
    }

    #[test]
    fn rejects_region_count_over_architectural_max() {
        let mut config = base_config();
        config.pmp_regions = pmp::MAX_PMP_REGIONS + 1;
        assert_eq!(config.validate().unwrap_err(), ConfigError::TooManyRegions(config.pmp_regions));
    }

    #[test]
    fn rejects_grain_wider_than_address_space() {
        let mut config = base_config();
        config.pmp_grain = 40;
        config.pa_bits = 34;
        assert_eq!(config.validate().unwrap_err(), ConfigError::GrainTooWide(40));
    }

    #[test]
    fn vm_init_then_unmapped_domain_misses() {
        let runtime = NullRuntime::new();
        let code = [
            runtime.new_domain(DomainKind::Physical, Some(Mode::User)),
            runtime.new_domain(DomainKind::Physical, Some(Mode::Supervisor)),
            runtime.new_domain(DomainKind::Physical, Some(Mode::Machine)),
        ];
        let data = [
            runtime.new_domain(DomainKind::Physical, Some(Mode::User)),
            runtime.new_domain(DomainKind::Physical, Some(Mode::Supervisor)),
            runtime.new_domain(DomainKind::Physical, Some(Mode::Machine)),
        ];
        let mut vm = VmemUnit::vm_init(base_config(), &runtime, code, data).unwrap();

        let ptw_domain = NullDomain;
        let csr = FixedCsr {
            mode: Mode::User,
            virt: false,
        };
        let exceptions = NullSink;
        let bogus = DomainId(9999);
        let ok = vm.vm_miss(
            &ptw_domain,
            &csr,
            &runtime,
            &exceptions,
            bogus,
            AccessType::Load,
            0x1000,
            4,
            AccessAttrs::default(),
        );
        assert!(!ok);
    }

    #[test]
    fn pmp_cfg_and_addr_roundtrip_through_facade() {
        let runtime = NullRuntime::new();
        let code = [
            runtime.new_domain(DomainKind::Physical, Some(Mode::User)),
            runtime.new_domain(DomainKind::Physical, Some(Mode::Supervisor)),
            runtime.new_domain(DomainKind::Physical, Some(Mode::Machine)),
        ];
        let data = [
            runtime.new_domain(DomainKind::Physical, Some(Mode::User)),
            runtime.new_domain(DomainKind::Physical, Some(Mode::Supervisor)),
            runtime.new_domain(DomainKind::Physical, Some(Mode::Machine)),
        ];
        let mut vm = VmemUnit::vm_init(base_config(), &runtime, code, data).unwrap();

        vm.vm_write_pmpaddr(0, 0x40).unwrap();
        assert_eq!(vm.vm_read_pmpaddr(0).unwrap(), 0x40);

        let cfg = bits::PmpCfgByte {
            r: true,
            w: false,
            x: false,
            mode: bits::PmpAMode::Na4,
            locked: false,
        };
        vm.vm_write_pmpcfg(&runtime, 0, 8, cfg.encode() as u64);
        assert_eq!(vm.vm_read_pmpcfg(0).unwrap(), cfg.encode());
    }

    #[test]
    fn vm_miss_splits_rw_from_x_across_distinct_code_and_data_domains() {
        let runtime = NullRuntime::new();
        let code = [
            runtime.new_domain(DomainKind::Physical, Some(Mode::User)),
            runtime.new_domain(DomainKind::Physical, Some(Mode::Supervisor)),
            runtime.new_domain(DomainKind::Physical, Some(Mode::Machine)),
        ];
        let data = [
            runtime.new_domain(DomainKind::Physical, Some(Mode::User)),
            runtime.new_domain(DomainKind::Physical, Some(Mode::Supervisor)),
            runtime.new_domain(DomainKind::Physical, Some(Mode::Machine)),
        ];
        let mut config = base_config();
        config.split_code_data_pmp = true;
        let mut vm = VmemUnit::vm_init(config, &runtime, code, data).unwrap();
        vm.vm_new_pmp(0, 0, 34).unwrap();

        let ptw_domain = NullDomain;
        let csr = FixedCsr {
            mode: Mode::Supervisor,
            virt: false,
        };
        let exceptions = NullSink;
        let physical = vm.domains.for_mode(Mode::Supervisor).physical;

        let ok = vm.vm_miss(
            &ptw_domain,
            &csr,
            &runtime,
            &exceptions,
            physical,
            AccessType::Load,
            0x2000,
            4,
            AccessAttrs::default(),
        );
        assert!(ok);

        let protects = runtime.protects.lock().unwrap();
        assert_eq!(protects.len(), 2, "data and code domains are protected independently");
        let data_call = protects.iter().find(|(d, ..)| *d == data[1]).unwrap();
        let code_call = protects.iter().find(|(d, ..)| *d == code[1]).unwrap();
        assert!(data_call.3.r() && data_call.3.w() && !data_call.3.x());
        assert!(code_call.3.x() && !code_call.3.r() && !code_call.3.w());
    }

    #[test]
    fn refresh_mprv_domain_falls_back_to_current_mode_outside_debug_without_mprv() {
        let runtime = NullRuntime::new();
        let code = [
            runtime.new_domain(DomainKind::Physical, Some(Mode::User)),
            runtime.new_domain(DomainKind::Physical, Some(Mode::Supervisor)),
            runtime.new_domain(DomainKind::Physical, Some(Mode::Machine)),
        ];
        let data = [
            runtime.new_domain(DomainKind::Physical, Some(Mode::User)),
            runtime.new_domain(DomainKind::Physical, Some(Mode::Supervisor)),
            runtime.new_domain(DomainKind::Physical, Some(Mode::Machine)),
        ];
        let vm = VmemUnit::vm_init(base_config(), &runtime, code, data).unwrap();
        let csr = FixedCsr {
            mode: Mode::Supervisor,
            virt: false,
        };
        assert_eq!(vm.vm_refresh_mprv_domain(&csr), vm.domains.for_mode(Mode::Supervisor).virt);
    }

    #[test]
    fn save_restore_roundtrips_through_facade() {
        let runtime = NullRuntime::new();
        let code = [
            runtime.new_domain(DomainKind::Physical, Some(Mode::User)),
            runtime.new_domain(DomainKind::Physical, Some(Mode::Supervisor)),
            runtime.new_domain(DomainKind::Physical, Some(Mode::Machine)),
        ];
        let data = [
            runtime.new_domain(DomainKind::Physical, Some(Mode::User)),
            runtime.new_domain(DomainKind::Physical, Some(Mode::Supervisor)),
            runtime.new_domain(DomainKind::Physical, Some(Mode::Machine)),
        ];
        let mut vm = VmemUnit::vm_init(base_config(), &runtime, code, data).unwrap();

        vm.orchestrator.tlb(Regime::Hs).insert(TlbEntry::new(
            0x1000,
            0x1FFF,
            0x1000,
            Regime::Hs,
            tlb::PrivMask::RWX,
            true,
            false,
            true,
            false,
            tlb::MappedMask::EMPTY,
            false,
            SimAsid::pack(1, 0, 0, false, false, false, false, false, false),
            asid::SimAsidMask(0xFFFF),
        ));

        let mut buf = Vec::new();
        vm.vm_save(&mut buf).unwrap();

        let mut restored = VmemUnit::vm_init(base_config(), &runtime, code, data).unwrap();
        restored.vm_restore(&mut buf.as_slice()).unwrap();
        assert!(!restored.dump_tlb().is_empty());
    }
}
