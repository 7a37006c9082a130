//! Layered memory-domain plumbing (spec §4.6, §6).
//!
//! The host memory-domain runtime — raw reads/writes, range-table
//! primitives, alias mappings, region-protect calls — is an external
//! collaborator, reached only through [`MemoryDomain`] and [`AliasRuntime`].
//! This mirrors `riscv-vm::bus::Bus`: a trait the MMU/PMP layer depends on
//! without owning an implementation.

use serde::{Deserialize, Serialize};

use crate::asid::{SimAsid, SimAsidMask};
use crate::csr::Mode;
pub use crate::error::DomainError;
use crate::error::Trap;
use crate::tlb::PrivMask;

/// Generic read/write surface backing a domain, used by the page-table
/// walker for supervisor-privilege PTE traffic and by the orchestrator for
/// the final refined access. Shaped exactly like `riscv-vm::bus::Bus`'s
/// `load`/`store` helpers.
pub trait MemoryDomain: Send + Sync {
    fn read(&self, addr: u64, size: u64) -> Result<u64, DomainError>;
    fn write(&self, addr: u64, size: u64, value: u64) -> Result<(), DomainError>;
}

/// Opaque handle to a constructed domain. Never inspected by value; only
/// compared for identity against the `domain` argument to `vmMiss`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DomainId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainKind {
    Pma,
    Pmp,
    Physical,
    Virtual,
    Transaction,
    Clic,
}

/// The host memory-domain runtime's mutating operations: `newDomain`,
/// `aliasMemory`, `aliasMemoryVM`, `unaliasMemoryVM`, `protectMemory`.
pub trait AliasRuntime: Send + Sync {
    fn new_domain(&self, kind: DomainKind, mode: Option<Mode>) -> DomainId;

    /// Plain (non-ASID-checked) physical alias, used to stack PMA under PMP
    /// under Physical at construction time.
    fn alias_memory(&self, target: DomainId, source: DomainId, low: u64, high: u64);

    /// Install a virtual-domain alias validated against `sim_asid` under
    /// `asid_mask`, per spec §4.6.
    #[allow(clippy::too_many_arguments)]
    fn alias_memory_vm(
        &self,
        pmp_domain: DomainId,
        virtual_domain: DomainId,
        low_pa: u64,
        high_pa: u64,
        low_va: u64,
        priv_mask: PrivMask,
        asid_mask: SimAsidMask,
        sim_asid: SimAsid,
    );

    fn unalias_memory_vm(&self, virtual_domain: DomainId, low_va: u64, high_va: u64);

    /// `protectMemory`: restrict `[low_pa, high_pa]` in `domain` to
    /// `priv_mask`. Split data/code domains call this independently when
    /// `code` and `data` domains differ.
    fn protect_memory(&self, domain: DomainId, low_pa: u64, high_pa: u64, priv_mask: PrivMask);
}

/// Raises faults through the exception-entry interface (`takeMemoryException`).
pub trait ExceptionSink {
    fn take_memory_exception(&self, trap: Trap);
}

/// The layered domains constructed for one base privilege mode: PMA -> PMP
/// -> Physical, the Virtual domain aliased on top, and the code domain
/// aliased onto the same PMP layer as `physical` (equal to it unless the
/// caller supplied a distinct entry in `vmInit`'s `code_domains`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeDomains {
    pub pma: DomainId,
    pub pmp: DomainId,
    pub physical: DomainId,
    pub code: DomainId,
    pub virt: DomainId,
}

/// The complete domain stack built by `vmInit`: the four layered domains
/// per base privilege mode, plus the transaction-mode and CLIC alias
/// domains (spec §2, §6).
pub struct DomainStack {
    user: ModeDomains,
    supervisor: ModeDomains,
    machine: ModeDomains,
    pub transaction: DomainId,
    pub clic: DomainId,
}

/// Result of resolving a `vmMiss` domain argument against the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainMatch {
    /// The domain is the PMP or Physical layer for `Mode`: run PMP/PMA
    /// refinement directly (spec §4.5 step 1).
    PhysicalLike(Mode),
    /// The domain is the Virtual layer for `Mode`: run the full translation
    /// orchestrator loop (spec §4.5 step 2).
    Virtual(Mode),
}

impl DomainStack {
    /// Build the domain stack for one hart: code/data domain arrays are
    /// supplied by the caller (one physical-layer domain per base privilege
    /// mode, as constructed by the surrounding simulator's bus layer); this
    /// constructor only builds the PMA/PMP/Virtual layers on top of them.
    pub fn build(runtime: &dyn AliasRuntime, code_domains: [DomainId; 3], data_domains: [DomainId; 3]) -> DomainStack {
        let build_mode = |mode: Mode, physical: DomainId, code: DomainId| -> ModeDomains {
            let pma = runtime.new_domain(DomainKind::Pma, Some(mode));
            let pmp = runtime.new_domain(DomainKind::Pmp, Some(mode));
            let virt = runtime.new_domain(DomainKind::Virtual, Some(mode));
            runtime.alias_memory(pmp, pma, 0, u64::MAX);
            runtime.alias_memory(physical, pmp, 0, u64::MAX);
            runtime.alias_memory(code, pmp, 0, u64::MAX);
            ModeDomains {
                pma,
                pmp,
                physical,
                code,
                virt,
            }
        };

        // Data and code domains both carry the physical layer, each aliased
        // onto the same PMP layer, so `protect_memory` can split RW from X
        // when the two domains are distinct (spec §4.7).
        let user = build_mode(Mode::User, data_domains[0], code_domains[0]);
        let supervisor = build_mode(Mode::Supervisor, data_domains[1], code_domains[1]);
        let machine = build_mode(Mode::Machine, data_domains[2], code_domains[2]);

        let transaction = runtime.new_domain(DomainKind::Transaction, None);
        let clic = runtime.new_domain(DomainKind::Clic, None);

        DomainStack {
            user,
            supervisor,
            machine,
            transaction,
            clic,
        }
    }

    pub fn for_mode(&self, mode: Mode) -> &ModeDomains {
        match mode {
            Mode::User => &self.user,
            Mode::Supervisor => &self.supervisor,
            Mode::Machine => &self.machine,
        }
    }

    /// Resolve a `vmMiss` domain argument, per spec §4.5 step 1: "not a
    /// mapped domain" if nothing matches.
    pub fn classify(&self, domain: DomainId) -> Option<DomainMatch> {
        for mode in [Mode::User, Mode::Supervisor, Mode::Machine] {
            let d = self.for_mode(mode);
            if domain == d.pmp || domain == d.physical || domain == d.code {
                return Some(DomainMatch::PhysicalLike(mode));
            }
            if domain == d.virt {
                return Some(DomainMatch::Virtual(mode));
            }
        }
        None
    }
}
