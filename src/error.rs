//! Error taxonomy for the virtual-memory subsystem.
//!
//! `PtwError` and `PmpError`/`DomainError` are internal, fine-grained causes;
//! `Trap` is the architectural fault the orchestrator reports through
//! [`crate::domain::ExceptionSink`]. The split mirrors the teacher's
//! `riscv-vm::dram::MemoryError` (leaf cause) feeding into `riscv-vm::Trap`
//! (architectural outcome).

use thiserror::Error;

use crate::csr::Regime;

/// Fine-grained page-table-walk failure, named after the RISC-V privileged
/// spec's own mnemonics rather than a generic "fault" enum.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PtwError {
    #[error("virtual address does not sign-extend the VPN bits")]
    VaExtend,
    #[error("PTE not valid (V=0)")]
    V0,
    #[error("reserved PTE encoding (R=0, W=1)")]
    R0W1,
    #[error("walk ran out of levels before reaching a leaf")]
    Leaf,
    #[error("misaligned superpage (PA not aligned to its own size)")]
    Align,
    #[error("required privilege not granted by the leaf PTE")]
    Priv,
    #[error("accessed bit clear and hardware A-updates are disabled")]
    A0,
    #[error("dirty bit clear on a write and hardware D-updates are disabled")]
    D0,
    #[error("bus error reading a page-table entry")]
    Read,
    #[error("bus error writing back an updated page-table entry")]
    Write,
}

/// Logging severity a `PtwError` should be reported at, per spec: informational
/// faults are normal OS behavior and should not be logged as warnings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warn,
}

impl PtwError {
    pub fn severity(self) -> Severity {
        match self {
            PtwError::V0 | PtwError::Priv | PtwError::A0 | PtwError::D0 => Severity::Info,
            _ => Severity::Warn,
        }
    }

    /// True for the page-fault family; false for the two bus-error causes,
    /// which map to access faults instead.
    pub fn is_page_fault(self) -> bool {
        !matches!(self, PtwError::Read | PtwError::Write)
    }
}

/// The access being attempted, carried alongside the required permission set
/// so error classification knows which `Trap` variant to raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Instruction,
    Load,
    Store,
}

/// Architectural fault raised through the exception-entry interface.
///
/// Guest variants are used only when the failing walk was stage-2
/// (`Regime::Vs2`); see [`Trap::from_ptw_error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    InstructionPageFault(u64),
    LoadPageFault(u64),
    StoreAmoPageFault(u64),
    InstructionGuestPageFault(u64),
    LoadGuestPageFault(u64),
    StoreAmoGuestPageFault(u64),
    InstructionAccessFault(u64),
    LoadAccessFault(u64),
    StoreAmoAccessFault(u64),
    /// PMP or PMA denial (`AFault_PMP` / hook denial); reported as an access
    /// fault on the original access.
    PmpAccessFault(u64, AccessType),
    /// `domain` passed to `vmMiss` did not match any of the constructed
    /// per-mode domains.
    UnmappedDomain,
}

impl Trap {
    /// Classify a walker failure into the architectural fault it produces,
    /// per spec §7. `va` is the *original* faulting VA (already restored to
    /// the stage-1 VA if the failing walk was stage-2); `guest` is true iff
    /// the failing walker was stage-2 (`Regime::Vs2`).
    pub fn from_ptw_error(err: PtwError, access: AccessType, va: u64, regime: Regime) -> Trap {
        let guest = regime == Regime::Vs2;
        if err.is_page_fault() {
            match (access, guest) {
                (AccessType::Instruction, false) => Trap::InstructionPageFault(va),
                (AccessType::Load, false) => Trap::LoadPageFault(va),
                (AccessType::Store, false) => Trap::StoreAmoPageFault(va),
                (AccessType::Instruction, true) => Trap::InstructionGuestPageFault(va),
                (AccessType::Load, true) => Trap::LoadGuestPageFault(va),
                (AccessType::Store, true) => Trap::StoreAmoGuestPageFault(va),
            }
        } else {
            match access {
                AccessType::Instruction => Trap::InstructionAccessFault(va),
                AccessType::Load => Trap::LoadAccessFault(va),
                AccessType::Store => Trap::StoreAmoAccessFault(va),
            }
        }
    }
}

impl std::fmt::Display for Trap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Trap {}

/// Failure talking to the host memory-domain runtime (range-table ops,
/// aliasing, raw read/write) — the external collaborator referenced only
/// through [`crate::domain::MemoryDomain`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DomainError {
    #[error("bus error at {0:#x}")]
    Bus(u64),
    #[error("domain handle does not correspond to a constructed domain")]
    NotMapped,
}

/// PMP register-file access failure.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PmpError {
    #[error("region index {0} is out of range")]
    IndexOutOfRange(usize),
    #[error("region index {0} is locked")]
    Locked(usize),
}

/// Rejected [`crate::VmemConfig`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("PMP region count {0} exceeds the architectural maximum of 64")]
    TooManyRegions(usize),
    #[error("PMP grain {0} is wider than the supported physical address width")]
    GrainTooWide(u32),
}
