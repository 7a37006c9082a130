//! Interfaces consumed from the surrounding processor state.
//!
//! The virtual-memory subsystem never owns the CSR register file, the
//! current privilege mode, or the guest's chosen endianness — it only reads
//! them through [`CsrSource`]. This mirrors `riscv-vm::bus::Bus`: a thin
//! trait the MMU depends on without knowing what backs it.

use serde::{Deserialize, Serialize};

/// Base privilege mode, independent of the virtualization (`V`) bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    User,
    Supervisor,
    Machine,
}

impl Mode {
    /// Numeric privilege level, lowest first, used for CSR access checks
    /// and for the PMP "is caller machine mode" comparison.
    pub fn level(self) -> u8 {
        match self {
            Mode::User => 0,
            Mode::Supervisor => 1,
            Mode::Machine => 3,
        }
    }

    pub fn is_machine(self) -> bool {
        matches!(self, Mode::Machine)
    }
}

/// Privileged-architecture version, ordered so callers can test `>= V1_11`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PrivVersion {
    V1_10,
    V1_11,
    V1_12,
}

/// Which translation regime is active for the current access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Regime {
    /// Non-virtualized supervisor (`satp`-governed).
    Hs,
    /// Virtualized stage 1, guest virtual -> guest physical (`vsatp`).
    Vs1,
    /// Virtualized stage 2, guest physical -> supervisor physical (`hgatp`).
    Vs2,
}

/// Byte order used for a regime's page-table reads/writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// A decoded view of `satp`/`vsatp` (stage-1 address translation CSRs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SatpView {
    /// Raw `MODE` field (0 = Bare, 8 = Sv39, 9 = Sv48, 1 = Sv32).
    pub mode: u64,
    pub ppn: u64,
    pub asid: u16,
}

/// A decoded view of `hgatp` (stage-2 address translation CSR).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HgatpView {
    pub mode: u64,
    pub ppn: u64,
    pub vmid: u16,
}

/// A decoded view of the status bits this subsystem cares about, shared
/// shape for `mstatus`/`vsstatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusView {
    pub mxr: bool,
    pub sum: bool,
    pub mprv: bool,
    pub mpp: Option<Mode>,
    /// `MPV` — MPRV applies to a virtualized access.
    pub mpv: bool,
}

/// Everything the virtual-memory subsystem reads from the surrounding
/// processor. Implemented by the simulator's CPU/CSR layer; this crate only
/// calls through it.
pub trait CsrSource {
    fn mode(&self) -> Mode;
    /// The `V` (virtualization) bit: true when running a virtualized guest.
    fn virt(&self) -> bool;
    /// Lowest privilege mode implemented by this hart (for `vmRefreshMPRVDomain`).
    fn min_mode(&self) -> Mode;
    fn priv_version(&self) -> PrivVersion;

    fn satp(&self) -> SatpView;
    fn vsatp(&self) -> SatpView;
    fn hgatp(&self) -> HgatpView;

    fn mstatus(&self) -> StatusView;
    fn vsstatus(&self) -> StatusView;

    /// `dcsr.mprven`: whether MPRV is honored while in debug mode.
    fn debug_mode(&self) -> bool;
    fn dcsr_mprven(&self) -> bool;

    /// Data endianness for a given regime's page-table traffic.
    fn endianness(&self, regime: Regime) -> Endian {
        let _ = regime;
        Endian::Little
    }
}
