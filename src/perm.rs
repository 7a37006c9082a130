//! Permission check (spec §4.2), grounded on
//! `riscv-vm::mmu::check_permission_tlb` but generalized to the packed
//! [`PrivMask`] type and the MXR/SUM composition rules for VS1/VS2.

use crate::csr::{Mode, PrivVersion, Regime, StatusView};
use crate::error::AccessType;
use crate::tlb::PrivMask;

/// Inputs needed to decide whether an access is permitted against a
/// candidate leaf mapping.
pub struct PermCheck {
    pub caller_mode: Mode,
    pub regime: Regime,
    pub hs_status: StatusView,
    pub vs_status: StatusView,
    pub priv_version: PrivVersion,
}

/// Evaluate spec §4.2 against a leaf's raw RWX/U bits, returning the
/// effective privilege granted (for comparison against the required set).
pub fn check(check: &PermCheck, entry_perm: PrivMask, entry_user: bool, access: AccessType) -> bool {
    let mut priv_mask = entry_perm;

    // Step 2: effective MXR/SUM. For VS1, MXR is the OR of the hypervisor
    // and virtualized stage's MXR bit; VS2 accesses are always evaluated as
    // user mode and never consult SUM.
    let (mxr, sum) = match check.regime {
        Regime::Hs => (check.hs_status.mxr, check.hs_status.sum),
        Regime::Vs1 => (check.hs_status.mxr || check.vs_status.mxr, check.vs_status.sum),
        Regime::Vs2 => (check.hs_status.mxr || check.vs_status.mxr, false),
    };

    // Step 3: X-implies-R under MXR, before any SUM-based narrowing.
    if priv_mask.x() && mxr {
        priv_mask = priv_mask.with_r();
    }

    let effective_mode = if check.regime == Regime::Vs2 {
        Mode::User
    } else {
        check.caller_mode
    };

    match effective_mode {
        Mode::User => {
            if !entry_user {
                return false;
            }
        }
        Mode::Supervisor => {
            if entry_user {
                if !sum {
                    return false;
                }
                if check.priv_version >= PrivVersion::V1_11 {
                    priv_mask = priv_mask.without_x();
                }
            }
        }
        Mode::Machine => {}
    }

    let required = match access {
        AccessType::Instruction => PrivMask(crate::tlb::PERM_X),
        AccessType::Load => PrivMask(crate::tlb::PERM_R),
        AccessType::Store => PrivMask(crate::tlb::PERM_W),
    };

    priv_mask.contains(required)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(mxr: bool, sum: bool) -> StatusView {
        StatusView {
            mxr,
            sum,
            mprv: false,
            mpp: None,
            mpv: false,
        }
    }

    #[test]
    fn user_mode_denied_on_supervisor_only_page() {
        let c = PermCheck {
            caller_mode: Mode::User,
            regime: Regime::Hs,
            hs_status: status(false, false),
            vs_status: status(false, false),
            priv_version: PrivVersion::V1_12,
        };
        assert!(!check(&c, PrivMask::RWX, false, AccessType::Load));
    }

    #[test]
    fn supervisor_denied_on_user_page_without_sum() {
        let c = PermCheck {
            caller_mode: Mode::Supervisor,
            regime: Regime::Hs,
            hs_status: status(false, false),
            vs_status: status(false, false),
            priv_version: PrivVersion::V1_12,
        };
        assert!(!check(&c, PrivMask::RWX, true, AccessType::Load));
    }

    #[test]
    fn supervisor_with_sum_cannot_execute_user_page_post_1_11() {
        let c = PermCheck {
            caller_mode: Mode::Supervisor,
            regime: Regime::Hs,
            hs_status: status(false, true),
            vs_status: status(false, false),
            priv_version: PrivVersion::V1_12,
        };
        assert!(!check(&c, PrivMask::RWX, true, AccessType::Instruction));
        assert!(check(&c, PrivMask::RWX, true, AccessType::Load));
    }

    #[test]
    fn mxr_grants_read_on_execute_only_page() {
        let c = PermCheck {
            caller_mode: Mode::User,
            regime: Regime::Hs,
            hs_status: status(true, false),
            vs_status: status(false, false),
            priv_version: PrivVersion::V1_12,
        };
        assert!(check(&c, PrivMask(crate::tlb::PERM_X), true, AccessType::Load));
    }

    #[test]
    fn stage2_ignores_sum() {
        let c = PermCheck {
            caller_mode: Mode::Supervisor,
            regime: Regime::Vs2,
            hs_status: status(false, false),
            vs_status: status(false, false),
            priv_version: PrivVersion::V1_12,
        };
        // Stage-2 treats the access as user mode, so a user-inaccessible
        // entry (entry_user = false) should be denied regardless of SUM.
        assert!(!check(&c, PrivMask::RWX, false, AccessType::Load));
        assert!(check(&c, PrivMask::RWX, true, AccessType::Load));
    }
}
