//! TLB save/restore (spec §6 "Persisted state format"), grounded on
//! `riscv-vm::emulator::Emulator::{save_snapshot_to_path,
//! load_snapshot_from_path}`'s bincode-over-`Write`/`Read` pattern, but
//! scoped to TLB contents only — PMP and CSR state ride the surrounding
//! processor's own save path (spec §2 Non-goals).

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

use crate::asid::{SimAsid, SimAsidMask};
use crate::csr::Regime;
use crate::tlb::{PrivMask, Tlb, TlbEntry};

/// One persisted record. `Entry` carries an entry with `mapped` and the
/// range-table back-reference cleared, per spec §6; `End` is the
/// zero-payload terminator closing the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum Record {
    /// Tagged `TLB_ENTRY` in spec prose; the variant name doubles as the tag.
    Entry(TlbEntryRecord),
    End,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TlbEntryRecord {
    low_va: u64,
    high_va: u64,
    pa: u64,
    regime: Regime,
    perm: u8,
    user: bool,
    global: bool,
    accessed: bool,
    dirty: bool,
    artifact: bool,
    sim_asid: u64,
    asid_mask: u64,
}

impl From<&TlbEntry> for TlbEntryRecord {
    fn from(e: &TlbEntry) -> Self {
        // `mapped` and the range-table handle are both runtime-local and
        // rebuilt by `insert` on restore, so neither is persisted.
        TlbEntryRecord {
            low_va: e.low_va,
            high_va: e.high_va,
            pa: e.pa,
            regime: e.regime,
            perm: e.perm.0,
            user: e.user,
            global: e.global,
            accessed: e.accessed,
            dirty: e.dirty,
            artifact: e.artifact,
            sim_asid: e.sim_asid.0,
            asid_mask: e.asid_mask.0,
        }
    }
}

impl TlbEntryRecord {
    fn into_entry(self) -> TlbEntry {
        TlbEntry::new(
            self.low_va,
            self.high_va,
            self.pa,
            self.regime,
            PrivMask(self.perm),
            self.user,
            self.global,
            self.accessed,
            self.dirty,
            crate::tlb::MappedMask::EMPTY,
            self.artifact,
            SimAsid(self.sim_asid),
            SimAsidMask(self.asid_mask),
        )
    }
}

/// Write every live entry in `tlb` as a `TLB_ENTRY` record, followed by the
/// terminator, per spec §6.
pub fn save_tlb<W: Write>(tlb: &Tlb, writer: &mut W) -> bincode::Result<()> {
    let mut count = 0u64;
    for entry in tlb.dump_entries() {
        bincode::serialize_into(&mut *writer, &Record::Entry(TlbEntryRecord::from(&entry)))?;
        count += 1;
    }
    bincode::serialize_into(&mut *writer, &Record::End)?;
    log::debug!("save_tlb[{:?}]: {} entries written", tlb.regime(), count);
    Ok(())
}

/// Clear `tlb` (ANY-mode invalidation over the full address range, per spec
/// §6) and reinsert every record up to the terminator.
pub fn restore_tlb<R: Read>(tlb: &mut Tlb, reader: &mut R) -> bincode::Result<()> {
    tlb.invalidate(0, u64::MAX, crate::tlb::InvalidateScope::Any, None);
    let mut count = 0u64;
    loop {
        match bincode::deserialize_from(&mut *reader)? {
            Record::Entry(record) => {
                tlb.insert(record.into_entry());
                count += 1;
            }
            Record::End => break,
        }
    }
    log::debug!("restore_tlb[{:?}]: {} entries read", tlb.regime(), count);
    Ok(())
}

/// Serialize all three regime TLBs to `writer` as three independent
/// `save_tlb` streams, in HS, VS1, VS2 order.
pub fn save_all<W: Write>(hs: &Tlb, vs1: &Tlb, vs2: &Tlb, writer: &mut W) -> bincode::Result<()> {
    save_tlb(hs, writer)?;
    save_tlb(vs1, writer)?;
    save_tlb(vs2, writer)?;
    Ok(())
}

/// Restore all three regime TLBs from `reader`, matching [`save_all`]'s order.
pub fn restore_all<R: Read>(hs: &mut Tlb, vs1: &mut Tlb, vs2: &mut Tlb, reader: &mut R) -> bincode::Result<()> {
    restore_tlb(hs, reader)?;
    restore_tlb(vs1, reader)?;
    restore_tlb(vs2, reader)?;
    Ok(())
}

/// A recoverable I/O failure during save/restore, surfaced separately from
/// the bincode error so callers can distinguish a truncated stream from a
/// disk error without depending on `bincode`'s error internals.
#[derive(Debug)]
pub enum SaveError {
    Io(io::Error),
    Codec(bincode::Error),
}

impl From<io::Error> for SaveError {
    fn from(e: io::Error) -> Self {
        SaveError::Io(e)
    }
}

impl From<bincode::Error> for SaveError {
    fn from(e: bincode::Error) -> Self {
        SaveError::Codec(e)
    }
}

impl std::fmt::Display for SaveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SaveError::Io(e) => write!(f, "TLB save/restore I/O error: {e}"),
            SaveError::Codec(e) => write!(f, "TLB save/restore codec error: {e}"),
        }
    }
}

impl std::error::Error for SaveError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlb::MappedMask;

    fn sample_entry(low: u64) -> TlbEntry {
        let mut e = TlbEntry::new(
            low,
            low + 0xFFF,
            low,
            Regime::Hs,
            PrivMask::RWX,
            true,
            false,
            true,
            false,
            MappedMask::EMPTY,
            false,
            SimAsid::pack(7, 0, 0, false, false, false, false, false, false),
            SimAsidMask(0xFFFF),
        );
        e.mapped.set(crate::csr::Mode::Supervisor);
        e
    }

    #[test]
    fn roundtrip_preserves_entry_fields_and_clears_mapped() {
        let mut tlb = Tlb::new(Regime::Hs);
        tlb.insert(sample_entry(0x1000));
        tlb.insert(sample_entry(0x9000));

        let mut buf = Vec::new();
        save_tlb(&tlb, &mut buf).unwrap();

        let mut restored = Tlb::new(Regime::Hs);
        restore_tlb(&mut restored, &mut buf.as_slice()).unwrap();

        let key = SimAsid::pack(7, 0, 0, false, false, false, false, false, false);
        let found = restored.find(0x1800, key).expect("restored entry should be found");
        assert_eq!(found.low_va, 0x1000);
        assert_eq!(found.pa, 0x1000);
        assert!(found.accessed);
        assert!(!found.dirty);
        assert_eq!(found.mapped, MappedMask::EMPTY, "mapped bitmask must not survive a restore");
    }

    #[test]
    fn restore_clears_preexisting_entries_first() {
        let mut tlb = Tlb::new(Regime::Hs);
        tlb.insert(sample_entry(0x2000));

        let mut empty_stream = Vec::new();
        bincode::serialize_into(&mut empty_stream, &Record::End).unwrap();
        restore_tlb(&mut tlb, &mut empty_stream.as_slice()).unwrap();

        let key = SimAsid::pack(7, 0, 0, false, false, false, false, false, false);
        assert!(tlb.find(0x2800, key).is_none(), "pre-existing entries must be invalidated before restore");
    }

    #[test]
    fn save_all_and_restore_all_roundtrip_three_regimes() {
        let mut hs = Tlb::new(Regime::Hs);
        let mut vs1 = Tlb::new(Regime::Vs1);
        let mut vs2 = Tlb::new(Regime::Vs2);
        hs.insert(sample_entry(0x1000));
        vs1.insert(sample_entry(0x2000));
        vs2.insert(sample_entry(0x3000));

        let mut buf = Vec::new();
        save_all(&hs, &vs1, &vs2, &mut buf).unwrap();

        let mut r_hs = Tlb::new(Regime::Hs);
        let mut r_vs1 = Tlb::new(Regime::Vs1);
        let mut r_vs2 = Tlb::new(Regime::Vs2);
        restore_all(&mut r_hs, &mut r_vs1, &mut r_vs2, &mut buf.as_slice()).unwrap();

        let key = SimAsid::pack(7, 0, 0, false, false, false, false, false, false);
        assert!(r_hs.find(0x1800, key).is_some());
        assert!(r_vs1.find(0x2800, key).is_some());
        assert!(r_vs2.find(0x3800, key).is_some());
    }
}
