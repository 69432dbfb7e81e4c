//! Directory entries & names (C7): search, insertion, and deletion over a
//! directory's slot sequence, plus short/long name codecs.
//!
//! Generalizes the teacher's `fat/dir.rs` (a single-cluster, FAT32-only
//! `DirIter` that panicked via `.unwrap()` on every read and left
//! `add_entry`'s growth path `unimplemented!()`) into the full spec.md
//! §4.7 search/insert/delete trio, decoupled from any particular backing
//! store via the [`DirIo`] trait so it works uniformly over a FAT12/16
//! fixed root region and a FAT32 cluster-chain directory.

pub mod entry;
pub mod sfn;

#[cfg(feature = "long-names")]
pub mod lfn;

use crate::error::{EntryError, FsError};
use entry::{slot_state, DirEntry, SlotState, ENTRY_SIZE};

/// A single 32-byte slot's logical address: an index into the directory's
/// slot sequence (sector-major, slot-minor), not a physical disk address.
/// The caller maps this back to `{sector, offset_in_sector}` (spec.md
/// §GLOSSARY "Directory position") via its own geometry.
pub type SlotIndex = u32;

/// What a directory search/insert/delete operation needs from its backing
/// store. Implemented by the volume layer, which knows whether this
/// directory is a fixed root region or a cluster chain.
pub trait DirIo {
    fn sector_size(&self) -> u16;

    /// Total slots currently allocated to this directory.
    fn slot_capacity(&self) -> u32 {
        (self.sector_size() as u32 / ENTRY_SIZE as u32) * self.allocated_sectors()
    }

    fn allocated_sectors(&self) -> u32;

    fn read_slot(&mut self, index: SlotIndex, out: &mut [u8; ENTRY_SIZE]) -> Result<(), FsError>;
    fn write_slot(&mut self, index: SlotIndex, data: &[u8; ENTRY_SIZE]) -> Result<(), FsError>;

    /// Appends one more cluster to the directory, zero-filled. Returns the
    /// new total slot capacity. Root directories that can't grow (FAT12/16
    /// fixed root region) return `EntryError::RootDir`.
    fn grow(&mut self) -> Result<u32, FsError>;
}

/// The result of a successful search (spec.md §4.7.3): the decoded short
/// entry plus the slot range it and its LFN chain occupy.
#[derive(Debug, Clone)]
pub struct FoundEntry {
    pub entry: DirEntry,
    pub start: SlotIndex,
    pub end: SlotIndex,
    #[cfg(feature = "long-names")]
    pub long_name: Option<heapless::String<255>>,
}

fn names_match_case_insensitive(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.chars().zip(b.chars()).all(|(x, y)| x.to_ascii_uppercase() == y.to_ascii_uppercase())
}

/// Finds `name` in the directory, reconstructing LFN chains to compare
/// long names and falling back to SFN comparison otherwise. Matching is
/// always case-insensitive (spec.md Non-goals: no case-sensitive
/// semantics).
pub fn find(io: &mut dyn DirIo, name: &str) -> Result<Option<FoundEntry>, FsError> {
    let total = io.slot_capacity();
    let mut raw = [0u8; ENTRY_SIZE];

    #[cfg(feature = "long-names")]
    let mut lfn_fragments: heapless::Vec<lfn::LfnFragment, 20> = heapless::Vec::new();
    let mut chain_start: Option<SlotIndex> = None;

    let mut idx = 0;
    while idx < total {
        io.read_slot(idx, &mut raw)?;
        match slot_state(&raw) {
            SlotState::End => return Ok(None),
            SlotState::Deleted => {
                #[cfg(feature = "long-names")]
                lfn_fragments.clear();
                chain_start = None;
            }
            SlotState::Occupied => {
                let attrs_byte = raw[11];
                #[cfg(feature = "long-names")]
                if attrs_byte == entry::Attributes::LFN.bits() {
                    if chain_start.is_none() {
                        chain_start = Some(idx);
                    }
                    let _ = lfn_fragments.push(lfn::decode_fragment(&raw));
                    idx += 1;
                    continue;
                }

                let decoded = DirEntry::decode(&raw);
                if decoded.is_volume_id() {
                    #[cfg(feature = "long-names")]
                    lfn_fragments.clear();
                    chain_start = None;
                    idx += 1;
                    continue;
                }

                let start = chain_start.unwrap_or(idx);

                #[cfg(feature = "long-names")]
                {
                    if !lfn_fragments.is_empty() {
                        let mut long_name = heapless::String::new();
                        lfn::reassemble(&lfn_fragments, &mut long_name);
                        if names_match_case_insensitive(&long_name, name) {
                            return Ok(Some(FoundEntry { entry: decoded, start, end: idx, long_name: Some(long_name) }));
                        }
                        lfn_fragments.clear();
                        chain_start = None;
                        let short = sfn::decode(&decoded.name_raw);
                        if names_match_case_insensitive(short.as_str(), name) {
                            return Ok(Some(FoundEntry { entry: decoded, start, end: idx, long_name: None }));
                        }
                        idx += 1;
                        continue;
                    }
                }

                let short = sfn::decode(&decoded.name_raw);
                if names_match_case_insensitive(short.as_str(), name) {
                    #[cfg(feature = "long-names")]
                    return Ok(Some(FoundEntry { entry: decoded, start, end: idx, long_name: None }));
                    #[cfg(not(feature = "long-names"))]
                    return Ok(Some(FoundEntry { entry: decoded, start, end: idx }));
                }

                chain_start = None;
            }
        }
        idx += 1;
    }

    Ok(None)
}

fn free_run_before_entry(io: &mut dyn DirIo, needed: u32) -> Result<Option<SlotIndex>, FsError> {
    let total = io.slot_capacity();
    let mut raw = [0u8; ENTRY_SIZE];

    let mut run_start: Option<SlotIndex> = None;
    let mut run_len: u32 = 0;

    let mut idx = 0;
    while idx < total {
        io.read_slot(idx, &mut raw)?;
        match slot_state(&raw) {
            SlotState::Occupied => {
                run_start = None;
                run_len = 0;
            }
            SlotState::Deleted => {
                if run_start.is_none() {
                    run_start = Some(idx);
                }
                run_len += 1;
                if run_len >= needed {
                    return Ok(run_start);
                }
            }
            SlotState::End => {
                let start = run_start.unwrap_or(idx);
                let available = total - start;
                return Ok(if available >= needed { Some(start) } else { None });
            }
        }
        idx += 1;
    }

    Ok(None)
}

/// Allocates room for `needed` contiguous slots, growing the directory by
/// whole clusters until there's enough space (spec.md §4.7.4).
fn reserve_slots(io: &mut dyn DirIo, needed: u32) -> Result<SlotIndex, FsError> {
    loop {
        if let Some(start) = free_run_before_entry(io, needed)? {
            return Ok(start);
        }
        io.grow()?;
    }
}

/// Writes a short entry (and, with `long-names`, its LFN chain) for `name`
/// at a newly reserved slot range, and re-terminates the directory.
/// Returns the slot range occupied.
#[cfg(feature = "long-names")]
pub fn insert(io: &mut dyn DirIo, name: &str, mut make_entry: impl FnMut([u8; 11]) -> DirEntry, existing_names: impl Fn(&str) -> bool) -> Result<(SlotIndex, SlotIndex), FsError> {
    let sfn_raw = synthesize_unique_sfn(name, existing_names)?;
    let checksum = lfn::sfn_checksum(&sfn_raw);

    let mut frag_storage = [lfn::LfnFragment { ordinal: 0, is_last: false, checksum: 0, chars: [0; lfn::CHARS_PER_FRAGMENT] }; 20];
    let needs_lfn = !names_match_case_insensitive(sfn::decode(&sfn_raw).as_str(), name);

    let fragment_count = if needs_lfn {
        lfn::split_into_fragments(name, checksum, &mut frag_storage).ok_or(EntryError::NameTooLong)?
    } else {
        0
    };

    let needed = fragment_count as u32 + 1;
    let start = reserve_slots(io, needed)?;

    for (i, frag) in frag_storage[..fragment_count].iter().enumerate() {
        let raw = lfn::encode_fragment(frag.ordinal, frag.is_last, frag.checksum, &frag.chars);
        io.write_slot(start + i as u32, &raw)?;
    }

    let entry_slot = start + fragment_count as u32;
    let entry = make_entry(sfn_raw);
    io.write_slot(entry_slot, &entry.encode())?;

    terminate_if_needed(io, entry_slot + 1)?;
    Ok((start, entry_slot))
}

#[cfg(not(feature = "long-names"))]
pub fn insert(io: &mut dyn DirIo, name: &str, mut make_entry: impl FnMut([u8; 11]) -> DirEntry) -> Result<(SlotIndex, SlotIndex), FsError> {
    let sfn_raw = sfn::encode_strict(name)?;
    let start = reserve_slots(io, 1)?;
    let entry = make_entry(sfn_raw);
    io.write_slot(start, &entry.encode())?;
    terminate_if_needed(io, start + 1)?;
    Ok((start, start))
}

/// If `next` is not itself already `End`, and we just consumed what used
/// to be the frontier, writes a fresh `End` marker there so the directory
/// stays correctly terminated. Harmless (idempotent) if `next` already is
/// the existing frontier.
fn terminate_if_needed(io: &mut dyn DirIo, next: SlotIndex) -> Result<(), FsError> {
    if next >= io.slot_capacity() {
        return Ok(());
    }
    let mut raw = [0u8; ENTRY_SIZE];
    io.read_slot(next, &mut raw)?;
    if slot_state(&raw) == SlotState::Occupied {
        return Ok(());
    }
    io.write_slot(next, &[0u8; ENTRY_SIZE])
}

#[cfg(feature = "long-names")]
fn synthesize_unique_sfn(name: &str, exists: impl Fn(&str) -> bool) -> Result<[u8; 11], FsError> {
    if let Ok(raw) = sfn::encode_strict(name) {
        if !exists(sfn::decode(&raw).as_str()) {
            return Ok(raw);
        }
    }

    for n in 1..=9999u32 {
        let candidate = sfn::numeric_tail_candidate(name, n);
        if !exists(candidate.as_str()) {
            return sfn::encode_strict(candidate.as_str());
        }
    }

    Err(EntryError::Exists.into())
}

/// Marks every slot in `start..=end` deleted (spec.md §4.7.5).
pub fn delete(io: &mut dyn DirIo, start: SlotIndex, end: SlotIndex) -> Result<(), FsError> {
    for idx in start..=end {
        let mut raw = [0u8; ENTRY_SIZE];
        io.read_slot(idx, &mut raw)?;
        raw[0] = 0xE5;
        io.write_slot(idx, &raw)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::DateTime;

    struct MemDir {
        sector_size: u16,
        sectors: std::vec::Vec<u8>,
        growable: bool,
    }

    impl MemDir {
        fn new(sector_size: u16, sectors: u32, growable: bool) -> Self {
            Self { sector_size, sectors: std::vec![0u8; sector_size as usize * sectors as usize], growable }
        }
    }

    impl DirIo for MemDir {
        fn sector_size(&self) -> u16 {
            self.sector_size
        }

        fn allocated_sectors(&self) -> u32 {
            self.sectors.len() as u32 / self.sector_size as u32
        }

        fn read_slot(&mut self, index: SlotIndex, out: &mut [u8; ENTRY_SIZE]) -> Result<(), FsError> {
            let off = index as usize * ENTRY_SIZE;
            out.copy_from_slice(&self.sectors[off..off + ENTRY_SIZE]);
            Ok(())
        }

        fn write_slot(&mut self, index: SlotIndex, data: &[u8; ENTRY_SIZE]) -> Result<(), FsError> {
            let off = index as usize * ENTRY_SIZE;
            self.sectors[off..off + ENTRY_SIZE].copy_from_slice(data);
            Ok(())
        }

        fn grow(&mut self) -> Result<u32, FsError> {
            if !self.growable {
                return Err(EntryError::RootDir.into());
            }
            self.sectors.extend(std::vec![0u8; self.sector_size as usize]);
            Ok(self.slot_capacity())
        }
    }

    fn dt() -> DateTime {
        DateTime { year: 2024, month: 1, day: 1, hour: 0, minute: 0, second: 0, ..Default::default() }
    }

    #[test]
    fn insert_then_find_short_name() {
        let mut dir = MemDir::new(512, 1, false);
        insert(&mut dir, "FOO.TXT", |raw| DirEntry::new_file(raw, 5, dt()), |_| false).unwrap();

        let found = find(&mut dir, "foo.txt").unwrap().unwrap();
        assert_eq!(found.entry.first_cluster, 5);
    }

    #[test]
    fn delete_marks_slots_and_find_stops_matching() {
        let mut dir = MemDir::new(512, 1, false);
        let (start, end) = insert(&mut dir, "FOO.TXT", |raw| DirEntry::new_file(raw, 5, dt()), |_| false).unwrap();
        delete(&mut dir, start, end).unwrap();
        assert!(find(&mut dir, "FOO.TXT").unwrap().is_none());
    }

    #[test]
    fn grows_directory_when_full() {
        let mut dir = MemDir::new(512, 1, true);
        let slots_per_sector = 512 / ENTRY_SIZE;
        for i in 0..slots_per_sector {
            let name = sfn::numeric_tail_candidate("F", i as u32 + 1);
            insert(&mut dir, name.as_str(), |raw| DirEntry::new_file(raw, 2, dt()), |_| false).unwrap();
        }
        assert_eq!(dir.allocated_sectors(), 2);
    }
}
