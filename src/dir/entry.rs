//! The 32-byte on-disk directory entry record (spec.md §4.7, §GLOSSARY
//! "Directory entry").
//!
//! Generalized from the teacher's `fat/dir.rs::DirEntry` (which used
//! separate `FileName`/`FileExt` newtypes, had an unfinished `into_arr`
//! stubbed with `todo!()`, and carried no date/time decode) into a record
//! that round-trips every DOS-era field and distinguishes LFN slots.

use crate::clock::DateTime;

pub const ENTRY_SIZE: usize = 32;

bitflags::bitflags! {
    /// Attribute byte at offset 11. The all-four-bits-set combination
    /// `{READ_ONLY, HIDDEN, SYSTEM, VOLUME_ID}` marks an LFN fragment
    /// rather than a real file (spec.md §GLOSSARY).
    #[derive(Default)]
    pub struct Attributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN    = 0x02;
        const SYSTEM    = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE   = 0x20;
    }
}

impl Attributes {
    pub const LFN: Attributes = Attributes::from_bits_truncate(0x0F);

    pub fn is_lfn(self) -> bool {
        self == Attributes::LFN
    }
}

/// How a raw 32-byte slot should be interpreted (spec.md §4.7.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Byte 0 is `0x00`: this slot and everything after it in the
    /// directory is unused.
    End,
    /// Byte 0 is `0xE5`: a deleted, reusable slot.
    Deleted,
    /// A live short-name entry or LFN fragment.
    Occupied,
}

pub fn slot_state(raw: &[u8; ENTRY_SIZE]) -> SlotState {
    match raw[0] {
        0x00 => SlotState::End,
        0xE5 => SlotState::Deleted,
        _ => SlotState::Occupied,
    }
}

/// A decoded short-name directory entry (spec.md §GLOSSARY "Directory
/// entry"). LFN fragments are decoded separately (see `lfn.rs`) and never
/// represented by this type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name_raw: [u8; 11],
    pub attrs: Attributes,
    pub creation_time_tenths: u8,
    pub creation_time: u16,
    pub creation_date: u16,
    pub last_access_date: u16,
    pub write_time: u16,
    pub write_date: u16,
    pub first_cluster: u32,
    pub file_size: u32,
}

impl DirEntry {
    pub fn decode(raw: &[u8; ENTRY_SIZE]) -> Self {
        let cluster_hi = u16::from_le_bytes([raw[20], raw[21]]) as u32;
        let cluster_lo = u16::from_le_bytes([raw[26], raw[27]]) as u32;

        Self {
            name_raw: raw[0..11].try_into().unwrap(),
            attrs: Attributes::from_bits_truncate(raw[11]),
            creation_time_tenths: raw[13],
            creation_time: u16::from_le_bytes([raw[14], raw[15]]),
            creation_date: u16::from_le_bytes([raw[16], raw[17]]),
            last_access_date: u16::from_le_bytes([raw[18], raw[19]]),
            write_time: u16::from_le_bytes([raw[22], raw[23]]),
            write_date: u16::from_le_bytes([raw[24], raw[25]]),
            first_cluster: (cluster_hi << 16) | cluster_lo,
            file_size: u32::from_le_bytes([raw[28], raw[29], raw[30], raw[31]]),
        }
    }

    pub fn encode(&self) -> [u8; ENTRY_SIZE] {
        let mut raw = [0u8; ENTRY_SIZE];
        raw[0..11].copy_from_slice(&self.name_raw);
        raw[11] = self.attrs.bits();
        raw[13] = self.creation_time_tenths;
        raw[14..16].copy_from_slice(&self.creation_time.to_le_bytes());
        raw[16..18].copy_from_slice(&self.creation_date.to_le_bytes());
        raw[18..20].copy_from_slice(&self.last_access_date.to_le_bytes());
        raw[20..22].copy_from_slice(&((self.first_cluster >> 16) as u16).to_le_bytes());
        raw[22..24].copy_from_slice(&self.write_time.to_le_bytes());
        raw[24..26].copy_from_slice(&self.write_date.to_le_bytes());
        raw[26..28].copy_from_slice(&(self.first_cluster as u16).to_le_bytes());
        raw[28..32].copy_from_slice(&self.file_size.to_le_bytes());
        raw
    }

    pub fn is_dir(&self) -> bool {
        self.attrs.contains(Attributes::DIRECTORY)
    }

    pub fn is_volume_id(&self) -> bool {
        self.attrs.contains(Attributes::VOLUME_ID)
    }

    pub fn set_write_timestamp(&mut self, dt: DateTime) {
        self.write_date = crate::clock::encode_date(&dt);
        self.write_time = crate::clock::encode_time(&dt);
    }

    pub fn set_creation_timestamp(&mut self, dt: DateTime) {
        self.creation_date = crate::clock::encode_date(&dt);
        self.creation_time = crate::clock::encode_time(&dt);
        self.creation_time_tenths = crate::clock::encode_time_tenth(&dt);
    }

    pub fn new_file(name_raw: [u8; 11], first_cluster: u32, dt: DateTime) -> Self {
        let mut e = Self {
            name_raw,
            attrs: Attributes::ARCHIVE,
            creation_time_tenths: 0,
            creation_time: 0,
            creation_date: 0,
            last_access_date: 0,
            write_time: 0,
            write_date: 0,
            first_cluster,
            file_size: 0,
        };
        e.set_creation_timestamp(dt);
        e.set_write_timestamp(dt);
        e
    }

    pub fn new_dir(name_raw: [u8; 11], first_cluster: u32, dt: DateTime) -> Self {
        let mut e = Self::new_file(name_raw, first_cluster, dt);
        e.attrs = Attributes::DIRECTORY;
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode_decode() {
        let e = DirEntry::new_file(*b"README  TXT", 123, DateTime { year: 2024, month: 6, day: 1, hour: 12, minute: 30, second: 0, ..Default::default() });
        let raw = e.encode();
        let back = DirEntry::decode(&raw);
        assert_eq!(back, e);
    }

    #[test]
    fn slot_state_recognizes_end_and_deleted() {
        let mut raw = [0u8; ENTRY_SIZE];
        assert_eq!(slot_state(&raw), SlotState::End);
        raw[0] = 0xE5;
        assert_eq!(slot_state(&raw), SlotState::Deleted);
        raw[0] = b'R';
        assert_eq!(slot_state(&raw), SlotState::Occupied);
    }

    #[test]
    fn lfn_attribute_combination_is_recognized() {
        assert!(Attributes::LFN.is_lfn());
        assert!(!Attributes::DIRECTORY.is_lfn());
    }
}
