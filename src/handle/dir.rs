//! Directory handle / iteration state (spec.md §3.1 "Directory handle",
//! §4.8 `dir_open`/`dir_read`).

/// One open directory. `first_cluster` is `None` for the fixed FAT12/16 root
/// region (mirrors [`crate::volume::Volume::root_dir_handle`]'s
/// `Option<u32>` convention) and `Some(root_cluster)` for a FAT32 root or
/// any subdirectory.
pub struct DirHandle {
    pub first_cluster: Option<u32>,
    /// Slot index the next `dir_read` resumes from.
    pub read_cursor: u32,
}

impl DirHandle {
    pub fn new(first_cluster: Option<u32>) -> Self {
        Self { first_cluster, read_cursor: 0 }
    }

    pub fn rewind(&mut self) {
        self.read_cursor = 0;
    }
}
