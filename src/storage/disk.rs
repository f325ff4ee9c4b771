// Disk space manager.
//
// Partitions and pages are identified by 64-bit virtual page numbers whose
// high 32 bits encode the partition. The trait is the seam the buffer
// manager and recovery code talk through; `MemDiskManager` is the in-memory
// implementation used by tests, which survives simulated crashes as long as
// the caller keeps it alive.
//
// The `*_at` variants allocate a specific partition or page and exist for
// restart redo, which must recreate exactly the pages the log names.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::common::{page_index, page_num, partition, PageNum, PartNum, LOG_PARTITION, PAGE_SIZE};
use crate::error::{DbError, Result};

/// Partition and page allocation plus whole-page I/O.
pub trait DiskSpaceManager: Send + Sync {
    /// Allocates a fresh partition and returns its number.
    fn alloc_part(&self) -> Result<PartNum>;

    /// Allocates the specific partition `part`.
    fn alloc_part_at(&self, part: PartNum) -> Result<()>;

    /// Frees a partition and every page in it.
    fn free_part(&self, part: PartNum) -> Result<()>;

    /// Allocates a fresh page in `part` and returns its virtual page number.
    fn alloc_page(&self, part: PartNum) -> Result<PageNum>;

    /// Allocates the specific page `page`.
    fn alloc_page_at(&self, page: PageNum) -> Result<()>;

    /// Frees a page.
    fn free_page(&self, page: PageNum) -> Result<()>;

    /// Reads a whole page (`PAGE_SIZE` bytes) into `buf`.
    fn read_page(&self, page: PageNum, buf: &mut [u8]) -> Result<()>;

    /// Writes a whole page (`PAGE_SIZE` bytes).
    fn write_page(&self, page: PageNum, data: &[u8]) -> Result<()>;

    fn is_part_allocated(&self, part: PartNum) -> bool;

    fn is_page_allocated(&self, page: PageNum) -> bool;
}

#[derive(Default)]
struct Partition {
    next_index: u32,
    pages: HashSet<u32>,
}

struct DiskState {
    next_part: PartNum,
    partitions: HashMap<PartNum, Partition>,
    pages: HashMap<PageNum, Vec<u8>>,
}

/// In-memory disk space manager.
pub struct MemDiskManager {
    state: RwLock<DiskState>,
}

impl MemDiskManager {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(DiskState {
                // Partition 0 is the write-ahead log's and is never handed out.
                next_part: LOG_PARTITION + 1,
                partitions: HashMap::new(),
                pages: HashMap::new(),
            }),
        }
    }
}

impl Default for MemDiskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskSpaceManager for MemDiskManager {
    fn alloc_part(&self) -> Result<PartNum> {
        let mut st = self.state.write();
        let mut part = st.next_part;
        while st.partitions.contains_key(&part) {
            part += 1;
        }
        st.partitions.insert(part, Partition::default());
        st.next_part = part + 1;
        Ok(part)
    }

    fn alloc_part_at(&self, part: PartNum) -> Result<()> {
        if part == LOG_PARTITION {
            return Err(DbError::InvalidInput(
                "partition 0 is reserved for the log".to_string(),
            ));
        }
        let mut st = self.state.write();
        if st.partitions.contains_key(&part) {
            return Err(DbError::AlreadyExists(format!("partition {part}")));
        }
        st.partitions.insert(part, Partition::default());
        if st.next_part <= part {
            st.next_part = part + 1;
        }
        Ok(())
    }

    fn free_part(&self, part: PartNum) -> Result<()> {
        let mut st = self.state.write();
        let removed = st
            .partitions
            .remove(&part)
            .ok_or_else(|| DbError::NotFound(format!("partition {part}")))?;
        for index in removed.pages {
            st.pages.remove(&page_num(part, index));
        }
        Ok(())
    }

    fn alloc_page(&self, part: PartNum) -> Result<PageNum> {
        if part == LOG_PARTITION {
            return Err(DbError::InvalidInput(
                "partition 0 is reserved for the log".to_string(),
            ));
        }
        let mut st = self.state.write();
        let partition = st
            .partitions
            .get_mut(&part)
            .ok_or_else(|| DbError::NotFound(format!("partition {part}")))?;
        let mut index = partition.next_index;
        while partition.pages.contains(&index) {
            index += 1;
        }
        partition.pages.insert(index);
        partition.next_index = index + 1;
        let page = page_num(part, index);
        st.pages.insert(page, vec![0; PAGE_SIZE]);
        Ok(page)
    }

    fn alloc_page_at(&self, page: PageNum) -> Result<()> {
        let part = partition(page);
        if part == LOG_PARTITION {
            return Err(DbError::InvalidInput(
                "partition 0 is reserved for the log".to_string(),
            ));
        }
        let mut st = self.state.write();
        let part_state = st
            .partitions
            .get_mut(&part)
            .ok_or_else(|| DbError::NotFound(format!("partition {part}")))?;
        let index = page_index(page);
        if !part_state.pages.insert(index) {
            return Err(DbError::AlreadyExists(format!("page {page}")));
        }
        if part_state.next_index <= index {
            part_state.next_index = index + 1;
        }
        st.pages.insert(page, vec![0; PAGE_SIZE]);
        Ok(())
    }

    fn free_page(&self, page: PageNum) -> Result<()> {
        let mut st = self.state.write();
        let part_state = st
            .partitions
            .get_mut(&partition(page))
            .ok_or_else(|| DbError::NotFound(format!("page {page}")))?;
        if !part_state.pages.remove(&page_index(page)) {
            return Err(DbError::NotFound(format!("page {page}")));
        }
        st.pages.remove(&page);
        Ok(())
    }

    fn read_page(&self, page: PageNum, buf: &mut [u8]) -> Result<()> {
        if buf.len() != PAGE_SIZE {
            return Err(DbError::InvalidInput(format!(
                "page reads take {PAGE_SIZE}-byte buffers, got {}",
                buf.len()
            )));
        }
        let st = self.state.read();
        let data = st
            .pages
            .get(&page)
            .ok_or_else(|| DbError::NotFound(format!("page {page}")))?;
        buf.copy_from_slice(data);
        Ok(())
    }

    fn write_page(&self, page: PageNum, data: &[u8]) -> Result<()> {
        if data.len() != PAGE_SIZE {
            return Err(DbError::InvalidInput(format!(
                "page writes take {PAGE_SIZE}-byte buffers, got {}",
                data.len()
            )));
        }
        let mut st = self.state.write();
        let slot = st
            .pages
            .get_mut(&page)
            .ok_or_else(|| DbError::NotFound(format!("page {page}")))?;
        slot.copy_from_slice(data);
        Ok(())
    }

    fn is_part_allocated(&self, part: PartNum) -> bool {
        self.state.read().partitions.contains_key(&part)
    }

    fn is_page_allocated(&self, page: PageNum) -> bool {
        self.state.read().pages.contains_key(&page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_io_round_trip() {
        let disk = MemDiskManager::new();
        let part = disk.alloc_part().unwrap();
        assert_ne!(part, LOG_PARTITION);

        let page = disk.alloc_page(part).unwrap();
        assert_eq!(partition(page), part);
        assert!(disk.is_page_allocated(page));

        let mut data = vec![0u8; PAGE_SIZE];
        data[100] = 0xAB;
        disk.write_page(page, &data).unwrap();

        let mut buf = vec![0u8; PAGE_SIZE];
        disk.read_page(page, &mut buf).unwrap();
        assert_eq!(buf[100], 0xAB);
    }

    #[test]
    fn test_alloc_at_specific_page() {
        let disk = MemDiskManager::new();
        disk.alloc_part_at(4).unwrap();
        let page = page_num(4, 9);
        disk.alloc_page_at(page).unwrap();
        assert!(disk.is_page_allocated(page));
        assert!(disk.alloc_page_at(page).is_err());

        // Fresh allocations skip explicitly-created pages.
        let next = disk.alloc_page(4).unwrap();
        assert_ne!(next, page);
    }

    #[test]
    fn test_free_part_drops_pages() {
        let disk = MemDiskManager::new();
        let part = disk.alloc_part().unwrap();
        let page = disk.alloc_page(part).unwrap();
        disk.free_part(part).unwrap();
        assert!(!disk.is_part_allocated(part));
        assert!(!disk.is_page_allocated(page));
    }

    #[test]
    fn test_log_partition_is_reserved() {
        let disk = MemDiskManager::new();
        assert!(disk.alloc_part_at(LOG_PARTITION).is_err());
        assert!(disk.alloc_page(LOG_PARTITION).is_err());
    }

    #[test]
    fn test_free_unallocated_page_fails() {
        let disk = MemDiskManager::new();
        let part = disk.alloc_part().unwrap();
        assert!(disk.free_page(page_num(part, 3)).is_err());
    }
}
