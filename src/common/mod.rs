// # Common Types and Identifiers
//
// Shared type aliases and constants used across the storage, buffer, and
// transaction modules. Identifiers live here so that the subsystems can
// reference each other's resources without depending on each other.

// ============================================================================
// Type Aliases - Shared Identifiers
// ============================================================================

/// Unique identifier for transactions
pub type TransactionId = u64;

/// Log Sequence Number: the byte offset of a record in the write-ahead log
pub type Lsn = u64;

/// Virtual page number: the high 32 bits hold the partition number, the low
/// 32 bits the page index within that partition
pub type PageNum = u64;

/// Partition number
pub type PartNum = u32;

// ============================================================================
// Page Geometry
// ============================================================================

/// Size of an on-disk page in bytes, including the page LSN header
pub const PAGE_SIZE: usize = 4096;

/// Bytes of a page available to callers; the first 8 bytes of the on-disk
/// page persist the page LSN
pub const EFFECTIVE_PAGE_SIZE: usize = PAGE_SIZE - 8;

/// Partition reserved for the write-ahead log. Never handed out by the disk
/// space manager and never tracked in the dirty page table.
pub const LOG_PARTITION: PartNum = 0;

/// Builds a virtual page number from a partition and a page index.
#[inline]
pub fn page_num(part: PartNum, index: u32) -> PageNum {
    ((part as u64) << 32) | index as u64
}

/// Extracts the partition from a virtual page number.
#[inline]
pub fn partition(page: PageNum) -> PartNum {
    (page >> 32) as PartNum
}

/// Extracts the page index within its partition.
#[inline]
pub fn page_index(page: PageNum) -> u32 {
    (page & 0xFFFF_FFFF) as u32
}
