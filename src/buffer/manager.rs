// Buffer pool manager.
//
// Fixed frame budget over the disk space manager, with pin/unpin handles,
// per-frame page LSNs, and LRU eviction. Steal/no-force: dirty pages may be
// written out before commit and are not forced at commit. The write-ahead
// rule is enforced through the `FlushListener` hooks: before a dirty frame
// goes to disk the listener flushes the log through the frame's page LSN,
// and after the write the listener is told the page reached disk.
//
// On-disk page layout: the first 8 bytes hold the page LSN, the remaining
// `EFFECTIVE_PAGE_SIZE` bytes are the caller-visible payload.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::common::{Lsn, PageNum, EFFECTIVE_PAGE_SIZE, PAGE_SIZE};
use crate::error::{DbError, Result};
use crate::storage::disk::DiskSpaceManager;

/// Recovery-side hooks around page I/O.
pub trait FlushListener: Send + Sync {
    /// Called with the frame's page LSN before a dirty page is written out.
    fn page_flush_hook(&self, page_lsn: Lsn) -> Result<()>;

    /// Called once a page's bytes have reached disk.
    fn disk_io_hook(&self, page_num: PageNum) -> Result<()>;
}

/// Buffer pool configuration.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Number of buffer frames.
    pub num_frames: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self { num_frames: 256 }
    }
}

#[derive(Debug)]
struct Frame {
    data: Vec<u8>,
    page_lsn: Lsn,
    dirty: bool,
    pin_count: usize,
}

#[derive(Default)]
struct PoolState {
    frames: HashMap<PageNum, Arc<Mutex<Frame>>>,
    /// Least-recently-used order, least recent first.
    lru: VecDeque<PageNum>,
}

/// Buffer pool with pinning and LRU eviction.
pub struct BufferManager {
    disk: Arc<dyn DiskSpaceManager>,
    config: BufferConfig,
    state: Mutex<PoolState>,
    listener: RwLock<Option<Arc<dyn FlushListener>>>,
}

impl BufferManager {
    pub fn new(disk: Arc<dyn DiskSpaceManager>, config: BufferConfig) -> Arc<Self> {
        Arc::new(Self {
            disk,
            config,
            state: Mutex::new(PoolState::default()),
            listener: RwLock::new(None),
        })
    }

    /// Registers the recovery manager's flush hooks. Must happen before any
    /// dirty page can be evicted.
    pub fn set_listener(&self, listener: Arc<dyn FlushListener>) {
        *self.listener.write() = Some(listener);
    }

    /// Pins `page_num` into a frame and returns a handle; dropping the
    /// handle unpins. Evicts the least recently used unpinned frame when
    /// the pool is full.
    pub fn get_page(&self, page_num: PageNum) -> Result<PageHandle> {
        let mut st = self.state.lock();
        if let Some(frame) = st.frames.get(&page_num).cloned() {
            if let Some(pos) = st.lru.iter().position(|p| *p == page_num) {
                st.lru.remove(pos);
            }
            st.lru.push_back(page_num);
            frame.lock().pin_count += 1;
            return Ok(PageHandle { page_num, frame });
        }

        if st.frames.len() >= self.config.num_frames {
            self.evict_one(&mut st)?;
        }

        let mut buf = vec![0u8; PAGE_SIZE];
        self.disk.read_page(page_num, &mut buf)?;
        let page_lsn = u64::from_le_bytes(buf[..8].try_into().expect("8-byte header"));
        let frame = Arc::new(Mutex::new(Frame {
            data: buf[8..].to_vec(),
            page_lsn,
            dirty: false,
            pin_count: 1,
        }));
        st.frames.insert(page_num, Arc::clone(&frame));
        st.lru.push_back(page_num);
        Ok(PageHandle { page_num, frame })
    }

    /// Writes a dirty page out (hooks included) while keeping it resident.
    pub fn flush_page(&self, page_num: PageNum) -> Result<()> {
        let st = self.state.lock();
        let Some(frame) = st.frames.get(&page_num).cloned() else {
            return Ok(());
        };
        let mut f = frame.lock();
        if f.dirty {
            self.write_out(page_num, &f)?;
            f.dirty = false;
        }
        Ok(())
    }

    /// Flushes every dirty frame. Used at clean shutdown.
    pub fn flush_all(&self) -> Result<()> {
        let pages: Vec<PageNum> = self.state.lock().frames.keys().copied().collect();
        for page in pages {
            self.flush_page(page)?;
        }
        Ok(())
    }

    /// Drops a page's frame without writing it back. Used when the page is
    /// being freed.
    pub fn discard(&self, page_num: PageNum) {
        let mut st = self.state.lock();
        st.frames.remove(&page_num);
        if let Some(pos) = st.lru.iter().position(|p| *p == page_num) {
            st.lru.remove(pos);
        }
    }

    /// True when the page is resident and dirty in memory.
    pub fn is_dirty(&self, page_num: PageNum) -> bool {
        self.state
            .lock()
            .frames
            .get(&page_num)
            .map(|f| f.lock().dirty)
            .unwrap_or(false)
    }

    fn evict_one(&self, st: &mut PoolState) -> Result<()> {
        let pos = st
            .lru
            .iter()
            .position(|page| {
                st.frames
                    .get(page)
                    .map(|f| f.lock().pin_count == 0)
                    .unwrap_or(false)
            })
            .ok_or_else(|| DbError::Buffer("no evictable frames in the pool".to_string()))?;
        let page_num = st.lru.remove(pos).expect("position is in range");
        let frame = st.frames.remove(&page_num).expect("lru entries are resident");
        let f = frame.lock();
        if f.dirty {
            self.write_out(page_num, &f)?;
        }
        trace!(page = page_num, "evicted frame");
        Ok(())
    }

    fn write_out(&self, page_num: PageNum, frame: &Frame) -> Result<()> {
        let listener = self.listener.read().clone();
        if let Some(listener) = &listener {
            listener.page_flush_hook(frame.page_lsn)?;
        }
        let mut buf = vec![0u8; PAGE_SIZE];
        buf[..8].copy_from_slice(&frame.page_lsn.to_le_bytes());
        buf[8..].copy_from_slice(&frame.data);
        self.disk.write_page(page_num, &buf)?;
        if let Some(listener) = &listener {
            listener.disk_io_hook(page_num)?;
        }
        Ok(())
    }
}

/// Pinned page. Dropping the handle unpins the frame.
#[derive(Debug)]
pub struct PageHandle {
    page_num: PageNum,
    frame: Arc<Mutex<Frame>>,
}

impl PageHandle {
    pub fn page_num(&self) -> PageNum {
        self.page_num
    }

    /// Copies `len` bytes starting at `offset` out of the page payload.
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        if offset + len > EFFECTIVE_PAGE_SIZE {
            return Err(DbError::InvalidInput(format!(
                "read of {len} bytes at offset {offset} exceeds the page payload"
            )));
        }
        let f = self.frame.lock();
        Ok(f.data[offset..offset + len].to_vec())
    }

    /// Writes `data` at `offset` and marks the frame dirty.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        if offset + data.len() > EFFECTIVE_PAGE_SIZE {
            return Err(DbError::InvalidInput(format!(
                "write of {} bytes at offset {offset} exceeds the page payload",
                data.len()
            )));
        }
        let mut f = self.frame.lock();
        f.data[offset..offset + data.len()].copy_from_slice(data);
        f.dirty = true;
        Ok(())
    }

    pub fn page_lsn(&self) -> Lsn {
        self.frame.lock().page_lsn
    }

    pub fn set_page_lsn(&self, lsn: Lsn) {
        let mut f = self.frame.lock();
        f.page_lsn = lsn;
        f.dirty = true;
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        let mut f = self.frame.lock();
        f.pin_count = f.pin_count.saturating_sub(1);
    }
}
