//! Memory controller: owns the universe of physical pages and their
//! free/used lists, and performs the per-tick read/write accounting.
//! Spec.md §4.3, grounded in
//! `original_source/src/include/MemoryController.hpp`/`.cpp`. The teacher's
//! `memory.rs` (`HBM`) donates the sparse-store struct shape, repointed
//! from byte-addressed storage to page-addressed storage.

use std::collections::{HashMap, VecDeque};

use log::warn;

use crate::page::{Page, PageId, PageLocation};
use crate::request::{AccessKind, MemoryAccess};

/// Owns the physical page table plus free/used bookkeeping (component A,
/// "Page Store + Free List").
pub struct MemoryController {
    page_size: u64,
    storage_limit: u64,
    compulsory_miss: bool,

    pages: HashMap<PageId, Page>,
    free_list: VecDeque<PageId>,
    used_list: Vec<PageId>,
    next_page_id: PageId,

    /// Accesses GMMU has classified as VRAM-resident hits, awaiting this
    /// tick's read/write accounting.
    pub gmmu_to_mc_queue: VecDeque<MemoryAccess>,
    /// Accounted accesses, returned to GMMU next tick.
    pub mc_to_gmmu_queue: VecDeque<MemoryAccess>,
}

impl MemoryController {
    pub fn new(storage_limit: u64, page_size: u64, compulsory_miss: bool) -> Self {
        MemoryController {
            page_size,
            storage_limit,
            compulsory_miss,
            pages: HashMap::new(),
            free_list: VecDeque::new(),
            used_list: Vec::new(),
            next_page_id: 0,
            gmmu_to_mc_queue: VecDeque::new(),
            mc_to_gmmu_queue: VecDeque::new(),
        }
    }

    fn create_page(&mut self) -> PageId {
        let id = self.next_page_id;
        self.next_page_id += 1;
        if id.saturating_mul(self.page_size) > self.storage_limit {
            warn!(
                "memory_allocate: page {} exceeds soft storage limit {} bytes, extending anyway",
                id, self.storage_limit
            );
        }
        self.pages.insert(id, Page::new(id, self.compulsory_miss));
        self.free_list.push_back(id);
        id
    }

    /// Allocates `⌈bytes / page_size⌉` pages, links them via `next`, and
    /// returns the head page id. Lazily creates pages when the free list is
    /// empty; the storage limit is a soft cap, per spec.md §4.3.
    pub fn allocate(&mut self, bytes: u64) -> PageId {
        assert!(bytes > 0, "allocate: cannot allocate memory to empty data");
        let count = bytes.div_ceil(self.page_size);

        let mut head: Option<PageId> = None;
        let mut prev: Option<PageId> = None;
        for _ in 0..count {
            if self.free_list.is_empty() {
                self.create_page();
            }
            let id = self.free_list.pop_front().expect("just ensured non-empty");
            self.used_list.push(id);

            if head.is_none() {
                head = Some(id);
            }
            if let Some(p) = prev {
                self.pages.get_mut(&p).unwrap().next = Some(id);
            }
            prev = Some(id);
        }
        head.expect("count >= 1 guarantees at least one page allocated")
    }

    /// Walks the `next` chain from `head`, returning every page to the
    /// free list with its location reset to DRAM.
    pub fn release(&mut self, head: Option<PageId>) {
        let mut cursor = head;
        while let Some(id) = cursor {
            let next = self.pages.get(&id).and_then(|p| p.next);
            {
                let page = self.pages.get_mut(&id).expect("release: unknown page id");
                page.location = PageLocation::Dram;
                page.next = None;
            }
            self.used_list.retain(|&p| p != id);
            self.free_list.push_back(id);
            cursor = next;
        }
    }

    pub fn refer(&self, page_id: PageId) -> Option<&Page> {
        self.pages.get(&page_id)
    }

    pub fn refer_mut(&mut self, page_id: PageId) -> Option<&mut Page> {
        self.pages.get_mut(&page_id)
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn used_page_count(&self) -> usize {
        self.used_list.len()
    }

    pub fn free_page_count(&self) -> usize {
        self.free_list.len()
    }

    /// Per-tick: drains `gmmu_to_mc_queue`, asserting every page is
    /// VRAM-resident (fatal otherwise), bumps its read/write counter, and
    /// forwards the access onward.
    pub fn cycle(&mut self) {
        while let Some(access) = self.gmmu_to_mc_queue.pop_front() {
            for &page_id in &access.page_ids {
                let page = self
                    .pages
                    .get_mut(&page_id)
                    .unwrap_or_else(|| panic!("MC cycle: unknown page {}", page_id));
                assert_eq!(
                    page.location,
                    PageLocation::Vram,
                    "MC invariant violation: page {} accessed while not VRAM-resident",
                    page_id
                );
                match access.kind {
                    AccessKind::Read => page.touch_read(),
                    AccessKind::Write => page.touch_write(),
                }
            }
            self.mc_to_gmmu_queue.push_back(access);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{AppId, BlockId, ModelId, SmId, WarpId};

    fn access(kind: AccessKind, page_ids: Vec<PageId>) -> MemoryAccess {
        MemoryAccess {
            model_id: 0 as ModelId,
            app_id: 0 as AppId,
            sm_id: 0 as SmId,
            block_id: 0,
            warp_id: 0 as WarpId,
            request_id: 0,
            kind,
            page_ids,
        }
    }

    #[test]
    fn allocate_links_pages_via_next() {
        let mut mc = MemoryController::new(1 << 30, 4096, false);
        let head = mc.allocate(4096 * 3);
        let p0 = mc.refer(head).unwrap().clone();
        let p1 = mc.refer(p0.next.unwrap()).unwrap().clone();
        assert!(p1.next.is_some());
        assert!(mc.refer(p1.next.unwrap()).unwrap().next.is_none());
    }

    #[test]
    fn release_returns_pages_to_free_list_as_dram() {
        let mut mc = MemoryController::new(1 << 30, 4096, false);
        let head = mc.allocate(4096 * 2);
        assert_eq!(mc.used_page_count(), 2);
        mc.release(Some(head));
        assert_eq!(mc.used_page_count(), 0);
        assert_eq!(mc.refer(head).unwrap().location, PageLocation::Dram);
    }

    #[test]
    #[should_panic(expected = "invariant violation")]
    fn cycle_panics_on_non_vram_access() {
        let mut mc = MemoryController::new(1 << 30, 4096, true); // compulsory miss -> starts DRAM
        let head = mc.allocate(4096);
        mc.gmmu_to_mc_queue.push_back(access(AccessKind::Read, vec![head]));
        mc.cycle();
    }

    #[test]
    fn cycle_bumps_counters_and_forwards_access() {
        let mut mc = MemoryController::new(1 << 30, 4096, false);
        let head = mc.allocate(4096);
        mc.gmmu_to_mc_queue.push_back(access(AccessKind::Write, vec![head]));
        mc.cycle();
        assert_eq!(mc.refer(head).unwrap().counters.write, 1);
        assert_eq!(mc.mc_to_gmmu_queue.len(), 1);
    }
}
