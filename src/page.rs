//! Physical page bookkeeping. Spec.md §3 "Page", grounded in
//! `original_source/src/include/MemoryController.hpp`'s `Page`/`PageInfo`.

pub type PageId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageLocation {
    Vram,
    Dram,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PageCounters {
    pub read: u64,
    pub write: u64,
    pub access: u64,
    pub swap: u64,
}

#[derive(Debug, Clone)]
pub struct Page {
    pub page_id: PageId,
    pub location: PageLocation,
    pub next: Option<PageId>,
    pub counters: PageCounters,
}

impl Page {
    pub fn new(page_id: PageId, compulsory_miss: bool) -> Self {
        Page {
            page_id,
            location: if compulsory_miss {
                PageLocation::Dram
            } else {
                PageLocation::Vram
            },
            next: None,
            counters: PageCounters::default(),
        }
    }

    pub fn touch_read(&mut self) {
        self.counters.read += 1;
        self.counters.access += 1;
    }

    pub fn touch_write(&mut self) {
        self.counters.write += 1;
        self.counters.access += 1;
    }

    pub fn swap(&mut self, to: PageLocation) {
        self.location = to;
        self.counters.swap += 1;
    }
}
