//! GMMU: per-application VRAM page groups with LRU eviction, fault
//! coalescing, optional sequential prefetch, and a migration-penalty state
//! machine. Spec.md §4.4. Grounded in `original_source/src/GMMU.cpp`
//! almost line-for-line in control flow (not text).

use std::collections::{HashMap, HashSet, VecDeque};

use log::debug;

use crate::ids::{AppId, ModelId, SHARED_CGROUP_ID};
use crate::lru::Lru;
use crate::memory::MemoryController;
use crate::page::{PageId, PageLocation};
use crate::request::MemoryAccess;

/// Whether cgroups are keyed per-application or collapsed under the shared
/// wildcard id (`MEM_ALLOCATION::None`). Toggled by the active memory
/// allocator (`setCGroupType` in the original).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CGroupMode {
    Shared,
    PerApp,
}

/// A cgroup maps resident page ids to themselves — the value is redundant
/// with the key, but carrying it lets `Lru::insert`'s evicted return tell
/// us *which* page left without a separate reverse index.
type CGroup = Lru<PageId, PageId>;

pub struct Gmmu {
    cgroup_mode: CGroupMode,
    cgroups: HashMap<AppId, CGroup>,

    mshrs: VecDeque<MemoryAccess>,
    warps_to_gmmu_queue: VecDeque<MemoryAccess>,
    gmmu_to_warps_queue: VecDeque<MemoryAccess>,
    page_fault_finish_queue: VecDeque<MemoryAccess>,
    page_fault_process_queue: HashMap<AppId, HashSet<PageId>>,

    wait_cycle: u64,

    pcie_access_bound: u64,
    page_fault_communication_cycle: u64,
    page_fault_migration_unit_cycle: u64,
    page_prefetch: bool,
    penalty_enabled: bool,
}

impl Gmmu {
    pub fn new(
        pcie_access_bound: u64,
        page_fault_communication_cycle: u64,
        page_fault_migration_unit_cycle: u64,
        page_prefetch: bool,
        penalty_enabled: bool,
    ) -> Self {
        Gmmu {
            cgroup_mode: CGroupMode::Shared,
            cgroups: HashMap::new(),
            mshrs: VecDeque::new(),
            warps_to_gmmu_queue: VecDeque::new(),
            gmmu_to_warps_queue: VecDeque::new(),
            page_fault_finish_queue: VecDeque::new(),
            page_fault_process_queue: HashMap::new(),
            wait_cycle: 0,
            pcie_access_bound,
            page_fault_communication_cycle,
            page_fault_migration_unit_cycle,
            page_prefetch,
            penalty_enabled,
        }
    }

    fn cgroup_key(&self, app_id: AppId) -> AppId {
        match self.cgroup_mode {
            CGroupMode::Shared => SHARED_CGROUP_ID,
            CGroupMode::PerApp => app_id,
        }
    }

    pub fn set_cgroup_type(&mut self, per_app: bool) {
        self.cgroup_mode = if per_app { CGroupMode::PerApp } else { CGroupMode::Shared };
    }

    pub fn cgroup_usage(&self, app_id: AppId) -> usize {
        self.cgroups.get(&self.cgroup_key(app_id)).map(|c| c.usage()).unwrap_or(0)
    }

    pub fn cgroup_capacity(&self, app_id: AppId) -> usize {
        self.cgroups.get(&self.cgroup_key(app_id)).map(|c| c.capacity()).unwrap_or(0)
    }

    /// Sum of `usage()` across distinct cgroups — in `Shared` mode this is a
    /// single cgroup's usage, not one term per application. Spec.md §8
    /// invariant 2 ("Σ cgroup.usage() ≤ VRAM_SPACE / PAGE_SIZE") is stated
    /// over distinct cgroups, so callers checking that invariant should use
    /// this rather than summing `cgroup_usage(app_id)` per app.
    pub fn total_cgroup_usage(&self) -> usize {
        self.cgroups.values().map(|c| c.usage()).sum()
    }

    pub fn set_cgroup_size(&mut self, app_id: AppId, capacity: u64) {
        let key = self.cgroup_key(app_id);
        let cgroup = self.cgroups.entry(key).or_insert_with(|| Lru::new(0));
        cgroup.resize(capacity as usize);
        debug!("set_cgroup_size: [{}, {}]", key, cgroup.capacity());
    }

    /// Per-tick entry point: fault handling, then access classification.
    pub fn cycle(&mut self, mc: &mut MemoryController) {
        self.page_fault_handler(mc);
        self.access_processing(mc);
    }

    /// §4.4 step-by-step fault handler.
    fn page_fault_handler(&mut self, mc: &mut MemoryController) {
        if self.wait_cycle > 0 {
            self.wait_cycle -= 1;
            return;
        }

        // Commit pending migration.
        if !self.page_fault_process_queue.is_empty() {
            for (app_id, pages) in self.page_fault_process_queue.drain() {
                let key = self.cgroup_key(app_id);
                let cap = self.cgroups.entry(key).or_insert_with(|| Lru::new(0)).capacity();
                assert!(
                    pages.len() <= cap,
                    "GMMU invariant violation: app {} cgroup capacity {} smaller than its demand {}",
                    app_id,
                    cap,
                    pages.len()
                );
                for page_id in pages {
                    {
                        let page = mc.refer_mut(page_id).expect("migrate: unknown page");
                        page.swap(PageLocation::Vram);
                    }
                    let evicted = self.cgroups.entry(key).or_insert_with(|| Lru::new(0)).insert(page_id, page_id);
                    if let Some(evicted_page) = evicted {
                        let page = mc.refer_mut(evicted_page).expect("evict: unknown page");
                        page.swap(PageLocation::Dram);
                    }
                }
            }
            self.warps_to_gmmu_queue.extend(self.page_fault_finish_queue.drain(..));
        }

        // Schedule new migration.
        if !self.mshrs.is_empty() {
            self.page_fault_process_queue.clear();
            let mut page_count: u64 = 0;
            let mut accepted: HashSet<usize> = HashSet::new();

            for (idx, access) in self.mshrs.iter().enumerate() {
                let key = self.cgroup_key(access.app_id);
                let cgroup_cap = self.cgroups.entry(key).or_insert_with(|| Lru::new(0)).capacity() as u64;

                let missing: HashSet<PageId> = access
                    .page_ids
                    .iter()
                    .copied()
                    .filter(|pid| !self.cgroups.get(&key).map(|c| c.contains(pid)).unwrap_or(false))
                    .collect();

                if page_count + missing.len() as u64 > self.pcie_access_bound {
                    break;
                }

                let pending = self.page_fault_process_queue.entry(access.app_id).or_default();
                if (pending.len() + missing.len()) as u64 > cgroup_cap {
                    continue; // would self-thrash this app's cgroup
                }

                page_count -= pending.len() as u64;
                pending.extend(missing);
                page_count += pending.len() as u64;
                accepted.insert(idx);
            }

            let mut remaining = VecDeque::new();
            for (idx, access) in self.mshrs.drain(..).enumerate() {
                if accepted.contains(&idx) {
                    self.page_fault_finish_queue.push_back(access);
                } else {
                    remaining.push_back(access);
                }
            }
            self.mshrs = remaining;

            // Prefetch: sort cgroups by descending fill gap, walk `next` chains.
            if self.page_prefetch && page_count < self.pcie_access_bound {
                let mut gap_order: Vec<(AppId, u64)> = self
                    .cgroups
                    .iter()
                    .map(|(&k, c)| (k, c.capacity() as u64 - c.usage() as u64))
                    .collect();
                gap_order.sort_by(|a, b| b.1.cmp(&a.1));

                for (key, fill_gap) in gap_order {
                    if page_count >= self.pcie_access_bound {
                        break;
                    }
                    let prefetch_limit = (self.pcie_access_bound - page_count).min(fill_gap);
                    if prefetch_limit == 0 {
                        continue;
                    }

                    let seed_pages: Vec<PageId> = self
                        .page_fault_process_queue
                        .get(&key)
                        .map(|s| s.iter().copied().collect())
                        .unwrap_or_default();

                    let mut prefetch_list: HashSet<PageId> = HashSet::new();
                    for seed in seed_pages {
                        let mut cursor = mc.refer(seed).and_then(|p| p.next);
                        while let Some(pid) = cursor {
                            if prefetch_list.len() as u64 == prefetch_limit {
                                break;
                            }
                            let resident = self.cgroups.get(&key).map(|c| c.contains(&pid)).unwrap_or(false);
                            if !resident {
                                prefetch_list.insert(pid);
                            }
                            cursor = mc.refer(pid).and_then(|p| p.next);
                        }
                        if prefetch_list.len() as u64 == prefetch_limit {
                            break;
                        }
                    }

                    let added = prefetch_list.len() as u64;
                    self.page_fault_process_queue.entry(key).or_default().extend(prefetch_list);
                    page_count += added;
                }
            }

            if page_count > 0 {
                self.wait_cycle = if self.penalty_enabled {
                    self.page_fault_communication_cycle + page_count * self.page_fault_migration_unit_cycle
                } else {
                    1
                };
                debug!("Demanded page number: {}", page_count);
            }
        }
    }

    /// §4.4 access-processing phase: splice MC responses, deliver to
    /// warps, collect new misses/hits.
    fn access_processing(&mut self, mc: &mut MemoryController) {
        self.gmmu_to_warps_queue.extend(mc.mc_to_gmmu_queue.drain(..));

        while let Some(access) = self.warps_to_gmmu_queue.pop_front() {
            let key = self.cgroup_key(access.app_id);
            let hit = access.page_ids.iter().all(|pid| {
                self.cgroups.entry(key).or_insert_with(|| Lru::new(0)).lookup(pid).is_some()
            });

            if hit {
                mc.gmmu_to_mc_queue.push_back(access);
            } else {
                self.mshrs.push_back(access);
            }
        }
    }

    /// Drains accesses ready for delivery back to their originating warp.
    /// The SM layer calls this once per tick to pull its inbox deliveries.
    pub fn drain_warp_deliveries(&mut self) -> VecDeque<MemoryAccess> {
        std::mem::take(&mut self.gmmu_to_warps_queue)
    }

    /// The SM layer's round-robin collection step feeds newly emitted warp
    /// accesses in here, one at a time, in warp-then-SM order.
    pub fn ingest_sm_access(&mut self, access: MemoryAccess) {
        self.warps_to_gmmu_queue.push_back(access);
    }

    /// Removes every queued access bearing `model_id`, erases the pending
    /// fault set, and frees the cgroup. Spec.md §4.4 "Model termination".
    pub fn terminate_model(&mut self, app_id: AppId, model_id: ModelId, mc: &MemoryController) {
        self.warps_to_gmmu_queue.retain(|a| a.model_id != model_id);
        self.gmmu_to_warps_queue.retain(|a| a.model_id != model_id);
        self.page_fault_finish_queue.retain(|a| a.model_id != model_id);
        self.mshrs.retain(|a| a.model_id != model_id);

        self.page_fault_process_queue.remove(&app_id);
        if self.page_fault_process_queue.is_empty() {
            self.wait_cycle = 0;
        }

        self.free_cgroup(app_id, mc);
    }

    /// Releases DRAM-resident entries from `app_id`'s cgroup; VRAM-resident
    /// pages stay until their owning kernel's requests release them.
    pub fn free_cgroup(&mut self, app_id: AppId, mc: &MemoryController) {
        let key = self.cgroup_key(app_id);
        if let Some(cgroup) = self.cgroups.get_mut(&key) {
            let released = cgroup.release(|&pid| {
                mc.refer(pid).map(|p| p.location == PageLocation::Dram).unwrap_or(false)
            });
            debug!("free_cgroup: release {} pages from cgroup {}", released, key);
        }
    }

    pub fn wait_cycle(&self) -> u64 {
        self.wait_cycle
    }

    pub fn mshr_len(&self) -> usize {
        self.mshrs.len()
    }

    pub fn pending_fault_pages(&self) -> usize {
        self.page_fault_process_queue.values().map(|s| s.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{AppId as A, BlockId, ModelId as M, RequestId, SmId, WarpId};
    use crate::request::AccessKind;

    fn access(app_id: A, model_id: M, page_ids: Vec<PageId>) -> MemoryAccess {
        MemoryAccess {
            model_id,
            app_id,
            sm_id: 0 as SmId,
            block_id: 0 as BlockId,
            warp_id: 0 as WarpId,
            request_id: 0 as RequestId,
            kind: AccessKind::Read,
            page_ids,
        }
    }

    #[test]
    fn miss_then_migration_then_hit() {
        let mut mc = MemoryController::new(1 << 30, 4096, true); // compulsory miss
        let mut gmmu = Gmmu::new(64, 10, 2, false, true);
        gmmu.set_cgroup_size(0, 4);

        let page = mc.allocate(4096);
        gmmu.ingest_sm_access(access(0, 0, vec![page]));
        gmmu.access_processing(&mut mc);
        assert_eq!(gmmu.mshr_len(), 1);

        gmmu.page_fault_handler(&mut mc);
        assert!(gmmu.wait_cycle() > 0);
        assert_eq!(gmmu.mshr_len(), 0);

        for _ in 0..gmmu.wait_cycle() {
            gmmu.page_fault_handler(&mut mc);
        }
        assert_eq!(mc.refer(page).unwrap().location, PageLocation::Vram);
    }

    #[test]
    fn eviction_flips_victim_page_back_to_dram() {
        let mut mc = MemoryController::new(1 << 30, 4096, true);
        let mut gmmu = Gmmu::new(64, 10, 2, false, true);
        gmmu.set_cgroup_size(0, 1); // capacity of one page forces eviction

        let p0 = mc.allocate(4096);
        let p1 = mc.allocate(4096);

        gmmu.ingest_sm_access(access(0, 0, vec![p0]));
        gmmu.access_processing(&mut mc);
        gmmu.page_fault_handler(&mut mc);
        for _ in 0..gmmu.wait_cycle() {
            gmmu.page_fault_handler(&mut mc);
        }
        assert_eq!(mc.refer(p0).unwrap().location, PageLocation::Vram);

        gmmu.ingest_sm_access(access(0, 0, vec![p1]));
        gmmu.access_processing(&mut mc);
        gmmu.page_fault_handler(&mut mc);
        for _ in 0..gmmu.wait_cycle() {
            gmmu.page_fault_handler(&mut mc);
        }
        assert_eq!(mc.refer(p1).unwrap().location, PageLocation::Vram);
        assert_eq!(mc.refer(p0).unwrap().location, PageLocation::Dram);
    }

    #[test]
    fn terminate_model_purges_all_queues() {
        let mc = MemoryController::new(1 << 30, 4096, false);
        let mut gmmu = Gmmu::new(64, 10, 2, false, true);
        gmmu.ingest_sm_access(access(0, 7, vec![1]));
        gmmu.mshrs.push_back(access(0, 7, vec![2]));
        gmmu.terminate_model(0, 7, &mc);
        assert_eq!(gmmu.mshr_len(), 0);
        assert!(gmmu.warps_to_gmmu_queue.is_empty());
    }
}
