//! Request/access/kernel data model. Spec.md §3.
//!
//! Grounded in `original_source/src/include/Kernel.hpp` (the header is
//! authoritative over its own stale `.cpp`, per DESIGN.md). The teacher's
//! `kernel.rs` donates the `Kernel` name but none of its closure-based
//! body: here a kernel is a DAG node holding queued requests, not a
//! function pointer over a thread context.

use std::collections::VecDeque;

use crate::ids::{AppId, BlockId, KernelId, LayerId, ModelId, RequestId, SmId, WarpId};
use crate::page::PageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

/// One batch of page touches emitted by a warp, consumed by GMMU then MC,
/// and returned verbatim to the originating warp.
#[derive(Debug, Clone)]
pub struct MemoryAccess {
    pub model_id: ModelId,
    pub app_id: AppId,
    pub sm_id: SmId,
    pub block_id: BlockId,
    pub warp_id: WarpId,
    pub request_id: RequestId,
    pub kind: AccessKind,
    pub page_ids: Vec<PageId>,
}

/// A `(page_id, remaining_touches)` pair: coalesced-access bookkeeping for
/// one page inside a `Request`.
#[derive(Debug, Clone, Copy)]
pub struct PageTouch {
    pub page_id: PageId,
    pub remaining_touches: u32,
}

/// One unit of computation inside a kernel; generates 0+ `MemoryAccess`
/// objects as a warp thread drains it.
#[derive(Debug, Clone)]
pub struct Request {
    pub request_id: RequestId,
    pub read_pages: Vec<PageTouch>,
    pub write_pages: Vec<PageTouch>,
    pub num_instructions: i32,
}

impl Request {
    pub fn new(request_id: RequestId, read_pages: Vec<PageId>, write_pages: Vec<PageId>, num_instructions: i32) -> Self {
        let touch = |p: PageId| PageTouch {
            page_id: p,
            remaining_touches: 1,
        };
        Request {
            request_id,
            read_pages: read_pages.into_iter().map(touch).collect(),
            write_pages: write_pages.into_iter().map(touch).collect(),
            num_instructions,
        }
    }
}

/// Per-warp record kept for the "Finish warp" log line (spec.md §6).
#[derive(Debug, Clone, Default)]
pub struct WarpRecord {
    pub warp_id: WarpId,
    pub start_cycle: u64,
    pub end_cycle: u64,
    pub compute_cycles: u64,
    pub wait_cycles: u64,
}

/// Per-block record kept for the "Finish block" log line (spec.md §6).
#[derive(Debug, Clone, Default)]
pub struct BlockRecord {
    pub block_id: BlockId,
    pub sm_id: SmId,
    pub start_cycle: u64,
    pub end_cycle: u64,
    pub launch_access_counter: u64,
    pub return_access_counter: u64,
    pub pages_touched: usize,
    pub warps: Vec<WarpRecord>,
}

/// A DAG node: one compiled layer's worth of GPU work.
#[derive(Debug, Clone)]
pub struct Kernel {
    pub kernel_id: KernelId,
    pub app_id: AppId,
    pub model_id: ModelId,
    pub layer_id: LayerId,
    pub requests: VecDeque<Request>,
    pub deps: Vec<KernelId>,
    pub sm_set: Vec<SmId>,
    pub running: bool,
    pub finish: bool,
    pub start_cycle: Option<u64>,
    pub end_cycle: Option<u64>,
    pub block_records: Vec<BlockRecord>,
    /// Memory footprint in bytes, copied from the source layer at compile
    /// time; used by the scheduler's memory-allocation math (BARM/SALBI).
    pub num_of_memory: u64,
    pub filter_mem: u64,
    pub ifmap_mem: u64,
    pub ofmap_mem: u64,
    /// `true` for `Layer::Dense` — SALBI always takes the full ready-
    /// kernel count for dense layers regardless of batch-size math.
    pub is_dense: bool,
}

impl Kernel {
    pub fn new(kernel_id: KernelId, app_id: AppId, model_id: ModelId, layer_id: LayerId) -> Self {
        Kernel {
            kernel_id,
            app_id,
            model_id,
            layer_id,
            requests: VecDeque::new(),
            deps: Vec::new(),
            sm_set: Vec::new(),
            running: false,
            finish: false,
            start_cycle: None,
            end_cycle: None,
            block_records: Vec::new(),
            num_of_memory: 0,
            filter_mem: 0,
            ifmap_mem: 0,
            ofmap_mem: 0,
            is_dense: false,
        }
    }

    /// Ready iff every dependency is finished. Callers pass a lookup
    /// closure since dependencies live in the owning model's kernel
    /// arena, not inside `Kernel` itself.
    pub fn is_ready<F>(&self, dep_finished: F) -> bool
    where
        F: Fn(KernelId) -> bool,
    {
        !self.running && !self.finish && self.deps.iter().all(|d| dep_finished(*d))
    }

    pub fn launch_access_counter(&self) -> u64 {
        self.block_records.iter().map(|b| b.launch_access_counter).sum()
    }

    pub fn return_access_counter(&self) -> u64 {
        self.block_records.iter().map(|b| b.return_access_counter).sum()
    }
}

/// A fan-in wrapper over same-layer-ID kernels launched together, each
/// scaled by its model's batch multiplier (spec.md §3).
#[derive(Debug, Clone)]
pub struct KernelGroup {
    pub members: Vec<(KernelId, u32)>,
}

impl KernelGroup {
    pub fn single(kernel_id: KernelId, batch_multiplier: u32) -> Self {
        KernelGroup {
            members: vec![(kernel_id, batch_multiplier)],
        }
    }

    pub fn kernel_ids(&self) -> impl Iterator<Item = KernelId> + '_ {
        self.members.iter().map(|(k, _)| *k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_ready_iff_all_deps_finished() {
        let mut k = Kernel::new(3, 0, 0, 0);
        k.deps = vec![1, 2];
        assert!(!k.is_ready(|id| id == 1));
        assert!(k.is_ready(|_| true));
    }

    #[test]
    fn finished_kernel_requests_are_empty() {
        let mut k = Kernel::new(1, 0, 0, 0);
        k.requests.push_back(Request::new(0, vec![1], vec![], 0));
        assert!(!k.requests.is_empty());
        k.requests.clear();
        k.finish = true;
        k.running = false;
        assert!(k.requests.is_empty() && !k.running);
    }
}
