//! Streaming Multiprocessor: owns a fixed pool of warps and the blocks
//! currently bound to a kernel. Spec.md §4.5, grounded in
//! `original_source/src/include/SM.hpp`/`SM.cpp` (`bindKernel`,
//! `checkFinish`, `recycleResource`). The teacher's `sm.rs` donates the
//! `StreamingMultiprocessor` name and its resource-counter shape, not its
//! register-file/tensor-core body.

use std::collections::VecDeque;

use crate::block::Block;
use crate::ids::{BlockId, KernelId, SmId, WarpId};
use crate::request::{Kernel, MemoryAccess};
use crate::warp::Warp;

/// Live resource budget, drawn down as blocks are bound and returned on
/// `recycle_resources`. `original_source/src/include/SM.hpp`'s
/// `ComputingResource`.
#[derive(Debug, Clone, Copy)]
pub struct ComputingResource {
    pub remaining_blocks: u32,
    pub remaining_warps: u32,
}

pub struct StreamingMultiprocessor {
    pub sm_id: SmId,
    warps: Vec<Warp>,
    idle: Vec<bool>,
    resource: ComputingResource,
    running_blocks: Vec<Block>,
    next_block_id: BlockId,

    max_warp_per_block: u32,
    max_access_per_request: u32,

    exec_cycles: u64,
    idle_cycles: u64,
}

impl StreamingMultiprocessor {
    pub fn new(
        sm_id: SmId,
        max_block_per_sm: u32,
        max_warp_per_sm: u32,
        max_warp_per_block: u32,
        max_thread_per_warp: u32,
        max_access_per_request: u32,
    ) -> Self {
        StreamingMultiprocessor {
            sm_id,
            warps: (0..max_warp_per_sm).map(|i| Warp::new(i as WarpId, max_thread_per_warp)).collect(),
            idle: vec![true; max_warp_per_sm as usize],
            resource: ComputingResource {
                remaining_blocks: max_block_per_sm,
                remaining_warps: max_warp_per_sm,
            },
            running_blocks: Vec::new(),
            next_block_id: 0,
            max_warp_per_block,
            max_access_per_request,
            exec_cycles: 0,
            idle_cycles: 0,
        }
    }

    pub fn resource_info(&self) -> ComputingResource {
        self.resource
    }

    pub fn is_idle(&self) -> bool {
        self.running_blocks.is_empty()
    }

    /// Bind `kernel` to this SM, launching `⌈remaining_warps /
    /// max_warp_per_block⌉` blocks and greedily claiming idle warps into
    /// each one. Baseline policy: a bound kernel gets every free resource
    /// the SM currently has (`original_source/src/SM.cpp::bindKernel`).
    pub fn bind_kernel(&mut self, kernel: &Kernel, now: u64) -> bool {
        if self.resource.remaining_blocks == 0 || self.resource.remaining_warps == 0 {
            return false;
        }

        let launch_block_num = self.resource.remaining_warps.div_ceil(self.max_warp_per_block);
        for _ in 0..launch_block_num {
            if self.resource.remaining_blocks == 0 {
                break;
            }
            let block_id = self.next_block_id;
            self.next_block_id += 1;
            let mut block = Block::new(block_id, kernel.kernel_id, self.sm_id, now);

            for (warp_id, idle) in self.idle.iter_mut().enumerate() {
                if *idle {
                    *idle = false;
                    self.warps[warp_id].reset_for_block(now);
                    block.warp_ids.push(warp_id as WarpId);
                    block.record.warps.push(Default::default());
                    self.resource.remaining_warps -= 1;
                }
                if block.warp_ids.len() as u32 == self.max_warp_per_block {
                    break;
                }
            }

            self.running_blocks.push(block);
            self.resource.remaining_blocks -= 1;
        }
        true
    }

    /// Deliver GMMU responses addressed to this SM's warps, then step every
    /// warp of every running block, collecting emitted accesses.
    pub fn cycle(&mut self, kernels: &mut std::collections::HashMap<KernelId, Kernel>, returns: &mut VecDeque<MemoryAccess>) -> Vec<MemoryAccess> {
        let mut outgoing = Vec::new();

        for access in returns.drain(..) {
            let Some(block_idx) = self.running_blocks.iter().position(|b| b.block_id == access.block_id) else {
                continue; // stale response for a block already recycled
            };
            if self.running_blocks[block_idx].warp_ids.contains(&access.warp_id) {
                self.running_blocks[block_idx].record.return_access_counter += 1;
                self.warps[access.warp_id as usize].inbox.push_back(access);
            }
        }

        for block in self.running_blocks.iter_mut() {
            let Some(kernel) = kernels.get_mut(&block.kernel_id) else { continue };
            for &warp_id in &block.warp_ids {
                let warp = &mut self.warps[warp_id as usize];
                warp.step(kernel, self.sm_id, block.block_id, self.max_access_per_request);
                while let Some(access) = warp.outbox.pop_front() {
                    block.record.launch_access_counter += 1;
                    outgoing.push(access);
                }
            }
        }

        if self.is_idle() {
            self.idle_cycles += 1;
        } else {
            self.exec_cycles += 1;
        }

        outgoing
    }

    /// Retire every block whose warps have all gone idle, folding its
    /// record into the owning kernel and returning resources to the pool.
    pub fn check_finish(&mut self, kernels: &mut std::collections::HashMap<KernelId, Kernel>, now: u64) {
        let mut i = 0;
        while i < self.running_blocks.len() {
            let all_idle = self.running_blocks[i]
                .warp_ids
                .iter()
                .all(|&w| !self.warps[w as usize].busy);
            if !all_idle {
                i += 1;
                continue;
            }

            let mut block = self.running_blocks.remove(i);
            block.record.end_cycle = now;
            assert_eq!(
                block.record.launch_access_counter, block.record.return_access_counter,
                "SM {}: block {} finished with unreturned accesses",
                self.sm_id, block.block_id
            );

            for &warp_id in &block.warp_ids {
                self.idle[warp_id as usize] = true;
            }
            self.resource.remaining_warps += block.warp_ids.len() as u32;
            self.resource.remaining_blocks += 1;

            if let Some(kernel) = kernels.get_mut(&block.kernel_id) {
                kernel.block_records.push(block.record);
            }
        }
    }

    /// True once `kernel` has no blocks left running on this SM.
    pub fn check_is_complete(&self, kernel_id: KernelId) -> bool {
        !self.running_blocks.iter().any(|b| b.kernel_id == kernel_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::LayerId;
    use crate::request::Request;

    fn sm() -> StreamingMultiprocessor {
        StreamingMultiprocessor::new(0, 2, 4, 2, 2, 4)
    }

    fn kernel_with_requests(n: u32) -> Kernel {
        let mut k = Kernel::new(0, 0, 0, 0 as LayerId);
        for i in 0..n {
            k.requests.push_back(Request::new(i as u64, vec![100 + i as u64], vec![], 0));
        }
        k
    }

    #[test]
    fn bind_kernel_claims_idle_warps_up_to_block_cap() {
        let mut s = sm();
        let kernel = kernel_with_requests(4);
        assert!(s.bind_kernel(&kernel, 0));
        assert_eq!(s.resource_info().remaining_warps, 0);
        assert_eq!(s.running_blocks.len(), 2);
        assert_eq!(s.running_blocks[0].warp_ids.len(), 2);
    }

    #[test]
    fn bind_kernel_fails_when_no_resources_remain() {
        let mut s = sm();
        let kernel = kernel_with_requests(4);
        assert!(s.bind_kernel(&kernel, 0));
        assert!(!s.bind_kernel(&kernel, 0));
    }

    #[test]
    fn check_finish_recycles_resources_when_warps_go_idle() {
        let mut s = StreamingMultiprocessor::new(0, 1, 1, 1, 1, 4);
        let k = Kernel::new(5, 0, 0, 0 as LayerId);
        assert!(s.bind_kernel(&k, 0));
        let mut kernels = std::collections::HashMap::new();
        kernels.insert(5, k);

        let mut empty = VecDeque::new();
        s.cycle(&mut kernels, &mut empty); // warp sees empty queue -> never goes busy
        s.check_finish(&mut kernels, 1);
        assert_eq!(s.resource_info().remaining_warps, 1);
        assert_eq!(s.resource_info().remaining_blocks, 1);
    }
}
