//! GPU top-level: owns every SM, the GMMU, and the kernel command/running/
//! finished queues. Spec.md §4.6, grounded in
//! `original_source/src/GPU.cpp`/`include/GPU.hpp`.

use std::collections::{HashMap, HashSet, VecDeque};

use log::info;

use crate::gmmu::Gmmu;
use crate::ids::{AppId, KernelId, ModelId, SmId};
use crate::memory::MemoryController;
use crate::request::Kernel;
use crate::sm::StreamingMultiprocessor;

pub struct Gpu {
    sms: Vec<StreamingMultiprocessor>,
    pub gmmu: Gmmu,

    command_queue: VecDeque<KernelId>,
    running_kernels: Vec<KernelId>,
    pub finished_kernels: Vec<KernelId>,
}

impl Gpu {
    pub fn new(sms: Vec<StreamingMultiprocessor>, gmmu: Gmmu) -> Self {
        Gpu {
            sms,
            gmmu,
            command_queue: VecDeque::new(),
            running_kernels: Vec::new(),
            finished_kernels: Vec::new(),
        }
    }

    pub fn sm_count(&self) -> usize {
        self.sms.len()
    }

    /// Queues `kernel_id` for binding once its full `sm_set` is idle.
    /// Rejects kernels with an empty request queue, mirroring
    /// `GPU::launchKernel`'s `requests.size()` guard.
    pub fn launch_kernel(&mut self, kernel: &Kernel) -> bool {
        if kernel.requests.is_empty() {
            return false;
        }
        self.command_queue.push_back(kernel.kernel_id);
        true
    }

    pub fn get_idle_sms(&self) -> HashSet<SmId> {
        self.sms.iter().filter(|s| s.is_idle()).map(|s| s.sm_id).collect()
    }

    /// One entry per SM, in id order, `true` while it has a block bound.
    /// Feeds the live metrics snapshot's SM occupancy panel.
    pub fn sm_active_mask(&self) -> Vec<bool> {
        self.sms.iter().map(|s| !s.is_idle()).collect()
    }

    /// One GPU-domain tick: retire finished blocks, retire finished kernels,
    /// admit command-queue kernels whose SMs are all idle, then step every
    /// SM (feeding its emitted accesses into the GMMU and its deliveries
    /// back out of it).
    pub fn cycle(&mut self, kernels: &mut HashMap<KernelId, Kernel>, mc: &mut MemoryController, now: u64) {
        for sm in self.sms.iter_mut() {
            sm.check_finish(kernels, now);
        }

        self.check_finish_kernel(kernels, now);
        self.runtime_block_scheduling(kernels, now);

        self.gmmu.cycle(mc);
        let mut deliveries: HashMap<SmId, VecDeque<_>> = HashMap::new();
        for access in self.gmmu.drain_warp_deliveries() {
            deliveries.entry(access.sm_id).or_default().push_back(access);
        }

        for sm in self.sms.iter_mut() {
            let mut returns = deliveries.remove(&sm.sm_id).unwrap_or_default();
            for access in sm.cycle(kernels, &mut returns) {
                self.gmmu.ingest_sm_access(access);
            }
        }
    }

    fn runtime_block_scheduling(&mut self, kernels: &mut HashMap<KernelId, Kernel>, now: u64) {
        let idle = self.get_idle_sms();
        let mut remaining = VecDeque::new();

        while let Some(kernel_id) = self.command_queue.pop_front() {
            let Some(kernel) = kernels.get(&kernel_id) else { continue };
            let sm_ready = kernel.sm_set.iter().all(|sm_id| idle.contains(sm_id));

            if sm_ready {
                let sm_set = kernel.sm_set.clone();
                for sm_id in &sm_set {
                    let kernel = kernels.get(&kernel_id).expect("kernel vanished mid-bind");
                    let sm = self.sms.iter_mut().find(|s| &s.sm_id == sm_id).expect("unknown sm in sm_set");
                    sm.bind_kernel(kernel, now);
                }
                let kernel = kernels.get_mut(&kernel_id).expect("kernel vanished mid-bind");
                kernel.running = true;
                kernel.start_cycle = Some(now);
                self.running_kernels.push(kernel_id);
            } else {
                remaining.push_back(kernel_id);
            }
        }

        self.command_queue = remaining;
    }

    fn check_finish_kernel(&mut self, kernels: &mut HashMap<KernelId, Kernel>, now: u64) {
        let mut still_running = Vec::new();
        for kernel_id in self.running_kernels.drain(..) {
            let Some(kernel) = kernels.get(&kernel_id) else { continue };
            let complete = kernel
                .sm_set
                .iter()
                .all(|sm_id| self.sms.iter().find(|s| s.sm_id == *sm_id).map(|s| s.check_is_complete(kernel_id)).unwrap_or(true));

            if complete {
                let kernel = kernels.get_mut(&kernel_id).expect("checked above");
                kernel.finish = true;
                kernel.running = false;
                kernel.end_cycle = Some(now);
                info!("Finish kernel {}:", kernel_id);
                self.finished_kernels.push(kernel_id);
            } else {
                still_running.push(kernel_id);
            }
        }
        self.running_kernels = still_running;
    }

    /// Purges every queue of `model_id`'s footprint: GMMU state, SM-bound
    /// blocks (implicitly drained as their warps run dry), running/command
    /// queue membership.
    pub fn terminate_model(&mut self, app_id: AppId, model_id: ModelId, kernels: &mut HashMap<KernelId, Kernel>, mc: &MemoryController) {
        self.gmmu.terminate_model(app_id, model_id, mc);

        self.running_kernels.retain(|id| {
            let keep = kernels.get(id).map(|k| k.model_id != model_id).unwrap_or(false);
            if !keep {
                if let Some(k) = kernels.get_mut(id) {
                    k.running = false;
                }
            }
            keep
        });
        self.command_queue.retain(|id| kernels.get(id).map(|k| k.model_id != model_id).unwrap_or(false));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::LayerId;
    use crate::request::Request;

    fn gpu_with_one_sm() -> (Gpu, HashMap<KernelId, Kernel>) {
        let sm = StreamingMultiprocessor::new(0, 2, 4, 2, 2, 4);
        let gmmu = Gmmu::new(64, 10, 2, false, false);
        (Gpu::new(vec![sm], gmmu), HashMap::new())
    }

    #[test]
    fn launch_rejects_empty_kernel() {
        let (mut gpu, _) = gpu_with_one_sm();
        let k = Kernel::new(1, 0, 0, 0 as LayerId);
        assert!(!gpu.launch_kernel(&k));
    }

    #[test]
    fn launch_then_bind_moves_kernel_to_running() {
        let (mut gpu, mut kernels) = gpu_with_one_sm();
        let mut k = Kernel::new(1, 0, 0, 0 as LayerId);
        k.requests.push_back(Request::new(0, vec![1], vec![], 0));
        k.sm_set = vec![0];
        assert!(gpu.launch_kernel(&k));
        kernels.insert(1, k);

        let mut mc = MemoryController::new(1 << 20, 4096, false);
        gpu.cycle(&mut kernels, &mut mc, 0);
        assert!(kernels[&1].running);
    }
}
