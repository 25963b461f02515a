//! Application / Model runtime: the CPU-side task queue and in-flight
//! model bookkeeping. Spec.md §3 "Application", §4.7.1's model
//! materialization (`Dynamic_Batch_Admission`). Grounded in
//! `original_source/src/include/Application.hpp`/`.cpp` and
//! `original_source/src/CPU.cpp::Dynamic_Batch_Admission`.

use std::collections::HashMap;

use log::info;

use crate::ids::{AppId, KernelId, ModelId, SmId};
use crate::layer::{ModelInfo, ModelTopology};
use crate::memory::MemoryController;
use crate::page::PageId;
use crate::request::{Kernel, KernelGroup, Request};

/// One queued inference request, arriving at `arrival_cycle`. `deadline`
/// is `None` unless deadline enforcement is enabled for this run.
#[derive(Debug, Clone, Copy)]
pub struct Task {
    pub app_id: AppId,
    pub arrival_cycle: u64,
    pub deadline: Option<u64>,
}

/// An in-flight batch of one or more tasks compiled into a kernel DAG.
/// Each layer of the model's topology becomes one `Kernel`, cascaded by
/// `deps` onto the previous layer.
pub struct ModelRuntime {
    pub model_id: ModelId,
    pub app_id: AppId,
    pub name: &'static str,
    pub batch_size: u32,
    pub deadline: Option<u64>,
    /// Kernel ids, one per topology layer, in dependency order.
    pub kernel_ids: Vec<KernelId>,
    /// SMs this model may launch kernels on; empty means held back
    /// (Lazy-Batching's slack-exhausted models, SALBI's zero-allocation
    /// apps).
    pub sm_budget: Vec<SmId>,
}

impl ModelRuntime {
    /// Kernels with all dependencies finished, not yet running or
    /// finished themselves, grouped by whether they share the smallest
    /// ready layer id (the unit the launcher batches together).
    pub fn ready_kernels<'a>(&'a self, kernels: &'a HashMap<KernelId, Kernel>) -> Vec<&'a Kernel> {
        let is_finished = |id: KernelId| kernels.get(&id).map(|k| k.finish).unwrap_or(false);
        self.kernel_ids
            .iter()
            .filter_map(|id| kernels.get(id))
            .filter(|k| k.is_ready(is_finished))
            .collect()
    }

    pub fn smallest_ready_layer_kernels<'a>(&'a self, kernels: &'a HashMap<KernelId, Kernel>) -> Vec<KernelId> {
        let ready = self.ready_kernels(kernels);
        let Some(min_layer) = ready.iter().map(|k| k.layer_id).min() else { return Vec::new() };
        ready.into_iter().filter(|k| k.layer_id == min_layer).map(|k| k.kernel_id).collect()
    }

    pub fn is_finished(&self, kernels: &HashMap<KernelId, Kernel>) -> bool {
        self.kernel_ids.iter().all(|id| kernels.get(id).map(|k| k.finish).unwrap_or(true))
    }

    /// Sum of remaining (not-yet-finished) layers' `execute_cycles`,
    /// scaled by batch size — the Lazy-Batching slack calculation's per-
    /// model term (§4.7.3).
    pub fn remaining_execute_cycles(&self, kernels: &HashMap<KernelId, Kernel>, topology: &ModelTopology) -> u64 {
        topology
            .layers
            .iter()
            .zip(self.kernel_ids.iter())
            .filter(|(_, id)| !kernels.get(id).map(|k| k.finish).unwrap_or(true))
            .map(|(layer, _)| layer.execute_cycles * self.batch_size as u64)
            .sum()
    }
}

pub struct Application {
    pub app_id: AppId,
    pub model_type: &'static str,
    pub model_info: ModelInfo,
    pub task_queue: std::collections::VecDeque<Task>,
    pub waiting_models: Vec<ModelRuntime>,
    pub running_models: Vec<ModelRuntime>,
    pub sm_budget: Vec<SmId>,
    pub finish: bool,
}

impl Application {
    pub fn new(app_id: AppId, model_type: &'static str, task_count: u32, arrival_cycle: u64, deadline_offset: Option<u64>) -> Self {
        let topology = ModelTopology::build(model_type, 1);
        let task_queue = (0..task_count)
            .map(|_| Task {
                app_id,
                arrival_cycle,
                deadline: deadline_offset.map(|d| arrival_cycle + d),
            })
            .collect();
        Application {
            app_id,
            model_type,
            model_info: topology.info(),
            task_queue,
            waiting_models: Vec::new(),
            running_models: Vec::new(),
            sm_budget: Vec::new(),
            finish: false,
        }
    }

    /// Materializes the next `batch_size` queued tasks into one
    /// `ModelRuntime`, compiling its layer cascade into a `Kernel` DAG via
    /// `MemoryController::allocate`. Pushed straight into `running_models`
    /// once the scheduler has already assigned `sm_budget` (mirrors the
    /// original's single-step `Dynamic_Batch_Admission`).
    pub fn admit_model(
        &mut self,
        batch_size: u32,
        sm_budget: Vec<SmId>,
        next_model_id: &mut ModelId,
        next_kernel_id: &mut KernelId,
        kernels: &mut HashMap<KernelId, Kernel>,
        mc: &mut MemoryController,
    ) {
        let batch_size = batch_size.min(self.task_queue.len() as u32).max(1);
        let deadline = self.task_queue.front().and_then(|t| t.deadline);
        for _ in 0..batch_size {
            self.task_queue.pop_front();
        }

        let model_id = *next_model_id;
        *next_model_id += 1;
        let topology = ModelTopology::build(self.model_type, batch_size);

        let mut kernel_ids = Vec::with_capacity(topology.layers.len());
        let mut prev: Vec<KernelId> = Vec::new();
        for layer in &topology.layers {
            let kernel_id = *next_kernel_id;
            *next_kernel_id += 1;

            let mut kernel = Kernel::new(kernel_id, self.app_id, model_id, layer.layer_id);
            kernel.deps = prev.clone();
            kernel.sm_set = sm_budget.clone();
            kernel.num_of_memory = layer.total_memory();
            kernel.filter_mem = layer.filter_mem;
            kernel.ifmap_mem = layer.ifmap_mem;
            kernel.ofmap_mem = layer.ofmap_mem;
            kernel.is_dense = layer.kind.is_dense();
            compile_requests(&mut kernel, layer.ifmap_mem, layer.ofmap_mem, layer.filter_mem, mc);

            kernels.insert(kernel_id, kernel);
            kernel_ids.push(kernel_id);
            prev = vec![kernel_id];
        }

        self.running_models.push(ModelRuntime {
            model_id,
            app_id: self.app_id,
            name: self.model_type,
            batch_size,
            deadline,
            kernel_ids,
            sm_budget,
        });
    }

    /// Drops a finished/terminated model's bookkeeping, logging the "model
    /// finished" record (spec.md §6).
    pub fn retire_model(&mut self, model_id: ModelId) {
        if let Some(pos) = self.running_models.iter().position(|m| m.model_id == model_id) {
            let m = self.running_models.remove(pos);
            info!(
                "App {} Model {}: {} with {} batch size is finished",
                self.app_id, m.model_id, m.name, m.batch_size
            );
        }
        self.waiting_models.retain(|m| m.model_id != model_id);
    }

    /// Per-CPU-tick housekeeping: an application is finished once its task
    /// queue is drained and no model remains in flight.
    pub fn cycle(&mut self) {
        self.finish = self.task_queue.is_empty() && self.running_models.is_empty() && self.waiting_models.is_empty();
    }
}

/// Splits a layer's memory footprint into page-sized `Request`s: filter
/// and input-feature-map pages are read, output-feature-map pages are
/// written. Out of the core's scope per spec.md §1 ("the core consumes a
/// compiled artifact"); this is the compiling side of that boundary.
fn compile_requests(kernel: &mut Kernel, ifmap_mem: u64, ofmap_mem: u64, filter_mem: u64, mc: &mut MemoryController) {
    const PAGES_PER_REQUEST: usize = 4;

    let read_bytes = ifmap_mem + filter_mem;
    let read_pages = if read_bytes > 0 { page_chain(mc, mc.allocate(read_bytes)) } else { Vec::new() };
    let write_pages = if ofmap_mem > 0 { page_chain(mc, mc.allocate(ofmap_mem)) } else { Vec::new() };

    let request_count = read_pages.len().div_ceil(PAGES_PER_REQUEST).max(write_pages.len().div_ceil(PAGES_PER_REQUEST)).max(1);
    let mut request_id = 0u64;
    for i in 0..request_count {
        let reads: Vec<PageId> = read_pages.iter().skip(i * PAGES_PER_REQUEST).take(PAGES_PER_REQUEST).copied().collect();
        let writes: Vec<PageId> = write_pages.iter().skip(i * PAGES_PER_REQUEST).take(PAGES_PER_REQUEST).copied().collect();
        kernel.requests.push_back(Request::new(request_id, reads, writes, 2));
        request_id += 1;
    }
}

fn page_chain(mc: &MemoryController, head: PageId) -> Vec<PageId> {
    let mut chain = Vec::new();
    let mut cursor = Some(head);
    while let Some(id) = cursor {
        chain.push(id);
        cursor = mc.refer(id).and_then(|p| p.next);
    }
    chain
}

/// Builds a single-kernel `KernelGroup` for one model's one ready kernel,
/// or a fan-in group when several models share the same ready layer id
/// (Lazy-Batching, SALBI). `batch_multiplier` is each member's batch size.
pub fn group_ready_kernels(members: &[(KernelId, u32)]) -> KernelGroup {
    KernelGroup {
        members: members.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admit_model_compiles_one_kernel_per_layer() {
        let mut app = Application::new(0, "LeNet", 2, 0, None);
        let mut kernels = HashMap::new();
        let mut mc = MemoryController::new(1 << 30, 4096, false);
        let mut next_model_id = 0u64;
        let mut next_kernel_id = 0u64;

        app.admit_model(1, vec![0, 1], &mut next_model_id, &mut next_kernel_id, &mut kernels, &mut mc);

        let model = &app.running_models[0];
        let topology = ModelTopology::build("LeNet", 1);
        assert_eq!(model.kernel_ids.len(), topology.layers.len());
        assert_eq!(app.task_queue.len(), 1);
    }

    #[test]
    fn cascaded_kernels_depend_on_the_previous_layer() {
        let mut app = Application::new(0, "LeNet", 1, 0, None);
        let mut kernels = HashMap::new();
        let mut mc = MemoryController::new(1 << 30, 4096, false);
        let mut next_model_id = 0u64;
        let mut next_kernel_id = 0u64;

        app.admit_model(1, vec![0], &mut next_model_id, &mut next_kernel_id, &mut kernels, &mut mc);
        let model = &app.running_models[0];
        for window in model.kernel_ids.windows(2) {
            assert_eq!(kernels[&window[1]].deps, vec![window[0]]);
        }
    }

    #[test]
    fn application_finishes_once_queue_and_models_drain() {
        let mut app = Application::new(0, "LeNet", 1, 0, None);
        let mut kernels = HashMap::new();
        let mut mc = MemoryController::new(1 << 30, 4096, false);
        let mut next_model_id = 0u64;
        let mut next_kernel_id = 0u64;
        app.admit_model(1, vec![0], &mut next_model_id, &mut next_kernel_id, &mut kernels, &mut mc);
        app.cycle();
        assert!(!app.finish);

        let model_id = app.running_models[0].model_id;
        for id in &app.running_models[0].kernel_ids {
            kernels.get_mut(id).unwrap().finish = true;
        }
        app.retire_model(model_id);
        app.cycle();
        assert!(app.finish);
    }
}
