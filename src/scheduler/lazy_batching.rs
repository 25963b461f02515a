//! Lazy-Batching: deadline-slack-driven admission that holds back models
//! once a per-app batch/slack budget is exhausted, then merges same-layer
//! ready kernels of the budgeted models into one launch. Spec.md §4.7.3,
//! grounded in `original_source/src/Scheduler_LazyB.cpp`.

use std::collections::HashMap;

use crate::ids::{AppId, KernelId};
use crate::layer::ModelTopology;
use crate::request::{Kernel, KernelGroup};

use super::{materialize_ready_tasks, SchedulerCtx, SchedulerPolicy};

pub struct LazyBScheduler;

impl LazyBScheduler {
    pub fn new() -> Self {
        LazyBScheduler
    }
}

fn head_ready_kernel_id(model: &crate::application::ModelRuntime, kernels: &HashMap<KernelId, Kernel>) -> Option<KernelId> {
    model.ready_kernels(kernels).first().map(|k| k.kernel_id)
}

impl SchedulerPolicy for LazyBScheduler {
    /// Distributes the full SM set round-robin over every non-finished
    /// app (as `Scheduler_LazyB::Inference_Admission` does before its
    /// slack walk), then sorts each app's `running_models` by their head
    /// ready kernel id (descending) and walks from the tail (smallest id,
    /// i.e. the most-progressed model) toward the head, handing out the
    /// app's SM budget while `slack >= 0 && batch_budget >= 0` holds.
    fn admission(&mut self, ctx: &mut SchedulerCtx) {
        materialize_ready_tasks(ctx);

        for app in ctx.apps.iter_mut() {
            app.sm_budget.clear();
        }
        let sm_total = ctx.gpu.sm_count() as u32;
        let active: Vec<AppId> = ctx.apps.iter().filter(|a| !a.finish).map(|a| a.app_id).collect();
        if !active.is_empty() {
            let mut sm_count = 0u32;
            'fill: loop {
                for &app_id in &active {
                    if sm_count == sm_total {
                        break 'fill;
                    }
                    ctx.app_mut(app_id).sm_budget.push(sm_count);
                    sm_count += 1;
                }
                if sm_count == sm_total {
                    break;
                }
            }
        }

        let idle = ctx.gpu.get_idle_sms();
        let app_ids: Vec<AppId> = ctx.apps.iter().map(|a| a.app_id).collect();
        let now = ctx.now;
        let max_batch = ctx.cfg.lazyb_max_batch_size;
        let kernels_ref = &*ctx.kernels;

        for app_id in app_ids {
            let sm_budget = ctx.apps.iter().find(|a| a.app_id == app_id).expect("unknown app_id").sm_budget.clone();
            if sm_budget.is_empty() || !sm_budget.iter().all(|s| idle.contains(s)) {
                continue;
            }

            let app = ctx.apps.iter_mut().find(|a| a.app_id == app_id).expect("unknown app_id");
            app.running_models.sort_by(|a, b| {
                let ka = head_ready_kernel_id(a, kernels_ref);
                let kb = head_ready_kernel_id(b, kernels_ref);
                kb.cmp(&ka) // descending: largest (least-progressed) head id first
            });
            if app.running_models.is_empty() {
                continue;
            }

            let topology = ModelTopology::build(app.model_type, 1);
            let Some(deadline) = app.running_models.last().and_then(|m| m.deadline) else {
                // No deadline enforced for this app's tasks: no slack constraint.
                for model in app.running_models.iter_mut() {
                    model.sm_budget = sm_budget.clone();
                }
                continue;
            };

            let mut slack: i64 = deadline as i64 - now as i64;
            let mut batch_budget: i64 = max_batch as i64;
            for model in app.running_models.iter_mut().rev() {
                let remaining = model.remaining_execute_cycles(kernels_ref, &topology);
                slack -= remaining as i64;
                batch_budget -= model.batch_size as i64;
                model.sm_budget = if slack >= 0 && batch_budget >= 0 { sm_budget.clone() } else { Vec::new() };
            }
        }
    }

    /// Merges same-smallest-layer-id ready kernels across every budgeted
    /// (non-empty-`sm_budget`) model of an app into one `KernelGroup`.
    fn kernel_launch(&mut self, ctx: &mut SchedulerCtx) {
        let idle = ctx.gpu.get_idle_sms();
        let app_ids: Vec<AppId> = ctx.apps.iter().map(|a| a.app_id).collect();

        for app_id in app_ids {
            let app_sm_budget = ctx.app_mut(app_id).sm_budget.clone();
            if app_sm_budget.is_empty() || !app_sm_budget.iter().all(|s| idle.contains(s)) {
                continue;
            }

            let app = ctx.apps.iter_mut().find(|a| a.app_id == app_id).expect("unknown app_id");
            let candidates: Vec<(KernelId, u32)> = app
                .running_models
                .iter()
                .filter(|m| !m.sm_budget.is_empty())
                .filter_map(|m| head_ready_kernel_id(m, ctx.kernels).map(|k| (k, m.batch_size)))
                .collect();
            if candidates.is_empty() {
                continue;
            }

            let min_layer = candidates
                .iter()
                .filter_map(|&(k, _)| ctx.kernels.get(&k).map(|k| k.layer_id))
                .min();
            let Some(min_layer) = min_layer else { continue };

            let members: Vec<(KernelId, u32)> = candidates
                .into_iter()
                .filter(|&(k, _)| ctx.kernels.get(&k).map(|k| k.layer_id) == Some(min_layer))
                .collect();
            let group = KernelGroup { members };

            for (kernel_id, _) in &group.members {
                let kernel = ctx.kernels.get_mut(kernel_id).expect("ready kernel vanished");
                kernel.sm_set = app_sm_budget.clone();
                ctx.gpu.launch_kernel(kernel);
            }
        }
    }

    /// Matches `original_source`'s comment ("no memory limitation to the
    /// system"): one shared, VRAM-wide cgroup, same as `Memory_Allocator::None`.
    fn memory_allocation(&mut self, ctx: &mut SchedulerCtx) {
        ctx.gpu.gmmu.set_cgroup_type(false);
        ctx.gpu.gmmu.set_cgroup_size(crate::ids::SHARED_CGROUP_ID, ctx.cfg.vram_pages());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::Application;
    use crate::config::SimConfig;
    use crate::gmmu::Gmmu;
    use crate::gpu::Gpu;
    use crate::memory::MemoryController;
    use crate::sm::StreamingMultiprocessor;

    #[test]
    fn slack_exhausted_models_get_empty_budget() {
        let cfg = SimConfig::default();
        let mut apps = vec![Application::new(0, "LeNet", 0, 0, None)];
        let mut mc = MemoryController::new(1 << 30, cfg.page_size, false);
        let mut kernels = HashMap::new();
        let mut next_model_id = 0u64;
        let mut next_kernel_id = 0u64;

        // Three models, each with a tight deadline that only the first two can satisfy.
        for _ in 0..3 {
            apps[0].task_queue.push_back(crate::application::Task {
                app_id: 0,
                arrival_cycle: 0,
                deadline: Some(50),
            });
        }
        for _ in 0..3 {
            apps[0].admit_model(1, Vec::new(), &mut next_model_id, &mut next_kernel_id, &mut kernels, &mut mc);
        }

        let sms = (0..4).map(|i| StreamingMultiprocessor::new(i, 2, 4, 2, 2, 4)).collect();
        let mut gpu = Gpu::new(sms, Gmmu::new(64, 10, 2, false, false));
        let mut sched = LazyBScheduler::new();

        let mut ctx = SchedulerCtx {
            apps: &mut apps,
            kernels: &mut kernels,
            gpu: &mut gpu,
            mc: &mut mc,
            cfg: &cfg,
            next_model_id: &mut next_model_id,
            next_kernel_id: &mut next_kernel_id,
            now: 0,
        };
        sched.admission(&mut ctx);

        let budgeted = ctx.apps[0].running_models.iter().filter(|m| !m.sm_budget.is_empty()).count();
        assert!(budgeted < 3, "at least one model should be held back once slack/batch budget is exhausted");
    }
}
