//! Baseline / Greedy admission, the shared launcher, and the None/Average
//! memory allocators. Spec.md §4.7.1, grounded in
//! `original_source/src/Scheduler_Baseline.cpp` and
//! `src/Scheduler_Average.cpp`.

use crate::ids::SHARED_CGROUP_ID;

use super::{launch_smallest_ready_layer, materialize_ready_tasks, SchedulerCtx, SchedulerPolicy};

/// Baseline admission hands every application the full SM set; Greedy
/// (`Scheduler_Baseline`'s sequential-inference sibling, spec.md §6
/// `INFERENCE_MODE::Sequential`) only does so once every SM is idle, so at
/// most one application runs at a time.
pub struct BaselineScheduler {
    greedy: bool,
}

impl BaselineScheduler {
    pub fn new(greedy: bool) -> Self {
        BaselineScheduler { greedy }
    }
}

impl SchedulerPolicy for BaselineScheduler {
    fn admission(&mut self, ctx: &mut SchedulerCtx) {
        materialize_ready_tasks(ctx);

        if self.greedy {
            let all_idle = ctx.gpu.get_idle_sms().len() == ctx.gpu.sm_count();
            if !all_idle {
                return;
            }
        }

        let sm_budget: Vec<_> = (0..ctx.gpu.sm_count() as u32).collect();
        for app in ctx.apps.iter_mut() {
            app.sm_budget = sm_budget.clone();
            for model in app.waiting_models.drain(..) {
                app.running_models.push(model);
            }
        }
    }

    fn kernel_launch(&mut self, ctx: &mut SchedulerCtx) {
        launch_smallest_ready_layer(ctx);
    }

    /// `Memory_Allocator` (`None`): one shared cgroup sized to the full
    /// VRAM budget, keyed by the `-1` wildcard (spec.md §4.7.1).
    fn memory_allocation(&mut self, ctx: &mut SchedulerCtx) {
        ctx.gpu.gmmu.set_cgroup_type(false);
        ctx.gpu.gmmu.set_cgroup_size(SHARED_CGROUP_ID, ctx.cfg.vram_pages());
    }
}

/// `Memory_Allocator::Average`: splits VRAM evenly across applications,
/// handing any remainder one page at a time to the earliest app ids.
/// Standalone allocator (§4.7.5), usable by any admission/launcher pair.
pub fn average_memory_allocation(ctx: &mut SchedulerCtx) {
    ctx.gpu.gmmu.set_cgroup_type(true);

    let app_ids: Vec<_> = ctx.apps.iter().map(|a| a.app_id).collect();
    if app_ids.is_empty() {
        return;
    }

    let total_pages = ctx.cfg.vram_pages();
    let share = total_pages / app_ids.len() as u64;
    let mut remainder = total_pages % app_ids.len() as u64;

    for app_id in app_ids {
        let extra = if remainder > 0 {
            remainder -= 1;
            1
        } else {
            0
        };
        ctx.gpu.gmmu.set_cgroup_size(app_id, share + extra);
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
    use std::collections::HashMap;

    fn ctx_fixture(app_count: i32) -> (Vec<Application>, Gpu, MemoryController, SimConfig) {
        let cfg = SimConfig::default();
        let apps = (0..app_count).map(|i| Application::new(i, "LeNet", 1, 0, None)).collect();
        let sms = (0..4).map(|i| StreamingMultiprocessor::new(i, 2, 4, 2, 2, 4)).collect();
        let gmmu = Gmmu::new(64, 10, 2, false, false);
        (apps, Gpu::new(sms, gmmu), MemoryController::new(1 << 30, cfg.page_size, false), cfg)
    }

    #[test]
    fn baseline_admission_grants_every_app_the_full_sm_set() {
        let (mut apps, mut gpu, mut mc, cfg) = ctx_fixture(2);
        let mut kernels = HashMap::new();
        let mut next_model_id = 0;
        let mut next_kernel_id = 0;
        let mut sched = BaselineScheduler::new(false);

        apps[0].waiting_models.push(crate::application::ModelRuntime {
            model_id: 0,
            app_id: 0,
            name: "LeNet",
            batch_size: 1,
            deadline: None,
            kernel_ids: vec![],
            sm_budget: vec![],
        });

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

        assert_eq!(ctx.apps[0].sm_budget.len(), 4);
        assert_eq!(ctx.apps[1].sm_budget.len(), 4);
        assert_eq!(ctx.apps[0].running_models.len(), 1);
    }

    #[test]
    fn average_memory_split_gives_remainder_to_earliest_apps() {
        let (mut apps, mut gpu, mut mc, mut cfg) = ctx_fixture(3);
        cfg.vram_space = cfg.page_size * 10; // 10 pages / 3 apps -> 3,3,3 + 1 remainder
        let mut kernels = HashMap::new();
        let mut next_model_id = 0;
        let mut next_kernel_id = 0;
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
        average_memory_allocation(&mut ctx);
        assert_eq!(ctx.gpu.gmmu.cgroup_capacity(0), 4);
        assert_eq!(ctx.gpu.gmmu.cgroup_capacity(1), 3);
        assert_eq!(ctx.gpu.gmmu.cgroup_capacity(2), 3);
    }
}
