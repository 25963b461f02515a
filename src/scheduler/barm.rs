//! BARM: BASMD SM dispatch + TPMEMA memory allocation. Spec.md §4.7.2,
//! grounded in `original_source/src/Scheduler_BARM.cpp`.

use std::collections::HashMap;

use crate::ids::AppId;

use super::{launch_smallest_ready_layer, materialize_ready_tasks, SchedulerCtx, SchedulerPolicy};

pub struct BarmScheduler;

impl BarmScheduler {
    pub fn new() -> Self {
        BarmScheduler
    }
}

impl SchedulerPolicy for BarmScheduler {
    /// BASMD: `workload(app) = io_mem * |running_models| + filter_mem`,
    /// proportionally rounded to SMs, ascending-sorted so the lightest app
    /// gets its share first; leftover SM goes to `mAPPs.front()` — the
    /// index-0 application, not the sorted-smallest-workload one.
    fn admission(&mut self, ctx: &mut SchedulerCtx) {
        materialize_ready_tasks(ctx);

        for app in ctx.apps.iter_mut() {
            app.sm_budget.clear();
        }

        let Some(first_app_id) = ctx.apps.first().map(|a| a.app_id) else { return };

        let mut workloads: Vec<(AppId, u64)> = ctx
            .apps
            .iter()
            .map(|app| {
                let workload = app.model_info.io_mem_count * app.running_models.len() as u64 + app.model_info.filter_mem_count;
                (app.app_id, workload)
            })
            .collect();
        if workloads.is_empty() {
            return;
        }
        workloads.sort_by_key(|&(_, w)| w);

        let total: u64 = workloads.iter().map(|&(_, w)| w).sum();
        let sm_total = ctx.gpu.sm_count() as u64;

        let mut sm_count: u64 = 0;
        for &(app_id, workload) in &workloads {
            if total == 0 {
                break;
            }
            let sm_num = ((sm_total as f64 * workload as f64 / total as f64).round() as u64).max(1);
            let app = ctx.app_mut(app_id);
            for _ in 0..sm_num {
                if sm_count == sm_total {
                    break;
                }
                app.sm_budget.push(sm_count as u32);
                sm_count += 1;
            }
        }
        if sm_count < sm_total {
            ctx.app_mut(first_app_id).sm_budget.push(sm_count as u32);
        }
    }

    fn kernel_launch(&mut self, ctx: &mut SchedulerCtx) {
        launch_smallest_ready_layer(ctx);
    }

    /// TPMEMA: demand-weighted memory allocation, sorted ascending by each
    /// app's outstanding page demand (running + queued kernels).
    fn memory_allocation(&mut self, ctx: &mut SchedulerCtx) {
        ctx.gpu.gmmu.set_cgroup_type(true);

        let mut demand: HashMap<AppId, u64> = HashMap::new();
        for kernel in ctx.kernels.values() {
            if kernel.running || !kernel.finish {
                *demand.entry(kernel.app_id).or_default() += kernel.num_of_memory.div_ceil(ctx.cfg.page_size);
            }
        }

        let mut budget: Vec<(AppId, u64)> = demand.into_iter().collect();
        if budget.is_empty() {
            return;
        }
        budget.sort_by_key(|&(_, d)| d);

        let mut remaining = ctx.cfg.vram_pages();
        let mut apps_left = budget.len() as u64;
        for (_, pages) in budget.iter_mut() {
            if remaining < *pages {
                *pages = remaining / apps_left;
            }
            remaining -= *pages;
            apps_left -= 1;
        }

        let extra = remaining / budget.len() as u64;
        for (_, pages) in budget.iter_mut() {
            *pages += extra;
            remaining -= extra;
        }

        for (_, pages) in budget.iter_mut() {
            if remaining == 0 {
                break;
            }
            *pages += 1;
            remaining -= 1;
        }

        for (app_id, pages) in budget {
            ctx.gpu.gmmu.set_cgroup_size(app_id, pages);
        }
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

    /// Spec.md §8 scenario 5: workloads (10, 30, 60), SM_TOTAL = 10 ->
    /// budgets (1, 3, 6) with the rounding residue given to `apps[0]`.
    #[test]
    fn basmd_assigns_sms_proportionally_to_workload() {
        let cfg = SimConfig::default();
        let mut apps: Vec<Application> = (0..3).map(|i| Application::new(i, "LeNet", 0, 0, None)).collect();
        apps[0].model_info.filter_mem_count = 10;
        apps[1].model_info.filter_mem_count = 30;
        apps[2].model_info.filter_mem_count = 60;

        let sms = (0..10).map(|i| StreamingMultiprocessor::new(i, 2, 4, 2, 2, 4)).collect();
        let mut gpu = Gpu::new(sms, Gmmu::new(64, 10, 2, false, false));
        let mut mc = MemoryController::new(1 << 30, cfg.page_size, false);
        let mut kernels = std::collections::HashMap::new();
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
        let mut sched = BarmScheduler::new();
        sched.admission(&mut ctx);

        assert_eq!(ctx.apps[0].sm_budget.len(), 1);
        assert_eq!(ctx.apps[1].sm_budget.len(), 3);
        assert_eq!(ctx.apps[2].sm_budget.len(), 6);
    }
}
