//! SALBI: WASMD (workload-aware SM dispatch, weighted by bias-to-batch
//! ratio) + ORBIS (page-fault-ratio memory allocation and batch launch).
//! Spec.md §4.7.4, grounded in `original_source/src/Scheduler_SALBI.cpp`
//! (named `Scheduler_My` there).

use std::collections::HashMap;

use crate::ids::{AppId, KernelId};
use crate::request::KernelGroup;

use super::{materialize_ready_tasks, SchedulerCtx, SchedulerPolicy};

pub struct SalbiScheduler;

impl SalbiScheduler {
    pub fn new() -> Self {
        SalbiScheduler
    }
}

impl SchedulerPolicy for SalbiScheduler {
    /// WASMD: like BARM's BASMD, but workload is biased by
    /// `BBR = filter_mem / (io_mem + filter_mem)`.
    fn admission(&mut self, ctx: &mut SchedulerCtx) {
        // Flipped here, before `kernel_launch` reads per-app cgroup
        // capacities into NPA — flipping in `memory_allocation` (which runs
        // *after* `kernel_launch` in the trait's admission -> launch ->
        // memory order) would leave tick 1's ORBIS allocation computed
        // against the still-Shared cgroup.
        ctx.gpu.gmmu.set_cgroup_type(true);

        materialize_ready_tasks(ctx);

        for app in ctx.apps.iter_mut() {
            app.sm_budget.clear();
        }

        let mut workloads: Vec<(AppId, f64)> = ctx
            .apps
            .iter()
            .filter(|a| !a.running_models.is_empty())
            .map(|app| {
                let np = (app.model_info.io_mem_count * app.running_models.len() as u64 + app.model_info.filter_mem_count) as f64;
                let denom = (app.model_info.io_mem_count + app.model_info.filter_mem_count).max(1) as f64;
                let bbr = app.model_info.filter_mem_count as f64 / denom;
                (app.app_id, np * bbr)
            })
            .collect();
        if workloads.is_empty() {
            return;
        }
        workloads.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());

        let total: f64 = workloads.iter().map(|&(_, w)| w).sum();
        let sm_total = ctx.gpu.sm_count() as u64;

        let mut sm_count: u64 = 0;
        for &(app_id, workload) in &workloads {
            if total <= 0.0 {
                break;
            }
            let sm_num = ((sm_total as f64 * workload / total).round() as u64).max(1);
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
            let first_app_id = workloads[0].0;
            ctx.app_mut(first_app_id).sm_budget.push(sm_count as u32);
        }
    }

    /// ORBIS's memory half: computed and applied together with the batch
    /// launcher in `kernel_launch`, since the page-fault-ratio ordering it
    /// produces drives both (§4.7.4). `cgroup_mode` is flipped to PerApp in
    /// `admission` (before `kernel_launch` runs), so this phase is a no-op.
    fn memory_allocation(&mut self, _ctx: &mut SchedulerCtx) {}

    /// ORBIS: computes NP/NPA, sorts by page-fault ratio, tops up VRAM
    /// allocation in that order, re-ranks with blocking SMs folded in, then
    /// launches each launchable app's batch.
    fn kernel_launch(&mut self, ctx: &mut SchedulerCtx) {
        let page_size = ctx.cfg.page_size;

        // NP: VRAM bytes currently owed by running + queued kernels.
        let mut np: HashMap<AppId, u64> = HashMap::new();
        for kernel in ctx.kernels.values() {
            if kernel.running || (!kernel.finish && kernel.start_cycle.is_none() && !kernel.sm_set.is_empty()) {
                *np.entry(kernel.app_id).or_default() += kernel.num_of_memory;
            }
        }

        // NPA: current cgroup size in bytes.
        let app_ids: Vec<AppId> = ctx.apps.iter().map(|a| a.app_id).collect();
        let mut npa: HashMap<AppId, u64> = HashMap::new();
        for &app_id in &app_ids {
            npa.insert(app_id, ctx.gpu.gmmu.cgroup_capacity(app_id) as u64 * page_size);
        }

        // Ready kernels of apps with no layer currently executing.
        let mut ready: HashMap<AppId, Vec<KernelId>> = HashMap::new();
        for &app_id in &app_ids {
            if np.contains_key(&app_id) {
                continue;
            }
            let app = ctx.apps.iter_mut().find(|a| a.app_id == app_id).expect("unknown app_id");
            let mut candidates: Vec<KernelId> = Vec::new();
            for model in &app.running_models {
                candidates.extend(model.smallest_ready_layer_kernels(ctx.kernels));
            }
            if candidates.is_empty() {
                continue;
            }
            let min_layer = candidates.iter().filter_map(|k| ctx.kernels.get(k).map(|k| k.layer_id)).min();
            candidates.retain(|k| ctx.kernels.get(k).map(|k| k.layer_id) == min_layer);

            if let Some(&first) = candidates.first() {
                let kernel = ctx.kernels.get(&first).expect("candidate kernel vanished");
                *np.entry(app_id).or_default() += kernel.filter_mem + (kernel.ifmap_mem + kernel.ofmap_mem) * candidates.len() as u64;
            }
            ready.insert(app_id, candidates);
        }

        if np.is_empty() {
            return;
        }

        let sm_budget_len: HashMap<AppId, u64> = app_ids.iter().map(|&id| (id, ctx.app_mut(id).sm_budget.len().max(1) as u64)).collect();

        let pfr = |np_v: u64, npa_v: u64, sm_len: u64| -> f64 { np_v as f64 * (np_v as i64 - npa_v as i64 + 1) as f64 / sm_len.max(1) as f64 };

        let mut pfr_list: Vec<(AppId, f64)> = np.keys().map(|&id| (id, pfr(np[&id], *npa.get(&id).unwrap_or(&0), sm_budget_len[&id]))).collect();
        pfr_list.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());

        let mut memory_budget: i64 = ctx.cfg.vram_space as i64 - npa.values().map(|&v| v as i64).sum::<i64>();
        for &(app_id, _) in &pfr_list {
            let np_v = np[&app_id] as i64;
            let npa_v = *npa.get(&app_id).unwrap_or(&0) as i64;
            if npa_v > 0 {
                let diff = np_v - npa_v;
                let new_alloc = diff.min(memory_budget).max(0);
                *npa.get_mut(&app_id).unwrap() += new_alloc as u64;
                memory_budget -= new_alloc;
            } else if np_v <= memory_budget {
                npa.insert(app_id, np_v as u64);
                memory_budget -= np_v;
            } else {
                *npa.get_mut(&app_id).unwrap() += memory_budget.max(0) as u64;
                memory_budget = 0;
            }
        }

        for (&app_id, &bytes) in npa.iter() {
            ctx.gpu.gmmu.set_cgroup_size(app_id, bytes / page_size);
        }

        // Blocking SMs: budgets of ready apps that ended up with zero allocation.
        let mut blocking_sms: Vec<u32> = Vec::new();
        for &app_id in ready.keys() {
            if *npa.get(&app_id).unwrap_or(&0) == 0 {
                blocking_sms.extend(ctx.app_mut(app_id).sm_budget.clone());
            }
        }

        // Re-rank with blocking SMs folded into the divisor for ready apps.
        for (app_id, score) in pfr_list.iter_mut() {
            if ready.contains_key(app_id) {
                let np_v = np[app_id];
                let npa_v = *npa.get(app_id).unwrap_or(&0);
                let divisor = sm_budget_len[app_id] + blocking_sms.len() as u64;
                *score = pfr(np_v, npa_v, divisor);
            }
        }
        pfr_list.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());

        let lowest_pfr_app = pfr_list.first().map(|&(id, _)| id);

        for (app_id, _) in pfr_list {
            let Some(kernel_list) = ready.get(&app_id) else { continue };
            if kernel_list.is_empty() || *npa.get(&app_id).unwrap_or(&0) == 0 {
                continue;
            }

            let first_kernel = ctx.kernels.get(&kernel_list[0]).expect("ready kernel vanished");
            let is_dense = first_kernel.is_dense;
            let npa_bytes = npa[&app_id] as i64;
            let denom = (first_kernel.ifmap_mem + first_kernel.ofmap_mem).max(1) as i64;
            let mut batch_size = (((npa_bytes - first_kernel.filter_mem as i64) as f64 / denom as f64).ceil() as i64).max(1) as usize;
            if is_dense {
                batch_size = kernel_list.len();
            }
            batch_size = batch_size.min(kernel_list.len());

            let mut sm_set = ctx.app_mut(app_id).sm_budget.clone();
            if Some(app_id) == lowest_pfr_app && !blocking_sms.is_empty() {
                for sm in &blocking_sms {
                    if !sm_set.contains(sm) {
                        sm_set.push(*sm);
                    }
                }
            }

            let members: Vec<(KernelId, u32)> = kernel_list.iter().take(batch_size).map(|&k| (k, 1)).collect();
            let group = KernelGroup { members };
            for (kernel_id, _) in &group.members {
                let kernel = ctx.kernels.get_mut(kernel_id).expect("ready kernel vanished");
                kernel.sm_set = sm_set.clone();
                ctx.gpu.launch_kernel(kernel);
            }
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

    #[test]
    fn wasmd_gives_higher_bbr_app_more_sms() {
        let cfg = SimConfig::default();
        let mut apps = vec![Application::new(0, "ResNet18", 1, 0, None), Application::new(1, "VGG16", 1, 0, None)];
        let mut mc = MemoryController::new(1 << 30, cfg.page_size, false);
        let mut kernels = HashMap::new();
        let mut next_model_id = 0u64;
        let mut next_kernel_id = 0u64;

        // Make app 0's filter:io ratio (BBR) much higher than app 1's.
        apps[0].model_info.filter_mem_count = 900;
        apps[0].model_info.io_mem_count = 100;
        apps[1].model_info.filter_mem_count = 100;
        apps[1].model_info.io_mem_count = 900;

        apps[0].admit_model(1, Vec::new(), &mut next_model_id, &mut next_kernel_id, &mut kernels, &mut mc);
        apps[1].admit_model(1, Vec::new(), &mut next_model_id, &mut next_kernel_id, &mut kernels, &mut mc);

        let sms = (0..8).map(|i| StreamingMultiprocessor::new(i, 2, 4, 2, 2, 4)).collect();
        let mut gpu = Gpu::new(sms, Gmmu::new(64, 10, 2, false, false));
        let mut sched = SalbiScheduler::new();

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

        assert!(ctx.apps[0].sm_budget.len() > ctx.apps[1].sm_budget.len());
    }
}
