//! Scheduler family: a uniform three-phase (Admission → Kernel Launch →
//! Memory Allocation) interface over pluggable policies. Spec.md §4.7,
//! grounded in `original_source/src/include/Scheduler.hpp`'s abstract
//! base and its four concrete subclasses. Spec.md §9's "policy dispatch
//! via function-pointer fields... replace with a tagged enum" design note
//! is implemented here as `SchedulerPolicy`.

mod barm;
mod baseline;
mod lazy_batching;
mod salbi;

use std::collections::HashMap;

use crate::application::Application;
use crate::config::{SchedulerMode, SimConfig};
use crate::gpu::Gpu;
use crate::ids::{AppId, KernelId, ModelId};
use crate::memory::MemoryController;
use crate::request::Kernel;

/// Everything a scheduler phase needs, gathered per spec.md §9's
/// `SimulatorContext` note so no phase carries its own copy of shared
/// state.
pub struct SchedulerCtx<'a> {
    pub apps: &'a mut [Application],
    pub kernels: &'a mut HashMap<KernelId, Kernel>,
    pub gpu: &'a mut Gpu,
    pub mc: &'a mut MemoryController,
    pub cfg: &'a SimConfig,
    pub next_model_id: &'a mut ModelId,
    pub next_kernel_id: &'a mut KernelId,
    pub now: u64,
}

impl<'a> SchedulerCtx<'a> {
    fn app_mut(&mut self, app_id: AppId) -> &mut Application {
        self.apps.iter_mut().find(|a| a.app_id == app_id).expect("unknown app_id")
    }
}

pub trait SchedulerPolicy {
    fn admission(&mut self, ctx: &mut SchedulerCtx);
    fn kernel_launch(&mut self, ctx: &mut SchedulerCtx);
    fn memory_allocation(&mut self, ctx: &mut SchedulerCtx);

    fn run_tick(&mut self, ctx: &mut SchedulerCtx) {
        self.admission(ctx);
        self.kernel_launch(ctx);
        self.memory_allocation(ctx);
    }
}

/// Tagged dispatch over the concrete policy family, replacing the
/// original's virtual `Scheduler*` class hierarchy.
pub enum Scheduler {
    Baseline(baseline::BaselineScheduler),
    Barm(barm::BarmScheduler),
    LazyB(lazy_batching::LazyBScheduler),
    Salbi(salbi::SalbiScheduler),
}

impl Scheduler {
    pub fn new(mode: SchedulerMode) -> Self {
        match mode {
            SchedulerMode::Baseline => Scheduler::Baseline(baseline::BaselineScheduler::new(false)),
            SchedulerMode::Greedy => Scheduler::Baseline(baseline::BaselineScheduler::new(true)),
            SchedulerMode::Barm => Scheduler::Barm(barm::BarmScheduler::new()),
            SchedulerMode::LazyB => Scheduler::LazyB(lazy_batching::LazyBScheduler::new()),
            // `Scheduler_My` is SALBI's experimental predecessor; dispatch to SALBI (spec.md §6).
            SchedulerMode::My | SchedulerMode::Salbi => Scheduler::Salbi(salbi::SalbiScheduler::new()),
        }
    }

    pub fn run_tick(&mut self, ctx: &mut SchedulerCtx) {
        match self {
            Scheduler::Baseline(s) => s.run_tick(ctx),
            Scheduler::Barm(s) => s.run_tick(ctx),
            Scheduler::LazyB(s) => s.run_tick(ctx),
            Scheduler::Salbi(s) => s.run_tick(ctx),
        }
    }
}

/// Materializes newly-arrived tasks into `waiting_models`, one model per
/// call, sized by `batch_mode`. Shared by every admission phase — the
/// original's `Dynamic_Batch_Admission` inlines this same step before its
/// SM-budget math.
fn materialize_ready_tasks(ctx: &mut SchedulerCtx) {
    let batch_mode = ctx.cfg.batch_mode;
    for app in ctx.apps.iter_mut() {
        if !app.running_models.is_empty() || !app.waiting_models.is_empty() || app.task_queue.is_empty() {
            continue;
        }
        let batch_size = match batch_mode {
            crate::config::BatchMode::Disable => 1,
            crate::config::BatchMode::Max => app.task_queue.len() as u32,
        };
        // Compiled directly into `running_models`; `sm_budget` is filled
        // in by the caller's SM-dispatch step a moment later.
        app.admit_model(batch_size, Vec::new(), ctx.next_model_id, ctx.next_kernel_id, ctx.kernels, ctx.mc);
    }
}

/// For each app with a nonempty, fully-idle `sm_budget`, launches the
/// smallest-ready-layer-id kernel set of its head running model. Shared
/// launcher used by Baseline and BARM (§4.7.1's `Inference_Launcher`).
fn launch_smallest_ready_layer(ctx: &mut SchedulerCtx) {
    let idle = ctx.gpu.get_idle_sms();
    let app_ids: Vec<AppId> = ctx.apps.iter().map(|a| a.app_id).collect();

    for app_id in app_ids {
        let sm_budget = ctx.app_mut(app_id).sm_budget.clone();
        if sm_budget.is_empty() || !sm_budget.iter().all(|s| idle.contains(s)) {
            continue;
        }

        let ready = {
            let app = ctx.apps.iter_mut().find(|a| a.app_id == app_id).expect("unknown app_id");
            let Some(model) = app.running_models.first() else { continue };
            model.smallest_ready_layer_kernels(ctx.kernels)
        };
        for kernel_id in ready {
            let kernel = ctx.kernels.get_mut(&kernel_id).expect("ready kernel vanished");
            kernel.sm_set = sm_budget.clone();
            ctx.gpu.launch_kernel(kernel);
        }
    }
}
