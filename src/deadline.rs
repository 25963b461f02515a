//! Deadline enforcement: runs before admission on every CPU tick when
//! enabled. Spec.md §4.8, grounded in
//! `original_source/src/Scheduler.cpp::missDeadlineHandler`.

use std::collections::HashMap;

use log::error;

use crate::application::{Application, ModelRuntime};
use crate::gpu::Gpu;
use crate::ids::{KernelId, ModelId};
use crate::layer::ModelTopology;
use crate::memory::MemoryController;
use crate::request::Kernel;

/// Declares a model missed iff its deadline minus remaining execute time
/// has already passed. Terminates it through `Gpu::terminate_model` and
/// logs the miss record (spec.md §6).
pub fn run(apps: &mut [Application], kernels: &mut HashMap<KernelId, Kernel>, gpu: &mut Gpu, mc: &MemoryController, now: u64) {
    for app in apps.iter_mut() {
        let topology = ModelTopology::build(app.model_type, 1);

        let mut missed: Vec<ModelId> = Vec::new();

        app.waiting_models.retain(|model| {
            if has_missed(model, kernels, &topology, now) {
                missed.push(model.model_id);
                false
            } else {
                true
            }
        });

        let mut still_running = Vec::new();
        for model in app.running_models.drain(..) {
            if has_missed(&model, kernels, &topology, now) {
                missed.push(model.model_id);
            } else {
                still_running.push(model);
            }
        }
        app.running_models = still_running;

        for model_id in missed {
            error!(
                "Model {} miss deadline! app {}",
                model_id, app.app_id
            );
            gpu.terminate_model(app.app_id, model_id, kernels, mc);
            app.retire_model(model_id);
        }
    }
}

fn has_missed(model: &ModelRuntime, kernels: &HashMap<KernelId, Kernel>, topology: &ModelTopology, now: u64) -> bool {
    let Some(deadline) = model.deadline else { return false };
    let remaining = model.remaining_execute_cycles(kernels, topology);
    deadline.saturating_sub(remaining) <= now
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gmmu::Gmmu;
    use crate::sm::StreamingMultiprocessor;

    #[test]
    fn model_past_deadline_is_terminated_and_retired() {
        let mut kernels = HashMap::new();
        let mut mc = MemoryController::new(1 << 30, 4096, false);
        let mut app = Application::new(0, "LeNet", 1, 0, Some(0)); // deadline == arrival: always missed
        let mut next_model_id = 0u64;
        let mut next_kernel_id = 0u64;
        app.admit_model(1, vec![0], &mut next_model_id, &mut next_kernel_id, &mut kernels, &mut mc);
        assert_eq!(app.running_models.len(), 1);

        let sm = StreamingMultiprocessor::new(0, 1, 1, 1, 1, 4);
        let gmmu = Gmmu::new(64, 10, 2, false, false);
        let mut gpu = Gpu::new(vec![sm], gmmu);

        run(std::slice::from_mut(&mut app), &mut kernels, &mut gpu, &mc, 100);
        assert!(app.running_models.is_empty());
    }
}
