//! Driver binary: builds a `TASK_MODE` application set, runs the
//! simulator to completion (or a cycle ceiling), and logs a final report.
//! Grounded in `original_source/src/main.cpp`'s fixed-app-set startup.

use gpusim::application::Application;
use gpusim::config::{SimConfig, TaskMode};
use gpusim::metrics::write_metrics;
use gpusim::simulator::Simulator;

const MAX_CYCLES: u64 = 1_000_000;

/// Instantiates the fixed application set named by `cfg.task_mode`, mirroring
/// the original's `TASK_MODE`-gated `#ifdef` blocks in `main.cpp`.
fn build_apps(cfg: &SimConfig) -> Vec<Application> {
    let deadline_offset = if cfg.enable_deadline { Some(20_000) } else { None };
    let one = |app_id, model: &'static str| Application::new(app_id, model, 4, 0, deadline_offset);

    match cfg.task_mode {
        TaskMode::LeNet | TaskMode::Light => vec![one(0, "LeNet")],
        TaskMode::CaffeNet => vec![one(0, "CaffeNet")],
        TaskMode::ResNet18 => vec![one(0, "ResNet18")],
        TaskMode::Vgg16 => vec![one(0, "VGG16")],
        TaskMode::GoogleNet => vec![one(0, "GoogleNet")],
        TaskMode::Heavy => vec![one(0, "ResNet18"), one(1, "VGG16")],
        TaskMode::Mix => vec![one(0, "LeNet"), one(1, "ResNet18")],
        TaskMode::All => vec![
            one(0, "LeNet"),
            one(1, "CaffeNet"),
            one(2, "ResNet18"),
            one(3, "VGG16"),
            one(4, "GoogleNet"),
        ],
        TaskMode::Test1 => vec![one(0, "LeNet"), one(1, "LeNet")],
        TaskMode::Test2 => vec![one(0, "CaffeNet"), one(1, "ResNet18"), one(2, "VGG16")],
    }
}

fn main() {
    env_logger::init();

    let cfg = SimConfig::default();
    let apps = build_apps(&cfg);
    log::info!("starting run: scheduler={:?} task_mode={:?} apps={}", cfg.scheduler_mode, cfg.task_mode, apps.len());

    let mut sim = Simulator::new(cfg, apps);
    let report = sim.run(MAX_CYCLES);
    write_metrics(&sim.snapshot());

    log::info!(
        "run finished: cycles={} apps_finished={}/{} kernels_finished={}",
        report.cycles,
        report.apps_finished,
        report.apps_total,
        report.finished_kernels,
    );
    println!(
        "cycles={} apps_finished={}/{} kernels_finished={}",
        report.cycles, report.apps_finished, report.apps_total, report.finished_kernels,
    );
}
