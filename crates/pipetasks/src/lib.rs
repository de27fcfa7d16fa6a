//! Standard task library
//!
//! Built-in tasks and the example composites built from them

mod debug;
mod stats;
mod time;

pub use debug::{DebugTask, DebugTaskFactory};
pub use stats::{sigma_clip, ClippedStats, MeanTask, MeanTaskFactory, StdTask, StdTaskFactory};
pub use time::{DelayTask, DelayTaskFactory};

use pipecore::{NodeSpec, PipelineDef};
use piperuntime::TaskRegistry;
use std::sync::Arc;

/// Register all standard tasks and composites with a registry
pub fn register_all(registry: &mut TaskRegistry) {
    registry.register(Arc::new(debug::DebugTaskFactory));
    registry.register(Arc::new(time::DelayTaskFactory));
    registry.register(Arc::new(stats::MeanTaskFactory));
    registry.register(Arc::new(stats::StdTaskFactory));

    let defs = composites();
    tracing::debug!("Registering {} standard composites", defs.len());
    for def in defs {
        registry.register_composite(def);
    }
}

/// The example composites shipped with the library
pub fn composites() -> Vec<PipelineDef> {
    vec![
        PipelineDef::new(
            "all_stats",
            NodeSpec::sequential(
                "all_stats",
                vec![
                    NodeSpec::task("stats.mean")
                        .with_name("mean")
                        .with_config("num_sigma_clip", 3.0),
                    NodeSpec::task("stats.mean")
                        .with_name("mean_2")
                        .with_config("num_sigma_clip", 5.0),
                    NodeSpec::task("stats.std").with_name("std"),
                ],
            ),
        )
        .with_description("Clipped mean at 3 and 5 sigma, then the standard deviation"),
        PipelineDef::new(
            "stats_fanout",
            NodeSpec::parallel(
                "stats_fanout",
                vec![
                    NodeSpec::task("stats.mean").with_name("mean"),
                    NodeSpec::task("stats.std").with_name("std"),
                ],
            ),
        )
        .with_description("Mean and standard deviation computed side by side"),
        PipelineDef::new(
            "super_test",
            NodeSpec::sequential(
                "super_test",
                vec![
                    NodeSpec::task("debug.log")
                        .with_name("T1")
                        .with_config("message", "first"),
                    NodeSpec::task("debug.log")
                        .with_name("T2")
                        .with_config("message", "second"),
                ],
            ),
        )
        .with_description("Two debug tasks in sequence"),
    ]
}
