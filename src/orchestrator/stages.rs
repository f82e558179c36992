//! Stage plan preparation: probe extraction and argument template rendering.

use crate::config::SupervisorConfig;
use crate::models::{StageKind, StageSpec};
use std::path::{Path, PathBuf};

/// Values substituted into stage argument templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageContext {
    pub outdir: PathBuf,
    pub iterations: u32,
    pub rng_bytes: u32,
    pub tcti: String,
}

impl StageContext {
    pub fn new(config: &SupervisorConfig, outdir: &Path) -> Self {
        StageContext {
            outdir: outdir.to_path_buf(),
            iterations: config.profile.iterations(),
            rng_bytes: config.profile.rng_bytes(),
            tcti: config.tcti.clone(),
        }
    }

    /// Context of `stage`, whose output lands in `<run_dir>/<output_subdir>`.
    pub fn for_stage(&self, run_dir: &Path, stage: &StageSpec) -> Self {
        StageContext {
            outdir: run_dir.join(&stage.output_subdir),
            ..self.clone()
        }
    }
}

/// Substitute `{outdir}`, `{iterations}`, `{rng_bytes}` and `{tcti}` in the stage arguments.
pub fn render_args(stage: &StageSpec, ctx: &StageContext) -> Vec<String> {
    let outdir = ctx.outdir.to_string_lossy();
    stage
        .args
        .iter()
        .map(|arg| {
            arg.replace("{outdir}", &outdir)
                .replace("{iterations}", &ctx.iterations.to_string())
                .replace("{rng_bytes}", &ctx.rng_bytes.to_string())
                .replace("{tcti}", &ctx.tcti)
        })
        .collect()
}

/// Pull the capability probe out of the plan; a default probe is used when none is queued.
pub fn split_probe(stages: Vec<StageSpec>) -> (StageSpec, Vec<StageSpec>) {
    let mut probe = None;
    let mut rest = Vec::with_capacity(stages.len());
    for stage in stages {
        if probe.is_none() && stage.kind == StageKind::CapabilityProbe {
            probe = Some(stage);
        } else if stage.kind != StageKind::CapabilityProbe {
            rest.push(stage);
        }
    }
    (probe.unwrap_or_else(StageSpec::capability_probe), rest)
}
