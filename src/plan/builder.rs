use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::{Manifest, Plan, Step, StepKind};
use crate::error::{Error, Result};

pub const DETECT_STEP: &str = "Detect hardware";
pub const RESTORE_POINT_STEP: &str = "Create restore point";
pub const UPDATE_RESET_STEP: &str = "Reset Windows Update components";
pub const NETWORK_RESET_STEP: &str = "Reset network stack";
pub const SFC_STEP: &str = "System file check";
pub const DISM_STEP: &str = "Component store repair";
pub const VERIFY_DRIVERS_STEP: &str = "Verify driver signatures";
pub const INSTALL_INF_STEP: &str = "Install driver INF";
pub const SCAN_DEVICES_STEP: &str = "Scan for hardware changes";
pub const FINALIZE_STEP: &str = "Finalize";

/// Build the concrete plan for `model_id`.
///
/// Always starts with the baseline repair sequence and ends with a finalize
/// step. Declared steps keep their list order; the `order` field is carried
/// as metadata only. Relative declared paths are resolved against `root`.
pub fn build_plan(manifest: &Manifest, model_id: &str, root: &Path) -> Result<Plan> {
    let model = manifest
        .model(model_id)
        .ok_or_else(|| Error::Manifest(format!("unknown model id: {}", model_id)))?;

    let mut plan = baseline();

    match &model.steps {
        Some(declared) => {
            for step in declared {
                let mut step = step.clone();
                step.path = step.path.map(|p| resolve_path(root, &p));

                let driver_dir = match &step.path {
                    Some(path)
                        if step.kind == StepKind::DriversInf
                            && (is_glob(path) || path.is_dir()) =>
                    {
                        Some(path.clone())
                    }
                    _ => None,
                };

                match driver_dir {
                    Some(dir) => {
                        for expanded in expand_drivers(&step, &dir) {
                            plan.push(expanded);
                        }
                    }
                    None => plan.push(step),
                }
            }
        }
        None => {
            let dir = root.join("drivers").join(model_id);
            if dir.is_dir() {
                debug!(dir = %dir.display(), "Legacy model, expanding driver folder");
                let template = Step::new(100, INSTALL_INF_STEP, StepKind::DriversInf);
                for expanded in expand_drivers(&template, &dir) {
                    plan.push(expanded);
                }
            }
        }
    }

    plan.push(Step::new(999, FINALIZE_STEP, StepKind::Finalize));
    info!(model_id, steps = plan.len(), "Plan built");
    Ok(plan)
}

fn baseline() -> Plan {
    Plan::new(vec![
        Step::new(1, DETECT_STEP, StepKind::Detect),
        Step::new(2, RESTORE_POINT_STEP, StepKind::RestorePoint),
        Step::new(3, UPDATE_RESET_STEP, StepKind::UpdateReset),
        Step::new(4, NETWORK_RESET_STEP, StepKind::NetworkReset),
        Step::new(5, SFC_STEP, StepKind::Sfc),
        Step::new(6, DISM_STEP, StepKind::Dism),
    ])
}

fn resolve_path(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

fn is_glob(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().contains(['*', '?', '[']))
        .unwrap_or(false)
}

/// Expand one driver declaration into verify, one install per INF, then scan.
/// The declared reboot flag moves to the trailing scan step.
fn expand_drivers(template: &Step, path: &Path) -> Vec<Step> {
    let (dir, infs) = if is_glob(path) {
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let pattern = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let infs = match glob::Pattern::new(&pattern) {
            Ok(pattern) => list_files(&dir, 1, |name| pattern.matches(name)),
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "Invalid driver pattern");
                Vec::new()
            }
        };
        (dir, infs)
    } else {
        let infs = list_files(path, usize::MAX, |name| {
            Path::new(name)
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("inf"))
                .unwrap_or(false)
        });
        (path.to_path_buf(), infs)
    };

    debug!(dir = %dir.display(), count = infs.len(), "Expanded driver folder");

    let mut steps = Vec::with_capacity(infs.len() + 2);
    steps.push(
        Step::new(template.order, VERIFY_DRIVERS_STEP, StepKind::DriversVerify).with_path(&dir),
    );
    for inf in infs {
        let mut step = Step::new(template.order, INSTALL_INF_STEP, StepKind::DriversInf)
            .with_path(inf)
            .with_args(template.args.clone());
        step.timeout_sec = template.timeout_sec;
        steps.push(step);
    }
    let mut scan = Step::new(template.order, SCAN_DEVICES_STEP, StepKind::DriversScan);
    scan.reboot = template.reboot;
    steps.push(scan);
    steps
}

fn list_files(dir: &Path, depth: usize, matches: impl Fn(&str) -> bool) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .max_depth(depth)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| matches(&e.file_name().to_string_lossy()))
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}
