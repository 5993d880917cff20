mod builder;
pub mod inf;
mod manifest;
mod step;

pub use builder::{
    build_plan, DETECT_STEP, DISM_STEP, FINALIZE_STEP, INSTALL_INF_STEP, NETWORK_RESET_STEP,
    RESTORE_POINT_STEP, SCAN_DEVICES_STEP, SFC_STEP, UPDATE_RESET_STEP, VERIFY_DRIVERS_STEP,
};
pub use manifest::{Manifest, ModelEntry, Resolution, ResolvedBy};
pub use step::{Plan, Step, StepKind};
