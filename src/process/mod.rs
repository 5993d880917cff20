mod progress;
mod runner;

pub use progress::{ProgressMatcher, DEFAULT_PATTERN, DISM_PATTERNS, SFC_PATTERNS};
pub use runner::{run_with_progress, run_with_timeout, ProcessOutput, TIMEOUT_EXIT_CODE};
