use std::path::Path;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::{CommandSpec, Timeouts, Tools};
use crate::error::{Error, Result};
use crate::process::run_with_timeout;

/// Host operations behind the inline step handlers.
#[allow(async_fn_in_trait)]
pub trait SystemActions {
    async fn create_restore_point(&self, run_id: &str) -> Result<()>;
    async fn reset_update_components(&self) -> Result<()>;
    async fn reset_network(&self) -> Result<()>;
    async fn repair_boot(&self) -> Result<()>;
    /// `Ok(true)` when `path` carries a valid signature.
    async fn verify_signature(&self, path: &Path) -> Result<bool>;
    async fn reboot(&self) -> Result<()>;
}

/// [`SystemActions`] backed by the configured external tools.
#[derive(Debug, Clone)]
pub struct CommandActions {
    tools: Tools,
    timeout: Duration,
}

impl CommandActions {
    pub fn new(tools: Tools, timeouts: &Timeouts) -> Self {
        Self {
            tools,
            timeout: Duration::from_secs(timeouts.inline),
        }
    }

    async fn run(&self, spec: &CommandSpec, vars: &[(&str, &str)]) -> Result<i32> {
        let args = spec.render(vars);
        debug!(program = %spec.program, ?args, "Running inline command");
        run_with_timeout(&spec.program, &args, self.timeout).await
    }

    async fn run_checked(&self, spec: &CommandSpec, vars: &[(&str, &str)]) -> Result<()> {
        match self.run(spec, vars).await? {
            0 => Ok(()),
            code => Err(Error::Action(format!("{} exited with {}", spec.program, code))),
        }
    }

    /// Run every command; fail afterwards if any of them failed.
    async fn run_all(&self, specs: &[CommandSpec]) -> Result<()> {
        let mut failures = Vec::new();
        for spec in specs {
            if let Err(e) = self.run_checked(spec, &[]).await {
                warn!(program = %spec.program, error = %e, "Command failed");
                failures.push(e.to_string());
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Action(failures.join("; ")))
        }
    }
}

impl SystemActions for CommandActions {
    async fn create_restore_point(&self, run_id: &str) -> Result<()> {
        self.run_checked(&self.tools.restore_point, &[("run_id", run_id)])
            .await
    }

    async fn reset_update_components(&self) -> Result<()> {
        self.run_all(&self.tools.update_reset).await
    }

    async fn reset_network(&self) -> Result<()> {
        self.run_all(&self.tools.network_reset).await
    }

    async fn repair_boot(&self) -> Result<()> {
        self.run_all(&self.tools.boot_repair).await
    }

    async fn verify_signature(&self, path: &Path) -> Result<bool> {
        let path = path.to_string_lossy().into_owned();
        let code = self
            .run(&self.tools.signature_check, &[("path", path.as_str())])
            .await?;
        Ok(code == 0)
    }

    async fn reboot(&self) -> Result<()> {
        self.run_checked(&self.tools.reboot, &[]).await
    }
}
