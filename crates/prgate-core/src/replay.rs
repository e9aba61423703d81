//! Container replay.
//!
//! The container job runs the same stage sequence as bare metal, inside a
//! detached container started from a freshly built (never published) image.
//! Commands reach the container through `ContainerExecutor`; only the build,
//! start and teardown commands run on the host.

use std::sync::Arc;

use prgate_env::{
    CommandExecutor, CommandSpec, ContainerExecutor, Environment, ExecutionTarget, Invocation,
};
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::pipeline::JobContext;

#[derive(Debug, Clone)]
pub struct ContainerReplay {
    runtime: String,
    context: String,
    dockerfile: String,
    image_ref: String,
    container_name: String,
    workdir: String,
    run_args: Vec<String>,
    keepalive: Vec<String>,
    remote: String,
}

impl ContainerReplay {
    /// Image and container names are derived from the job context so that
    /// replaying the same commit yields the same commands.
    pub fn new(config: &PipelineConfig, ctx: &JobContext) -> Self {
        let c = &config.container;
        let tag = ctx.tag();
        Self {
            runtime: c.runtime.clone(),
            context: c.context.clone(),
            dockerfile: c.dockerfile.clone(),
            image_ref: format!("{}:{}", c.image, tag),
            container_name: format!("prgate-{}", tag),
            workdir: c.workdir.clone(),
            run_args: c.run_args.clone(),
            keepalive: c.keepalive.clone(),
            remote: config.source.remote.clone(),
        }
    }

    pub fn image_ref(&self) -> &str {
        &self.image_ref
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    /// Build from the fixed context and Dockerfile. Nothing is pushed.
    pub fn build_command(&self) -> CommandSpec {
        CommandSpec::argv([
            self.runtime.as_str(),
            "build",
            "-f",
            self.dockerfile.as_str(),
            "-t",
            self.image_ref.as_str(),
            self.context.as_str(),
        ])
    }

    pub fn start_command(&self) -> CommandSpec {
        let mut argv = vec![
            self.runtime.clone(),
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            self.container_name.clone(),
        ];
        argv.extend(self.run_args.iter().cloned());
        argv.push(self.image_ref.clone());
        argv.extend(self.keepalive.iter().cloned());
        CommandSpec::Argv(argv)
    }

    pub fn teardown_command(&self) -> CommandSpec {
        CommandSpec::argv([self.runtime.as_str(), "rm", "-f", self.container_name.as_str()])
    }

    /// Bring the image's checkout to the reviewed ref.
    pub fn sync_commands(&self, ctx: &JobContext) -> Vec<CommandSpec> {
        vec![
            CommandSpec::argv(["git", "reset", "--hard"]),
            CommandSpec::argv(["git", "fetch", self.remote.as_str()]),
            CommandSpec::argv(["git", "checkout", ctx.checkout_target(&self.remote).as_str()]),
        ]
    }

    /// The job environment: every command runs inside the container, in the
    /// image's source checkout.
    pub fn environment(&self, host: Arc<dyn CommandExecutor>) -> Environment {
        let executor = ContainerExecutor::new(host, &self.runtime, &self.container_name);
        Environment::new(ExecutionTarget::Container, &self.workdir, Arc::new(executor))
    }

    /// Remove the container. Failures are logged and never change a verdict.
    pub async fn teardown(&self, host: &dyn CommandExecutor) {
        let invocation = Invocation::new(&self.teardown_command());
        match host.execute(&invocation).await {
            Ok(output) if output.success() => {
                info!(container = %self.container_name, "container removed")
            }
            Ok(output) => warn!(
                container = %self.container_name,
                exit_code = output.exit_code,
                stderr = %output.stderr.trim(),
                "container teardown failed"
            ),
            Err(e) => warn!(container = %self.container_name, error = %e, "container teardown failed"),
        }
    }
}
