//! Get command - fetch one resource version on the local worker

use crate::cli::args::GetArgs;
use crate::config::Config;
use crate::error::{GantryError, GantryResult};
use crate::exec::{
    ArtifactSource, DirectoryDestination, ExitStatus, GetDelegate, GetPlan, NoopStep, Process,
    ResourceConfig, Signal, Sink, SourceRepository, Step, StepFactory, StepMetadata, Success,
    VersionInfo, WorkerFactory,
};
use crate::resource::{Params, ResourceType, SessionId, Source, Version};
use crate::worker::create_backend;
use console::style;
use parking_lot::Mutex;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Delegate reporting step progress on the terminal
pub struct ConsoleDelegate {
    stdout: Sink,
    stderr: Sink,
    status: Mutex<Option<ExitStatus>>,
}

impl ConsoleDelegate {
    pub fn new() -> Self {
        Self::with_sinks(Sink::stdout(), Sink::stderr())
    }

    pub fn with_sinks(stdout: Sink, stderr: Sink) -> Self {
        Self {
            stdout,
            stderr,
            status: Mutex::new(None),
        }
    }

    /// Exit status of the completed step, if it completed
    pub fn exit_status(&self) -> Option<ExitStatus> {
        *self.status.lock()
    }

    fn report(&self, line: &str) {
        if let Err(e) = self.stderr.write_line(line) {
            warn!("Failed to write to terminal: {}", e);
        }
    }
}

impl Default for ConsoleDelegate {
    fn default() -> Self {
        Self::new()
    }
}

impl GetDelegate for ConsoleDelegate {
    fn stdout(&self) -> Sink {
        self.stdout.clone()
    }

    fn stderr(&self) -> Sink {
        self.stderr.clone()
    }

    fn completed(&self, status: ExitStatus, info: Option<&VersionInfo>) {
        *self.status.lock() = Some(status);

        let line = match info {
            Some(info) => format!(
                "{} fetched {}",
                style("✓").green(),
                format_version(&info.version)
            ),
            None => format!(
                "{} resource script exited with status {}",
                style("✗").red(),
                status
            ),
        };
        self.report(&line);

        if let Some(info) = info {
            for field in &info.metadata {
                let label = style(format!("{}:", field.name)).dim();
                self.report(&format!("  {} {}", label, field.value));
            }
        }
    }

    fn failed(&self, err: &GantryError) {
        // Reported by the caller once the process exits
        debug!("Get step failed: {}", err);
    }
}

fn format_version(version: &Version) -> String {
    if version.is_empty() {
        return "(no version)".to_string();
    }
    version
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build the source config from `--source-json` overlaid with `--source` pairs
fn build_source(json: Option<&str>, pairs: Vec<(String, String)>) -> GantryResult<Source> {
    let mut source = match json {
        Some(json) => match serde_json::from_str::<Value>(json)? {
            Value::Object(map) => map.into_iter().collect(),
            other => {
                return Err(GantryError::User(format!(
                    "--source-json must be a JSON object, got: {}",
                    other
                )))
            }
        },
        None => Source::new(),
    };

    for (key, value) in pairs {
        source.insert(key, Value::String(value));
    }
    Ok(source)
}

fn build_params(pairs: Vec<(String, String)>) -> Params {
    pairs
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect()
}

fn build_version(pairs: Vec<(String, String)>) -> Option<Version> {
    if pairs.is_empty() {
        None
    } else {
        Some(pairs.into_iter().collect())
    }
}

/// Execute the get command
pub async fn execute(args: GetArgs, config: &Config) -> GantryResult<()> {
    let name = args.name.unwrap_or_else(|| args.resource_type.clone());
    let resource = ResourceConfig {
        name: name.clone(),
        resource_type: ResourceType::new(args.resource_type.as_str()),
        source: build_source(args.source_json.as_deref(), args.source)?,
    };

    let backend = create_backend(config)?;
    let delegate = Arc::new(ConsoleDelegate::new());

    let plan = GetPlan {
        metadata: StepMetadata::default(),
        source_name: name.clone(),
        session: SessionId::new(format!("get-{}", name)),
        delegate: delegate.clone(),
        resource,
        params: build_params(args.param),
        tags: args.tag,
        version: build_version(args.version),
    };

    let factory = WorkerFactory::new(
        backend.worker_client,
        backend.tracker_factory,
        backend.clock,
    );
    let repository = Arc::new(SourceRepository::new());
    let step = factory
        .get(plan)
        .using(Arc::new(NoopStep), Arc::clone(&repository));

    let result = run_until_done(Arc::clone(&step)).await;
    let result = match result {
        Ok(()) => finish(&*step, &delegate, &repository, &name, args.output.as_deref()).await,
        Err(e) => Err(e),
    };

    step.release().await;
    result
}

/// Run the step, forwarding Ctrl-C as an interrupt and a second one as a kill
async fn run_until_done(step: Arc<dyn Step>) -> GantryResult<()> {
    let process = Process::invoke(step);
    let mut interrupts = 0u32;

    loop {
        tokio::select! {
            result = process.wait() => return result,
            ctrl_c = tokio::signal::ctrl_c() => {
                ctrl_c.map_err(|e| GantryError::io("listening for Ctrl-C", e))?;
                interrupts += 1;
                let signal = if interrupts == 1 { Signal::Interrupt } else { Signal::Kill };
                warn!("Received Ctrl-C, sending {} to the fetch", signal);
                process.signal(signal);
            }
        }
    }
}

async fn finish(
    step: &dyn Step,
    delegate: &ConsoleDelegate,
    repository: &SourceRepository,
    name: &str,
    output: Option<&Path>,
) -> GantryResult<()> {
    if step.success() != Some(Success(true)) {
        let status = delegate.exit_status().unwrap_or(ExitStatus(1));
        return Err(GantryError::ResourceScriptFailed {
            exit_status: status.0,
        });
    }

    if let Some(dir) = output {
        let artifact = repository
            .source_for(name)
            .ok_or_else(|| GantryError::Internal(format!("no artifact registered as {}", name)))?;
        copy_artifact(&*artifact, dir).await?;
        eprintln!("{} copied {} into {}", style("✓").green(), name, dir.display());
    }

    Ok(())
}

async fn copy_artifact(artifact: &dyn ArtifactSource, dir: &Path) -> GantryResult<()> {
    let destination = DirectoryDestination::new(dir);
    artifact.stream_to(&destination).await
}
