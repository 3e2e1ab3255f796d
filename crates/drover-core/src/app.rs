//! Application lifecycle.
//!
//! `Application::<Config>::run()` parses arguments, loads configuration,
//! builds and runs pipelines, and turns the outcome into a process exit code.

use std::future::Future;
use std::process::ExitCode;

use clap::Parser;
use tracing::info;

use crate::config::{CliArgs, ConfigPath, Mergeable};
use crate::error::{ConfigError, PipelineSetupError};
use crate::topology::{Pipeline, PipelineContext, RunMode, RunSummary, run_pipelines};
use crate::tracing::init_tracing;

/// Exit code used when shutdown interrupted a run and nothing failed.
pub const EXIT_CANCELLED: u8 = 130;

/// Trait for application configurations that can be loaded and run.
pub trait AppConfig: Mergeable + Sized {
    /// The pipeline type this config produces.
    type Pipeline: Pipeline;

    /// Human-readable name for components (e.g., "feed").
    const COMPONENT_NAME: &'static str;

    /// Validate a merged configuration.
    fn validate(&self) -> Result<(), ConfigError>;

    /// Build pipelines from this config.
    fn create_pipelines(
        &self,
        context: PipelineContext,
    ) -> impl Future<Output = Result<Vec<Self::Pipeline>, PipelineSetupError>>;

    /// Log startup info (component count and details).
    fn log_startup_info(&self);
}

/// Application runner that handles the full startup lifecycle.
pub struct Application<C: AppConfig> {
    config: C,
    mode: RunMode,
}

impl<C: AppConfig> Application<C> {
    /// Full application lifecycle: parse args, load config, run pipelines.
    pub fn run() -> ExitCode {
        init_tracing();

        let args = CliArgs::parse();
        let paths = args.config_paths();

        if paths.is_empty() {
            eprintln!("Error: no config files or directories specified");
            return ExitCode::FAILURE;
        }

        info!("Loading config from {} source(s)", paths.len());

        match Self::load(&paths, &args.only) {
            Ok(mut app) => {
                if args.watch {
                    app.mode = RunMode::Watch;
                }
                app.execute()
            }
            Err(e) => {
                eprintln!("Failed to load config: {e}");
                ExitCode::FAILURE
            }
        }
    }

    /// Load, narrow to the selected components and validate.
    pub fn load(paths: &[ConfigPath], only: &[String]) -> Result<Self, ConfigError> {
        let mut config: C = crate::config::load_from_paths(paths)?;
        config.retain_selected(only, C::COMPONENT_NAME)?;
        config.validate()?;
        Ok(Self {
            config,
            mode: RunMode::Once,
        })
    }

    /// The loaded configuration.
    pub fn config(&self) -> &C {
        &self.config
    }

    fn execute(self) -> ExitCode {
        self.config.log_startup_info();

        let runtime = match tokio::runtime::Runtime::new() {
            Ok(runtime) => runtime,
            Err(e) => {
                eprintln!("Failed to start async runtime: {e}");
                return ExitCode::FAILURE;
            }
        };

        let result = runtime.block_on(run_pipelines(
            Mergeable::metrics(&self.config).address.as_deref(),
            Mergeable::global(&self.config),
            self.mode,
            C::COMPONENT_NAME,
            |context| self.config.create_pipelines(context),
        ));

        match result {
            Ok(summary) => exit_code(&summary, C::COMPONENT_NAME),
            Err(e) => {
                eprintln!("Setup failed: {e}");
                ExitCode::FAILURE
            }
        }
    }
}

/// Report failures on stderr and pick the exit code for a run summary.
pub fn exit_code(summary: &RunSummary, component: &str) -> ExitCode {
    for (key, error) in &summary.failed {
        eprintln!("{component} {key} failed: {error}");
    }
    for key in &summary.cancelled {
        eprintln!("{component} {key} cancelled");
    }
    ExitCode::from(exit_status(summary))
}

/// Numeric exit status: failures beat cancellations beat success.
pub fn exit_status(summary: &RunSummary) -> u8 {
    if !summary.failed.is_empty() {
        1
    } else if !summary.cancelled.is_empty() {
        EXIT_CANCELLED
    } else {
        0
    }
}
