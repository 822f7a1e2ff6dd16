//! Command definitions and shared plumbing

mod cp;
mod jobs;
mod ls;
mod mkdir;
mod rm;
mod stat;
mod transfer;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Subcommand;
use nb_core::{
    JobEngine, ObjectStore, ProviderRegistry, ResourceUri, StateStore, TransferExecutor,
};

use crate::config::CliConfig;
use crate::exit_code::ExitCode;
use crate::output::Formatter;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List objects and directories
    Ls(ls::LsArgs),

    /// Show metadata of an object or directory
    Stat(stat::StatArgs),

    /// Create a directory
    Mkdir(mkdir::MkdirArgs),

    /// Remove an object or directory
    Rm(rm::RmArgs),

    /// Copy an object, within or across providers
    Cp(cp::CpArgs),

    /// Move an object, within or across providers
    Mv(cp::CpArgs),

    /// Inspect, resume or cancel persisted jobs
    #[command(subcommand)]
    Jobs(jobs::JobsCommands),
}

/// Loaded configuration plus the providers built from it
pub struct Context {
    pub formatter: Formatter,
    pub config: CliConfig,
    pub registry: ProviderRegistry,
}

impl Context {
    /// Provider for `uri`, printing the error when none is configured
    pub fn provider(&self, uri: &ResourceUri) -> Result<Arc<dyn ObjectStore>, ExitCode> {
        self.registry.resolve(uri).map_err(|e| {
            self.formatter
                .error(&format!("{e} (add a section to providers.toml)"));
            ExitCode::UsageError
        })
    }

    pub fn state_store(&self) -> Option<StateStore> {
        self.config.engine.resolved_state_dir().map(StateStore::new)
    }

    /// Job engine backed by the transfer executor and the on-disk state
    pub fn engine(&self) -> JobEngine {
        let state = self.state_store();
        let checkpoints = state.as_ref().map(StateStore::checkpoint_log);
        let executor =
            TransferExecutor::new(self.registry.clone(), self.config.engine.clone(), checkpoints);
        JobEngine::with_state_store(Arc::new(executor), self.config.engine.concurrency, state)
    }

    /// Report a core error and pick the matching exit code
    pub fn fail(&self, context: &str, error: &nb_core::Error) -> ExitCode {
        self.formatter
            .error_with_kind(&format!("{context}: {error}"), Some(error.kind()));
        ExitCode::from(error)
    }
}

/// Parse a command-line location: a URI, or a local path
pub fn parse_location(input: &str) -> nb_core::Result<ResourceUri> {
    if input.contains("://") {
        return ResourceUri::parse(input);
    }
    let path = Path::new(input);
    let absolute: PathBuf = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let uri = ResourceUri::from_local_path(&normalize(&absolute))?;
    if input.ends_with('/') || input.ends_with(std::path::MAIN_SEPARATOR) {
        Ok(uri.as_dir())
    } else {
        Ok(uri)
    }
}

/// Drop `.` and resolve `..` without touching the filesystem
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

pub async fn execute(command: Commands, ctx: &Context) -> ExitCode {
    match command {
        Commands::Ls(args) => ls::execute(args, ctx).await,
        Commands::Stat(args) => stat::execute(args, ctx).await,
        Commands::Mkdir(args) => mkdir::execute(args, ctx).await,
        Commands::Rm(args) => rm::execute(args, ctx).await,
        Commands::Cp(args) => cp::execute(args, false, ctx).await,
        Commands::Mv(args) => cp::execute(args, true, ctx).await,
        Commands::Jobs(cmd) => jobs::execute(cmd, ctx).await,
    }
}
