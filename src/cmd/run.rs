use clap::Parser;
use snafu::prelude::*;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use super::TaskFile;
use crate::config::RookConfig;
use crate::engine::TaskEngine;
use crate::persistence::TransitionStore;
use crate::providers::store::{MemoryStore, RedbStore};
use crate::transition::TransitionType;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("I/O error: {source}"))]
    Io { source: std::io::Error },

    #[snafu(display("YAML parsing error: {source}"))]
    Yaml { source: serde_yaml::Error },

    #[snafu(display("Invalid input JSON: {source}"))]
    Json { source: serde_json::Error },

    #[snafu(display("Engine error: {source}"))]
    Engine { source: crate::engine::Error },

    #[snafu(display("Store error: {source}"))]
    Store { source: crate::persistence::Error },

    #[snafu(display("Configuration error: {source}"))]
    Configuration { source: config::ConfigError },
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<crate::engine::Error> for Error {
    fn from(source: crate::engine::Error) -> Self {
        Error::Engine { source }
    }
}

impl From<crate::persistence::Error> for Error {
    fn from(source: crate::persistence::Error) -> Self {
        Error::Store { source }
    }
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Task file to execute
    #[arg(required = true, value_name = "TASK")]
    pub task: PathBuf,

    /// Execution input as a JSON object
    #[arg(short, long, default_value = "{}")]
    pub input: String,

    /// Path to the durable transition database; in-memory when omitted
    #[arg(short, long, value_name = "PATH")]
    pub db: Option<PathBuf>,
}

pub async fn handle_run(args: &RunArgs) -> Result<()> {
    let raw = std::fs::read_to_string(&args.task).context(IoSnafu)?;
    let file: TaskFile = serde_yaml::from_str(&raw).context(YamlSnafu)?;
    let input: serde_json::Value = serde_json::from_str(&args.input).context(JsonSnafu)?;

    let config = RookConfig::load().context(ConfigurationSnafu)?;
    let store: Arc<dyn TransitionStore> = match &args.db {
        Some(path) => Arc::new(RedbStore::new(&path.to_string_lossy())?),
        None => Arc::new(MemoryStore::new()),
    };
    let engine = TaskEngine::new(store, config);

    let (execution_id, _) = engine.start(file.task, file.agent, input).await?;
    println!("execution {execution_id} started");

    loop {
        let terminal = engine.run(execution_id).await?;
        match terminal.ty {
            TransitionType::Finish => {
                println!("{}", serde_json::to_string_pretty(&terminal.output).context(JsonSnafu)?);
                return Ok(());
            }
            TransitionType::Error => {
                eprintln!("execution failed: {}", terminal.output);
                std::process::exit(1);
            }
            TransitionType::Cancelled => {
                eprintln!("execution cancelled: {}", terminal.output);
                std::process::exit(1);
            }
            TransitionType::Wait => {
                // Awaiting input: read one JSON line from stdin and resume.
                if let Some(info) = terminal.metadata.get("info") {
                    println!("awaiting input: {info}");
                } else {
                    println!("awaiting input");
                }
                print!("> ");
                std::io::stdout().flush().context(IoSnafu)?;
                let mut line = String::new();
                std::io::stdin().read_line(&mut line).context(IoSnafu)?;
                let value: serde_json::Value =
                    serde_json::from_str(line.trim()).context(JsonSnafu)?;
                engine.resume(execution_id, value).await?;
            }
            TransitionType::Init | TransitionType::Step | TransitionType::Resume => {
                // run() only returns on terminal or wait transitions.
                unreachable!("run returned a non-suspending transition");
            }
        }
    }
}
