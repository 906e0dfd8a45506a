use clap::Parser;
use snafu::prelude::*;
use std::path::PathBuf;

use super::TaskFile;
use crate::validate::validate_task;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("I/O error reading {}: {source}", path.display()))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("YAML parsing error: {source}"))]
    Yaml { source: serde_yaml::Error },

    #[snafu(display("Validation failed: {source}"))]
    Validation { source: crate::validate::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Task file(s) to validate without executing
    #[arg(required = true, value_name = "TASK")]
    pub tasks: Vec<PathBuf>,
}

pub fn handle_validate(args: &ValidateArgs) -> Result<()> {
    for path in &args.tasks {
        let raw = std::fs::read_to_string(path).context(IoSnafu { path: path.clone() })?;
        let file: TaskFile = serde_yaml::from_str(&raw).context(YamlSnafu)?;
        validate_task(&file.task, &file.agent).context(ValidationSnafu)?;
        println!("{}: ok", path.display());
    }
    Ok(())
}
