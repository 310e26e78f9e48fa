//! TOML run plan, the orchestrator binary's input: a test definition plus
//! run options.

use serde::Deserialize;
use stampede_core::error::LoadError;
use stampede_core::protocol::{LoadTest, RunOptions};
use std::path::Path;

#[derive(Debug, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub test: LoadTest,
    pub options: RunOptions,
}

pub fn load(path: &Path) -> Result<Plan, LoadError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        LoadError::Config(format!("cannot read plan {}: {}", path.display(), e))
    })?;
    parse(&text)
}

pub fn parse(text: &str) -> Result<Plan, LoadError> {
    let plan: Plan =
        toml::from_str(text).map_err(|e| LoadError::Config(format!("malformed plan: {}", e)))?;
    plan.options.validate()?;
    Ok(plan)
}
