//! NDJSON input files

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use tidewater_core::Value;

/// A source stream fed from a file, given on the command line as `STREAM=PATH`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Input {
    pub stream: String,
    pub path: PathBuf,
}

impl FromStr for Input {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (stream, path) = s
            .split_once('=')
            .ok_or_else(|| format!("expected STREAM=PATH, got '{}'", s))?;
        if stream.is_empty() || path.is_empty() {
            return Err(format!("expected STREAM=PATH, got '{}'", s));
        }
        Ok(Self {
            stream: stream.to_string(),
            path: PathBuf::from(path),
        })
    }
}

/// One JSON document per non-blank line
pub fn read_ndjson(path: &Path) -> Result<Vec<Value>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read input {}", path.display()))?;
    parse_ndjson(&contents).with_context(|| format!("Invalid input {}", path.display()))
}

pub fn parse_ndjson(contents: &str) -> Result<Vec<Value>> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            let json: serde_json::Value = serde_json::from_str(line)
                .with_context(|| format!("line {} is not valid JSON", i + 1))?;
            Ok(Value::from(json))
        })
        .collect()
}
