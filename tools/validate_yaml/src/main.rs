use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

/// Check that a file parses as YAML.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    file: PathBuf,
}

fn validate(path: &Path) -> Result<serde_yaml::Value> {
    let content = std::fs::read_to_string(path).with_context(|| format!("cannot read {:?}", path))?;
    Ok(serde_yaml::from_str(&content)?)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match validate(&cli.file) {
        Ok(_) => {
            println!("YAML validation successful for {}", cli.file.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            println!("YAML validation failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_workflow_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.yaml");
        std::fs::write(&path, "name: sql-finetune\nresources:\n  gpus: 1\n").unwrap();
        let value = validate(&path).unwrap();
        assert_eq!(value["resources"]["gpus"], serde_yaml::Value::from(1));
    }

    #[test]
    fn rejects_broken_yaml_and_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "key: [unclosed\n").unwrap();
        assert!(validate(&path).is_err());
        assert!(validate(&dir.path().join("absent.yaml")).is_err());
    }
}
