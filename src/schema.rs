//! Emit JSON Schemas for the documents people author or consume by hand:
//! the catalog file, plugin metadata, and the execution summary.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use exec_plugin::{ExecutionSummary, PluginInfo};
use schemars::schema_for;
use serde_json::to_string_pretty;

use crate::catalog::Catalog;

pub fn write_schema(out_dir: &Path) -> Result<()> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("could not create {}", out_dir.display()))?;

    let catalog = schema_for!(Catalog);
    fs::write(out_dir.join("catalog.schema.json"), to_string_pretty(&catalog)?)?;

    let plugin_info = schema_for!(PluginInfo);
    fs::write(
        out_dir.join("plugin_info.schema.json"),
        to_string_pretty(&plugin_info)?,
    )?;

    let summary = schema_for!(ExecutionSummary);
    fs::write(
        out_dir.join("execution_summary.schema.json"),
        to_string_pretty(&summary)?,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn writes_parseable_schemas() {
        let dir = TempDir::new().unwrap();
        write_schema(dir.path()).unwrap();

        for file in [
            "catalog.schema.json",
            "plugin_info.schema.json",
            "execution_summary.schema.json",
        ] {
            let text = fs::read_to_string(dir.path().join(file)).unwrap();
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert!(value.get("title").is_some(), "{file} has no title");
        }
    }

    #[test]
    fn catalog_schema_mentions_the_discriminator() {
        let dir = TempDir::new().unwrap();
        write_schema(dir.path()).unwrap();
        let text = fs::read_to_string(dir.path().join("catalog.schema.json")).unwrap();
        assert!(text.contains("\"type\""));
        assert!(text.contains("remote"));
    }
}
