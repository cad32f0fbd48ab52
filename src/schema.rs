use std::fs;
use std::path::Path;

use anyhow::Result;
use schemars::schema_for;

use crate::definition::OperatorDef;

/// JSON Schema of the definition file format, pretty printed.
pub fn definition_schema() -> Result<String> {
    let schema = schema_for!(OperatorDef);
    Ok(serde_json::to_string_pretty(&schema)?)
}

/// Writes the definition schema to `path`, creating parent directories.
pub fn write_schema(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, definition_schema()?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_describes_definitions() {
        let schema: serde_json::Value = serde_json::from_str(&definition_schema().unwrap()).unwrap();
        let properties = &schema["properties"];
        for field in ["services", "delegates", "operators", "properties", "connections"] {
            assert!(properties.get(field).is_some(), "{field}");
        }
    }

    #[test]
    fn test_write_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schemas/operator.schema.json");
        write_schema(&path).unwrap();
        assert!(fs::read_to_string(&path).unwrap().contains("connections"));
    }
}
