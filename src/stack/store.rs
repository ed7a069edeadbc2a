//! Stack definition store - persists one definition per stack directory

use super::definition::{validate_name, StackDefinition, SCHEMA_VERSION};
use crate::error::{Result, StackError};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Definition file name inside a stack directory
pub const DEFINITION_FILE: &str = "stack.json";

/// Store for stack definitions under a base directory
#[derive(Debug, Clone)]
pub struct StackStore {
    base_dir: PathBuf,
}

impl StackStore {
    /// Create a store rooted at `base_dir`. Nothing is touched on disk.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Directory of a stack
    pub fn stack_dir(&self, name: &str) -> PathBuf {
        self.base_dir.join(name)
    }

    /// Definition file path of a stack
    pub fn definition_path(&self, name: &str) -> PathBuf {
        self.stack_dir(name).join(DEFINITION_FILE)
    }

    /// Whether a definition file exists for `name`
    pub fn exists(&self, name: &str) -> bool {
        validate_name("stack", name).is_ok() && self.definition_path(name).is_file()
    }

    /// Names of all stacks with a definition file, sorted
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StackError::persistence(&self.base_dir, e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StackError::persistence(&self.base_dir, e))?;
            if let Some(name) = entry.file_name().to_str() {
                if self.exists(name) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Load the definition of `name`
    pub fn load(&self, name: &str) -> Result<StackDefinition> {
        if validate_name("stack", name).is_err() {
            return Err(StackError::StackNotFound(name.to_string()));
        }

        let path = self.definition_path(name);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StackError::StackNotFound(name.to_string()));
            }
            Err(e) => return Err(StackError::persistence(&path, e)),
        };

        let definition = parse_definition(&path, &content)?;
        if definition.name != name {
            return Err(StackError::corrupt(
                &path,
                format!("definition names stack '{}'", definition.name),
            ));
        }

        tracing::debug!("Loaded stack definition {}", path.display());
        Ok(definition)
    }

    /// Atomically persist a definition.
    ///
    /// Writes a temp file next to the target and renames it into place.
    /// Skips the write when the file already holds identical content.
    pub fn save(&self, definition: &StackDefinition) -> Result<()> {
        definition.validate()?;

        let dir = self.stack_dir(&definition.name);
        let path = dir.join(DEFINITION_FILE);
        let content = serialize_definition(definition)?;

        if let Ok(existing) = fs::read(&path) {
            if existing == content.as_bytes() {
                return Ok(());
            }
        }

        fs::create_dir_all(&dir).map_err(|e| StackError::persistence(&dir, e))?;
        write_atomic(&path, content.as_bytes())?;

        tracing::debug!("Saved stack definition {}", path.display());
        Ok(())
    }

    /// Persist a brand-new definition; refuses to replace an existing one
    pub fn init(&self, definition: &StackDefinition) -> Result<()> {
        if self.exists(&definition.name) {
            return Err(StackError::StackExists(definition.name.clone()));
        }
        self.save(definition)
    }
}

fn serialize_definition(definition: &StackDefinition) -> Result<String> {
    let mut content = serde_json::to_string_pretty(definition)
        .map_err(|e| StackError::InvalidDefinition(format!("Failed to serialize: {}", e)))?;
    content.push('\n');
    Ok(content)
}

fn parse_definition(path: &Path, content: &str) -> Result<StackDefinition> {
    let value: serde_json::Value = serde_json::from_str(content)
        .map_err(|e| StackError::corrupt(path, format!("invalid JSON: {}", e)))?;

    match value.get("schema_version").and_then(|v| v.as_u64()) {
        Some(v) if v == u64::from(SCHEMA_VERSION) => {}
        Some(v) => {
            return Err(StackError::corrupt(
                path,
                format!("unknown schema version {}", v),
            ))
        }
        None => return Err(StackError::corrupt(path, "missing schema_version")),
    }

    let definition: StackDefinition = serde_json::from_value(value)
        .map_err(|e| StackError::corrupt(path, e.to_string()))?;

    definition.validate().map_err(|e| match e {
        StackError::InvalidDefinition(reason) => StackError::corrupt(path, reason),
        other => other,
    })?;

    Ok(definition)
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| DEFINITION_FILE.to_string());
    let temp_path = path.with_file_name(format!(".{}.tmp.{}", file_name, uuid::Uuid::new_v4()));

    let written = fs::File::create(&temp_path).and_then(|mut file| {
        file.write_all(data)?;
        file.sync_all()
    });

    if let Err(e) = written.and_then(|_| fs::rename(&temp_path, path)) {
        let _ = fs::remove_file(&temp_path);
        return Err(StackError::persistence(path, e));
    }

    Ok(())
}
