//! Pull-based access to the current form contents.

use std::path::{Path, PathBuf};

use crate::state::Payload;

/// Returns a fresh snapshot of the form on every call.
pub trait FormSource: Send + Sync {
    fn collect(&self) -> Payload;
}

impl<F> FormSource for F
where
    F: Fn() -> Payload + Send + Sync,
{
    fn collect(&self) -> Payload {
        self()
    }
}

/// A form with no fields; used when the caller always passes payloads explicitly.
pub struct EmptyForm;

impl FormSource for EmptyForm {
    fn collect(&self) -> Payload {
        Payload::new()
    }
}

/// Reads the form from a JSON object on disk.
///
/// A missing file, invalid JSON, or a non-object document all read as an
/// empty form; the agent treats that as "nothing to save".
#[derive(Debug, Clone)]
pub struct JsonFileForm {
    path: PathBuf,
}

impl JsonFileForm {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Like `collect`, but reports why the file could not be read.
    pub fn read(&self) -> anyhow::Result<Payload> {
        use anyhow::Context;

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read form file: {}", self.path.display()))?;
        let value: serde_json::Value = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse form file: {}", self.path.display()))?;
        match value {
            serde_json::Value::Object(map) => Ok(map),
            _ => anyhow::bail!(
                "Form file {} must contain a JSON object",
                self.path.display()
            ),
        }
    }
}

impl FormSource for JsonFileForm {
    fn collect(&self) -> Payload {
        self.read().unwrap_or_else(|e| {
            tracing::warn!(error = %format!("{:#}", e), "form snapshot unavailable");
            Payload::new()
        })
    }
}
