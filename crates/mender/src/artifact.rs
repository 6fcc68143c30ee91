//! Persisted command lists ("living documents").
//!
//! Files are YAML (or JSON by extension) holding either a bare sequence of
//! commands or a mapping with a `commands` key. Writes replace the whole file
//! atomically through a temp file in the same directory; other keys of a
//! mapping document are preserved.

use async_trait::async_trait;
use serde_yaml::Value;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

use crate::command::Command;
use crate::errors::MenderError;

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn read(&self, path: &Path) -> Result<Vec<Command>, MenderError>;

    /// Replaces the command list at `path`.
    async fn write(&self, path: &Path, commands: &[Command]) -> Result<(), MenderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Yaml,
    Json,
}

impl Format {
    fn of(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Format::Json,
            _ => Format::Yaml,
        }
    }
}

fn io_error(path: &Path, source: std::io::Error) -> MenderError {
    MenderError::ArtifactIo {
        path: path.display().to_string(),
        source,
    }
}

fn format_error(path: &Path, message: impl std::fmt::Display) -> MenderError {
    MenderError::ArtifactFormat {
        path: path.display().to_string(),
        message: message.to_string(),
    }
}

fn parse_document(path: &Path, text: &str) -> Result<Value, MenderError> {
    if text.trim().is_empty() {
        return Ok(Value::Sequence(Vec::new()));
    }
    match Format::of(path) {
        Format::Json => serde_json::from_str::<serde_json::Value>(text)
            .map_err(|e| format_error(path, e))
            .and_then(|json| serde_yaml::to_value(json).map_err(|e| format_error(path, e))),
        Format::Yaml => serde_yaml::from_str(text).map_err(|e| format_error(path, e)),
    }
}

fn commands_of(path: &Path, document: &Value) -> Result<Vec<Command>, MenderError> {
    let list = match document {
        Value::Sequence(_) => document.clone(),
        Value::Mapping(map) => map
            .get("commands")
            .cloned()
            .ok_or_else(|| format_error(path, "mapping document has no 'commands' key"))?,
        _ => return Err(format_error(path, "expected a command list")),
    };
    serde_yaml::from_value(list).map_err(|e| format_error(path, e))
}

fn render(path: &Path, document: &Value) -> Result<String, MenderError> {
    match Format::of(path) {
        Format::Json => serde_json::to_string_pretty(document)
            .map(|mut s| {
                s.push('\n');
                s
            })
            .map_err(|e| format_error(path, e)),
        Format::Yaml => serde_yaml::to_string(document).map_err(|e| format_error(path, e)),
    }
}

/// File-backed store.
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlArtifactStore;

impl YamlArtifactStore {
    pub fn new() -> Self {
        Self
    }

    async fn read_document(&self, path: &Path) -> Result<Option<Value>, MenderError> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => parse_document(path, &text).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(path, e)),
        }
    }
}

#[async_trait]
impl ArtifactStore for YamlArtifactStore {
    async fn read(&self, path: &Path) -> Result<Vec<Command>, MenderError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| io_error(path, e))?;
        let commands = commands_of(path, &parse_document(path, &text)?)?;
        debug!(path = %path.display(), commands = commands.len(), "Read artifact");
        Ok(commands)
    }

    async fn write(&self, path: &Path, commands: &[Command]) -> Result<(), MenderError> {
        let list = serde_yaml::to_value(commands).map_err(|e| format_error(path, e))?;
        let document = match self.read_document(path).await? {
            Some(Value::Mapping(mut map)) => {
                map.insert(Value::String("commands".to_string()), list);
                Value::Mapping(map)
            }
            _ => list,
        };
        let text = render(path, &document)?;

        let target: PathBuf = path.to_path_buf();
        tokio::task::spawn_blocking(move || replace_file(&target, text.as_bytes()))
            .await
            .map_err(|e| MenderError::Internal(format!("artifact writer panicked: {e}")))??;
        debug!(path = %path.display(), commands = commands.len(), "Wrote artifact");
        Ok(())
    }
}

/// Writes to a sibling temp file, syncs it, then renames it over `path`.
fn replace_file(path: &Path, bytes: &[u8]) -> Result<(), MenderError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut temp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| io_error(path, e))?;
    temp.write_all(bytes).map_err(|e| io_error(path, e))?;
    temp.as_file().sync_all().map_err(|e| io_error(path, e))?;
    temp.persist(path).map_err(|e| io_error(path, e.error))?;
    Ok(())
}

/// Merges healed commands into the artifact at `path`: re-reads the current
/// list, replaces each listed position (appending past the end) and writes
/// the full list back. Returns how many positions were written.
#[instrument(level = "debug", skip(store, healed), fields(path = %path.display()))]
pub async fn heal_artifact(
    store: &dyn ArtifactStore,
    path: &Path,
    healed: &[(usize, Command)],
) -> Result<usize, MenderError> {
    if healed.is_empty() {
        return Ok(0);
    }
    let mut commands = store.read(path).await?;
    let mut sorted: Vec<&(usize, Command)> = healed.iter().collect();
    sorted.sort_by_key(|(position, _)| *position);

    for (position, command) in sorted {
        match commands.get_mut(*position) {
            Some(slot) => *slot = command.clone(),
            None => commands.push(command.clone()),
        }
    }
    store.write(path, &commands).await?;
    info!("Wrote {} healed command(s) back to {}", healed.len(), path.display());
    Ok(healed.len())
}
