//! Named sequence storage and script file helpers.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::{KsrError, Result};
use crate::script;
use crate::sequence::{self, Sequence, SequenceRecord};

const EXTENSION: &str = "json";

/// One entry of [`SequenceStore::list`].
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceSummary {
    /// Store key, as accepted by `load` and `delete`.
    pub name: String,
    pub action_count: usize,
    pub modified_at: DateTime<Utc>,
}

/// Save, load, list and delete sequences by name.
pub trait SequenceStore {
    fn save(&self, sequence: &Sequence, name: &str) -> Result<()>;
    fn load(&self, name: &str) -> Result<Sequence>;
    /// Newest first.
    fn list(&self) -> Result<Vec<SequenceSummary>>;
    fn delete(&self, name: &str) -> Result<()>;
}

/// One pretty-printed JSON record per sequence in a directory.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// The directory is created on the first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        let key = sanitize_name(name);
        if key.is_empty() || key.chars().all(|c| c == '.') {
            return Err(KsrError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid sequence name '{name}'"),
            )));
        }
        Ok(self.dir.join(format!("{key}.{EXTENSION}")))
    }

    fn summarize(path: &Path) -> Option<SequenceSummary> {
        let name = path.file_stem()?.to_string_lossy().into_owned();
        let modified_at = fs::metadata(path)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_default();

        let action_count = match fs::read_to_string(path)
            .map_err(KsrError::from)
            .and_then(|json| sequence::parse(&json))
        {
            Ok(sequence) => sequence.len(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable sequence file");
                0
            }
        };

        Some(SequenceSummary {
            name,
            action_count,
            modified_at,
        })
    }
}

/// Store key for a user-supplied name: trimmed, `.json` suffix dropped,
/// path separators and control characters replaced.
fn sanitize_name(name: &str) -> String {
    let trimmed = name.trim();
    let stem = trimmed
        .strip_suffix(&format!(".{EXTENSION}"))
        .unwrap_or(trimmed);
    stem.chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

impl SequenceStore for JsonFileStore {
    fn save(&self, sequence: &Sequence, name: &str) -> Result<()> {
        let path = self.path_for(name)?;
        fs::create_dir_all(&self.dir)?;
        let record = SequenceRecord::new(sequence.clone());
        fs::write(&path, serde_json::to_string_pretty(&record)?)?;
        debug!(path = %path.display(), actions = sequence.len(), "Sequence saved");
        Ok(())
    }

    fn load(&self, name: &str) -> Result<Sequence> {
        let path = self.path_for(name)?;
        let json = match fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(KsrError::not_found(name));
            }
            Err(e) => return Err(e.into()),
        };
        sequence::parse(&json)
    }

    fn list(&self) -> Result<Vec<SequenceSummary>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut summaries: Vec<SequenceSummary> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == EXTENSION))
            .filter_map(|path| Self::summarize(&path))
            .collect();

        summaries.sort_by(|a, b| {
            b.modified_at
                .cmp(&a.modified_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(summaries)
    }

    fn delete(&self, name: &str) -> Result<()> {
        let path = self.path_for(name)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "Sequence deleted");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(KsrError::not_found(name)),
            Err(e) => Err(e.into()),
        }
    }
}

/// Write `sequence` as a script file.
pub fn export_script_file(sequence: &Sequence, path: impl AsRef<Path>) -> Result<()> {
    fs::write(path, script::export_script(sequence))?;
    Ok(())
}

/// Read a script file into a sequence named after the file stem.
pub fn import_script_file(path: impl AsRef<Path>) -> Result<Sequence> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)?;
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    script::parse_script(&text, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::KeyAction;

    fn sample(name: &str) -> Sequence {
        let mut seq = Sequence::new(name);
        let a = "char:a".parse().unwrap();
        seq.append(KeyAction::press(a, 0.0));
        seq.append(KeyAction::delay(0.25, 0.25));
        seq
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name(" macro.json "), "macro");
        assert_eq!(sanitize_name("../etc/passwd"), ".._etc_passwd");
        assert_eq!(sanitize_name("a\\b:c"), "a_b_c");
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested"));
        let seq = sample("greeting");

        store.save(&seq, "greeting").unwrap();
        assert!(dir.path().join("nested/greeting.json").is_file());
        assert_eq!(store.load("greeting").unwrap(), seq);
        assert_eq!(store.load("greeting.json").unwrap(), seq);
    }

    #[test]
    fn test_record_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        store.save(&sample("x"), "x").unwrap();

        let raw = fs::read_to_string(dir.path().join("x.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["version"], "1.0");
        assert!(value["created"].is_string());
        assert_eq!(value["sequence"]["name"], "x");
        assert_eq!(value["sequence"]["actions"][0]["action_type"], "key_press");
        assert_eq!(value["sequence"]["actions"][0]["key"], "char:a");
        assert_eq!(value["sequence"]["actions"][1]["key"], "");
    }

    #[test]
    fn test_missing_entries_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        assert!(matches!(store.load("nope"), Err(KsrError::NotFound(_))));
        assert!(matches!(store.delete("nope"), Err(KsrError::NotFound(_))));
    }

    #[test]
    fn test_invalid_names_are_rejected() {
        let store = JsonFileStore::new("unused");
        assert!(matches!(store.save(&sample("x"), "  "), Err(KsrError::Io(_))));
        assert!(store.load("..").is_err());
    }

    #[test]
    fn test_list_includes_unreadable_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        store.save(&sample("good"), "good").unwrap();
        fs::write(dir.path().join("broken.json"), "{ not json").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut listed = store.list().unwrap();
        listed.sort_by(|a, b| a.name.cmp(&b.name));
        let counts: Vec<(&str, usize)> = listed
            .iter()
            .map(|s| (s.name.as_str(), s.action_count))
            .collect();
        assert_eq!(counts, vec![("broken", 0), ("good", 2)]);
    }

    #[test]
    fn test_list_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("absent"));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_delete_removes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        store.save(&sample("temp"), "temp").unwrap();
        store.delete("temp").unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_script_file_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("login.txt");
        export_script_file(&sample("login"), &path).unwrap();

        let imported = import_script_file(&path).unwrap();
        assert_eq!(imported.name, "login");
        assert_eq!(imported.len(), 2);
        assert_eq!(imported.key_press_count(), 1);
    }
}
