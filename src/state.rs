//! Local run-state persistence: last snapshot/manifest per subvolume,
//! written atomically as sorted-key JSON.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid state json at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

// Field order is alphabetical so the default serde derive emits
// sorted-key JSON without a custom serializer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SubvolumeState {
    pub last_full_at: Option<String>,
    pub last_manifest: Option<String>,
    pub last_snapshot: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct State {
    pub last_run_at: Option<String>,
    pub subvolumes: BTreeMap<String, SubvolumeState>,
}

/// Loads state from `path`, returning a fresh default `State` if the
/// file does not yet exist.
pub fn load_state(path: &Path) -> Result<State, StateError> {
    if !path.exists() {
        return Ok(State::default());
    }
    let raw = std::fs::read_to_string(path).map_err(|source| StateError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| StateError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Atomically persists `state`: writes to a sibling `.tmp` file then
/// renames it over `path`, so a crash mid-write never corrupts the
/// previous state.
pub fn save_state(path: &Path, state: &State) -> Result<(), StateError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| StateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    }
    let temp_path = path.with_extension("tmp");
    let body =
        serde_json::to_string_pretty(state).map_err(|source| StateError::Json {
            path: path.to_path_buf(),
            source,
        })?;
    {
        let mut file = std::fs::File::create(&temp_path).map_err(|source| StateError::Io {
            path: temp_path.clone(),
            source,
        })?;
        file.write_all(body.as_bytes())
            .and_then(|_| file.write_all(b"\n"))
            .map_err(|source| StateError::Io {
                path: temp_path.clone(),
                source,
            })?;
    }
    std::fs::rename(&temp_path, path).map_err(|source| StateError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_default_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let state = load_state(&path).unwrap();
        assert!(state.subvolumes.is_empty());
        assert!(state.last_run_at.is_none());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let mut state = State::default();
        state.subvolumes.insert(
            "home".to_string(),
            SubvolumeState {
                last_snapshot: Some("/srv/snapshots/home__20260101T000000Z__full".to_string()),
                last_manifest: Some("subvol/home/full/manifest-20260101T000000Z.json".to_string()),
                last_full_at: Some("20260101T000000Z".to_string()),
            },
        );
        state.last_run_at = Some("20260101T000000Z".to_string());

        save_state(&path, &state).unwrap();
        let loaded = load_state(&path).unwrap();
        assert_eq!(loaded, state);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn save_overwrites_previous_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        save_state(&path, &State::default()).unwrap();
        let mut second = State::default();
        second.last_run_at = Some("20260202T000000Z".to_string());
        save_state(&path, &second).unwrap();
        assert_eq!(load_state(&path).unwrap(), second);
    }
}
