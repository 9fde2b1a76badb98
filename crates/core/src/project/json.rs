use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::{records_of, sort_listing, ProjectId, ProjectInfo, ProjectStore, TrackRecord};
use crate::{PcmBuffer, Result, StorageError, TrackSlot};

const INDEX_FILE: &str = "projects.json";
const TRACKS_FILE: &str = "tracks.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProjectIndex {
    next_id: ProjectId,
    projects: Vec<ProjectInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TrackRow {
    track_number: usize,
    volume: f32,
    muted: bool,
    audio_file: String,
}

/// Directory-backed project store.
///
/// ```text
/// <root>/projects.json        index of all projects
/// <root>/<id>/tracks.json     per-track volume, mute and audio file name
/// <root>/<id>/track-<n>.pcm   raw headerless PCM
/// ```
#[derive(Debug, Clone)]
pub struct JsonProjectStore {
    root: PathBuf,
}

impl JsonProjectStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(StorageError::from)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn project_dir(&self, id: ProjectId) -> PathBuf {
        self.root.join(id.to_string())
    }

    fn read_index(&self) -> Result<ProjectIndex> {
        let path = self.root.join(INDEX_FILE);
        if !path.exists() {
            return Ok(ProjectIndex::default());
        }
        let text = fs::read_to_string(&path).map_err(StorageError::from)?;
        Ok(serde_json::from_str::<ProjectIndex>(&text).map_err(StorageError::from)?)
    }

    fn write_index(&self, index: &ProjectIndex) -> Result<()> {
        let json = serde_json::to_vec_pretty(index).map_err(StorageError::from)?;
        write_atomic(&self.root.join(INDEX_FILE), &json)
    }

    /// Writes the tracks into a staging directory and swaps it in, so a
    /// failure midway leaves the previous track set intact.
    fn write_tracks(&self, id: ProjectId, tracks: &[TrackSlot]) -> Result<()> {
        let dir = self.project_dir(id);
        let staging = self.root.join(format!("{id}.staging"));
        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(StorageError::from)?;
        }
        fs::create_dir_all(&staging).map_err(StorageError::from)?;

        let mut rows = Vec::new();
        for record in records_of(tracks) {
            let audio_file = format!("track-{}.pcm", record.track_number);
            fs::write(staging.join(&audio_file), record.audio.as_bytes())
                .map_err(StorageError::from)?;
            rows.push(TrackRow {
                track_number: record.track_number,
                volume: record.volume,
                muted: record.muted,
                audio_file,
            });
        }
        let json = serde_json::to_vec_pretty(&rows).map_err(StorageError::from)?;
        fs::write(staging.join(TRACKS_FILE), json).map_err(StorageError::from)?;

        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(StorageError::from)?;
        }
        fs::rename(&staging, &dir).map_err(StorageError::from)?;
        Ok(())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).map_err(StorageError::from)?;
    fs::rename(&tmp, path).map_err(StorageError::from)?;
    Ok(())
}

impl ProjectStore for JsonProjectStore {
    fn save_project(&mut self, name: &str, tracks: &[TrackSlot]) -> Result<ProjectId> {
        let mut index = self.read_index()?;
        index.next_id += 1;
        let id = index.next_id;

        self.write_tracks(id, tracks)?;

        let now = Utc::now();
        index.projects.push(ProjectInfo {
            id,
            name: name.to_string(),
            created_at: now,
            last_modified: now,
        });
        self.write_index(&index)?;
        Ok(id)
    }

    fn update_project(&mut self, id: ProjectId, name: &str, tracks: &[TrackSlot]) -> Result<()> {
        let mut index = self.read_index()?;
        if !index.projects.iter().any(|p| p.id == id) {
            return Err(StorageError::ProjectNotFound(id).into());
        }

        self.write_tracks(id, tracks)?;

        if let Some(info) = index.projects.iter_mut().find(|p| p.id == id) {
            info.name = name.to_string();
            info.last_modified = Utc::now();
        }
        self.write_index(&index)
    }

    fn load_project(&self, id: ProjectId) -> Result<Vec<TrackRecord>> {
        let index = self.read_index()?;
        if !index.projects.iter().any(|p| p.id == id) {
            return Err(StorageError::ProjectNotFound(id).into());
        }

        let dir = self.project_dir(id);
        let text = fs::read_to_string(dir.join(TRACKS_FILE)).map_err(StorageError::from)?;
        let mut rows: Vec<TrackRow> = serde_json::from_str(&text).map_err(StorageError::from)?;
        rows.sort_by_key(|row| row.track_number);

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            if row.audio_file.contains(['/', '\\']) {
                return Err(StorageError::Malformed(format!(
                    "audio file `{}` escapes the project directory",
                    row.audio_file
                ))
                .into());
            }
            let bytes = fs::read(dir.join(&row.audio_file)).map_err(StorageError::from)?;
            records.push(TrackRecord::new(
                row.track_number,
                PcmBuffer::new(bytes),
                row.volume,
                row.muted,
            ));
        }
        Ok(records)
    }

    fn list_projects(&self) -> Result<Vec<ProjectInfo>> {
        let mut projects = self.read_index()?.projects;
        sort_listing(&mut projects);
        Ok(projects)
    }
}
