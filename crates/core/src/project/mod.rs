//! Saving and loading station content.
//!
//! Persistence is per track: number, raw PCM bytes, volume and mute. Only
//! tracks holding audio are stored. The PCM bytes carry no header; the
//! station format is implied.

mod json;

use std::{collections::HashMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use json::JsonProjectStore;

use crate::{
    LoopStation, LoopStationError, PcmBuffer, Result, StorageError, TrackSlot,
};

pub type ProjectId = u32;

/// Listing entry for a saved project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub id: ProjectId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// Bumped by every update.
    pub last_modified: DateTime<Utc>,
}

impl fmt::Display for ProjectInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (Modified: {})",
            self.name,
            self.last_modified.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

/// Persisted state of one track.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackRecord {
    /// 1-based track the record belongs to.
    pub track_number: usize,
    /// Raw headerless PCM; never empty in a valid record.
    pub audio: PcmBuffer,
    pub volume: f32,
    pub muted: bool,
}

impl TrackRecord {
    /// Builds a record as read back from a store.
    pub fn new(track_number: usize, audio: PcmBuffer, volume: f32, muted: bool) -> Self {
        Self {
            track_number,
            audio,
            volume,
            muted,
        }
    }

    /// `None` for a track without audio.
    pub fn from_slot(slot: &TrackSlot) -> Option<Self> {
        slot.audio_data().map(|audio| Self {
            track_number: slot.number(),
            audio: audio.clone(),
            volume: slot.volume(),
            muted: slot.is_muted(),
        })
    }

    /// Checks the record fits a station with `track_count` tracks.
    pub fn validate(&self, track_count: usize) -> Result<()> {
        if !(1..=track_count).contains(&self.track_number) {
            return Err(StorageError::Malformed(format!(
                "track number {} outside 1..={track_count}",
                self.track_number
            ))
            .into());
        }
        if self.audio.is_empty() {
            return Err(StorageError::Malformed(format!(
                "track {} has no audio",
                self.track_number
            ))
            .into());
        }
        if !self.volume.is_finite() {
            return Err(StorageError::Malformed(format!(
                "track {} has volume {}",
                self.track_number, self.volume
            ))
            .into());
        }
        Ok(())
    }
}

/// Storage collaborator for station projects.
pub trait ProjectStore {
    /// Creates a project from the tracks holding audio and returns its id.
    fn save_project(&mut self, name: &str, tracks: &[TrackSlot]) -> Result<ProjectId>;

    /// Renames the project and replaces its stored tracks.
    fn update_project(&mut self, id: ProjectId, name: &str, tracks: &[TrackSlot]) -> Result<()>;

    /// Stored tracks of the project, in track order.
    fn load_project(&self, id: ProjectId) -> Result<Vec<TrackRecord>>;

    /// All projects, most recently modified first.
    fn list_projects(&self) -> Result<Vec<ProjectInfo>>;
}

fn records_of(tracks: &[TrackSlot]) -> Vec<TrackRecord> {
    tracks.iter().filter_map(TrackRecord::from_slot).collect()
}

fn sort_listing(projects: &mut [ProjectInfo]) {
    projects.sort_by(|a, b| {
        b.last_modified
            .cmp(&a.last_modified)
            .then_with(|| b.id.cmp(&a.id))
    });
}

/// Project store kept in memory, for tests and throwaway sessions.
#[derive(Debug, Default)]
pub struct MemoryProjectStore {
    projects: HashMap<ProjectId, (ProjectInfo, Vec<TrackRecord>)>,
    next_id: ProjectId,
    read_only: bool,
}

impl MemoryProjectStore {
    /// An empty, writable store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every write fail, the way a full or read-only disk would.
    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "project store is read-only",
            ))
            .into())
        } else {
            Ok(())
        }
    }
}

impl ProjectStore for MemoryProjectStore {
    fn save_project(&mut self, name: &str, tracks: &[TrackSlot]) -> Result<ProjectId> {
        self.check_writable()?;
        self.next_id += 1;
        let id = self.next_id;
        let now = Utc::now();
        let info = ProjectInfo {
            id,
            name: name.to_string(),
            created_at: now,
            last_modified: now,
        };
        self.projects.insert(id, (info, records_of(tracks)));
        Ok(id)
    }

    fn update_project(&mut self, id: ProjectId, name: &str, tracks: &[TrackSlot]) -> Result<()> {
        self.check_writable()?;
        let (info, records) = self
            .projects
            .get_mut(&id)
            .ok_or(StorageError::ProjectNotFound(id))?;
        info.name = name.to_string();
        info.last_modified = Utc::now();
        *records = records_of(tracks);
        Ok(())
    }

    fn load_project(&self, id: ProjectId) -> Result<Vec<TrackRecord>> {
        self.projects
            .get(&id)
            .map(|(_, records)| records.clone())
            .ok_or_else(|| StorageError::ProjectNotFound(id).into())
    }

    fn list_projects(&self) -> Result<Vec<ProjectInfo>> {
        let mut projects: Vec<ProjectInfo> =
            self.projects.values().map(|(info, _)| info.clone()).collect();
        sort_listing(&mut projects);
        Ok(projects)
    }
}

/// Project the station content was last saved to or loaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentProject {
    pub id: ProjectId,
    pub name: String,
}

/// A station bound to a project store, remembering the current project so
/// repeated saves update it instead of creating copies.
#[derive(Debug)]
pub struct ProjectSession<S> {
    station: LoopStation,
    store: S,
    current: Option<CurrentProject>,
}

impl<S: ProjectStore> ProjectSession<S> {
    /// Starts without a current project.
    pub fn new(station: LoopStation, store: S) -> Self {
        Self {
            station,
            store,
            current: None,
        }
    }

    pub fn station(&self) -> &LoopStation {
        &self.station
    }

    pub fn station_mut(&mut self) -> &mut LoopStation {
        &mut self.station
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Project the next `save` updates, if any.
    pub fn current_project(&self) -> Option<&CurrentProject> {
        self.current.as_ref()
    }

    /// Saves under `name`, updating the current project if there is one.
    /// Nothing changes in memory when the store fails.
    pub fn save(&mut self, name: &str) -> Result<ProjectId> {
        let name = name.trim();
        if name.is_empty() {
            return Err(LoopStationError::EmptyProjectName);
        }
        if !self.station.has_any_audio() {
            return Err(LoopStationError::NothingToSave);
        }

        let id = match &self.current {
            Some(current) => {
                self.store
                    .update_project(current.id, name, self.station.tracks())?;
                current.id
            }
            None => self.store.save_project(name, self.station.tracks())?,
        };

        tracing::info!(project = id, name, "project saved");
        self.current = Some(CurrentProject {
            id,
            name: name.to_string(),
        });
        Ok(id)
    }

    /// Replaces the station content with a stored project.
    ///
    /// The project is read and validated in full before playback stops and
    /// tracks are cleared; a failed read or a malformed record leaves the
    /// station and the current project as they were.
    pub fn load(&mut self, id: ProjectId) -> Result<ProjectInfo> {
        let info = self
            .store
            .list_projects()?
            .into_iter()
            .find(|info| info.id == id)
            .ok_or(StorageError::ProjectNotFound(id))?;
        let records = self.store.load_project(id)?;

        self.station.apply_records(records)?;
        tracing::info!(project = id, name = %info.name, "project loaded");
        self.current = Some(CurrentProject {
            id,
            name: info.name.clone(),
        });
        Ok(info)
    }

    /// Saved projects, most recently modified first.
    pub fn list(&self) -> Result<Vec<ProjectInfo>> {
        self.store.list_projects()
    }

    /// Clears every track and forgets the current project.
    pub fn clear_all(&mut self) {
        self.station.clear_all();
        self.current = None;
    }

    /// Gives back the station and the store.
    pub fn into_parts(self) -> (LoopStation, S) {
        (self.station, self.store)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::device::memory::MemoryBackend;

    fn session() -> ProjectSession<MemoryProjectStore> {
        let station = LoopStation::new(Arc::new(MemoryBackend::realtime()), 4).unwrap();
        ProjectSession::new(station, MemoryProjectStore::new())
    }

    fn put(session: &mut ProjectSession<MemoryProjectStore>, track: usize, fill: u8) {
        session
            .station_mut()
            .track_mut(track)
            .unwrap()
            .set_audio_data(PcmBuffer::new(vec![fill; 32]))
            .unwrap();
    }

    #[test]
    fn save_validates_name_and_content() {
        let mut session = session();
        assert!(matches!(
            session.save("groove"),
            Err(LoopStationError::NothingToSave)
        ));

        put(&mut session, 1, 1);
        assert!(matches!(
            session.save("   "),
            Err(LoopStationError::EmptyProjectName)
        ));
        assert!(session.current_project().is_none());
    }

    #[test]
    fn second_save_updates_the_current_project() {
        let mut session = session();
        put(&mut session, 1, 1);
        let id = session.save("groove").unwrap();

        put(&mut session, 3, 3);
        assert_eq!(session.save("groove v2").unwrap(), id);

        let listing = session.list().unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "groove v2");
        assert_eq!(session.store().load_project(id).unwrap().len(), 2);
    }

    #[test]
    fn failed_save_keeps_session_state() {
        let mut session = session();
        put(&mut session, 1, 1);
        session.store_mut().set_read_only(true);

        let err = session.save("groove").unwrap_err();
        assert!(format!("{err}").contains("read-only"));
        assert!(session.current_project().is_none());
        assert!(session.station().track(1).unwrap().has_audio());
    }

    #[test]
    fn load_restores_tracks_volume_and_mute() {
        let mut session = session();
        put(&mut session, 2, 9);
        {
            let track = session.station_mut().track_mut(2).unwrap();
            track.set_volume(0.25);
            track.set_muted(true);
        }
        let id = session.save("layers").unwrap();

        session.clear_all();
        put(&mut session, 1, 5);
        assert!(session.current_project().is_none());

        let info = session.load(id).unwrap();
        assert_eq!(info.name, "layers");
        let station = session.station();
        assert!(!station.track(1).unwrap().has_audio());
        let track = station.track(2).unwrap();
        assert_eq!(track.audio_data().unwrap().as_bytes(), &[9; 32]);
        approx::assert_relative_eq!(track.volume(), 0.25);
        assert!(track.is_muted());
        assert_eq!(session.current_project().unwrap().id, id);
    }

    #[test]
    fn loading_unknown_project_changes_nothing() {
        let mut session = session();
        put(&mut session, 1, 1);
        assert!(matches!(
            session.load(42),
            Err(LoopStationError::Storage(StorageError::ProjectNotFound(42)))
        ));
        assert!(session.station().track(1).unwrap().has_audio());
    }

    #[test]
    fn record_validation() {
        let audio = PcmBuffer::new(vec![0; 2]);
        assert!(TrackRecord::new(1, audio.clone(), 1.0, false).validate(4).is_ok());
        assert!(TrackRecord::new(0, audio.clone(), 1.0, false).validate(4).is_err());
        assert!(TrackRecord::new(5, audio.clone(), 1.0, false).validate(4).is_err());
        assert!(TrackRecord::new(2, audio, f32::INFINITY, false).validate(4).is_err());
        assert!(TrackRecord::new(3, PcmBuffer::new(Vec::new()), 1.0, false)
            .validate(4)
            .is_err());
    }

    #[test]
    fn listing_shows_newest_first() {
        let mut store = MemoryProjectStore::new();
        let first = store.save_project("a", &[]).unwrap();
        let second = store.save_project("b", &[]).unwrap();
        store.update_project(first, "a2", &[]).unwrap();

        let ids: Vec<ProjectId> = store.list_projects().unwrap().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![first, second]);
    }
}
