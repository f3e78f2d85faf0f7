//! Compact tag and side-record stores
//!
//! Stores never write their target in place. `stage` writes the complete new
//! content to a staging path chosen by the transaction; the transaction renames
//! it over the target once every store has staged successfully.

use crate::error::PersistenceError;
use crate::merge::{SideRecord, TagSet};
use id3::frame::ExtendedText;
use id3::{ErrorKind, Tag, TagLike, Version};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Compact tag container embedded in the audio file
pub trait TagStore: Send + Sync {
    /// Current tags of `audio`; a file without a tag yields an empty set
    fn read(&self, audio: &Path) -> Result<TagSet, PersistenceError>;

    /// Write a copy of `audio` carrying exactly `tags` to `staged`
    fn stage(&self, audio: &Path, staged: &Path, tags: &TagSet) -> Result<(), PersistenceError>;
}

/// Full-fidelity side-record stored next to the audio file
pub trait SideRecordStore: Send + Sync {
    /// Side-record path for `audio`
    fn path_for(&self, audio: &Path) -> PathBuf;

    /// Current side-record; a missing file yields an empty record
    fn read(&self, audio: &Path) -> Result<SideRecord, PersistenceError>;

    /// Write `record` to `staged`
    fn stage(&self, staged: &Path, record: &SideRecord) -> Result<(), PersistenceError>;
}

/// Standard ID3v2 frames used for well-known keys; everything else is TXXX
///
/// `key` stays in TXXX: TKEY holds at most three characters ("Am") and
/// cannot carry names like "A minor".
const STANDARD_FRAMES: [(&str, &str); 2] = [("bpm", "TBPM"), ("genre", "TCON")];

fn standard_frame(key: &str) -> Option<&'static str> {
    STANDARD_FRAMES
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, frame)| *frame)
}

/// ID3v2 tag store
///
/// Keys `bpm` and `genre` map to TBPM and TCON. Every other key
/// is a TXXX frame whose description is the key. Frames outside that key space
/// (title, artist, artwork) are never touched.
#[derive(Debug, Clone, Default)]
pub struct Id3TagStore;

impl Id3TagStore {
    pub fn new() -> Self {
        Self
    }

    fn load(path: &Path) -> Result<Tag, PersistenceError> {
        match Tag::read_from_path(path) {
            Ok(tag) => Ok(tag),
            Err(e) if matches!(e.kind, ErrorKind::NoTag) => Ok(Tag::new()),
            Err(e) => Err(PersistenceError::TagStore {
                path: path.to_path_buf(),
                message: e.to_string(),
            }),
        }
    }

    fn managed(tag: &Tag) -> TagSet {
        let mut tags = TagSet::new();
        for (key, frame_id) in STANDARD_FRAMES {
            if let Some(text) = tag.get(frame_id).and_then(|f| f.content().text()) {
                tags.insert(key.to_string(), text.to_string());
            }
        }
        for extended in tag.extended_texts() {
            if standard_frame(&extended.description).is_some() {
                continue;
            }
            tags.entry(extended.description.clone())
                .or_insert_with(|| extended.value.clone());
        }
        tags
    }
}

impl TagStore for Id3TagStore {
    fn read(&self, audio: &Path) -> Result<TagSet, PersistenceError> {
        Ok(Self::managed(&Self::load(audio)?))
    }

    fn stage(&self, audio: &Path, staged: &Path, tags: &TagSet) -> Result<(), PersistenceError> {
        std::fs::copy(audio, staged).map_err(|e| PersistenceError::io(staged, e))?;

        let mut tag = Self::load(staged)?;
        let current = Self::managed(&tag);

        for key in current.keys().filter(|k| !tags.contains_key(*k)) {
            match standard_frame(key) {
                Some(frame_id) => {
                    tag.remove(frame_id);
                }
                None => tag.remove_extended_text(Some(key.as_str()), None),
            }
        }

        for (key, value) in tags {
            if current.get(key) == Some(value) {
                continue;
            }
            match standard_frame(key) {
                Some(frame_id) => tag.set_text(frame_id, value.clone()),
                None => {
                    tag.remove_extended_text(Some(key.as_str()), None);
                    tag.add_frame(ExtendedText {
                        description: key.clone(),
                        value: value.clone(),
                    });
                }
            }
        }

        tag.write_to_path(staged, Version::Id3v24)
            .map_err(|e| PersistenceError::TagStore {
                path: staged.to_path_buf(),
                message: e.to_string(),
            })?;

        debug!(audio = %audio.display(), tags = tags.len(), "Tags staged");
        Ok(())
    }
}

/// Pretty-printed JSON side-record at `<audio><suffix>`
#[derive(Debug, Clone)]
pub struct JsonSideRecordStore {
    suffix: String,
}

impl JsonSideRecordStore {
    pub fn new(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
        }
    }
}

impl Default for JsonSideRecordStore {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_SIDE_RECORD_SUFFIX)
    }
}

impl SideRecordStore for JsonSideRecordStore {
    fn path_for(&self, audio: &Path) -> PathBuf {
        with_suffix(audio, &self.suffix)
    }

    fn read(&self, audio: &Path) -> Result<SideRecord, PersistenceError> {
        let path = self.path_for(audio);
        if !path.exists() {
            return Ok(SideRecord::default());
        }
        let content = std::fs::read_to_string(&path).map_err(|e| PersistenceError::io(&path, e))?;
        serde_json::from_str(&content).map_err(|e| PersistenceError::SideRecord {
            path,
            message: e.to_string(),
        })
    }

    fn stage(&self, staged: &Path, record: &SideRecord) -> Result<(), PersistenceError> {
        let content = serde_json::to_string_pretty(record).map_err(|e| PersistenceError::SideRecord {
            path: staged.to_path_buf(),
            message: e.to_string(),
        })?;
        std::fs::write(staged, content).map_err(|e| PersistenceError::io(staged, e))
    }
}

/// `song.mp3` + `.analysis.json` => `song.mp3.analysis.json`
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os: OsString = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}
