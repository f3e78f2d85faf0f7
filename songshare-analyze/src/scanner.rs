//! Audio item discovery
//!
//! Expands the command-line inputs (files and directories) into the list of
//! audio files the tag store can write. Directory traversal is sequential;
//! magic-byte verification of the candidates runs on the rayon pool.

use rayon::prelude::*;
use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

/// Audio scanner errors
#[derive(Debug, Error)]
pub enum ScanError {
    /// Input path does not exist
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    /// Input file is not a supported audio file
    #[error("Not a supported audio file: {0}")]
    Unsupported(PathBuf),

    #[error("File access error {0}: {1}")]
    FileAccess(PathBuf, String),
}

/// Audio file scanner
#[derive(Debug, Clone)]
pub struct AudioScanner {
    ignore_patterns: Vec<String>,
    recursive: bool,
}

impl AudioScanner {
    /// Scanner with the default ignore list (VCS and OS metadata folders)
    pub fn new(recursive: bool) -> Self {
        Self {
            ignore_patterns: vec![
                ".DS_Store".to_string(),
                "Thumbs.db".to_string(),
                ".git".to_string(),
                ".svn".to_string(),
            ],
            recursive,
        }
    }

    /// Expand files and directories into a sorted, de-duplicated item list
    ///
    /// Explicit file arguments must be supported audio; unsupported files
    /// found inside directories are skipped.
    pub fn collect(&self, inputs: &[PathBuf]) -> Result<Vec<PathBuf>, ScanError> {
        let mut items = Vec::new();
        for input in inputs {
            if !input.exists() {
                return Err(ScanError::PathNotFound(input.clone()));
            }
            if input.is_dir() {
                items.extend(self.scan(input)?);
            } else if is_audio_file(input)? {
                items.push(input.clone());
            } else {
                return Err(ScanError::Unsupported(input.clone()));
            }
        }
        items.sort();
        items.dedup();
        Ok(items)
    }

    /// Audio files under `root`; one level deep unless recursive
    pub fn scan(&self, root: &Path) -> Result<Vec<PathBuf>, ScanError> {
        if !root.exists() {
            return Err(ScanError::PathNotFound(root.to_path_buf()));
        }

        let mut candidates = Vec::new();
        let mut symlink_visited = HashSet::new();
        let depth = if self.recursive { usize::MAX } else { 1 };

        let walker = WalkDir::new(root)
            .follow_links(false)
            .max_depth(depth)
            .into_iter()
            .filter_entry(|e| self.should_process_entry(e, &mut symlink_visited));

        for entry in walker {
            match entry {
                Ok(entry) if entry.file_type().is_file() => {
                    candidates.push(entry.path().to_path_buf());
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Error accessing entry"),
            }
        }

        let mut audio: Vec<PathBuf> = candidates
            .par_iter()
            .filter_map(|path| match is_audio_file(path) {
                Ok(true) => Some(path.clone()),
                Ok(false) => None,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Error verifying file");
                    None
                }
            })
            .collect();
        audio.sort();

        debug!(
            root = %root.display(),
            candidates = candidates.len(),
            audio = audio.len(),
            "Directory scanned"
        );
        Ok(audio)
    }

    fn should_process_entry(&self, entry: &DirEntry, symlink_visited: &mut HashSet<PathBuf>) -> bool {
        let file_name = entry.file_name().to_string_lossy();

        // Hidden entries include our own staging files; the root itself is exempt
        if entry.depth() > 0 && file_name.starts_with('.') {
            return false;
        }
        if self.ignore_patterns.iter().any(|p| file_name.contains(p.as_str())) {
            return false;
        }

        if entry.file_type().is_symlink() {
            if let Ok(canonical) = entry.path().canonicalize() {
                if !symlink_visited.insert(canonical) {
                    warn!(path = %entry.path().display(), "Symlink loop detected");
                    return false;
                }
            }
        }
        true
    }
}

impl Default for AudioScanner {
    fn default() -> Self {
        Self::new(false)
    }
}

/// MP3 by extension, confirmed by frame sync or ID3 header
pub fn is_audio_file(path: &Path) -> Result<bool, ScanError> {
    let is_mp3 = path
        .extension()
        .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("mp3"))
        .unwrap_or(false);
    if !is_mp3 {
        return Ok(false);
    }
    verify_magic_bytes(path)
}

fn verify_magic_bytes(path: &Path) -> Result<bool, ScanError> {
    let mut file =
        File::open(path).map_err(|e| ScanError::FileAccess(path.to_path_buf(), e.to_string()))?;

    let mut buffer = [0u8; 4];
    let bytes_read = file
        .read(&mut buffer)
        .map_err(|e| ScanError::FileAccess(path.to_path_buf(), e.to_string()))?;
    if bytes_read < 4 {
        return Ok(false);
    }

    Ok(matches!(
        buffer,
        [0xFF, 0xFB, ..] | [0xFF, 0xF3, ..] | [0xFF, 0xF2, ..] | [b'I', b'D', b'3', ..]
    ))
}
