//! Durable log of finished angle sessions, plus flat-file export.
//!
//! The log is one string: sessions separated by `;`, values within a
//! session by `,`. Values use Rust's shortest round-trip float formatting,
//! so decoding an encoded log yields the same numbers.

use crate::config::ControllerConfig;
use crate::observable::Observable;
use crate::Result;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

const SESSION_SEPARATOR: char = ';';
const VALUE_SEPARATOR: char = ',';

/// Key-value style backing store for the serialized log.
pub trait PreferenceStore: Send + Sync {
    /// `Ok(None)` when nothing was ever saved.
    fn load(&self) -> io::Result<Option<String>>;

    /// Replace the stored log. Must not leave a half-written log behind.
    fn save(&self, contents: &str) -> io::Result<()>;
}

/// Log stored in a single file, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PreferenceStore for FileStore {
    fn load(&self) -> io::Result<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn save(&self, contents: &str) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &self.path)
    }
}

/// In-process store, for tests and hosts that persist elsewhere.
#[derive(Debug, Default)]
pub struct MemoryStore {
    contents: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contents(contents: impl Into<String>) -> Self {
        Self {
            contents: Mutex::new(Some(contents.into())),
        }
    }

    pub fn contents(&self) -> Option<String> {
        self.contents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl PreferenceStore for MemoryStore {
    fn load(&self) -> io::Result<Option<String>> {
        Ok(self.contents())
    }

    fn save(&self, contents: &str) -> io::Result<()> {
        *self.contents.lock().unwrap_or_else(PoisonError::into_inner) = Some(contents.to_string());
        Ok(())
    }
}

/// A stored log entry that is not a number.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Malformed value {value:?} in session {session}")]
pub struct DecodeError {
    pub session: usize,
    pub value: String,
}

/// Serialize sessions, oldest first.
pub fn encode_sessions(sessions: &[Vec<f64>]) -> String {
    let mut out = String::new();
    for (i, session) in sessions.iter().enumerate() {
        if i > 0 {
            out.push(SESSION_SEPARATOR);
        }
        for (j, value) in session.iter().enumerate() {
            if j > 0 {
                out.push(VALUE_SEPARATOR);
            }
            out.push_str(&value.to_string());
        }
    }
    out
}

/// Parse a serialized log. An empty string is an empty log.
pub fn decode_sessions(encoded: &str) -> std::result::Result<Vec<Vec<f64>>, DecodeError> {
    let encoded = encoded.trim();
    if encoded.is_empty() {
        return Ok(Vec::new());
    }
    encoded
        .split(SESSION_SEPARATOR)
        .enumerate()
        .map(|(session, values)| {
            values
                .split(VALUE_SEPARATOR)
                .map(|value| {
                    value.trim().parse::<f64>().map_err(|_| DecodeError {
                        session,
                        value: value.to_string(),
                    })
                })
                .collect()
        })
        .collect()
}

/// Append-only log of finished sessions.
///
/// Appends are serialized, so concurrent writers never interleave or lose
/// each other's sessions. A store that cannot be read or parsed counts as
/// an empty log.
pub struct SessionArchive {
    store: Box<dyn PreferenceStore>,
    export_dir: PathBuf,
    write_lock: Mutex<()>,
    sessions: Observable<Vec<Vec<f64>>>,
}

impl SessionArchive {
    pub fn new(store: impl PreferenceStore + 'static, export_dir: impl Into<PathBuf>) -> Self {
        let archive = Self {
            store: Box::new(store),
            export_dir: export_dir.into(),
            write_lock: Mutex::new(()),
            sessions: Observable::new(Vec::new()),
        };
        archive.sessions.set(archive.read_log());
        archive
    }

    /// File-backed archive at the configured locations.
    pub fn open(config: &ControllerConfig) -> Self {
        log::info!(
            "Session archive at {} (exports to {})",
            config.archive_path.display(),
            config.export_dir.display()
        );
        Self::new(FileStore::new(&config.archive_path), &config.export_dir)
    }

    pub fn in_memory(export_dir: impl Into<PathBuf>) -> Self {
        Self::new(MemoryStore::new(), export_dir)
    }

    /// Append one finished session. Empty histories are not recorded.
    pub fn append_session(&self, history: &[f64]) -> Result<()> {
        if history.is_empty() {
            log::debug!("Skipping empty session");
            return Ok(());
        }
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut sessions = self.read_log();
        sessions.push(history.to_vec());
        self.store.save(&encode_sessions(&sessions))?;

        log::info!(
            "Archived session #{} ({} angles)",
            sessions.len(),
            history.len()
        );
        self.sessions.set(sessions);
        Ok(())
    }

    /// All archived sessions, most recent last.
    pub fn list_sessions(&self) -> Vec<Vec<f64>> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.read_log()
    }

    /// Observable copy of the log, refreshed on every append.
    pub fn sessions(&self) -> &Observable<Vec<Vec<f64>>> {
        &self.sessions
    }

    pub fn export_dir(&self) -> &Path {
        &self.export_dir
    }

    /// Write `history` to `<export_dir>/<name>.csv`, replacing any previous
    /// file of that name. Every value is followed by a comma.
    pub fn export_to_flat_file(&self, name: &str, history: &[f64]) -> Result<PathBuf> {
        if name.is_empty() || name.contains(|c: char| c == '/' || c == '\\') || name == "." || name == ".." {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid export name {:?}", name),
            )
            .into());
        }
        fs::create_dir_all(&self.export_dir)?;
        let path = self.export_dir.join(format!("{}.csv", name));

        let mut contents = String::with_capacity(history.len() * 8);
        for value in history {
            contents.push_str(&value.to_string());
            contents.push(VALUE_SEPARATOR);
        }
        fs::write(&path, contents)?;

        log::info!("Exported {} angles to {}", history.len(), path.display());
        Ok(path)
    }

    fn read_log(&self) -> Vec<Vec<f64>> {
        match self.store.load() {
            Ok(Some(encoded)) => decode_sessions(&encoded).unwrap_or_else(|e| {
                log::warn!("Session log is corrupt ({}), starting from an empty log", e);
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                log::warn!("Failed to read session log ({}), starting from an empty log", e);
                Vec::new()
            }
        }
    }
}

impl std::fmt::Debug for SessionArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionArchive")
            .field("export_dir", &self.export_dir)
            .field("sessions", &self.sessions.with(Vec::len))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn scratch_dir(tag: &str) -> PathBuf {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        let dir = std::env::temp_dir().join(format!(
            "tiltmeter-{}-{}-{}",
            tag,
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let sessions = vec![vec![1.0, 2.5], vec![3.33]];
        let encoded = encode_sessions(&sessions);
        assert_eq!(encoded, "1,2.5;3.33");
        assert_eq!(decode_sessions(&encoded).unwrap(), sessions);

        let awkward = vec![vec![0.1 + 0.2, -1e-300, 89.99999999999997]];
        assert_eq!(decode_sessions(&encode_sessions(&awkward)).unwrap(), awkward);
    }

    #[test]
    fn test_decode_empty_and_corrupt() {
        assert!(decode_sessions("").unwrap().is_empty());
        let err = decode_sessions("1,2;x,3").unwrap_err();
        assert_eq!(err.session, 1);
        assert_eq!(err.value, "x");
    }

    #[test]
    fn test_append_then_list() {
        let archive = SessionArchive::in_memory(scratch_dir("unused"));
        archive.append_session(&[1.0, 2.0]).unwrap();
        archive.append_session(&[0.0, 3.3355, 7.25]).unwrap();

        let sessions = archive.list_sessions();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions.last().unwrap(), &vec![0.0, 3.3355, 7.25]);
        assert_eq!(archive.sessions().get(), sessions);
    }

    #[test]
    fn test_empty_session_is_not_archived() {
        let archive = SessionArchive::in_memory(scratch_dir("unused"));
        archive.append_session(&[]).unwrap();
        assert!(archive.list_sessions().is_empty());
    }

    #[test]
    fn test_corrupt_store_starts_empty() {
        let archive = SessionArchive::new(MemoryStore::with_contents("1,2;abc"), scratch_dir("unused"));
        assert!(archive.list_sessions().is_empty());
        assert!(archive.sessions().get().is_empty());

        archive.append_session(&[4.5]).unwrap();
        assert_eq!(archive.list_sessions(), vec![vec![4.5]]);
    }

    #[test]
    fn test_file_store_persists_across_instances() {
        let dir = scratch_dir("store");
        let path = dir.join("nested").join("sessions.txt");

        let archive = SessionArchive::new(FileStore::new(&path), &dir);
        assert!(archive.list_sessions().is_empty());
        archive.append_session(&[10.0, 20.0]).unwrap();
        drop(archive);

        let reopened = SessionArchive::new(FileStore::new(&path), &dir);
        reopened.append_session(&[30.0]).unwrap();
        assert_eq!(reopened.list_sessions(), vec![vec![10.0, 20.0], vec![30.0]]);
        assert_eq!(fs::read_to_string(&path).unwrap(), "10,20;30");

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_concurrent_appends_are_not_lost() {
        let archive = Arc::new(SessionArchive::in_memory(scratch_dir("unused")));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let archive = archive.clone();
                std::thread::spawn(move || archive.append_session(&[i as f64, 0.5]).unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut firsts: Vec<f64> = archive.list_sessions().iter().map(|s| s[0]).collect();
        firsts.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(firsts, (0..8).map(|i| i as f64).collect::<Vec<_>>());
    }

    #[test]
    fn test_export_overwrites() {
        let dir = scratch_dir("export");
        let archive = SessionArchive::in_memory(&dir);

        let path = archive.export_to_flat_file("angles", &[1.5, 2.0, -3.25]).unwrap();
        assert_eq!(path, dir.join("angles.csv"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "1.5,2,-3.25,");

        archive.export_to_flat_file("angles", &[9.0]).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "9,");

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_export_rejects_path_names() {
        let archive = SessionArchive::in_memory(scratch_dir("unused"));
        assert!(archive.export_to_flat_file("../escape", &[1.0]).is_err());
        assert!(archive.export_to_flat_file("", &[1.0]).is_err());
    }
}
