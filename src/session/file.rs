//! One file per session under `save_path`, named by the session id and
//! holding the bag as a JSON object.

use std::fs::{self, File, FileTimes, OpenOptions};
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::debug;
use walkdir::WalkDir;

use super::cookie::is_valid_session_id;
use super::{SessionConfig, SessionError, SessionStore, SessionValues};

#[derive(Debug, Clone)]
pub struct FileSessionStore {
    save_path: PathBuf,
    max_lifetime: Duration,
}

impl FileSessionStore {
    /// `save_path` must name an existing directory; relative paths are
    /// resolved against the working directory.
    pub fn new(config: &SessionConfig) -> Result<Self, SessionError> {
        if config.save_path.as_os_str().is_empty() {
            return Err(SessionError::config("file session: empty save_path"));
        }

        let metadata = fs::metadata(&config.save_path).map_err(|err| {
            SessionError::config(format!(
                "file session: save_path `{}`: {err}",
                config.save_path.display()
            ))
        })?;
        if !metadata.is_dir() {
            return Err(SessionError::config(format!(
                "file session: `{}` is not a directory",
                config.save_path.display()
            )));
        }

        let save_path = std::path::absolute(&config.save_path).map_err(|err| {
            SessionError::config(format!("file session: cannot resolve save_path: {err}"))
        })?;

        Ok(Self {
            save_path,
            max_lifetime: config.lifetime(),
        })
    }

    pub fn save_path(&self) -> &Path {
        &self.save_path
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, SessionError> {
        if !is_valid_session_id(id) {
            return Err(SessionError::InvalidId(id.to_string()));
        }
        Ok(self.save_path.join(id))
    }
}

fn touch(file: &File, path: &Path) {
    let now = SystemTime::now();
    let times = FileTimes::new().set_accessed(now).set_modified(now);
    if let Err(err) = file.set_times(times) {
        debug!(
            target = "gantry::session::file",
            path = %path.display(),
            error = %err,
            "failed to refresh session file times"
        );
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self, id: &str) -> Result<SessionValues, SessionError> {
        let path = self.path_for(id)?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        // The sweep ages sessions by modification time.
        touch(&file, &path);

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        if bytes.is_empty() {
            return Ok(SessionValues::new());
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn save(&self, id: &str, values: &SessionValues) -> Result<(), SessionError> {
        let path = self.path_for(id)?;
        let encoded = serde_json::to_vec(values)?;
        fs::write(path, encoded)?;
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<(), SessionError> {
        let path = self.path_for(id)?;
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn sweep(&self) -> Result<usize, SessionError> {
        let now = SystemTime::now();
        let mut removed = 0;

        for entry in WalkDir::new(&self.save_path).min_depth(1) {
            let entry = entry.map_err(std::io::Error::from)?;
            if entry.file_type().is_dir() {
                continue;
            }
            let modified = entry
                .metadata()
                .map_err(std::io::Error::from)?
                .modified()?;
            let expired = modified
                .checked_add(self.max_lifetime)
                .is_some_and(|deadline| deadline < now);
            if !expired {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        Ok(removed)
    }
}
