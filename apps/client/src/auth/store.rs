use std::fs;
use std::io;
use std::path::PathBuf;

use directories::ProjectDirs;
use tracing::debug;

use super::session::Session;
use crate::errors::AppError;

/// The single durable piece of client state: the bearer credential, kept in
/// one file under the user's config directory. Read on startup, removed on
/// logout or authorization failure. Nothing else is persisted.
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    /// Opens the store at the default location, or at `override_path` when
    /// one is configured (tests point this at a temp directory).
    pub fn open(override_path: Option<PathBuf>) -> Result<Self, AppError> {
        let path = match override_path {
            Some(p) => p,
            None => ProjectDirs::from("", "", "campusnotes")
                .ok_or_else(|| {
                    AppError::Storage(io::Error::new(
                        io::ErrorKind::NotFound,
                        "no home directory for session storage",
                    ))
                })?
                .config_dir()
                .join("session"),
        };
        Ok(Self { path })
    }

    /// Loads the persisted session. An expired or unreadable credential is
    /// discarded on the spot so the next load starts clean.
    pub fn load(&self) -> Result<Option<Session>, AppError> {
        let token = match fs::read_to_string(&self.path) {
            Ok(t) => t.trim().to_string(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(AppError::Storage(e)),
        };
        if token.is_empty() {
            return Ok(None);
        }
        match Session::from_token(&token) {
            Ok(s) if !s.is_expired() => Ok(Some(s)),
            Ok(_) => {
                debug!("persisted session expired, clearing");
                self.clear()?;
                Ok(None)
            }
            Err(e) => {
                debug!("persisted credential unreadable ({e}), clearing");
                self.clear()?;
                Ok(None)
            }
        }
    }

    pub fn save(&self, session: &Session) -> Result<(), AppError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&self.path, session.token())?;
        Ok(())
    }

    pub fn clear(&self) -> Result<(), AppError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::Storage(e)),
        }
    }

    #[cfg(test)]
    pub(crate) fn path(&self) -> &std::path::Path {
        &self.path
    }
}
