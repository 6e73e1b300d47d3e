//! File system settings storage backend.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::{fs, io};

use tracing::{debug, error, warn};

use basm::SettingsStore;

/// Integer settings stored in a file system directory with one JSON object
/// file per section.
///
/// A value of 0 and an absent key are equivalent, so writing 0 removes the
/// key, and removing the last key removes the section file.
#[derive(Clone, Debug)]
#[repr(transparent)]
pub struct ConfigStore(PathBuf);

impl ConfigStore {
    const NAME: &'static str = "settings";

    /// Creates or opens a settings store in the specified root directory.
    #[inline(always)]
    #[must_use]
    pub fn open(root: impl AsRef<Path>) -> Self {
        Self(root.as_ref().join(Self::NAME))
    }

    /// Creates or opens a settings store in the current user's local data
    /// directory.
    ///
    /// # Panics
    ///
    /// Panics if it cannot determine the user directory.
    #[must_use]
    pub fn per_user(app: impl AsRef<Path>) -> Self {
        let dir = dirs::data_local_dir()
            .expect("user directory not available")
            .join(app.as_ref())
            .join(Self::NAME);
        Self(dir)
    }

    /// Loads a section from the file system. A missing or invalid file is an
    /// empty section.
    fn load<T: serde::de::DeserializeOwned + Default>(&self, section: &str) -> T {
        let path = self.path(section);
        let s = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if matches!(e.kind(), io::ErrorKind::NotFound) => return T::default(),
            Err(e) => {
                error!("Failed to read: {} ({e})", path.display());
                return T::default();
            }
        };
        serde_json::from_str(&s).unwrap_or_else(|e| {
            error!("Invalid file contents: {} ({e})", path.display());
            T::default()
        })
    }

    /// Saves a section to the file system.
    fn save(&self, section: &str, v: &impl serde::ser::Serialize) -> bool {
        let s = serde_json::to_string_pretty(v).expect("failed to serialize settings");
        if let Err(e) = fs::create_dir_all(&self.0) {
            warn!(
                "Failed to create settings directory: {} ({e})",
                self.0.display()
            );
        }
        let path = self.path(section);
        // TODO: Make atomic?
        match fs::File::create(&path)
            .and_then(|mut f| f.write_all(s.as_bytes()).and_then(|_| f.sync_data()))
        {
            Ok(_) => {
                debug!("Wrote: {}", path.display());
                true
            }
            Err(e) => {
                error!("Failed to write: {} ({e})", path.display());
                false
            }
        }
    }

    /// Removes a section file from the file system.
    fn remove(&self, section: &str) -> bool {
        let path = self.path(section);
        match fs::remove_file(&path) {
            Ok(_) => true,
            Err(e) if matches!(e.kind(), io::ErrorKind::NotFound) => true,
            Err(e) => {
                error!("Failed to remove: {} ({e})", path.display());
                false
            }
        }
    }

    /// Returns the file path for the specified section.
    fn path(&self, section: &str) -> PathBuf {
        self.0.join(format!("{section}.json"))
    }
}

impl SettingsStore for ConfigStore {
    fn write(&self, section: &str, key: &str, v: u32) -> bool {
        let mut m: BTreeMap<String, u32> = self.load(section);
        if v == 0 {
            if m.remove(key).is_none() {
                return true;
            }
        } else if m.insert(key.to_owned(), v) == Some(v) {
            return true;
        }
        if m.is_empty() {
            self.remove(section)
        } else {
            self.save(section, &m)
        }
    }

    fn read(&self, section: &str, key: &str) -> u32 {
        (self.load::<BTreeMap<String, u32>>(section).get(key)).map_or(0, |&v| v)
    }
}
