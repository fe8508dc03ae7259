// Copyright (C) 2025 Bonsai Software, Inc.
// This file is part of Cubelink, and is licensed under the
// GNU General Public License, version 3 or later. See the LICENSE file
// or <https://www.gnu.org/licenses/> for details.

use log::*;

use cubelink_link::{Setting, WireRecord, KEY_LEN};

use crate::{storage::FILE_SETTING, StationError, StationResult, Storage};

/// The live Setting and its persisted copy in `SETTING.BIN`.
#[derive(Debug)]
pub struct Settings {
    current: Setting,
    key: [u8; KEY_LEN],
    was_reset: bool,
}

impl Settings {
    /// Loads the persisted Setting. A missing or invalid file is replaced
    /// by the defaults, which are written back.
    pub fn load(storage: &mut dyn Storage, key: [u8; KEY_LEN]) -> StationResult<Self> {
        let loaded = match storage.read(FILE_SETTING)? {
            None => {
                info!("no {}, using defaults", FILE_SETTING);
                None
            }
            Some(bytes) => match Setting::read_from(&bytes) {
                Ok(setting) if setting.is_valid(&key) => Some(setting),
                Ok(setting) => {
                    warn!("{} failed validation: {:?}", FILE_SETTING, setting);
                    None
                }
                Err(err) => {
                    warn!("{} unreadable: {}", FILE_SETTING, err);
                    None
                }
            },
        };
        let settings = Settings {
            current: loaded.unwrap_or_else(|| Self::defaults(key)),
            key,
            was_reset: loaded.is_none(),
        };
        if settings.was_reset {
            settings.save(storage)?;
        }
        Ok(settings)
    }

    fn defaults(key: [u8; KEY_LEN]) -> Setting {
        Setting {
            key,
            ..Default::default()
        }
    }

    pub fn current(&self) -> &Setting {
        &self.current
    }

    /// True when the last load fell back to the defaults.
    pub fn was_reset(&self) -> bool {
        self.was_reset
    }

    /// Changes one field, committed only when the result validates.
    pub fn set_field(&mut self, storage: &mut dyn Storage, index: u8, value: u8) -> StationResult<()> {
        let next = self.current.with_field(index, value)?;
        self.commit(storage, next)
    }

    /// Replaces the whole Setting, the key must match ours.
    pub fn replace(&mut self, storage: &mut dyn Storage, next: Setting) -> StationResult<()> {
        if next.key != self.key {
            return Err(StationError::invalid_argument("setting key mismatch"));
        }
        self.commit(storage, next)
    }

    pub fn reset(&mut self, storage: &mut dyn Storage) -> StationResult<()> {
        info!("setting reset to defaults");
        let defaults = Self::defaults(self.key);
        write(storage, &defaults)?;
        self.current = defaults;
        Ok(())
    }

    fn commit(&mut self, storage: &mut dyn Storage, next: Setting) -> StationResult<()> {
        if !next.is_valid(&self.key) {
            return Err(StationError::invalid_argument(format!(
                "invalid setting: {:?}",
                next
            )));
        }
        // persisted first, a failed write leaves the live Setting alone
        if next.save_to_flash == 1 {
            write(storage, &next)?;
        } else {
            debug!("setting changed in memory only");
        }
        self.current = next;
        Ok(())
    }

    /// Writes the current Setting to storage.
    pub fn save(&self, storage: &mut dyn Storage) -> StationResult<()> {
        write(storage, &self.current)
    }
}

fn write(storage: &mut dyn Storage, setting: &Setting) -> StationResult<()> {
    storage.write(FILE_SETTING, &setting.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemStorage;
    use cubelink_link::DEFAULT_KEY;

    #[test]
    fn test_missing_file_writes_defaults() {
        let mut storage = MemStorage::new();
        let settings = Settings::load(&mut storage, DEFAULT_KEY).unwrap();
        assert!(settings.was_reset());
        assert_eq!(*settings.current(), Setting::default());
        assert_eq!(
            storage.read(FILE_SETTING).unwrap().unwrap(),
            Setting::default().to_bytes()
        );
    }

    #[test]
    fn test_corrupt_file_resets() {
        let mut storage = MemStorage::new();
        let mut bytes = Setting::default().to_bytes();
        bytes[0] = 0; // loop_runtime may not be zero
        storage.write(FILE_SETTING, &bytes).unwrap();
        let settings = Settings::load(&mut storage, DEFAULT_KEY).unwrap();
        assert!(settings.was_reset());
        assert_eq!(settings.current().loop_runtime, 20);

        storage.write(FILE_SETTING, b"short").unwrap();
        assert!(Settings::load(&mut storage, DEFAULT_KEY).unwrap().was_reset());

        // wrong key
        let other = Setting {
            key: *b"XYZ",
            ..Default::default()
        };
        storage.write(FILE_SETTING, &other.to_bytes()).unwrap();
        let settings = Settings::load(&mut storage, DEFAULT_KEY).unwrap();
        assert!(settings.was_reset());
        assert_eq!(settings.current().key, DEFAULT_KEY);
    }

    #[test]
    fn test_valid_file_survives() {
        let mut storage = MemStorage::new();
        let stored = Setting {
            beacon_threshold: 70,
            ..Default::default()
        };
        storage.write(FILE_SETTING, &stored.to_bytes()).unwrap();
        let settings = Settings::load(&mut storage, DEFAULT_KEY).unwrap();
        assert!(!settings.was_reset());
        assert_eq!(settings.current().beacon_threshold, 70);
    }

    #[test]
    fn test_set_field_and_save_to_flash() {
        let mut storage = MemStorage::new();
        let mut settings = Settings::load(&mut storage, DEFAULT_KEY).unwrap();

        settings.set_field(&mut storage, 4, 60).unwrap();
        let persisted = Setting::read_from(&storage.read(FILE_SETTING).unwrap().unwrap()).unwrap();
        assert_eq!(persisted.beacon_threshold, 60);

        // an invalid value leaves everything as it was
        assert!(settings.set_field(&mut storage, 0, 0).is_err());
        assert!(settings.set_field(&mut storage, 9, 1).is_err());
        assert_eq!(settings.current().loop_runtime, 20);

        // with save_to_flash off changes stay in memory
        settings.set_field(&mut storage, 6, 0).unwrap();
        settings.set_field(&mut storage, 5, 9).unwrap();
        assert_eq!(settings.current().inter_beacon_delay, 9);
        let persisted = Setting::read_from(&storage.read(FILE_SETTING).unwrap().unwrap()).unwrap();
        assert_eq!(persisted.inter_beacon_delay, 5);

        settings.reset(&mut storage).unwrap();
        assert_eq!(*settings.current(), Setting::default());
    }

    // reads work, writes fail once `broken` is set
    struct FlakyStorage {
        inner: MemStorage,
        broken: bool,
    }

    impl Storage for FlakyStorage {
        fn read(&self, name: &str) -> StationResult<Option<Vec<u8>>> {
            self.inner.read(name)
        }
        fn write(&mut self, name: &str, data: &[u8]) -> StationResult<()> {
            if self.broken {
                return Err(StationError::Storage(std::io::Error::other("card removed")));
            }
            self.inner.write(name, data)
        }
        fn list(&self, folder: &str) -> StationResult<Vec<String>> {
            self.inner.list(folder)
        }
        fn remove(&mut self, name: &str) -> StationResult<bool> {
            self.inner.remove(name)
        }
        fn remove_folder(&mut self, folder: &str) -> StationResult<()> {
            self.inner.remove_folder(folder)
        }
        fn wipe(&mut self) -> StationResult<()> {
            self.inner.wipe()
        }
    }

    #[test]
    fn test_failed_save_keeps_current() {
        let mut storage = FlakyStorage {
            inner: MemStorage::new(),
            broken: false,
        };
        let mut settings = Settings::load(&mut storage, DEFAULT_KEY).unwrap();
        settings.set_field(&mut storage, 4, 40).unwrap();

        storage.broken = true;
        assert!(settings.set_field(&mut storage, 4, 41).is_err());
        assert_eq!(settings.current().beacon_threshold, 40);
        let next = Setting {
            loop_runtime: 33,
            ..*settings.current()
        };
        assert!(settings.replace(&mut storage, next).is_err());
        assert_eq!(settings.current().loop_runtime, 20);
        assert!(settings.reset(&mut storage).is_err());
        assert_eq!(settings.current().beacon_threshold, 40);

        storage.broken = false;
        settings.set_field(&mut storage, 4, 41).unwrap();
        let persisted =
            Setting::read_from(&storage.read(FILE_SETTING).unwrap().unwrap()).unwrap();
        assert_eq!(persisted.beacon_threshold, 41);
    }

    #[test]
    fn test_replace_requires_key() {
        let mut storage = MemStorage::new();
        let mut settings = Settings::load(&mut storage, DEFAULT_KEY).unwrap();
        let foreign = Setting {
            key: *b"BBB",
            ..Default::default()
        };
        assert!(settings.replace(&mut storage, foreign).is_err());
        let next = Setting {
            loop_runtime: 33,
            ..Default::default()
        };
        settings.replace(&mut storage, next).unwrap();
        assert_eq!(settings.current().loop_runtime, 33);
    }
}
