// Copyright (C) 2025 Bonsai Software, Inc.
// This file is part of Cubelink, and is licensed under the
// GNU General Public License, version 3 or later. See the LICENSE file
// or <https://www.gnu.org/licenses/> for details.

use log::*;
use std::{
    collections::BTreeMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use cubelink_link::ld_type;

use crate::{StationError, StationResult};

pub const FOLDER_OUTBOX: &str = "OUTB";
pub const FOLDER_SENT: &str = "SENT";
pub const FOLDER_RECEIVED: &str = "RECV";
pub const FILE_LOG: &str = "LOG";
pub const FILE_SETTING: &str = "SETTING.BIN";
pub const FILE_OPER_TIME: &str = "OPER.BIN";

/// Joins a folder and a file name into a storage name.
pub fn in_folder(folder: &str, name: &str) -> String {
    format!("{}/{}", folder, name)
}

/// Name of an outbox file: the decimal sequence number plus an extension
/// giving the kind.
pub fn file_name(file_seq: u16, kind: u8) -> String {
    match kind {
        ld_type::IMAGE => format!("{}.IMG", file_seq),
        ld_type::TEXT => format!("{}.TXT", file_seq),
        ld_type::STARS => format!("{}.STR", file_seq),
        _ => file_seq.to_string(),
    }
}

/// Inverse of `file_name`.
pub fn parse_file_name(name: &str) -> Option<(u16, u8)> {
    let (stem, kind) = match name.split_once('.') {
        None => (name, ld_type::OTHER),
        Some((stem, "IMG")) => (stem, ld_type::IMAGE),
        Some((stem, "TXT")) => (stem, ld_type::TEXT),
        Some((stem, "STR")) => (stem, ld_type::STARS),
        Some(_) => return None,
    };
    stem.parse().ok().map(|seq| (seq, kind))
}

/// A numbered file found in OUTB or SENT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub folder: &'static str,
    pub name: String,
    pub file_seq: u16,
    pub kind: u8,
    pub data: Vec<u8>,
}

/// Looks a file up by sequence number, the outbox first.
pub fn find_file(storage: &dyn Storage, file_seq: u16) -> StationResult<Option<StoredFile>> {
    for folder in [FOLDER_OUTBOX, FOLDER_SENT] {
        for name in storage.list(folder)? {
            match parse_file_name(&name) {
                Some((seq, kind)) if seq == file_seq => {
                    if let Some(data) = storage.read(&in_folder(folder, &name))? {
                        return Ok(Some(StoredFile {
                            folder,
                            name,
                            file_seq,
                            kind,
                            data,
                        }));
                    }
                }
                _ => {}
            }
        }
    }
    Ok(None)
}

/// Highest-numbered file waiting in the outbox.
pub fn last_outbox_file(storage: &dyn Storage) -> StationResult<Option<StoredFile>> {
    let last = storage
        .list(FOLDER_OUTBOX)?
        .iter()
        .filter_map(|name| parse_file_name(name))
        .map(|(seq, _)| seq)
        .max();
    match last {
        Some(seq) => find_file(storage, seq),
        None => Ok(None),
    }
}

/// Flat file store with one level of folders. Names are `FILE` or
/// `FOLDER/FILE`.
pub trait Storage: Send {
    /// Returns `None` when the file does not exist.
    fn read(&self, name: &str) -> StationResult<Option<Vec<u8>>>;
    fn write(&mut self, name: &str, data: &[u8]) -> StationResult<()>;
    /// File names in `folder`, sorted.
    fn list(&self, folder: &str) -> StationResult<Vec<String>>;
    /// Returns whether the file existed.
    fn remove(&mut self, name: &str) -> StationResult<bool>;
    fn remove_folder(&mut self, folder: &str) -> StationResult<()>;
    fn wipe(&mut self) -> StationResult<()>;

    fn append(&mut self, name: &str, data: &[u8]) -> StationResult<()> {
        let mut contents = self.read(name)?.unwrap_or_default();
        contents.extend_from_slice(data);
        self.write(name, &contents)
    }
}

fn check_name(name: &str) -> StationResult<()> {
    let parts: Vec<&str> = name.split('/').collect();
    let bad = parts.len() > 2
        || parts
            .iter()
            .any(|p| p.is_empty() || *p == "." || *p == ".." || p.contains('\\'));
    if bad {
        return Err(StationError::invalid_argument(format!(
            "bad storage name: {:?}",
            name
        )));
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct MemStorage {
    files: BTreeMap<String, Vec<u8>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemStorage {
    fn read(&self, name: &str) -> StationResult<Option<Vec<u8>>> {
        check_name(name)?;
        Ok(self.files.get(name).cloned())
    }

    fn write(&mut self, name: &str, data: &[u8]) -> StationResult<()> {
        check_name(name)?;
        self.files.insert(name.to_string(), data.to_vec());
        Ok(())
    }

    fn list(&self, folder: &str) -> StationResult<Vec<String>> {
        check_name(folder)?;
        let prefix = format!("{}/", folder);
        Ok(self
            .files
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .map(str::to_string)
            .collect())
    }

    fn remove(&mut self, name: &str) -> StationResult<bool> {
        check_name(name)?;
        Ok(self.files.remove(name).is_some())
    }

    fn remove_folder(&mut self, folder: &str) -> StationResult<()> {
        check_name(folder)?;
        let prefix = format!("{}/", folder);
        self.files.retain(|k, _| !k.starts_with(&prefix));
        Ok(())
    }

    fn wipe(&mut self) -> StationResult<()> {
        self.files.clear();
        Ok(())
    }
}

/// Storage rooted at a directory on the host file system.
#[derive(Debug)]
pub struct DirStorage {
    root: PathBuf,
}

impl DirStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> StationResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        debug!("storage rooted at {}", root.display());
        Ok(DirStorage { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> StationResult<PathBuf> {
        check_name(name)?;
        Ok(self.root.join(name))
    }
}

impl Storage for DirStorage {
    fn read(&self, name: &str) -> StationResult<Option<Vec<u8>>> {
        match fs::read(self.path(name)?) {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&mut self, name: &str, data: &[u8]) -> StationResult<()> {
        let path = self.path(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, data)?;
        Ok(())
    }

    fn list(&self, folder: &str) -> StationResult<Vec<String>> {
        let dir = self.path(folder)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    fn remove(&mut self, name: &str) -> StationResult<bool> {
        match fs::remove_file(self.path(name)?) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn remove_folder(&mut self, folder: &str) -> StationResult<()> {
        match fs::remove_dir_all(self.path(folder)?) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn wipe(&mut self) -> StationResult<()> {
        warn!("wiping storage at {}", self.root.display());
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.is_dir() {
                fs::remove_dir_all(path)?;
            } else {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}
