// Copyright 2025 Cloudflare, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Cache backend storage abstraction
//!
//! A [Storage] manages named blobs inside one directory. It is not
//! thread-safe by contract; callers serialize access (the facade in
//! [crate] layers the locking on top).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use wicket_error::{Error, ErrorKind::*, OrErr, Result};

/// The directory created directly under the configured working directory.
pub const CACHE_DIR_NAME: &str = "__cache__";

/// Blob storage interface.
pub trait Storage {
    /// Create or overwrite the blob `name`.
    fn save(&self, name: &str, msg: &[u8]) -> Result<()>;

    /// The first blob whose content equals `msg`, if any.
    ///
    /// This is an expensive linear scan; the cache does not care much about
    /// lookup performance here.
    fn get_id_by_msg(&self, msg: &[u8]) -> Result<Option<String>>;

    /// Read the blob `name`.
    fn get_msg_by_id(&self, name: &str) -> Result<Vec<u8>>;

    /// Delete the blob `name`. Deleting a missing blob is not an error.
    fn remove(&self, name: &str) -> Result<()>;

    /// Delete every regular file in the working directory.
    fn remove_all(&self) -> Result<()>;

    /// Names of all regular files in the working directory.
    fn entry_names(&self) -> Result<Vec<String>>;

    /// Last write time of the blob `name`.
    fn modified(&self, name: &str) -> Result<SystemTime>;
}

/// [Storage] over regular files in `<workdir>/__cache__`.
#[derive(Debug)]
pub struct FileStore {
    wdir: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) the cache directory under `workdir`.
    pub fn new(workdir: &Path) -> Result<Self> {
        if !workdir.is_dir() {
            return Error::e_explain(
                FileOpenError,
                format!("cache parent directory {} not usable", workdir.display()),
            );
        }
        let wdir = workdir.join(CACHE_DIR_NAME);
        if !wdir.is_dir() {
            fs::create_dir(&wdir).or_err_with(FileCreateError, || {
                format!("failed to create cache directory {}", wdir.display())
            })?;
        }
        Ok(FileStore { wdir })
    }

    pub fn wdir(&self) -> &Path {
        &self.wdir
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.wdir.join(name)
    }

    fn regular_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let entries = fs::read_dir(&self.wdir).or_err_with(FileOpenError, || {
            format!("cache directory {} not readable", self.wdir.display())
        })?;
        for entry in entries {
            let entry = entry.or_err(FileReadError, "while scanning cache directory")?;
            let path = entry.path();
            if path.is_file() {
                files.push(path);
            }
        }
        Ok(files)
    }
}

impl Storage for FileStore {
    fn save(&self, name: &str, msg: &[u8]) -> Result<()> {
        if name.is_empty() {
            return Error::e_explain(InternalError, "refusing to save blob with empty name");
        }
        fs::write(self.path_of(name), msg)
            .or_err_with(FileWriteError, || format!("while writing blob {name}"))
    }

    fn get_id_by_msg(&self, msg: &[u8]) -> Result<Option<String>> {
        for path in self.regular_files()? {
            let Ok(content) = fs::read(&path) else {
                // a concurrent writer may have removed it, not our problem
                continue;
            };
            if content == msg {
                return Ok(path.file_name().map(|n| n.to_string_lossy().into_owned()));
            }
        }
        Ok(None)
    }

    fn get_msg_by_id(&self, name: &str) -> Result<Vec<u8>> {
        fs::read(self.path_of(name))
            .or_err_with(FileReadError, || format!("while reading blob {name}"))
    }

    fn remove(&self, name: &str) -> Result<()> {
        let path = self.path_of(name);
        if !path.is_file() {
            return Ok(());
        }
        fs::remove_file(&path)
            .or_err_with(FileRemoveError, || format!("while removing blob {name}"))
    }

    fn remove_all(&self) -> Result<()> {
        for path in self.regular_files()? {
            fs::remove_file(&path).or_err_with(FileRemoveError, || {
                format!("while removing {}", path.display())
            })?;
        }
        Ok(())
    }

    fn entry_names(&self) -> Result<Vec<String>> {
        Ok(self
            .regular_files()?
            .into_iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect())
    }

    fn modified(&self, name: &str) -> Result<SystemTime> {
        let meta = fs::metadata(self.path_of(name))
            .or_err_with(FileOpenError, || format!("while inspecting blob {name}"))?;
        meta.modified()
            .or_err(FileOpenError, "last write time not available")
    }
}
