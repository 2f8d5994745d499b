// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Durable storage for the cluster configuration.
//!
//! The control service owns exactly one configuration document and writes it through a
//! `ConfigurationStore` before acknowledging any change. Swapping the file store for a replicated
//! one only means another implementation of the trait.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use log::debug;

use crate::{error::ConfigurationError, model::Configuration};

pub trait ConfigurationStore: Send + Sync {
    /// The last saved configuration, or `None` if nothing was ever saved.
    fn load(&self) -> Result<Option<Configuration>, ConfigurationError>;

    /// Make `configuration` durable. Must not return before it would survive a crash.
    fn save(&self, configuration: &Configuration) -> Result<(), ConfigurationError>;
}

fn storage_error(path: &Path, e: impl std::fmt::Display) -> ConfigurationError {
    ConfigurationError::Storage(format!("{}: {e}", path.display()))
}

/// Stores the configuration as a JSON file, replaced atomically on every save.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: PathBuf) -> Self {
        FileStore { path }
    }

    fn temporary_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn write(&self, configuration: &Configuration) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temporary = self.temporary_path();
        let mut file = fs::File::create(&temporary)?;
        serde_json::to_writer_pretty(&mut file, configuration)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        fs::rename(&temporary, &self.path)?;
        if let Some(parent) = self.path.parent() {
            // Persist the rename itself.
            fs::File::open(parent)?.sync_all()?;
        }
        Ok(())
    }
}

impl ConfigurationStore for FileStore {
    fn load(&self) -> Result<Option<Configuration>, ConfigurationError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(storage_error(&self.path, e)),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| storage_error(&self.path, e))
    }

    fn save(&self, configuration: &Configuration) -> Result<(), ConfigurationError> {
        self.write(configuration)
            .map_err(|e| storage_error(&self.path, e))?;
        debug!(
            "saved configuration version {} to {}",
            configuration.version,
            self.path.display()
        );
        Ok(())
    }
}

/// Keeps the configuration in memory. Clones share the same saved document, which lets a test
/// "restart" a control service on top of what the previous instance saved.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    saved: Arc<Mutex<Option<Configuration>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following save fail, as a full or broken disk would.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl ConfigurationStore for MemoryStore {
    fn load(&self) -> Result<Option<Configuration>, ConfigurationError> {
        Ok(self.saved.lock().unwrap().clone())
    }

    fn save(&self, configuration: &Configuration) -> Result<(), ConfigurationError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ConfigurationError::Storage(
                "memory store is failing".to_string(),
            ));
        }
        *self.saved.lock().unwrap() = Some(configuration.clone());
        Ok(())
    }
}
