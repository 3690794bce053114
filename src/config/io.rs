use std::env::current_exe;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::str;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use directories_next::ProjectDirs;
use fd_lock::{RwLock, RwLockWriteGuard};
use log::{info, warn};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::config::types::Config;
use crate::error::ConfigError;

// pixels-ble.json next to the executable, for installs that travel on a usb stick
fn get_portable_config_path() -> Option<PathBuf> {
    match current_exe() {
        Ok(mut path) => {
            if !path.set_extension("json") {
                warn!("current exe has no filename: {}", path.to_string_lossy());
                return None;
            }

            Some(path)
        },
        Err(err) => {
            warn!("failed to get current exe path: {:?}", err);
            None
        },
    }
}

// os dependent standard directory, such as ~/.config on linux
fn get_local_config_path() -> Option<PathBuf> {
    ProjectDirs::from("io", "pixels", "pixels-ble").map(|dirs| dirs.config_dir().join("pixels-ble.json"))
}

fn get_config_path() -> Result<PathBuf, ConfigError> {
    if let Some(path) = get_portable_config_path() {
        match std::fs::metadata(&path) {
            Ok(attr) if attr.is_file() => return Ok(path),
            Ok(_) => {},
            Err(err) => {
                let err = ConfigError::from(err);
                if !err.is_file_not_found_error() {
                    warn!("Could not read metadata of: {}; Using local path instead. ({})", path.to_string_lossy(), err);
                }
            },
        }
    }

    get_local_config_path().ok_or(ConfigError::NoConfigPath)
}

pub struct ConfigIOLocker {
    rw_lock: RwLock<std::fs::File>,
}

impl ConfigIOLocker {
    /// Exclusive lock, so that only one instance drives the radio at a time.
    pub fn lock(&mut self) -> Result<RwLockWriteGuard<'_, std::fs::File>, ConfigError> {
        self.rw_lock
            .try_write()
            .map_err(|source| ConfigError::CanNotLock { source })
    }
}

struct ConfigIOInner {
    path: PathBuf,
    file: std::fs::File,
}

#[derive(Clone)]
pub struct ConfigIO {
    inner: Arc<Mutex<ConfigIOInner>>,
}

impl ConfigIO {
    pub fn new_sync() -> Result<Self, ConfigError> {
        Self::open(get_config_path()?)
    }

    pub fn open(path: PathBuf) -> Result<Self, ConfigError> {
        info!("Using config file {}", path.to_string_lossy());

        if let Some(directory) = path.parent() {
            std::fs::create_dir_all(directory)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .truncate(false)
            .append(false)
            .create(true)
            .open(&path)?;

        Ok(ConfigIO {
            inner: Arc::new(Mutex::new(ConfigIOInner { path, file })),
        })
    }

    fn inner(&self) -> MutexGuard<'_, ConfigIOInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn path(&self) -> PathBuf {
        self.inner().path.clone()
    }

    pub fn locker(&self) -> Result<ConfigIOLocker, ConfigError> {
        Ok(ConfigIOLocker {
            rw_lock: RwLock::new(self.inner().file.try_clone()?),
        })
    }

    // The File returned from here shares its cursor with every other clone
    fn get_file(&self) -> Result<File, ConfigError> {
        let file = self.inner().file.try_clone()?;
        Ok(File::from_std(file))
    }

    pub async fn read(&self) -> Result<Config, ConfigError> {
        let mut file = self.get_file()?;
        info!("Reading config file");

        let mut content = vec![];
        file.rewind().await?;
        file.read_to_end(&mut content).await?;

        if content.is_empty() {
            return Ok(Config::default());
        }

        let content = str::from_utf8(&content)?;

        let mut config: Config = serde_json::from_str(content)?;
        config.normalize();
        Ok(config)
    }

    pub async fn save(&self, config: &Config) -> Result<(), ConfigError> {
        let mut file = self.get_file()?;
        info!("Saving config");

        let content = serde_json::to_string_pretty(config)?;
        file.rewind().await?;
        file.set_len(0).await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("pixels-ble-test-{}", std::process::id()))
            .join(name)
    }

    #[tokio::test]
    async fn empty_file_reads_defaults_and_save_round_trips() {
        let path = temp_path("round-trip.json");
        let _ = std::fs::remove_file(&path);
        let io = ConfigIO::open(path.clone()).unwrap();

        assert_eq!(io.read().await.unwrap(), Config::default());

        let mut config = Config::default();
        config.name_prefix = Some("Pixel".to_string());
        config.scan_duration_ms = 3000;
        io.save(&config).await.unwrap();

        // shorter content must not leave a tail of the previous save
        io.save(&Config::default()).await.unwrap();
        assert_eq!(io.read().await.unwrap(), Config::default());

        io.save(&config).await.unwrap();
        assert_eq!(io.read().await.unwrap(), config);
        assert_eq!(io.path(), path);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn invalid_json_is_reported() {
        let path = temp_path("invalid.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{ not json").unwrap();

        let io = ConfigIO::open(path.clone()).unwrap();
        assert!(matches!(io.read().await, Err(ConfigError::JsonError { .. })));

        let _ = std::fs::remove_file(&path);
    }
}
