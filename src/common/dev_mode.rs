use std::path::PathBuf;
use std::fs;
use directories::ProjectDirs;
use crate::common::config::Config;
use crate::common::error::Result;
use crate::common::paths;

#[derive(Debug, Clone)]
pub struct DevMode {
    enabled: bool,
    base_dir: PathBuf,
}

impl DevMode {
    pub fn new(enabled: bool) -> Result<Self> {
        let base_dir = if enabled {
            PathBuf::from("./dev_data")
        } else {
            PathBuf::new() // Not used when disabled
        };

        if enabled {
            fs::create_dir_all(&base_dir)?;
            fs::create_dir_all(base_dir.join("gallery"))?;
            fs::create_dir_all(base_dir.join("captures"))?;
            fs::create_dir_all(base_dir.join("reports"))?;

            println!("📁 Development mode enabled - data will be saved to: {}",
                     base_dir.display());
        }

        Ok(Self { enabled, base_dir })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Root directory for the gallery and ledger.
    ///
    /// Dev mode always wins; otherwise `[storage] data_dir`, then the
    /// per-user project directory, then the system location.
    pub fn data_dir(&self, config: &Config) -> PathBuf {
        if self.enabled {
            return self.base_dir.clone();
        }
        if let Some(dir) = &config.storage.data_dir {
            return dir.clone();
        }
        ProjectDirs::from("com", "fingertime", "Fingertime")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(paths::system_data_dir)
    }

    pub fn reports_dir(&self) -> PathBuf {
        if self.enabled {
            self.base_dir.join("reports")
        } else {
            PathBuf::from("./reports")
        }
    }

    pub fn get_capture_path(&self, prefix: &str) -> PathBuf {
        if self.enabled {
            let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
            self.base_dir.join("captures").join(format!("{}_{}.png", prefix, timestamp))
        } else {
            PathBuf::from(format!("{}.png", prefix))
        }
    }
}
