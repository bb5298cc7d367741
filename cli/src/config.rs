use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nibble_core::calendar::WeekAnchor;
use nibble_core::models::Device;

pub const DEFAULT_APP_GROUP: &str = "group.nibble";
const CONFIG_FILE: &str = "config.toml";
const DB_FILE: &str = "nibble.db";
const PAIRING_KEY_FILE: &str = "pairing_key";
const DEFAULT_PORT: u16 = 7878;
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 750;

/// Keys accepted in `config.toml`. Everything is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub device: Option<Device>,
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub peer_url: Option<String>,
    pub peer_key: Option<String>,
    pub probe_timeout_ms: Option<u64>,
    pub week_start: Option<WeekAnchor>,
    pub digest_unlock: Option<WeekAnchor>,
    pub app_group: Option<String>,
}

impl FileConfig {
    /// A missing file is an empty config.
    pub fn read(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub url: String,
    pub key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub device: Device,
    pub bind: String,
    pub port: u16,
    pub peer: Option<PeerConfig>,
    pub probe_timeout: Duration,
    pub week_start: WeekAnchor,
    pub digest_unlock: WeekAnchor,
}

impl Config {
    /// Resolve the data directory and read `config.toml` from it (or from
    /// `config_path`). Every process of one device pair that uses the same
    /// app group opens the same ledger file.
    pub fn load(data_dir: Option<PathBuf>, config_path: Option<PathBuf>) -> Result<Self> {
        let default_dir = match &data_dir {
            Some(dir) => dir.clone(),
            None => group_data_dir(DEFAULT_APP_GROUP)?,
        };
        let config_path = config_path.unwrap_or_else(|| default_dir.join(CONFIG_FILE));
        let file = FileConfig::read(&config_path)?;

        let data_dir = match (data_dir, file.app_group.as_deref()) {
            (Some(dir), _) => dir,
            (None, Some(group)) if group != DEFAULT_APP_GROUP => group_data_dir(group)?,
            (None, _) => default_dir,
        };
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        Ok(Self::resolve(data_dir, file))
    }

    /// Apply defaults for every key the file leaves out.
    pub fn resolve(data_dir: PathBuf, file: FileConfig) -> Self {
        let peer = file.peer_url.map(|url| PeerConfig {
            url: url.trim_end_matches('/').to_string(),
            key: file.peer_key,
        });
        Self {
            db_path: data_dir.join(DB_FILE),
            data_dir,
            device: file.device.unwrap_or(Device::Phone),
            bind: file.bind.unwrap_or_else(|| "127.0.0.1".to_string()),
            port: file.port.unwrap_or(DEFAULT_PORT),
            peer,
            probe_timeout: Duration::from_millis(
                file.probe_timeout_ms.unwrap_or(DEFAULT_PROBE_TIMEOUT_MS),
            ),
            week_start: file.week_start.unwrap_or(WeekAnchor::DEFAULT_WEEK_START),
            digest_unlock: file
                .digest_unlock
                .unwrap_or(WeekAnchor::DEFAULT_DIGEST_UNLOCK),
        }
    }

    /// Load the pairing key from disk, or generate a new one.
    ///
    /// Returns `(key, newly_created)` where `newly_created` is true when a
    /// fresh key was just generated (first run). The paired device sends this
    /// key as a bearer token.
    pub fn load_or_create_pairing_key(&self) -> Result<(String, bool)> {
        use rand::Rng;
        use std::fmt::Write;

        let path = self.data_dir.join(PAIRING_KEY_FILE);

        if path.exists() {
            let key = std::fs::read_to_string(&path).context("Failed to read pairing key file")?;
            let key = key.trim().to_string();
            if !key.is_empty() {
                return Ok((key, false));
            }
        }

        let bytes: [u8; 32] = rand::rng().random();
        let key = bytes
            .iter()
            .fold(String::with_capacity(64), |mut acc: String, b| {
                let _ = write!(acc, "{b:02x}");
                acc
            });
        std::fs::write(&path, &key).context("Failed to write pairing key file")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .context("Failed to set pairing key file permissions")?;
        }
        tracing::info!(path = %path.display(), "generated new pairing key");
        Ok((key, true))
    }
}

fn group_data_dir(app_group: &str) -> Result<PathBuf> {
    let proj_dirs = ProjectDirs::from("", "", app_group)
        .context("Could not determine home directory")?;
    Ok(proj_dirs.data_dir().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(Some(dir.path().to_path_buf()), None).unwrap();
        assert_eq!(config.db_path, dir.path().join("nibble.db"));
        assert_eq!(config.device, Device::Phone);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.peer, None);
        assert_eq!(config.week_start, WeekAnchor::DEFAULT_WEEK_START);
        assert_eq!(config.digest_unlock, WeekAnchor::DEFAULT_DIGEST_UNLOCK);
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            r#"
device = "watch"
port = 9000
peer_url = "http://192.168.1.20:7878/"
peer_key = "abc"
probe_timeout_ms = 200
week_start = "mon 12:15"
digest_unlock = "6 09:00"
"#,
        )
        .unwrap();

        let config = Config::load(Some(dir.path().to_path_buf()), None).unwrap();
        assert_eq!(config.device, Device::Watch);
        assert_eq!(config.port, 9000);
        assert_eq!(
            config.peer,
            Some(PeerConfig {
                url: "http://192.168.1.20:7878".to_string(),
                key: Some("abc".to_string()),
            })
        );
        assert_eq!(config.probe_timeout, Duration::from_millis(200));
        assert_eq!(
            config.week_start,
            WeekAnchor::new(Weekday::Mon, 12, 15).unwrap()
        );
        assert_eq!(
            config.digest_unlock,
            WeekAnchor::new(Weekday::Fri, 9, 0).unwrap()
        );
    }

    #[test]
    fn explicit_config_path_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watch.toml");
        std::fs::write(&path, "device = \"watch\"\n").unwrap();
        let config = Config::load(Some(dir.path().to_path_buf()), Some(path)).unwrap();
        assert_eq!(config.device, Device::Watch);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        for body in [
            "device = \"tablet\"\n",
            "week_start = \"mon 25:00\"\n",
            "unknown_key = 1\n",
        ] {
            std::fs::write(dir.path().join("config.toml"), body).unwrap();
            assert!(Config::load(Some(dir.path().to_path_buf()), None).is_err());
        }
    }

    #[test]
    fn pairing_key_is_generated_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::resolve(dir.path().to_path_buf(), FileConfig::default());

        let (key, created) = config.load_or_create_pairing_key().unwrap();
        assert!(created);
        assert_eq!(key.len(), 64);

        let (again, created) = config.load_or_create_pairing_key().unwrap();
        assert!(!created);
        assert_eq!(again, key);
    }
}
