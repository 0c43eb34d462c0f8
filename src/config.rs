use std::path::PathBuf;
use std::time::Duration;

/// Default bound on a remote connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default capacity of the stream worker queue.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Runtime settings for [`crate::StreamController`] and [`crate::SessionArchive`].
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// How long `connect` waits for the peripheral's connected callback.
    pub connect_timeout: Duration,
    /// Samples queued for the stream worker before sources block until
    /// it catches up.
    pub channel_capacity: usize,
    /// File holding the archived session log.
    pub archive_path: PathBuf,
    /// Directory receiving exported `.csv` files.
    pub export_dir: PathBuf,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            archive_path: default_data_dir().join("sessions.txt"),
            export_dir: default_export_dir(),
        }
    }
}

impl ControllerConfig {
    /// Defaults overridden by `TILTMETER_*` environment variables:
    ///
    /// - `TILTMETER_CONNECT_TIMEOUT_MS`
    /// - `TILTMETER_CHANNEL_CAPACITY`
    /// - `TILTMETER_ARCHIVE_PATH`
    /// - `TILTMETER_EXPORT_DIR`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let config = Self {
            connect_timeout: Self::read_env_u64("TILTMETER_CONNECT_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.connect_timeout),
            channel_capacity: Self::read_env_u64("TILTMETER_CHANNEL_CAPACITY")
                .map(|v| (v as usize).max(1))
                .unwrap_or(defaults.channel_capacity),
            archive_path: Self::read_env_path("TILTMETER_ARCHIVE_PATH")
                .unwrap_or(defaults.archive_path),
            export_dir: Self::read_env_path("TILTMETER_EXPORT_DIR").unwrap_or(defaults.export_dir),
        };
        log::debug!("Controller config: {:?}", config);
        config
    }

    fn read_env_u64(name: &str) -> Option<u64> {
        let value = std::env::var(name).ok()?;
        match value.trim().parse::<u64>() {
            Ok(v) => Some(v),
            Err(_) => {
                log::warn!("Ignoring {}='{}': not an unsigned integer", name, value);
                None
            }
        }
    }

    fn read_env_path(name: &str) -> Option<PathBuf> {
        std::env::var_os(name)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    }
}

/// Per-user data directory for the archive, falling back to the working directory.
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tiltmeter")
}

/// The user's downloads directory, where exports are visible to the user.
pub fn default_export_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tiltmeter")
}
