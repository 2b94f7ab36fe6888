use crate::codec::DEFAULT_BITRATE_KBPS;
use std::path::PathBuf;
use tracing::{info, warn};

const LIBRARY_PATH_VAR: &str = "LINELOOP_LIBRARY_PATH";
const BITRATE_VAR: &str = "LINELOOP_BITRATE_KBPS";
const SCENE_CUE_VAR: &str = "LINELOOP_SCENE_CUE";

/// Application configuration
/// In debug builds: loads a .env file first, then reads the environment
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Root directory holding one folder per imported project
    pub library_path: PathBuf,
    /// Bitrate used when splitting new recordings
    pub bitrate_kbps: u32,
    /// Whether to play a short tone before the first line of a scene
    pub scene_cue: bool,
}

impl Config {
    /// Load configuration based on build mode
    pub fn load() -> Self {
        #[cfg(debug_assertions)]
        {
            if dotenvy::dotenv().is_ok() {
                info!("Config: Dev mode activated - loaded .env file");
            }
        }

        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Build a configuration from a variable lookup
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let library_path = lookup(LIBRARY_PATH_VAR)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_library_path);

        let bitrate_kbps = match lookup(BITRATE_VAR) {
            Some(value) => value.trim().parse::<u32>().unwrap_or_else(|_| {
                warn!(
                    "Config: invalid {} '{}', using {}",
                    BITRATE_VAR, value, DEFAULT_BITRATE_KBPS
                );
                DEFAULT_BITRATE_KBPS
            }),
            None => DEFAULT_BITRATE_KBPS,
        };

        let scene_cue = lookup(SCENE_CUE_VAR)
            .map(|v| !matches!(v.trim().to_lowercase().as_str(), "false" | "0" | "off" | "no"))
            .unwrap_or(true);

        info!("Config: library path: {}", library_path.display());

        Self {
            library_path,
            bitrate_kbps,
            scene_cue,
        }
    }

    /// File holding the persisted session
    pub fn session_path(&self) -> PathBuf {
        self.library_path.join("session.json")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            library_path: default_library_path(),
            bitrate_kbps: DEFAULT_BITRATE_KBPS,
            scene_cue: true,
        }
    }
}

/// ~/.lineloop, or a relative .lineloop when there is no home directory
fn default_library_path() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".lineloop"))
        .unwrap_or_else(|| PathBuf::from(".lineloop"))
}
