use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::consts;

/// Editor settings persisted under the data directory. Unknown fields in
/// the file are ignored and missing ones take their defaults, so the file
/// survives version skew in both directions.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Render target size used by the headless frame loop.
    pub render_size: (u32, u32),

    /// Frames the frame loop runs when no window is attached.
    pub headless_frame_count: u32,

    /// Capacity of the bindless image table.
    pub bindless_capacity: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            render_size: (1280, 720),
            headless_frame_count: 4,
            bindless_capacity: 1024,
        }
    }
}

pub fn data_dir() -> PathBuf {
    PathBuf::from(consts::io::DATA_DIR)
}

fn settings_path() -> PathBuf {
    data_dir().join(consts::io::SETTINGS_FILE)
}

impl Settings {
    pub fn load() -> Settings {
        let path = settings_path();
        match std::fs::read_to_string(&path) {
            Ok(text) => match ron::from_str(&text) {
                Ok(settings) => settings,
                Err(e) => {
                    log::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                    Settings::default()
                }
            },
            Err(_) => Settings::default(),
        }
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let dir = data_dir();
        std::fs::create_dir_all(dir.join(consts::io::ASSETS_DIR))?;
        std::fs::create_dir_all(dir.join(consts::io::SCENES_DIR))?;
        let text = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?;
        std::fs::write(settings_path(), text)?;
        Ok(())
    }
}
