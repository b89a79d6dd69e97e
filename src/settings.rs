use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf, sync::RwLock};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierSettings {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout_seconds: u64,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://generativelanguage.googleapis.com".into(),
            model: "gemini-2.5-flash".into(),
            timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveFeedSettings {
    pub url: String,
    pub connect_delay_ms: u64,
    pub capture_interval_secs: u64,
    pub capture_timeout_secs: u64,
}

impl Default for LiveFeedSettings {
    fn default() -> Self {
        Self {
            url: "https://picsum.photos/seed/plant/600/400".into(),
            connect_delay_ms: 2500,
            capture_interval_secs: 5,
            capture_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserSettings {
    #[serde(default)]
    classifier: ClassifierSettings,
    #[serde(default)]
    live_feed: LiveFeedSettings,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            classifier: ClassifierSettings::default(),
            live_feed: LiveFeedSettings::default(),
        }
    }
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<UserSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let mut data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_default()
        } else {
            UserSettings::default()
        };

        // The classifier key comes from the environment, never from disk.
        if let Ok(key) = std::env::var("GEMINI_API_KEY") {
            if !key.is_empty() {
                data.classifier.api_key = key;
            }
        }

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn classifier(&self) -> ClassifierSettings {
        self.data.read().unwrap().classifier.clone()
    }

    pub fn live_feed(&self) -> LiveFeedSettings {
        self.data.read().unwrap().live_feed.clone()
    }

    pub fn update_live_feed(&self, settings: LiveFeedSettings) -> Result<()> {
        {
            let mut guard = self.data.write().unwrap();
            guard.live_feed = settings;
            self.persist(&guard)?;
        }
        Ok(())
    }

    fn persist(&self, data: &UserSettings) -> Result<()> {
        let mut on_disk = data.clone();
        on_disk.classifier.api_key = String::new();
        let serialized = serde_json::to_string_pretty(&on_disk)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}
