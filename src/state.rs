//! State Management - per-bot JSON state files so strategies resume after a restart

use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Stores one JSON document per bot under `state_dir`
#[derive(Debug, Clone)]
pub struct StateStore {
    state_dir: PathBuf,
}

impl StateStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub async fn init(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.state_dir).await?;
        Ok(())
    }

    fn path_for(&self, bot: &str) -> PathBuf {
        let file: String = bot
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.state_dir.join(format!("{}.json", file))
    }

    /// Load a bot's state, `None` if it was never saved
    pub async fn load<T: DeserializeOwned>(&self, bot: &str) -> anyhow::Result<Option<T>> {
        let path = self.path_for(bot);
        let json = match fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state = serde_json::from_str(&json)
            .map_err(|e| anyhow::anyhow!("Corrupt state file {}: {}", path.display(), e))?;
        debug!("Loaded state from {}", path.display());
        Ok(Some(state))
    }

    /// Write a bot's state atomically (temp file + rename)
    pub async fn save<T: Serialize>(&self, bot: &str, state: &T) -> anyhow::Result<()> {
        fs::create_dir_all(&self.state_dir).await?;
        let path = self.path_for(bot);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(state)?;
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &path).await?;
        debug!("Wrote {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        count: u32,
        label: String,
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("nested"));
        store.init().await.unwrap();

        assert_eq!(store.load::<Sample>("dca-btc").await.unwrap(), None);

        let sample = Sample {
            count: 3,
            label: "holding".to_string(),
        };
        store.save("dca-btc", &sample).await.unwrap();
        assert_eq!(store.load::<Sample>("dca-btc").await.unwrap(), Some(sample));

        // No temp file left behind
        assert!(!dir.path().join("nested").join("dca-btc.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_bot_names_are_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());

        store.save("../escape me", &1u32).await.unwrap();
        assert!(dir.path().join("___escape_me.json").exists());
    }

    #[tokio::test]
    async fn test_corrupt_state_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        std::fs::write(dir.path().join("bot.json"), "{not json").unwrap();

        assert!(store.load::<Sample>("bot").await.is_err());
    }
}
