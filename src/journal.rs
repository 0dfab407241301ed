//! Decision journal - one JSON line per executed signal decision

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::ports::DecisionLog;
use crate::types::DecisionRecord;

/// Appends [`DecisionRecord`]s to a JSON Lines file.
///
/// Each record is one append-mode write; bots may share the file.
pub struct JsonlJournal {
    path: PathBuf,
}

impl JsonlJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DecisionLog for JsonlJournal {
    async fn append(&self, record: &DecisionRecord) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        debug!("Journaled {} decision for {}", record.action, record.bot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Action, Pair};
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn record(action: Action) -> DecisionRecord {
        DecisionRecord {
            timestamp: Utc::now(),
            bot: "signal-eth".to_string(),
            pair: Pair::new("ETH", "USDT").unwrap(),
            action,
            leverage: 3,
            amount: Decimal::ONE,
            price: Decimal::from(2000),
            take_profit: Some(Decimal::from(2100)),
            stop_loss: None,
            rationale: Some("breakout".to_string()),
            client_order_id: "id".to_string(),
            raw_response: "ACTION: BUY".to_string(),
        }
    }

    #[tokio::test]
    async fn test_appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let journal = JsonlJournal::new(dir.path().join("logs").join("decisions.jsonl"));

        journal.append(&record(Action::Buy)).await.unwrap();
        journal.append(&record(Action::Sell)).await.unwrap();

        let contents = std::fs::read_to_string(journal.path()).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: DecisionRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.action, Action::Buy);
        let second: DecisionRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.action, Action::Sell);
        assert_eq!(second.leverage, 3);
    }
}
