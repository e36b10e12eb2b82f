use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use crate::models::BannedWord;
use crate::store::RecordStore;

#[derive(Clone)]
pub struct BannedWordFilter {
    store: Arc<dyn RecordStore>,
}

impl BannedWordFilter {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// 统一转小写保存；空词和重复词不添加
    pub async fn add(&self, word: &str, created_by: u64) -> Result<bool> {
        let word = word.trim().to_lowercase();
        if word.is_empty() {
            return Ok(false);
        }
        if self
            .store
            .list_banned_words()
            .await?
            .iter()
            .any(|w| w.word == word)
        {
            return Ok(false);
        }
        self.store
            .save_banned_word(BannedWord {
                id: uuid::Uuid::new_v4().to_string(),
                word: word.clone(),
                created_by,
                created_at: Utc::now(),
            })
            .await?;
        info!("banned word added: {word}");
        Ok(true)
    }

    pub async fn list(&self) -> Result<Vec<BannedWord>> {
        self.store.list_banned_words().await
    }

    pub async fn delete(&self, word: &str) -> Result<bool> {
        self.store
            .delete_banned_word(&word.trim().to_lowercase())
            .await
    }

    pub async fn check(&self, text: &str) -> Result<bool> {
        let text = text.to_lowercase();
        Ok(self
            .store
            .list_banned_words()
            .await?
            .iter()
            .any(|w| text.contains(&w.word)))
    }
}
