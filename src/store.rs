use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::models::{Advertisement, AdminUser, BannedWord, ChatGroup, Settings};

const SNAPSHOT_FILE: &str = "bot_state.json";
const TEMP_FILE_SUFFIX: &str = ".tmp";

/// 每个方法内部是一次完整的读或读改写；多次调用之间不保证原子性
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn list_ads(&self) -> Result<Vec<Advertisement>>;
    async fn get_ad(&self, id: &str) -> Result<Option<Advertisement>>;
    async fn save_ad(&self, ad: Advertisement) -> Result<()>;
    async fn delete_ad(&self, id: &str) -> Result<bool>;

    async fn list_users(&self) -> Result<Vec<AdminUser>>;
    async fn get_user(&self, id: u64) -> Result<Option<AdminUser>>;
    async fn save_user(&self, user: AdminUser) -> Result<()>;
    /// 仅当没有任何管理员时把 `user` 设为管理员（同一把写锁内检查并写入）
    async fn grant_first_admin(&self, user: AdminUser) -> Result<bool>;

    async fn list_groups(&self) -> Result<Vec<ChatGroup>>;
    async fn get_group(&self, id: i64) -> Result<Option<ChatGroup>>;
    async fn save_group(&self, group: ChatGroup) -> Result<()>;

    async fn list_banned_words(&self) -> Result<Vec<BannedWord>>;
    async fn save_banned_word(&self, word: BannedWord) -> Result<()>;
    async fn delete_banned_word(&self, word: &str) -> Result<bool>;

    async fn settings(&self) -> Result<Settings>;
    async fn save_settings(&self, settings: Settings) -> Result<()>;

    async fn flush(&self) -> Result<()>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    ads: Vec<Advertisement>,
    #[serde(default)]
    users: Vec<AdminUser>,
    #[serde(default)]
    groups: Vec<ChatGroup>,
    #[serde(default)]
    banned_words: Vec<BannedWord>,
    #[serde(default)]
    settings: Settings,
    #[serde(default)]
    saved_at: Option<DateTime<Utc>>,
}

/// 内存状态，整体读写一个 JSON 文件
pub struct SnapshotStore {
    path: Option<PathBuf>,
    state: RwLock<Snapshot>,
}

impl SnapshotStore {
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: RwLock::new(Snapshot::default()),
        }
    }

    pub fn snapshot_path(data_dir: &str) -> PathBuf {
        PathBuf::from(data_dir).join(SNAPSHOT_FILE)
    }

    /// 文件不存在就从空状态开始；读不了或格式错误直接报错
    pub fn load(path: PathBuf) -> Result<Self> {
        let snap = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str::<Snapshot>(&text)
                .with_context(|| format!("parse snapshot: {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no snapshot at {}, starting empty", path.display());
                Snapshot::default()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("read snapshot: {}", path.display()));
            }
        };
        info!(
            "loaded state: {} ads, {} users, {} groups, {} banned words",
            snap.ads.len(),
            snap.users.len(),
            snap.groups.len(),
            snap.banned_words.len()
        );
        Ok(Self {
            path: Some(path),
            state: RwLock::new(snap),
        })
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = PathBuf::from(format!("{}{}", path.display(), TEMP_FILE_SUFFIX));
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[async_trait]
impl RecordStore for SnapshotStore {
    async fn list_ads(&self) -> Result<Vec<Advertisement>> {
        Ok(self.state.read().await.ads.clone())
    }

    async fn get_ad(&self, id: &str) -> Result<Option<Advertisement>> {
        let state = self.state.read().await;
        Ok(state.ads.iter().find(|a| a.id == id).cloned())
    }

    async fn save_ad(&self, ad: Advertisement) -> Result<()> {
        let mut state = self.state.write().await;
        match state.ads.iter_mut().find(|a| a.id == ad.id) {
            Some(slot) => *slot = ad,
            None => state.ads.push(ad),
        }
        Ok(())
    }

    async fn delete_ad(&self, id: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        let before = state.ads.len();
        state.ads.retain(|a| a.id != id);
        Ok(state.ads.len() != before)
    }

    async fn list_users(&self) -> Result<Vec<AdminUser>> {
        Ok(self.state.read().await.users.clone())
    }

    async fn get_user(&self, id: u64) -> Result<Option<AdminUser>> {
        let state = self.state.read().await;
        Ok(state.users.iter().find(|u| u.id == id).cloned())
    }

    async fn save_user(&self, user: AdminUser) -> Result<()> {
        let mut state = self.state.write().await;
        match state.users.iter_mut().find(|u| u.id == user.id) {
            Some(slot) => *slot = user,
            None => state.users.push(user),
        }
        Ok(())
    }

    async fn grant_first_admin(&self, mut user: AdminUser) -> Result<bool> {
        let mut state = self.state.write().await;
        if state.users.iter().any(|u| u.is_admin) {
            return Ok(false);
        }
        user.is_admin = true;
        match state.users.iter_mut().find(|u| u.id == user.id) {
            Some(slot) => *slot = user,
            None => state.users.push(user),
        }
        Ok(true)
    }

    async fn list_groups(&self) -> Result<Vec<ChatGroup>> {
        Ok(self.state.read().await.groups.clone())
    }

    async fn get_group(&self, id: i64) -> Result<Option<ChatGroup>> {
        let state = self.state.read().await;
        Ok(state.groups.iter().find(|g| g.id == id).cloned())
    }

    async fn save_group(&self, group: ChatGroup) -> Result<()> {
        let mut state = self.state.write().await;
        match state.groups.iter_mut().find(|g| g.id == group.id) {
            Some(slot) => *slot = group,
            None => state.groups.push(group),
        }
        Ok(())
    }

    async fn list_banned_words(&self) -> Result<Vec<BannedWord>> {
        Ok(self.state.read().await.banned_words.clone())
    }

    async fn save_banned_word(&self, word: BannedWord) -> Result<()> {
        self.state.write().await.banned_words.push(word);
        Ok(())
    }

    async fn delete_banned_word(&self, word: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        let before = state.banned_words.len();
        state.banned_words.retain(|w| w.word != word);
        Ok(state.banned_words.len() != before)
    }

    async fn settings(&self) -> Result<Settings> {
        Ok(self.state.read().await.settings.clone())
    }

    async fn save_settings(&self, settings: Settings) -> Result<()> {
        self.state.write().await.settings = settings;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        let bytes = {
            let mut state = self.state.write().await;
            state.saved_at = Some(Utc::now());
            serde_json::to_vec_pretty(&*state).context("serialize snapshot")?
        };
        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(|e| {
                warn!("flush join error: {:?}", e);
                anyhow::anyhow!("flush task failed: {e}")
            })?
            .context("write snapshot")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AdButton, MediaKind, MediaRef};

    fn ad(id: &str) -> Advertisement {
        Advertisement {
            id: id.to_string(),
            media: MediaRef {
                kind: MediaKind::Photo,
                file_id: format!("file-{id}"),
            },
            welcome_text: "hi {name}".into(),
            ad_text: "buy".into(),
            buttons: vec![AdButton {
                text: "go".into(),
                url: "https://example.com".into(),
            }],
            created_at: Utc::now(),
        }
    }

    fn temp_snapshot_path(tag: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("ad-guard-{}-{}", tag, uuid::Uuid::new_v4()))
            .join(SNAPSHOT_FILE)
    }

    #[tokio::test]
    async fn save_ad_replaces_same_id_and_keeps_order() {
        let store = SnapshotStore::in_memory();
        store.save_ad(ad("a")).await.unwrap();
        store.save_ad(ad("b")).await.unwrap();
        let mut changed = ad("a");
        changed.ad_text = "changed".into();
        store.save_ad(changed).await.unwrap();

        let ads = store.list_ads().await.unwrap();
        assert_eq!(ads.len(), 2);
        assert_eq!(ads[0].id, "a");
        assert_eq!(ads[0].ad_text, "changed");
        assert_eq!(ads[1].id, "b");
    }

    #[tokio::test]
    async fn delete_ad_reports_whether_anything_was_removed() {
        let store = SnapshotStore::in_memory();
        store.save_ad(ad("a")).await.unwrap();
        assert!(store.delete_ad("a").await.unwrap());
        assert!(!store.delete_ad("a").await.unwrap());
        assert!(store.get_ad("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_snapshot_starts_empty() {
        let path = temp_snapshot_path("missing");
        let store = SnapshotStore::load(path).unwrap();
        assert!(store.list_ads().await.unwrap().is_empty());
        assert!(store.settings().await.unwrap().channel_verification);
    }

    #[tokio::test]
    async fn flush_then_load_restores_state() {
        let path = temp_snapshot_path("roundtrip");
        let store = SnapshotStore::load(path.clone()).unwrap();
        store.save_ad(ad("a")).await.unwrap();
        let mut settings = store.settings().await.unwrap();
        settings.ad_cursor = 3;
        settings.target_channel_id = Some(-1001234);
        store.save_settings(settings).await.unwrap();
        store.flush().await.unwrap();

        let reloaded = SnapshotStore::load(path.clone()).unwrap();
        assert_eq!(reloaded.list_ads().await.unwrap().len(), 1);
        let settings = reloaded.settings().await.unwrap();
        assert_eq!(settings.ad_cursor, 3);
        assert_eq!(settings.target_channel_id, Some(-1001234));

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[tokio::test]
    async fn malformed_snapshot_is_an_error() {
        let path = temp_snapshot_path("malformed");
        write_atomic(&path, b"{ not json").unwrap();
        assert!(SnapshotStore::load(path.clone()).is_err());
        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}
