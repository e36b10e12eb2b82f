use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

use crate::models::ChatGroup;
use crate::store::RecordStore;

#[derive(Clone)]
pub struct GroupRegistry {
    store: Arc<dyn RecordStore>,
}

impl GroupRegistry {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    // 只更新标题和类型，不动广告群标记
    pub async fn register(&self, id: i64, title: &str, kind: &str) -> Result<ChatGroup> {
        let group = match self.store.get_group(id).await? {
            Some(mut g) => {
                g.title = title.to_string();
                g.kind = kind.to_string();
                g
            }
            None => {
                info!("registered group {} ({})", id, title);
                ChatGroup {
                    id,
                    title: title.to_string(),
                    kind: kind.to_string(),
                    is_ad_group: false,
                    joined_at: Utc::now(),
                }
            }
        };
        self.store.save_group(group.clone()).await?;
        Ok(group)
    }

    pub async fn get(&self, id: i64) -> Result<Option<ChatGroup>> {
        self.store.get_group(id).await
    }

    pub async fn set_ad_group(&self, id: i64, flag: bool) -> Result<bool> {
        let Some(mut group) = self.store.get_group(id).await? else {
            return Ok(false);
        };
        group.is_ad_group = flag;
        self.store.save_group(group).await?;
        info!("group {} ad-target = {}", id, flag);
        Ok(true)
    }

    /// 没见过的群先建占位记录，再标记为广告群并记为目标群
    pub async fn set_target(&self, id: i64) -> Result<ChatGroup> {
        let group = match self.store.get_group(id).await? {
            Some(mut g) => {
                g.is_ad_group = true;
                g
            }
            None => ChatGroup {
                id,
                title: "Target Group".to_string(),
                kind: "supergroup".to_string(),
                is_ad_group: true,
                joined_at: Utc::now(),
            },
        };
        self.store.save_group(group.clone()).await?;

        let mut settings = self.store.settings().await?;
        settings.target_group_id = Some(id);
        self.store.save_settings(settings).await?;
        info!("target group set: {}", id);
        Ok(group)
    }

    pub async fn ad_groups(&self) -> Result<Vec<ChatGroup>> {
        let groups: Vec<ChatGroup> = self
            .store
            .list_groups()
            .await?
            .into_iter()
            .filter(|g| g.is_ad_group)
            .collect();
        debug!("{} ad-target groups", groups.len());
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SnapshotStore;

    #[tokio::test]
    async fn set_target_creates_flagged_group() {
        let store = Arc::new(SnapshotStore::in_memory());
        let groups = GroupRegistry::new(store.clone());

        groups.set_target(123).await.unwrap();

        let g = groups.get(123).await.unwrap().unwrap();
        assert!(g.is_ad_group);
        assert_eq!(store.settings().await.unwrap().target_group_id, Some(123));
        assert_eq!(groups.ad_groups().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn set_target_flags_existing_group_and_keeps_title() {
        let groups = GroupRegistry::new(Arc::new(SnapshotStore::in_memory()));
        groups.register(-42, "Deals", "supergroup").await.unwrap();

        let g = groups.set_target(-42).await.unwrap();
        assert!(g.is_ad_group);
        assert_eq!(g.title, "Deals");
    }

    #[tokio::test]
    async fn register_refreshes_title_but_keeps_flag() {
        let groups = GroupRegistry::new(Arc::new(SnapshotStore::in_memory()));
        groups.register(-1, "Old", "group").await.unwrap();
        groups.set_ad_group(-1, true).await.unwrap();

        let g = groups.register(-1, "New", "supergroup").await.unwrap();
        assert_eq!(g.title, "New");
        assert_eq!(g.kind, "supergroup");
        assert!(g.is_ad_group);
    }

    #[tokio::test]
    async fn set_ad_group_on_unknown_group_fails() {
        let groups = GroupRegistry::new(Arc::new(SnapshotStore::in_memory()));
        assert!(!groups.set_ad_group(-7, true).await.unwrap());
    }
}
