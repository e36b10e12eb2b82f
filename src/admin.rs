use anyhow::Result;
use chrono::Utc;
use std::{future::Future, sync::Arc};
use teloxide::types::UserId;
use tracing::{info, warn};

use crate::models::AdminUser;
use crate::store::RecordStore;

pub const NOT_ADMIN_REPLY: &str = "⚠️ 此命令仅管理员可用";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// 此前没有管理员，调用者成为首位管理员
    Bootstrapped,
    AlreadyAdmin,
    Denied,
}

#[derive(Clone)]
pub struct AdminRegistry {
    store: Arc<dyn RecordStore>,
}

impl AdminRegistry {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub async fn is_admin(&self, id: UserId) -> Result<bool> {
        Ok(self
            .store
            .get_user(id.0)
            .await?
            .map(|u| u.is_admin)
            .unwrap_or(false))
    }

    pub async fn add_admin(&self, id: UserId, username: Option<String>) -> Result<bool> {
        let existing = self.store.get_user(id.0).await?;
        if existing.as_ref().map(|u| u.is_admin).unwrap_or(false) {
            warn!("user {} is already an admin", id.0);
            return Ok(false);
        }
        let user = match existing {
            Some(mut u) => {
                u.is_admin = true;
                if username.is_some() {
                    u.username = username;
                }
                u
            }
            None => AdminUser {
                id: id.0,
                is_admin: true,
                username,
                joined_at: Utc::now(),
            },
        };
        self.store.save_user(user).await?;
        info!("admin added: {}", id.0);
        Ok(true)
    }

    pub async fn remove_admin(&self, id: UserId) -> Result<bool> {
        let Some(mut user) = self.store.get_user(id.0).await? else {
            return Ok(false);
        };
        user.is_admin = false;
        self.store.save_user(user).await?;
        info!("admin removed: {}", id.0);
        Ok(true)
    }

    pub async fn list_admins(&self) -> Result<Vec<AdminUser>> {
        Ok(self
            .store
            .list_users()
            .await?
            .into_iter()
            .filter(|u| u.is_admin)
            .collect())
    }

    /// 启动通知和错误报告的接收人
    pub async fn first_admin(&self) -> Result<Option<AdminUser>> {
        Ok(self.list_admins().await?.into_iter().next())
    }

    /// 首次认领：没有管理员时，第一个发 /admin 的人直接成为管理员
    pub async fn claim(&self, id: UserId, username: Option<String>) -> Result<Claim> {
        let candidate = match self.store.get_user(id.0).await? {
            Some(mut u) => {
                if username.is_some() {
                    u.username = username;
                }
                u
            }
            None => AdminUser {
                id: id.0,
                is_admin: true,
                username,
                joined_at: Utc::now(),
            },
        };
        if self.store.grant_first_admin(candidate).await? {
            info!("bootstrap admin granted to {}", id.0);
            return Ok(Claim::Bootstrapped);
        }
        if self.is_admin(id).await? {
            Ok(Claim::AlreadyAdmin)
        } else {
            Ok(Claim::Denied)
        }
    }
}

/// 仅管理员可执行 `handler`，否则返回固定的拒绝文案
pub async fn require_admin<F, Fut>(admins: &AdminRegistry, user: UserId, handler: F) -> Result<String>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<String>>,
{
    if !admins.is_admin(user).await? {
        info!("rejected admin-only command from {}", user.0);
        return Ok(NOT_ADMIN_REPLY.to_string());
    }
    handler().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SnapshotStore;

    fn registry() -> AdminRegistry {
        AdminRegistry::new(Arc::new(SnapshotStore::in_memory()))
    }

    #[tokio::test]
    async fn first_claim_bootstraps_later_claims_are_denied() {
        let admins = registry();
        assert_eq!(
            admins.claim(UserId(1), Some("alice".into())).await.unwrap(),
            Claim::Bootstrapped
        );
        assert_eq!(admins.claim(UserId(2), None).await.unwrap(), Claim::Denied);
        assert_eq!(admins.claim(UserId(1), None).await.unwrap(), Claim::AlreadyAdmin);
        assert!(!admins.is_admin(UserId(2)).await.unwrap());
    }

    #[tokio::test]
    async fn add_admin_twice_fails_the_second_time() {
        let admins = registry();
        assert!(admins.add_admin(UserId(5), None).await.unwrap());
        assert!(!admins.add_admin(UserId(5), None).await.unwrap());
    }

    #[tokio::test]
    async fn remove_clears_flag_but_keeps_record() {
        let store = Arc::new(SnapshotStore::in_memory());
        let admins = AdminRegistry::new(store.clone());
        admins.add_admin(UserId(5), Some("bob".into())).await.unwrap();

        assert!(admins.remove_admin(UserId(5)).await.unwrap());
        assert!(!admins.is_admin(UserId(5)).await.unwrap());
        let kept = store.get_user(5).await.unwrap().unwrap();
        assert!(!kept.is_admin);
        assert_eq!(kept.username.as_deref(), Some("bob"));

        assert!(!admins.remove_admin(UserId(99)).await.unwrap());
    }

    #[tokio::test]
    async fn removed_admin_can_be_granted_again() {
        let admins = registry();
        admins.add_admin(UserId(5), None).await.unwrap();
        admins.remove_admin(UserId(5)).await.unwrap();
        assert!(admins.add_admin(UserId(5), None).await.unwrap());
    }

    #[tokio::test]
    async fn first_admin_follows_grant_order() {
        let admins = registry();
        admins.add_admin(UserId(9), None).await.unwrap();
        admins.add_admin(UserId(3), None).await.unwrap();
        assert_eq!(admins.first_admin().await.unwrap().unwrap().id, 9);
    }

    #[tokio::test]
    async fn require_admin_short_circuits_non_admins() {
        let admins = registry();
        admins.add_admin(UserId(1), None).await.unwrap();

        let denied = require_admin(&admins, UserId(2), || async { Ok("ran".to_string()) })
            .await
            .unwrap();
        assert_eq!(denied, NOT_ADMIN_REPLY);

        let allowed = require_admin(&admins, UserId(1), || async { Ok("ran".to_string()) })
            .await
            .unwrap();
        assert_eq!(allowed, "ran");
    }
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_bootstrap_exactly_once() {
        let admins = registry();
        let tasks: Vec<_> = (1..=8u64)
            .map(|id| {
                let admins = admins.clone();
                tokio::spawn(async move { admins.claim(UserId(id), None).await.unwrap() })
            })
            .collect();
        let mut granted = 0;
        for t in tasks {
            if t.await.unwrap() == Claim::Bootstrapped {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);
        assert_eq!(admins.list_admins().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn former_admin_can_bootstrap_when_nobody_is_left() {
        let admins = registry();
        admins.add_admin(UserId(4), Some("dora".into())).await.unwrap();
        admins.remove_admin(UserId(4)).await.unwrap();

        assert_eq!(admins.claim(UserId(4), None).await.unwrap(), Claim::Bootstrapped);
        let all = admins.list_admins().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].username.as_deref(), Some("dora"));
    }
}
