use anyhow::Result;
use std::{sync::Arc, time::Duration};
use teloxide::types::{ChatId, MessageId, UserId};
use tracing::{debug, info, warn};

use crate::models::{AdButton, ChatGroup};
use crate::platform::{api_log, spawn_delayed_delete, ChatApi};
use crate::store::RecordStore;

const PRIVATE_CHANNEL_PREFIX: &str = "-100";
const JOIN_BUTTON_TEXT: &str = "点击关注频道";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// 非广告群 / 验证已关闭 / 未设置频道
    Skipped,
    Allowed,
    Denied,
}

/// 有公开用户名用 t.me/<用户名>，否则用 t.me/c/<去掉 -100 的ID>
pub fn join_link(channel: i64, username: Option<&str>) -> String {
    match username {
        Some(u) if !u.is_empty() => format!("https://t.me/{}", u.trim_start_matches('@')),
        _ => {
            let id = channel.to_string();
            let id = id.strip_prefix(PRIVATE_CHANNEL_PREFIX).unwrap_or(&id);
            format!("https://t.me/c/{}", id)
        }
    }
}

pub struct ChannelGate {
    store: Arc<dyn RecordStore>,
    reminder_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct Incoming {
    pub chat: ChatId,
    pub message: MessageId,
    pub sender: UserId,
    pub sender_name: String,
}

impl ChannelGate {
    pub fn new(store: Arc<dyn RecordStore>, reminder_ttl: Duration) -> Self {
        Self {
            store,
            reminder_ttl,
        }
    }

    pub async fn decide(
        &self,
        api: &dyn ChatApi,
        group: &ChatGroup,
        sender: UserId,
    ) -> Result<GateDecision> {
        if !group.is_ad_group {
            return Ok(GateDecision::Skipped);
        }
        let settings = self.store.settings().await?;
        if !settings.channel_verification {
            return Ok(GateDecision::Skipped);
        }
        let Some(channel) = settings.target_channel_id else {
            warn!("channel verification enabled but no target channel set");
            return Ok(GateDecision::Skipped);
        };

        match api.member_status(ChatId(channel), sender).await {
            Ok(status) => {
                debug!("user {} status in {}: {:?}", sender.0, channel, status);
                if status.is_subscribed() {
                    Ok(GateDecision::Allowed)
                } else {
                    Ok(GateDecision::Denied)
                }
            }
            Err(e) => {
                warn!("member status lookup failed for {} in {}: {:?}", sender.0, channel, e);
                Ok(GateDecision::Denied)
            }
        }
    }

    /// 未关注：删消息，发带关注按钮的提醒，提醒到时自动删除
    pub async fn enforce(
        &self,
        api: Arc<dyn ChatApi>,
        group: &ChatGroup,
        msg: &Incoming,
    ) -> Result<GateDecision> {
        let decision = self.decide(api.as_ref(), group, msg.sender).await?;
        if decision != GateDecision::Denied {
            return Ok(decision);
        }
        let Some(channel) = self.store.settings().await?.target_channel_id else {
            return Ok(decision);
        };

        let _ = api_log(
            "delete_message",
            api.delete_message(msg.chat, msg.message).await,
        );

        let username = api_log("get_chat", api.chat_username(ChatId(channel)).await).flatten();
        let link = join_link(channel, username.as_deref());
        let text = format!(
            "⚠️ 亲爱的 {}，\n您需要先关注我们的频道才能在群内发言。\n关注后即可正常发言！",
            msg.sender_name
        );
        let button = vec![vec![AdButton {
            text: JOIN_BUTTON_TEXT.to_string(),
            url: link,
        }]];
        if let Some(reminder) = api_log(
            "send_message",
            api.send_text(msg.chat, text, Some(button)).await,
        ) {
            spawn_delayed_delete(api.clone(), msg.chat, reminder, self.reminder_ttl);
        }
        info!(
            "gated message from {} in group {} (not subscribed to {})",
            msg.sender.0, msg.chat.0, channel
        );
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::fake::{Call, FakeChat};
    use crate::platform::MemberStatus;
    use crate::store::SnapshotStore;
    use chrono::Utc;

    const CHANNEL: i64 = -1001234567890;

    fn group(flagged: bool) -> ChatGroup {
        ChatGroup {
            id: -500,
            title: "Deals".into(),
            kind: "supergroup".into(),
            is_ad_group: flagged,
            joined_at: Utc::now(),
        }
    }

    fn incoming() -> Incoming {
        Incoming {
            chat: ChatId(-500),
            message: MessageId(77),
            sender: UserId(42),
            sender_name: "Ann".into(),
        }
    }

    async fn gate_with_channel(channel: Option<i64>, enabled: bool) -> ChannelGate {
        let store = Arc::new(SnapshotStore::in_memory());
        let mut settings = store.settings().await.unwrap();
        settings.target_channel_id = channel;
        settings.channel_verification = enabled;
        store.save_settings(settings).await.unwrap();
        ChannelGate::new(store, Duration::from_secs(30))
    }

    #[test]
    fn join_link_prefers_public_handle() {
        assert_eq!(join_link(CHANNEL, Some("deals_news")), "https://t.me/deals_news");
        assert_eq!(join_link(CHANNEL, None), "https://t.me/c/1234567890");
        assert_eq!(join_link(-42, None), "https://t.me/c/-42");
    }

    #[tokio::test]
    async fn present_members_are_allowed() {
        let gate = gate_with_channel(Some(CHANNEL), true).await;
        let fake = FakeChat::new();
        for status in [
            MemberStatus::Member,
            MemberStatus::Administrator,
            MemberStatus::Creator,
        ] {
            fake.set_status(42, status);
            assert_eq!(
                gate.decide(&fake, &group(true), UserId(42)).await.unwrap(),
                GateDecision::Allowed
            );
        }
    }

    #[tokio::test]
    async fn absent_members_and_failed_lookups_are_denied() {
        let gate = gate_with_channel(Some(CHANNEL), true).await;
        let fake = FakeChat::new();
        assert_eq!(
            gate.decide(&fake, &group(true), UserId(42)).await.unwrap(),
            GateDecision::Denied
        );
        for status in [MemberStatus::Left, MemberStatus::Kicked] {
            fake.set_status(42, status);
            assert_eq!(
                gate.decide(&fake, &group(true), UserId(42)).await.unwrap(),
                GateDecision::Denied
            );
        }
    }

    #[tokio::test]
    async fn gate_is_skipped_when_not_applicable() {
        let fake = FakeChat::new();
        let gate = gate_with_channel(Some(CHANNEL), true).await;
        assert_eq!(
            gate.decide(&fake, &group(false), UserId(42)).await.unwrap(),
            GateDecision::Skipped
        );
        let gate = gate_with_channel(None, true).await;
        assert_eq!(
            gate.decide(&fake, &group(true), UserId(42)).await.unwrap(),
            GateDecision::Skipped
        );
        let gate = gate_with_channel(Some(CHANNEL), false).await;
        assert_eq!(
            gate.decide(&fake, &group(true), UserId(42)).await.unwrap(),
            GateDecision::Skipped
        );
    }

    #[tokio::test(start_paused = true)]
    async fn denial_deletes_message_and_reminder() {
        let gate = gate_with_channel(Some(CHANNEL), true).await;
        let fake = Arc::new(FakeChat::new());
        fake.set_status(42, MemberStatus::Left);
        let api: Arc<dyn ChatApi> = fake.clone();

        let decision = gate.enforce(api, &group(true), &incoming()).await.unwrap();
        assert_eq!(decision, GateDecision::Denied);

        let calls = fake.calls();
        assert_eq!(
            calls[0],
            Call::Delete {
                chat: ChatId(-500),
                message: MessageId(77)
            }
        );
        let Call::Text { text, buttons, .. } = &calls[1] else {
            panic!("expected reminder, got {:?}", calls[1]);
        };
        assert!(text.contains("Ann"));
        let buttons = buttons.as_ref().unwrap();
        assert_eq!(buttons[0][0].url, "https://t.me/c/1234567890");

        tokio::time::sleep(Duration::from_secs(31)).await;
        let deletes = fake.deletes();
        assert_eq!(deletes.len(), 2);
        assert_ne!(deletes[1].1, MessageId(77));
    }

    #[tokio::test]
    async fn allowed_sender_triggers_no_calls() {
        let gate = gate_with_channel(Some(CHANNEL), true).await;
        let fake = Arc::new(FakeChat::new());
        fake.set_status(42, MemberStatus::Member);
        let api: Arc<dyn ChatApi> = fake.clone();
        let decision = gate.enforce(api, &group(true), &incoming()).await.unwrap();
        assert_eq!(decision, GateDecision::Allowed);
        assert!(fake.calls().is_empty());
    }
}
