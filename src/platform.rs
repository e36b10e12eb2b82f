use anyhow::{Context, Result};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use teloxide::{
    prelude::*,
    types::{
        ChatId, ChatMemberStatus, InlineKeyboardButton, InlineKeyboardMarkup, InputFile, MessageId,
        UserId,
    },
};
use tracing::warn;

use crate::models::{AdButton, MediaKind, MediaRef};

pub type ButtonGrid = Vec<Vec<AdButton>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    Creator,
    Administrator,
    Member,
    Restricted,
    Left,
    Kicked,
}

impl MemberStatus {
    pub fn is_subscribed(self) -> bool {
        matches!(
            self,
            MemberStatus::Creator | MemberStatus::Administrator | MemberStatus::Member
        )
    }
}

impl From<ChatMemberStatus> for MemberStatus {
    fn from(status: ChatMemberStatus) -> Self {
        match status {
            ChatMemberStatus::Owner => MemberStatus::Creator,
            ChatMemberStatus::Administrator => MemberStatus::Administrator,
            ChatMemberStatus::Member => MemberStatus::Member,
            ChatMemberStatus::Restricted => MemberStatus::Restricted,
            ChatMemberStatus::Left => MemberStatus::Left,
            ChatMemberStatus::Banned => MemberStatus::Kicked,
        }
    }
}

/// 机器人对聊天平台的所有外发调用，每个都可能失败
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn send_text(
        &self,
        chat: ChatId,
        text: String,
        buttons: Option<ButtonGrid>,
    ) -> Result<MessageId>;

    async fn send_media(
        &self,
        chat: ChatId,
        media: &MediaRef,
        caption: String,
        buttons: ButtonGrid,
    ) -> Result<MessageId>;

    async fn delete_message(&self, chat: ChatId, message: MessageId) -> Result<()>;

    async fn member_status(&self, chat: ChatId, user: UserId) -> Result<MemberStatus>;

    /// 公开用户名（没有就是 None）
    async fn chat_username(&self, chat: ChatId) -> Result<Option<String>>;
}

pub struct TelegramApi {
    bot: Bot,
}

impl TelegramApi {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

fn keyboard(grid: ButtonGrid) -> Result<InlineKeyboardMarkup> {
    let mut rows = Vec::with_capacity(grid.len());
    for row in grid {
        let mut out = Vec::with_capacity(row.len());
        for b in row {
            let url = url::Url::parse(&b.url)
                .with_context(|| format!("bad button url: {}", b.url))?;
            out.push(InlineKeyboardButton::url(b.text, url));
        }
        rows.push(out);
    }
    Ok(InlineKeyboardMarkup::new(rows))
}

#[async_trait]
impl ChatApi for TelegramApi {
    async fn send_text(
        &self,
        chat: ChatId,
        text: String,
        buttons: Option<ButtonGrid>,
    ) -> Result<MessageId> {
        let req = self.bot.send_message(chat, text);
        let sent = match buttons {
            Some(grid) => req.reply_markup(keyboard(grid)?).await,
            None => req.await,
        }
        .context("send_message")?;
        Ok(sent.id)
    }

    async fn send_media(
        &self,
        chat: ChatId,
        media: &MediaRef,
        caption: String,
        buttons: ButtonGrid,
    ) -> Result<MessageId> {
        let kb = keyboard(buttons)?;
        let file = InputFile::file_id(media.file_id.clone());
        let sent = match media.kind {
            MediaKind::Photo => self
                .bot
                .send_photo(chat, file)
                .caption(caption)
                .reply_markup(kb)
                .await
                .context("send_photo")?,
            MediaKind::Video => self
                .bot
                .send_video(chat, file)
                .caption(caption)
                .reply_markup(kb)
                .await
                .context("send_video")?,
        };
        Ok(sent.id)
    }

    async fn delete_message(&self, chat: ChatId, message: MessageId) -> Result<()> {
        self.bot
            .delete_message(chat, message)
            .await
            .context("delete_message")?;
        Ok(())
    }

    async fn member_status(&self, chat: ChatId, user: UserId) -> Result<MemberStatus> {
        let member = self
            .bot
            .get_chat_member(chat, user)
            .await
            .context("get_chat_member")?;
        Ok(member.status().into())
    }

    async fn chat_username(&self, chat: ChatId) -> Result<Option<String>> {
        let info = self.bot.get_chat(chat).await.context("get_chat")?;
        Ok(info.username().map(str::to_string))
    }
}

fn ctx_perm_hint(ctx: &str) -> &'static str {
    match ctx {
        "delete_message" => "bot needs admin rights with Delete messages in that chat",
        "get_chat_member" => "bot must be an administrator of the target channel to read members",
        "get_chat" => "bot must be able to see the chat; private channels need the bot as a member",
        "send_message" | "send_media" => {
            "bot must be allowed to post there; in private chats the user may not have /start-ed the bot"
        }
        _ => "check that the bot is an administrator with the matching permission",
    }
}

/// 失败只记日志并附权限提示，返回 None
pub fn api_log<T>(ctx: &str, res: Result<T>) -> Option<T> {
    match res {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(
                "API call failed ({ctx}): {:?}; hint: {}",
                e,
                ctx_perm_hint(ctx)
            );
            None
        }
    }
}

/// 延时删除消息；不跟踪任务，重启即丢失
pub fn spawn_delayed_delete(
    api: Arc<dyn ChatApi>,
    chat: ChatId,
    message: MessageId,
    delay: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = api_log("delete_message", api.delete_message(chat, message).await);
    })
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use anyhow::anyhow;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        Text {
            chat: ChatId,
            text: String,
            buttons: Option<ButtonGrid>,
        },
        Media {
            chat: ChatId,
            media: MediaRef,
            caption: String,
            buttons: ButtonGrid,
        },
        Delete {
            chat: ChatId,
            message: MessageId,
        },
    }

    #[derive(Default)]
    pub struct FakeChat {
        pub calls: Mutex<Vec<Call>>,
        pub failing_chats: Mutex<HashSet<i64>>,
        pub statuses: Mutex<HashMap<u64, MemberStatus>>,
        pub usernames: Mutex<HashMap<i64, String>>,
        pub fail_deletes: Mutex<bool>,
        next_id: Mutex<i32>,
    }

    impl FakeChat {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_chat(&self, chat: i64) {
            self.failing_chats.lock().unwrap().insert(chat);
        }

        pub fn set_status(&self, user: u64, status: MemberStatus) {
            self.statuses.lock().unwrap().insert(user, status);
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub fn texts(&self) -> Vec<(ChatId, String)> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Text { chat, text, .. } => Some((chat, text)),
                    _ => None,
                })
                .collect()
        }

        pub fn deletes(&self) -> Vec<(ChatId, MessageId)> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Delete { chat, message } => Some((chat, message)),
                    _ => None,
                })
                .collect()
        }

        fn check(&self, chat: ChatId) -> Result<MessageId> {
            if self.failing_chats.lock().unwrap().contains(&chat.0) {
                return Err(anyhow!("chat {} rejected the request", chat.0));
            }
            let mut id = self.next_id.lock().unwrap();
            *id += 1;
            Ok(MessageId(1000 + *id))
        }
    }

    #[async_trait]
    impl ChatApi for FakeChat {
        async fn send_text(
            &self,
            chat: ChatId,
            text: String,
            buttons: Option<ButtonGrid>,
        ) -> Result<MessageId> {
            let id = self.check(chat)?;
            self.calls.lock().unwrap().push(Call::Text {
                chat,
                text,
                buttons,
            });
            Ok(id)
        }

        async fn send_media(
            &self,
            chat: ChatId,
            media: &MediaRef,
            caption: String,
            buttons: ButtonGrid,
        ) -> Result<MessageId> {
            let id = self.check(chat)?;
            self.calls.lock().unwrap().push(Call::Media {
                chat,
                media: media.clone(),
                caption,
                buttons,
            });
            Ok(id)
        }

        async fn delete_message(&self, chat: ChatId, message: MessageId) -> Result<()> {
            if *self.fail_deletes.lock().unwrap() {
                return Err(anyhow!("message to delete not found"));
            }
            self.calls
                .lock()
                .unwrap()
                .push(Call::Delete { chat, message });
            Ok(())
        }

        async fn member_status(&self, _chat: ChatId, user: UserId) -> Result<MemberStatus> {
            self.statuses
                .lock()
                .unwrap()
                .get(&user.0)
                .copied()
                .ok_or_else(|| anyhow!("Bad Request: user not found"))
        }

        async fn chat_username(&self, chat: ChatId) -> Result<Option<String>> {
            Ok(self.usernames.lock().unwrap().get(&chat.0).cloned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeChat;
    use super::*;

    #[test]
    fn only_present_members_count_as_subscribed() {
        assert!(MemberStatus::Member.is_subscribed());
        assert!(MemberStatus::Administrator.is_subscribed());
        assert!(MemberStatus::Creator.is_subscribed());
        assert!(!MemberStatus::Restricted.is_subscribed());
        assert!(!MemberStatus::Left.is_subscribed());
        assert!(!MemberStatus::Kicked.is_subscribed());
    }

    #[test]
    fn keyboard_rejects_unparseable_urls() {
        let grid = vec![vec![AdButton {
            text: "x".into(),
            url: "not a url".into(),
        }]];
        assert!(keyboard(grid).is_err());
    }

    #[test]
    fn api_log_swallows_errors() {
        let ok: Option<u8> = api_log("send_message", Ok(1));
        assert_eq!(ok, Some(1));
        let failed: Option<u8> = api_log("send_message", Err(anyhow::anyhow!("boom")));
        assert!(failed.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_delete_waits_then_deletes_once() {
        let fake = Arc::new(FakeChat::new());
        let api: Arc<dyn ChatApi> = fake.clone();
        let handle = spawn_delayed_delete(api, ChatId(-5), MessageId(7), Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(fake.deletes().is_empty());

        handle.await.unwrap();
        assert_eq!(fake.deletes(), vec![(ChatId(-5), MessageId(7))]);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_delete_failure_is_swallowed() {
        let fake = Arc::new(FakeChat::new());
        *fake.fail_deletes.lock().unwrap() = true;
        let api: Arc<dyn ChatApi> = fake.clone();
        let handle = spawn_delayed_delete(api, ChatId(-5), MessageId(7), Duration::from_secs(1));
        handle.await.unwrap();
        assert!(fake.deletes().is_empty());
    }
}
