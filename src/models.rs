use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
        }
    }
}

/// 只存 Telegram 的 file_id，文件本身不下载
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub file_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdButton {
    pub text: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    pub id: String,
    pub media: MediaRef,
    // 支持 {name} / {username} 占位符
    pub welcome_text: String,
    pub ad_text: String,
    pub buttons: Vec<AdButton>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatGroup {
    pub id: i64,
    pub title: String,
    pub kind: String,
    #[serde(default)]
    pub is_ad_group: bool,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminUser {
    pub id: u64,
    #[serde(default)]
    pub is_admin: bool,
    pub username: Option<String>,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BannedWord {
    pub id: String,
    pub word: String,
    pub created_by: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub target_group_id: Option<i64>,
    #[serde(default)]
    pub target_channel_id: Option<i64>,
    #[serde(default = "default_true")]
    pub channel_verification: bool,
    // 轮播游标
    #[serde(default)]
    pub ad_cursor: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            target_group_id: None,
            target_channel_id: None,
            channel_verification: true,
            ad_cursor: 0,
        }
    }
}

fn default_true() -> bool {
    true
}
