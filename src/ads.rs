use anyhow::{anyhow, Result};
use chrono::Utc;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use std::{collections::HashMap, sync::Arc};
use teloxide::types::UserId;
use thiserror::Error;
use tracing::info;

use crate::models::{AdButton, Advertisement, MediaRef};
use crate::platform::ButtonGrid;
use crate::store::RecordStore;

/// 欢迎语、广告语、按钮三段之间的分隔符
pub const FIELD_DELIMITER: &str = "\n\n\n";
const BUTTONS_PER_ROW: usize = 2;
/// Telegram 媒体说明文字上限（字符数）
pub const MAX_CAPTION_CHARS: usize = 1024;
/// Telegram 名字上限，用来估算 {name} / {username} 展开后的最长长度
const MAX_NAME_CHARS: usize = 64;

pub const SUBMISSION_FORMAT: &str = "欢迎语\n\n\n广告语\n可以包含多行\n\n\n按钮1|链接1;按钮2|链接2";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmissionError {
    #[error("需要欢迎语、广告语和按钮信息三部分，用三个换行符分隔（收到 {0} 部分）")]
    FieldCount(usize),
    #[error("广告语不能为空")]
    EmptyAdText,
    #[error("按钮格式错误：每个按钮应为 '按钮文字|按钮链接'，多个按钮用分号分隔（{0}）")]
    BadButton(String),
    #[error("按钮链接无效：{0}")]
    BadUrl(String),
    #[error("至少需要一个按钮")]
    NoButtons,
    #[error("广告内容过长：最长可达 {0} 字符，媒体说明文字上限为 1024 字符")]
    CaptionTooLong(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdSubmission {
    pub welcome_text: String,
    pub ad_text: String,
    pub buttons: Vec<AdButton>,
}

pub fn parse_submission(text: &str) -> Result<AdSubmission, SubmissionError> {
    let parts: Vec<&str> = text.split(FIELD_DELIMITER).collect();
    if parts.len() != 3 {
        return Err(SubmissionError::FieldCount(parts.len()));
    }
    let welcome_text = parts[0].trim().to_string();
    let ad_text = parts[1].trim().to_string();
    if ad_text.is_empty() {
        return Err(SubmissionError::EmptyAdText);
    }
    let longest = longest_caption_chars(&welcome_text, &ad_text);
    if longest > MAX_CAPTION_CHARS {
        return Err(SubmissionError::CaptionTooLong(longest));
    }

    let mut buttons = Vec::new();
    for raw in parts[2].trim().split(';') {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let fields: Vec<&str> = raw.split('|').collect();
        if fields.len() != 2 {
            return Err(SubmissionError::BadButton(raw.to_string()));
        }
        let (label, link) = (fields[0].trim(), fields[1].trim());
        if label.is_empty() || link.is_empty() {
            return Err(SubmissionError::BadButton(raw.to_string()));
        }
        if url::Url::parse(link).is_err() {
            return Err(SubmissionError::BadUrl(link.to_string()));
        }
        buttons.push(AdButton {
            text: label.to_string(),
            url: link.to_string(),
        });
    }
    if buttons.is_empty() {
        return Err(SubmissionError::NoButtons);
    }

    Ok(AdSubmission {
        welcome_text,
        ad_text,
        buttons,
    })
}

/// 每行两个按钮，最后一行可以只有一个
pub fn pack_buttons(buttons: &[AdButton]) -> ButtonGrid {
    buttons
        .chunks(BUTTONS_PER_ROW)
        .map(|row| row.to_vec())
        .collect()
}

pub fn format_template(s: &str, vars: &HashMap<&str, String>) -> String {
    let mut out = s.to_string();
    for (k, v) in vars {
        out = out.replace(&format!("{{{}}}", k), v);
    }
    out
}

fn compose_caption(welcome_text: &str, ad_text: &str, name: &str, username: Option<&str>) -> String {
    let mut vars = HashMap::new();
    vars.insert("name", name.to_string());
    vars.insert("username", username.unwrap_or(name).to_string());
    let welcome = format_template(welcome_text, &vars);
    if welcome.is_empty() {
        ad_text.to_string()
    } else {
        format!("{}\n\n{}", welcome, ad_text)
    }
}

/// 新成员欢迎语：欢迎语（已替换占位符）+ 空行 + 广告语
pub fn welcome_caption(ad: &Advertisement, name: &str, username: Option<&str>) -> String {
    compose_caption(&ad.welcome_text, &ad.ad_text, name, username)
}

fn longest_caption_chars(welcome_text: &str, ad_text: &str) -> usize {
    let widest = "W".repeat(MAX_NAME_CHARS);
    let welcome = compose_caption(welcome_text, ad_text, &widest, Some(&widest));
    welcome.chars().count().max(ad_text.chars().count())
}

#[derive(Clone)]
pub struct AdCatalog {
    store: Arc<dyn RecordStore>,
}

impl AdCatalog {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub async fn create(
        &self,
        media: MediaRef,
        welcome_text: String,
        ad_text: String,
        buttons: Vec<AdButton>,
    ) -> Result<Advertisement> {
        if buttons.is_empty() {
            return Err(anyhow!("advertisement needs at least one button"));
        }
        let ad = Advertisement {
            id: uuid::Uuid::new_v4().to_string(),
            media,
            welcome_text,
            ad_text,
            buttons,
            created_at: Utc::now(),
        };
        self.store.save_ad(ad.clone()).await?;
        info!("advertisement created: {}", ad.id);
        Ok(ad)
    }

    pub async fn list(&self) -> Result<Vec<Advertisement>> {
        self.store.list_ads().await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Advertisement>> {
        self.store.get_ad(id).await
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let removed = self.store.delete_ad(id).await?;
        if removed {
            info!("advertisement deleted: {id}");
        } else {
            info!("advertisement not found: {id}");
        }
        Ok(removed)
    }

    pub async fn get_random(&self) -> Result<Option<Advertisement>> {
        let ads = self.store.list_ads().await?;
        Ok(ads.choose(&mut rand::thread_rng()).cloned())
    }

    /// 轮播：游标存在 settings 里，重启后接着上次的位置继续
    pub async fn get_next(&self) -> Result<Option<Advertisement>> {
        let ads = self.store.list_ads().await?;
        if ads.is_empty() {
            return Ok(None);
        }
        let mut settings = self.store.settings().await?;
        let pos = settings.ad_cursor % ads.len();
        settings.ad_cursor = (pos + 1) % ads.len();
        self.store.save_settings(settings).await?;
        Ok(Some(ads[pos].clone()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdDraft {
    AwaitingMedia,
    MediaReceived(MediaRef),
}

/// `/add_ad` 两步流程中每个用户的进度（不落盘）
#[derive(Default)]
pub struct AdDraftBook {
    drafts: DashMap<UserId, AdDraft>,
}

impl AdDraftBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, user: UserId) {
        self.drafts.insert(user, AdDraft::AwaitingMedia);
    }

    #[cfg(test)]
    pub fn is_active(&self, user: UserId) -> bool {
        self.drafts.contains_key(&user)
    }

    /// 有草稿才接收媒体；重复上传以最后一次为准
    pub fn attach_media(&self, user: UserId, media: MediaRef) -> bool {
        match self.drafts.get_mut(&user) {
            Some(mut d) => {
                *d = AdDraft::MediaReceived(media);
                true
            }
            None => false,
        }
    }

    /// 已收到媒体时结束草稿并取出媒体
    pub fn take_media(&self, user: UserId) -> Option<MediaRef> {
        let (_, draft) = self
            .drafts
            .remove_if(&user, |_, d| matches!(d, AdDraft::MediaReceived(_)))?;
        match draft {
            AdDraft::MediaReceived(media) => Some(media),
            AdDraft::AwaitingMedia => None,
        }
    }
}
