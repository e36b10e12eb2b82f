use anyhow::Result;
use chrono::{DateTime, NaiveTime, Utc};
use std::{sync::Arc, time::Duration};
use teloxide::types::ChatId;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::ads::{pack_buttons, AdCatalog};
use crate::groups::GroupRegistry;
use crate::platform::{api_log, ChatApi};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    Every(Duration),
    // 每天固定时间（UTC）
    DailyAt(Vec<NaiveTime>),
}

pub fn parse_hhmm_utc(s: &str) -> Option<NaiveTime> {
    let parts: Vec<&str> = s.trim().split(':').collect();
    if parts.len() != 2 {
        return None;
    }
    let hh = parts[0].parse::<u32>().ok()?;
    let mm = parts[1].parse::<u32>().ok()?;
    NaiveTime::from_hms_opt(hh, mm, 0)
}

/// `now` 之后最近的一个时间点，今天没有就顺延到明天
pub fn next_daily_in_utc(times: &[NaiveTime], now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let today = now.date_naive();
    let tomorrow = today.succ_opt()?;
    times
        .iter()
        .map(|t| {
            let cand = today.and_time(*t).and_utc();
            if cand > now {
                cand
            } else {
                tomorrow.and_time(*t).and_utc()
            }
        })
        .min()
}

impl Schedule {
    pub fn delay_from(&self, now: DateTime<Utc>) -> Duration {
        match self {
            Schedule::Every(d) => *d,
            Schedule::DailyAt(times) => next_daily_in_utc(times, now)
                .and_then(|next| (next - now).to_std().ok())
                .unwrap_or(Duration::from_secs(3600)),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub ad_id: Option<String>,
    pub delivered: Vec<ChatId>,
    pub failed: Vec<ChatId>,
}

pub struct AdBroadcaster {
    catalog: AdCatalog,
    groups: GroupRegistry,
}

impl AdBroadcaster {
    pub fn new(catalog: AdCatalog, groups: GroupRegistry) -> Self {
        Self { catalog, groups }
    }

    /// 轮播下一条广告发到所有广告群；单个群失败不影响其他群
    pub async fn broadcast_once(&self, api: &dyn ChatApi) -> Result<BroadcastReport> {
        let mut report = BroadcastReport::default();

        let groups = self.groups.ad_groups().await?;
        if groups.is_empty() {
            warn!("broadcast skipped: no ad-target groups");
            return Ok(report);
        }
        let Some(ad) = self.catalog.get_next().await? else {
            info!("broadcast skipped: no advertisements");
            return Ok(report);
        };
        report.ad_id = Some(ad.id.clone());

        let grid = pack_buttons(&ad.buttons);
        for group in groups {
            let chat = ChatId(group.id);
            let sent = api
                .send_media(chat, &ad.media, ad.ad_text.clone(), grid.clone())
                .await;
            match api_log("send_media", sent) {
                Some(_) => {
                    info!("ad {} sent to {} ({})", ad.id, group.title, group.id);
                    report.delivered.push(chat);
                }
                None => {
                    warn!("ad {} not delivered to {} ({})", ad.id, group.title, group.id);
                    report.failed.push(chat);
                }
            }
        }
        Ok(report)
    }

    pub async fn run(
        &self,
        api: Arc<dyn ChatApi>,
        schedule: Schedule,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        info!("ad broadcaster started: {:?}", schedule);
        loop {
            let sleep = schedule.delay_from(Utc::now());
            tokio::select! {
                _ = shutdown_rx.recv() => { break; }
                _ = tokio::time::sleep(sleep) => {
                    if let Err(e) = self.broadcast_once(api.as_ref()).await {
                        warn!("scheduled broadcast failed: {:?}", e);
                    }
                }
            }
        }
        info!("ad broadcaster stopped");
    }
}
