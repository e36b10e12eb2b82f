use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::{path::PathBuf, time::Duration};

use crate::scheduler::{parse_hhmm_utc, Schedule};

const MIN_INTERVAL_SECS: u64 = 10;
const DEFAULT_WARNING_DELETE_SECS: u64 = 10;
const DEFAULT_REMINDER_DELETE_SECS: u64 = 30;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub bot: BotConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub moderation: ModerationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BotConfig {
    pub token: String,
    pub log_level: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RuntimeConfig {
    pub data_dir: Option<String>,
    // ✅ 可有可无：不写或 0 就只在退出时保存
    pub autosave_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BroadcastConfig {
    pub interval_secs: Option<u64>,
    pub daily_at: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ModerationConfig {
    pub warning_delete_secs: Option<u64>,
    pub reminder_delete_secs: Option<u64>,
}

impl RuntimeConfig {
    pub fn data_dir(&self) -> String {
        self.data_dir.clone().unwrap_or_else(|| "./data".to_string())
    }
}

impl ModerationConfig {
    pub fn warning_ttl(&self) -> Duration {
        Duration::from_secs(
            self.warning_delete_secs
                .unwrap_or(DEFAULT_WARNING_DELETE_SECS),
        )
    }

    pub fn reminder_ttl(&self) -> Duration {
        Duration::from_secs(
            self.reminder_delete_secs
                .unwrap_or(DEFAULT_REMINDER_DELETE_SECS),
        )
    }
}

impl BroadcastConfig {
    pub fn schedule(&self) -> Result<Schedule> {
        match (&self.interval_secs, &self.daily_at) {
            (Some(secs), None) => Ok(Schedule::Every(Duration::from_secs(*secs))),
            (None, Some(times)) => {
                let mut parsed = Vec::with_capacity(times.len());
                for t in times {
                    let time = parse_hhmm_utc(t)
                        .ok_or_else(|| anyhow!("broadcast.daily_at: bad time '{}' (want HH:MM)", t))?;
                    parsed.push(time);
                }
                Ok(Schedule::DailyAt(parsed))
            }
            (Some(_), Some(_)) => Err(anyhow!(
                "broadcast: set either interval_secs or daily_at, not both"
            )),
            (None, None) => Err(anyhow!("broadcast: one of interval_secs or daily_at is required")),
        }
    }
}

pub fn load_config(path: &PathBuf) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    parse_config(&text)
}

pub fn parse_config(text: &str) -> Result<Config> {
    let cfg: Config = serde_yaml::from_str(text).context("parse yaml")?;
    Ok(cfg)
}

pub fn validate_config(cfg: &Config) -> Result<()> {
    if cfg.bot.token.trim().is_empty() {
        return Err(anyhow!("bot.token is empty"));
    }

    match cfg.broadcast.schedule()? {
        Schedule::Every(d) if d.as_secs() < MIN_INTERVAL_SECS => {
            return Err(anyhow!(
                "broadcast.interval_secs={} too small (>= {})",
                d.as_secs(),
                MIN_INTERVAL_SECS
            ));
        }
        Schedule::DailyAt(times) if times.is_empty() => {
            return Err(anyhow!("broadcast.daily_at is empty"));
        }
        _ => {}
    }

    if cfg.moderation.warning_delete_secs == Some(0) {
        return Err(anyhow!("moderation.warning_delete_secs must be > 0"));
    }
    if cfg.moderation.reminder_delete_secs == Some(0) {
        return Err(anyhow!("moderation.reminder_delete_secs must be > 0"));
    }
    Ok(())
}

pub fn parse_config_arg(args: &[String]) -> Option<PathBuf> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--config" && i + 1 < args.len() {
            return Some(PathBuf::from(&args[i + 1]));
        }
        i += 1;
    }
    None
}
