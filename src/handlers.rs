use anyhow::{Context, Result};
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use teloxide::{
    prelude::*,
    types::{Chat, ChatId, User, UserId},
    utils::command::BotCommands,
};
use tracing::{error, info, warn};

use crate::admin::{require_admin, AdminRegistry, Claim};
use crate::ads::{
    pack_buttons, parse_submission, welcome_caption, AdCatalog, AdDraftBook, SUBMISSION_FORMAT,
};
use crate::banned_words::BannedWordFilter;
use crate::config::ModerationConfig;
use crate::gate::{ChannelGate, GateDecision, Incoming};
use crate::groups::GroupRegistry;
use crate::models::{MediaKind, MediaRef};
use crate::platform::{api_log, spawn_delayed_delete, ChatApi};
use crate::store::RecordStore;

/// Telegram 单条消息上限 4096，留点余量
const MAX_MESSAGE_CHARS: usize = 4000;

#[derive(BotCommands, Clone, Debug, PartialEq, Eq)]
#[command(rename_rule = "snake_case", description = "🤖 可用命令列表：")]
pub enum Command {
    #[command(description = "显示此帮助信息")]
    Help,
    #[command(description = "初始化管理员 / 添加管理员 <用户ID> / 查看管理员列表")]
    Admin(String),
    #[command(description = "移除管理员 <用户ID>")]
    RemoveAdmin(String),
    #[command(description = "设置目标群组 <群组ID>")]
    SetTarget(String),
    #[command(description = "查看目标群组")]
    ShowTarget,
    #[command(description = "停止向群组投放广告 <群组ID>")]
    RemoveAdGroup(String),
    #[command(description = "设置目标频道 <频道ID>")]
    SetTargetChannel(String),
    #[command(description = "查看目标频道")]
    ShowTargetChannel,
    #[command(description = "开启/关闭频道关注验证")]
    ToggleVerification,
    #[command(rename = "getid", description = "查看当前会话和用户ID")]
    GetId,
    #[command(description = "添加新广告")]
    AddAd,
    #[command(description = "查看所有广告")]
    ListAds,
    #[command(description = "删除广告 <广告ID>")]
    DeleteAd(String),
    #[command(description = "添加禁言词 <关键词>")]
    AddBannedWord(String),
    #[command(description = "查看禁言词")]
    ListBannedWords,
    #[command(description = "删除禁言词 <关键词>")]
    DeleteBannedWord(String),
}

pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    pub admins: AdminRegistry,
    pub ads: AdCatalog,
    pub words: BannedWordFilter,
    pub groups: GroupRegistry,
    pub gate: ChannelGate,
    pub drafts: AdDraftBook,
    pub warning_ttl: Duration,
    pub bot_id: UserId,
}

impl AppState {
    pub fn new(store: Arc<dyn RecordStore>, moderation: &ModerationConfig, bot_id: UserId) -> Self {
        Self {
            admins: AdminRegistry::new(store.clone()),
            ads: AdCatalog::new(store.clone()),
            words: BannedWordFilter::new(store.clone()),
            groups: GroupRegistry::new(store.clone()),
            gate: ChannelGate::new(store.clone(), moderation.reminder_ttl()),
            drafts: AdDraftBook::new(),
            warning_ttl: moderation.warning_ttl(),
            bot_id,
            store,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Invoker {
    pub chat: ChatId,
    pub user: UserId,
    pub username: Option<String>,
}

fn ok(text: impl AsRef<str>) -> String {
    format!("✅ {}", text.as_ref())
}

fn fail(text: impl AsRef<str>) -> String {
    format!("❌ {}", text.as_ref())
}

fn single_arg(args: &str) -> Option<&str> {
    args.split_whitespace().next()
}

pub fn help_text() -> String {
    Command::descriptions().to_string()
}

pub async fn execute(state: &AppState, who: &Invoker, cmd: Command) -> Result<String> {
    match cmd {
        Command::Help => Ok(help_text()),
        Command::GetId => Ok(format!(
            "会话 ID: {}\n用户 ID: {}",
            who.chat.0, who.user.0
        )),
        Command::Admin(args) => admin_command(state, who, &args).await,
        Command::RemoveAdmin(args) => {
            require_admin(&state.admins, who.user, || remove_admin(state, &args)).await
        }
        Command::SetTarget(args) => {
            require_admin(&state.admins, who.user, || set_target(state, &args)).await
        }
        Command::ShowTarget => require_admin(&state.admins, who.user, || show_target(state)).await,
        Command::RemoveAdGroup(args) => {
            require_admin(&state.admins, who.user, || remove_ad_group(state, &args)).await
        }
        Command::SetTargetChannel(args) => {
            require_admin(&state.admins, who.user, || set_target_channel(state, &args)).await
        }
        Command::ShowTargetChannel => {
            require_admin(&state.admins, who.user, || show_target_channel(state)).await
        }
        Command::ToggleVerification => {
            require_admin(&state.admins, who.user, || toggle_verification(state)).await
        }
        Command::AddAd => require_admin(&state.admins, who.user, || add_ad(state, who.user)).await,
        Command::ListAds => require_admin(&state.admins, who.user, || list_ads(state)).await,
        Command::DeleteAd(args) => {
            require_admin(&state.admins, who.user, || delete_ad(state, &args)).await
        }
        Command::AddBannedWord(args) => {
            require_admin(&state.admins, who.user, || add_banned_word(state, who.user, &args))
                .await
        }
        Command::ListBannedWords => {
            require_admin(&state.admins, who.user, || list_banned_words(state)).await
        }
        Command::DeleteBannedWord(args) => {
            require_admin(&state.admins, who.user, || delete_banned_word(state, &args)).await
        }
    }
}

async fn admin_command(state: &AppState, who: &Invoker, args: &str) -> Result<String> {
    match state.admins.claim(who.user, who.username.clone()).await? {
        Claim::Bootstrapped => {
            return Ok(ok(format!("您已被设置为首位管理员！\nID: {}", who.user.0)));
        }
        Claim::Denied => return Ok(fail("您不是管理员")),
        Claim::AlreadyAdmin => {}
    }

    if let Some(raw) = single_arg(args) {
        let Ok(id) = raw.parse::<u64>() else {
            return Ok(fail("无效的用户ID格式。请使用数字ID。"));
        };
        return Ok(if state.admins.add_admin(UserId(id), None).await? {
            ok(format!("已添加新管理员 {}", id))
        } else {
            fail(format!("添加管理员失败：{} 已经是管理员", id))
        });
    }

    let list = state
        .admins
        .list_admins()
        .await?
        .iter()
        .map(|a| {
            format!(
                "- ID: {} | Username: @{}",
                a.id,
                a.username.as_deref().unwrap_or("None")
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    Ok(format!("📋 管理员列表：\n{}", list))
}

async fn remove_admin(state: &AppState, args: &str) -> Result<String> {
    let Some(raw) = single_arg(args) else {
        return Ok(fail("请提供要移除的管理员ID\n用法: /remove_admin <admin_id>"));
    };
    let Ok(id) = raw.parse::<u64>() else {
        return Ok(fail("无效的用户ID格式"));
    };
    Ok(if state.admins.remove_admin(UserId(id)).await? {
        ok(format!("已移除管理员 {}", id))
    } else {
        fail(format!("移除管理员失败：未找到用户 {}", id))
    })
}

async fn set_target(state: &AppState, args: &str) -> Result<String> {
    let Some(raw) = single_arg(args) else {
        return Ok(fail("请提供目标群组ID\n用法: /set_target <群组ID>"));
    };
    let Ok(id) = raw.parse::<i64>() else {
        return Ok(fail("无效的群组ID，请提供正确的数字ID。"));
    };
    let group = state.groups.set_target(id).await?;
    Ok(ok(format!(
        "已成功设置目标群组ID为：{}，并将其标记为广告群",
        group.id
    )))
}

async fn remove_ad_group(state: &AppState, args: &str) -> Result<String> {
    let Some(raw) = single_arg(args) else {
        return Ok(fail("请提供群组ID\n用法: /remove_ad_group <群组ID>"));
    };
    let Ok(id) = raw.parse::<i64>() else {
        return Ok(fail("无效的群组ID，请提供正确的数字ID。"));
    };
    Ok(if state.groups.set_ad_group(id, false).await? {
        ok(format!("群组 {} 已停止广告投放", id))
    } else {
        fail(format!("未找到群组 {}", id))
    })
}

async fn show_target(state: &AppState) -> Result<String> {
    let settings = state.store.settings().await?;
    let Some(id) = settings.target_group_id else {
        return Ok("尚未设置目标群组\n使用 /set_target <群组ID> 设置".to_string());
    };
    let ad_groups = state.groups.ad_groups().await?;
    let mut text = match state.groups.get(id).await? {
        Some(g) => format!(
            "🎯 目标群组：{} ({})\n类型: {}\n广告群: {}",
            g.title,
            g.id,
            g.kind,
            if g.is_ad_group { "是" } else { "否" }
        ),
        None => format!("🎯 目标群组ID：{}（尚无群组记录）", id),
    };
    text.push_str(&format!("\n广告投放群组数量: {}", ad_groups.len()));
    Ok(text)
}

async fn set_target_channel(state: &AppState, args: &str) -> Result<String> {
    let Some(raw) = single_arg(args) else {
        return Ok(fail("请提供目标频道ID\n用法: /set_target_channel <频道ID>"));
    };
    let Ok(id) = raw.parse::<i64>() else {
        return Ok(fail("无效的频道ID，请提供正确的数字ID。"));
    };
    let mut settings = state.store.settings().await?;
    settings.target_channel_id = Some(id);
    state.store.save_settings(settings).await?;
    info!("target channel set: {}", id);
    Ok(ok(format!("已成功设置目标频道ID为：{}", id)))
}

async fn show_target_channel(state: &AppState) -> Result<String> {
    let settings = state.store.settings().await?;
    let verification = if settings.channel_verification {
        "已开启"
    } else {
        "已关闭"
    };
    Ok(match settings.target_channel_id {
        Some(id) => format!("📢 目标频道ID：{}\n频道验证：{}", id, verification),
        None => format!(
            "尚未设置目标频道\n使用 /set_target_channel <频道ID> 设置\n频道验证：{}",
            verification
        ),
    })
}

async fn toggle_verification(state: &AppState) -> Result<String> {
    let mut settings = state.store.settings().await?;
    settings.channel_verification = !settings.channel_verification;
    let enabled = settings.channel_verification;
    state.store.save_settings(settings).await?;
    info!("channel verification = {}", enabled);
    Ok(ok(if enabled {
        "频道关注验证已开启"
    } else {
        "频道关注验证已关闭"
    }))
}

async fn add_ad(state: &AppState, user: UserId) -> Result<String> {
    state.drafts.begin(user);
    Ok(format!(
        "📝 请按以下步骤添加广告：\n1. 发送广告图片或视频\n2. 回复该媒体，使用以下格式：\n\n{}",
        SUBMISSION_FORMAT
    ))
}

async fn list_ads(state: &AppState) -> Result<String> {
    let ads = state.ads.list().await?;
    if ads.is_empty() {
        return Ok("📝 当前没有广告".to_string());
    }
    let mut blocks = Vec::with_capacity(ads.len() + 1);
    for ad in &ads {
        let buttons = ad
            .buttons
            .iter()
            .map(|b| format!("- {} -> {}", b.text, b.url))
            .collect::<Vec<_>>()
            .join("\n");
        blocks.push(format!(
            "📢 广告\nID: {}\n类型: {}\n欢迎语: {}\n广告语: {}\n按钮列表:\n{}\n创建时间: {}",
            ad.id,
            ad.media.kind.as_str(),
            ad.welcome_text,
            ad.ad_text,
            buttons,
            ad.created_at.format("%Y-%m-%d %H:%M:%S")
        ));
    }
    blocks.push("💡 删除广告请使用：\n/delete_ad <广告ID>".to_string());
    Ok(blocks.join("\n\n"))
}

async fn delete_ad(state: &AppState, args: &str) -> Result<String> {
    let Some(id) = single_arg(args) else {
        return Ok(fail(
            "请提供要删除的广告ID\n用法: /delete_ad <ad_id>\n提示：使用 /list_ads 查看所有广告及其ID",
        ));
    };
    let not_found = || fail(format!("删除广告失败：未找到ID为 {} 的广告", id));
    let Some(ad) = state.ads.get(id).await? else {
        return Ok(not_found());
    };
    Ok(if state.ads.delete(&ad.id).await? {
        ok(format!("已删除广告 {}（{}）", ad.id, ad.media.kind.as_str()))
    } else {
        not_found()
    })
}

async fn add_banned_word(state: &AppState, user: UserId, args: &str) -> Result<String> {
    let word = args.trim();
    if word.is_empty() {
        return Ok(fail("请提供要禁用的关键词\n用法: /add_banned_word <关键词>"));
    }
    Ok(if state.words.add(word, user.0).await? {
        ok(format!("已添加禁言词: {}", word.to_lowercase()))
    } else {
        fail(format!("添加禁言词失败：{} 已存在", word.to_lowercase()))
    })
}

async fn list_banned_words(state: &AppState) -> Result<String> {
    let words = state.words.list().await?;
    if words.is_empty() {
        return Ok("当前没有禁言词".to_string());
    }
    let list = words
        .iter()
        .map(|w| format!("- {}", w.word))
        .collect::<Vec<_>>()
        .join("\n");
    Ok(format!(
        "📋 禁言词列表：\n{}\n\n删除禁言词请使用：\n/delete_banned_word <关键词>",
        list
    ))
}

async fn delete_banned_word(state: &AppState, args: &str) -> Result<String> {
    let word = args.trim();
    if word.is_empty() {
        return Ok(fail("请提供要删除的关键词\n用法: /delete_banned_word <关键词>"));
    }
    Ok(if state.words.delete(word).await? {
        ok(format!("已删除禁言词: {}", word.to_lowercase()))
    } else {
        fail(format!("删除失败：未找到禁言词 {}", word.to_lowercase()))
    })
}

/// `/add_ad` 第一步：收媒体。没有草稿返回 None
pub fn accept_ad_media(state: &AppState, user: UserId, media: MediaRef) -> Option<String> {
    if !state.drafts.attach_media(user, media) {
        return None;
    }
    Some(ok(format!(
        "媒体已收到，请回复此消息添加文本内容\n\n格式示例：\n{}",
        SUBMISSION_FORMAT
    )))
}

/// `/add_ad` 第二步：收文本。格式错误也会结束草稿
pub async fn accept_ad_text(state: &AppState, user: UserId, text: &str) -> Result<Option<String>> {
    let Some(media) = state.drafts.take_media(user) else {
        return Ok(None);
    };
    let sub = match parse_submission(text) {
        Ok(sub) => sub,
        Err(e) => {
            return Ok(Some(fail(format!(
                "格式错误：{}\n\n正确格式示例：\n{}",
                e, SUBMISSION_FORMAT
            ))));
        }
    };
    let ad = state
        .ads
        .create(media, sub.welcome_text, sub.ad_text, sub.buttons)
        .await?;
    Ok(Some(ok(format!("广告添加成功！\nID: {}", ad.id))))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Moderation {
    BannedWord,
    Gate(GateDecision),
}

pub async fn moderate_group_text(
    state: &AppState,
    api: Arc<dyn ChatApi>,
    title: &str,
    kind: &str,
    msg: &Incoming,
    text: &str,
) -> Result<Moderation> {
    if state.words.check(text).await? {
        let _ = api_log(
            "delete_message",
            api.delete_message(msg.chat, msg.message).await,
        );
        let warning = format!("⚠️ {}，您的消息包含禁用词，已被删除。", msg.sender_name);
        if let Some(id) = api_log("send_message", api.send_text(msg.chat, warning, None).await) {
            spawn_delayed_delete(api.clone(), msg.chat, id, state.warning_ttl);
        }
        info!("banned word from {} in {}", msg.sender.0, msg.chat.0);
        return Ok(Moderation::BannedWord);
    }

    let group = state.groups.register(msg.chat.0, title, kind).await?;
    let decision = state.gate.enforce(api, &group, msg).await?;
    Ok(Moderation::Gate(decision))
}

#[derive(Debug, Clone)]
pub struct Newcomer {
    pub id: UserId,
    pub name: String,
    pub username: Option<String>,
    pub is_bot: bool,
}

/// 随机挑一条广告欢迎新成员（跳过机器人），返回成功发送数
pub async fn welcome_newcomers(
    state: &AppState,
    api: &dyn ChatApi,
    chat: ChatId,
    newcomers: &[Newcomer],
) -> Result<usize> {
    let Some(ad) = state.ads.get_random().await? else {
        return Ok(0);
    };
    let grid = pack_buttons(&ad.buttons);
    let mut sent = 0;
    for user in newcomers {
        if user.id == state.bot_id || user.is_bot {
            continue;
        }
        let caption = welcome_caption(&ad, &user.name, user.username.as_deref());
        if api_log(
            "send_media",
            api.send_media(chat, &ad.media, caption, grid.clone()).await,
        )
        .is_some()
        {
            info!("welcomed {} ({}) in {}", user.name, user.id.0, chat.0);
            sent += 1;
        }
    }
    Ok(sent)
}

/// 记录错误并私信首位管理员
pub async fn report_error(state: &AppState, api: &dyn ChatApi, err: &anyhow::Error) {
    error!("handler error: {:?}", err);
    let first = match state.admins.first_admin().await {
        Ok(Some(a)) => a,
        Ok(None) => {
            warn!("no admin to notify about the error");
            return;
        }
        Err(e) => {
            warn!("admin lookup failed while reporting an error: {:?}", e);
            return;
        }
    };
    let text = format!(
        "🚨 机器人遇到错误:\n{:#}\n\n发生时间: {}",
        err,
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    );
    let _ = api_log(
        "send_message",
        api.send_text(ChatId(first.id as i64), text, None).await,
    );
}

pub async fn notify_startup(state: &AppState, api: &dyn ChatApi) {
    match state.admins.first_admin().await {
        Ok(Some(a)) => {
            let text = format!(
                "🤖 机器人已启动并准备就绪！\n启动时间: {}",
                Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
            );
            if api_log(
                "send_message",
                api.send_text(ChatId(a.id as i64), text, None).await,
            )
            .is_some()
            {
                info!("startup notice sent to admin {}", a.id);
            }
        }
        Ok(None) => warn!("no admin found for the startup notice"),
        Err(e) => warn!("admin lookup failed for the startup notice: {:?}", e),
    }
}

#[derive(Default)]
struct ReplyChunks {
    out: Vec<String>,
    cur: String,
    cur_chars: usize,
}

impl ReplyChunks {
    fn push(&mut self, sep: &str, piece: &str) {
        let n = piece.chars().count();
        let sep_chars = sep.chars().count();
        if !self.cur.is_empty() && self.cur_chars + sep_chars + n > MAX_MESSAGE_CHARS {
            self.finish_chunk();
        }
        if !self.cur.is_empty() {
            self.cur.push_str(sep);
            self.cur_chars += sep_chars;
        }
        self.cur.push_str(piece);
        self.cur_chars += n;
    }

    fn finish_chunk(&mut self) {
        if !self.cur.is_empty() {
            self.out.push(std::mem::take(&mut self.cur));
        }
        self.cur_chars = 0;
    }
}

/// 按空行切分；单段过长时按行切，单行过长时按字符切
pub fn chunk_reply(text: &str) -> Vec<String> {
    let mut chunks = ReplyChunks::default();
    for block in text.split("\n\n") {
        if block.chars().count() <= MAX_MESSAGE_CHARS {
            chunks.push("\n\n", block);
            continue;
        }
        for (i, line) in block.split('\n').enumerate() {
            let sep = if i == 0 { "\n\n" } else { "\n" };
            if line.chars().count() <= MAX_MESSAGE_CHARS {
                chunks.push(sep, line);
                continue;
            }
            let chars: Vec<char> = line.chars().collect();
            for (j, part) in chars.chunks(MAX_MESSAGE_CHARS).enumerate() {
                let part: String = part.iter().collect();
                chunks.push(if j == 0 { sep } else { "" }, &part);
            }
        }
    }
    chunks.finish_chunk();
    chunks.out
}

pub fn chat_kind(chat: &Chat) -> &'static str {
    if chat.is_private() {
        "private"
    } else if chat.is_supergroup() {
        "supergroup"
    } else if chat.is_group() {
        "group"
    } else if chat.is_channel() {
        "channel"
    } else {
        "unknown"
    }
}

fn display_name(user: &User) -> String {
    user.first_name.clone()
}

fn media_of(msg: &Message) -> Option<MediaRef> {
    if let Some(largest) = msg.photo().and_then(|sizes| sizes.last()) {
        return Some(MediaRef {
            kind: MediaKind::Photo,
            file_id: largest.file.id.to_string(),
        });
    }
    msg.video().map(|v| MediaRef {
        kind: MediaKind::Video,
        file_id: v.file.id.to_string(),
    })
}

async fn reply(api: &dyn ChatApi, chat: ChatId, text: String) {
    for chunk in chunk_reply(&text) {
        let _ = api_log("send_message", api.send_text(chat, chunk, None).await);
    }
}

pub async fn on_command(
    state: Arc<AppState>,
    api: Arc<dyn ChatApi>,
    msg: Message,
    cmd: Command,
) -> Result<()> {
    let Some(from) = msg.from.as_ref() else {
        return Ok(());
    };
    let who = Invoker {
        chat: msg.chat.id,
        user: from.id,
        username: from.username.clone(),
    };
    info!("command {:?} from {} in {}", cmd, who.user.0, who.chat.0);
    match execute(&state, &who, cmd).await {
        Ok(text) => reply(api.as_ref(), who.chat, text).await,
        Err(e) => report_error(&state, api.as_ref(), &e).await,
    }
    Ok(())
}

pub async fn on_message(state: Arc<AppState>, api: Arc<dyn ChatApi>, msg: Message) -> Result<()> {
    if let Err(e) = route_message(&state, api.clone(), &msg).await {
        report_error(&state, api.as_ref(), &e).await;
    }
    Ok(())
}

async fn route_message(state: &AppState, api: Arc<dyn ChatApi>, msg: &Message) -> Result<()> {
    let chat = msg.chat.id;

    if let Some(members) = msg.new_chat_members() {
        let newcomers: Vec<Newcomer> = members
            .iter()
            .map(|u| Newcomer {
                id: u.id,
                name: display_name(u),
                username: u.username.clone(),
                is_bot: u.is_bot,
            })
            .collect();
        welcome_newcomers(state, api.as_ref(), chat, &newcomers)
            .await
            .context("welcome newcomers")?;
        return Ok(());
    }

    let Some(from) = msg.from.as_ref() else {
        return Ok(());
    };

    if let Some(media) = media_of(msg) {
        if let Some(text) = accept_ad_media(state, from.id, media) {
            reply(api.as_ref(), chat, text).await;
        }
        return Ok(());
    }

    let Some(text) = msg.text() else {
        return Ok(());
    };

    if msg.reply_to_message().is_some() {
        if let Some(answer) = accept_ad_text(state, from.id, text).await? {
            reply(api.as_ref(), chat, answer).await;
            return Ok(());
        }
    }

    if msg.chat.is_private() || msg.chat.is_channel() {
        return Ok(());
    }

    let incoming = Incoming {
        chat,
        message: msg.id,
        sender: from.id,
        sender_name: display_name(from),
    };
    let title = msg.chat.title().unwrap_or_default();
    moderate_group_text(state, api, title, chat_kind(&msg.chat), &incoming, text)
        .await
        .context("moderate group message")?;
    Ok(())
}
