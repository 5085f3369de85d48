use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local, NaiveTime, Utc};
use rand::seq::SliceRandom;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, path::PathBuf, sync::Arc, time::Duration};
use teloxide::{
    dispatching::UpdateHandler,
    dptree,
    prelude::*,
    requests::{HasPayload, Payload, Request},
    types::{ChatId, InputFile, Message, ParseMode},
};
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

const TEMP_FILE_SUFFIX: &str = ".tmp";
const DEFAULT_DATA_FILE: &str = "memes_data.json";
const DEFAULT_AUTOPOST_INTERVAL_SECS: u64 = 7200;
const DEFAULT_STARTUP_DELAY_SECS: u64 = 30;
const DEFAULT_QUIET_START: &str = "22:00";
const DEFAULT_QUIET_END: &str = "08:00";

const DEFAULT_TRIGGER_KEYWORDS: &[&str] = &[
    "ютуб мюзік",
    "ютюб мюзік",
    "youtube music",
    "ютуб музик",
    "ютюб музик",
];

const DEFAULT_TRIGGER_REPLIES: &[&str] = &[
    "Те її слово? А на тобі **ютуб мюзік**. (вибач, я просто виконую свій обов’язок) 😌",
    "Почула «ютуб мюзік» — і в мені прокинувся крінж-радар 📡",
    "Спокійно. Дихай. Це лише «ютуб мюзік». Ми переживали гірше 💅",
    "Я нічого не кажу… але Spotify дивиться на це з осудом 👀",
];

const INTRO_TEXT: &str = "Йо 🌈
Я офіційно призначена відповідальною за мемну економіку цього чату.

Працюю просто: ти кидаєш мені в приват мем (🖼 картинки, 🎞 гіфки або 📹 відео), я його ховаю в сейф — і потім раз на 2 години дістаю звідти щось випадкове, щоб у вас знову з’явився сенс жити 😌

Важливі моменти, прошу уваги 👇
🌙 З 22:00 до 08:00 я в тихому режимі — навіть меми мають спати, а YouTube Music тим паче.
🔁 Повтори я не люблю: поки не закінчаться всі меми, один і той самий вдруге не вилізе.
🚫 Текстом мене не годуйте — я мем-бот, не психолог (хоча якщо щось іде в пизду і ви комплексуєте… ну, ви зрозуміли).

Коротше: кидай меми, неси вайб, неси крінж.
Я тут, щоб ця річка текла стабільно 🌊✨";

#[derive(Debug, Deserialize, Clone)]
struct Config {
    bot: BotConfig,
    #[serde(default)]
    posting: PostingConfig,
    #[serde(default)]
    storage: StorageConfig,
    #[serde(default)]
    trigger: TriggerConfig,
}

#[derive(Debug, Deserialize, Clone)]
struct BotConfig {
    token: String,
    log_level: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone)]
struct PostingConfig {
    // 0 or unset: posting disabled, submissions still accepted
    target_chat_id: Option<i64>,
    autopost_interval_secs: Option<u64>,
    startup_delay_secs: Option<u64>,
    quiet_start: Option<String>,
    quiet_end: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone)]
struct StorageConfig {
    data_file: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone)]
struct TriggerConfig {
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    regex: Vec<String>,
    #[serde(default)]
    replies: Vec<String>,
    image_file_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum MemeKind {
    Photo,
    Video,
    Animation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Meme {
    file_id: String,
    kind: MemeKind,
    added_by: String,
    added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct VaultData {
    #[serde(default)]
    memes: Vec<Meme>,
    // old records stored this as a list with possible duplicates; the set
    // collapses them on load
    #[serde(default)]
    cycle_sent: BTreeSet<String>,
}

struct AppState {
    bot_username: String,
    target_chat: Option<ChatId>,
    quiet: QuietHours,
    trigger: Trigger,
    store: MemeStore,
}

fn load_config(path: &PathBuf) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    let cfg: Config = serde_yaml::from_str(&text).context("parse yaml")?;
    Ok(cfg)
}

fn validate_config(cfg: &Config) -> Result<()> {
    if cfg.bot.token.trim().is_empty() {
        return Err(anyhow!("bot.token is empty"));
    }
    if cfg.posting.autopost_interval_secs == Some(0) {
        return Err(anyhow!("posting.autopost_interval_secs must be > 0"));
    }
    quiet_hours(&cfg.posting)?;
    Trigger::from_config(&cfg.trigger)?;
    Ok(())
}

fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    let parts: Vec<&str> = s.trim().split(':').collect();
    if parts.len() != 2 {
        return None;
    }
    let hh = parts[0].parse::<u32>().ok()?;
    let mm = parts[1].parse::<u32>().ok()?;
    NaiveTime::from_hms_opt(hh, mm, 0)
}

fn quiet_hours(cfg: &PostingConfig) -> Result<QuietHours> {
    let start = cfg.quiet_start.as_deref().unwrap_or(DEFAULT_QUIET_START);
    let end = cfg.quiet_end.as_deref().unwrap_or(DEFAULT_QUIET_END);
    Ok(QuietHours {
        start: parse_hhmm(start)
            .ok_or_else(|| anyhow!("posting.quiet_start '{}' is not HH:MM", start))?,
        end: parse_hhmm(end)
            .ok_or_else(|| anyhow!("posting.quiet_end '{}' is not HH:MM", end))?,
    })
}

#[derive(Debug, Clone, Copy)]
struct QuietHours {
    start: NaiveTime,
    end: NaiveTime,
}

impl QuietHours {
    // quiet window wraps midnight: [start, 24:00) ∪ [00:00, end)
    fn contains(&self, now: NaiveTime) -> bool {
        now >= self.start || now < self.end
    }

    fn label(&self) -> String {
        format!("{}–{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

struct Trigger {
    keywords: Vec<String>,
    patterns: Vec<Regex>,
    replies: Vec<String>,
    image_file_id: Option<String>,
}

impl Trigger {
    fn from_config(cfg: &TriggerConfig) -> Result<Self> {
        let keywords = if cfg.keywords.is_empty() {
            DEFAULT_TRIGGER_KEYWORDS.iter().map(|s| s.to_string()).collect()
        } else {
            cfg.keywords.iter().map(|s| s.to_lowercase()).collect()
        };
        let mut patterns = Vec::new();
        for pat in &cfg.regex {
            patterns
                .push(Regex::new(pat).with_context(|| format!("bad trigger regex '{}'", pat))?);
        }
        let replies = if cfg.replies.is_empty() {
            DEFAULT_TRIGGER_REPLIES.iter().map(|s| s.to_string()).collect()
        } else {
            cfg.replies.clone()
        };
        Ok(Self {
            keywords,
            patterns,
            replies,
            image_file_id: cfg.image_file_id.clone().filter(|s| !s.trim().is_empty()),
        })
    }

    fn matches(&self, text: &str) -> bool {
        let lowered = text.to_lowercase();
        if self.keywords.iter().any(|k| lowered.contains(k.as_str())) {
            return true;
        }
        self.patterns.iter().any(|r| r.is_match(text))
    }

    fn random_reply(&self) -> Option<&str> {
        self.replies
            .choose(&mut rand::thread_rng())
            .map(|s| s.as_str())
    }
}

fn write_atomic(path: &PathBuf, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = PathBuf::from(format!("{}{}", path.display(), TEMP_FILE_SUFFIX));
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

// Every operation re-reads the data file and writes it back under one lock,
// so a racing /meme and autopost tick can't lose each other's writes. A pick
// and its mark_sent are still separate operations with the dispatch in
// between: two posters racing can pick the same meme.
struct MemeStore {
    path: PathBuf,
    guard: Mutex<()>,
}

impl MemeStore {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            guard: Mutex::new(()),
        }
    }

    fn read(&self) -> VaultData {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return VaultData::default(),
            Err(e) => {
                warn!(
                    "vault read failed ({}), starting empty: {:?}",
                    self.path.display(),
                    e
                );
                return VaultData::default();
            }
        };
        match serde_json::from_str(&text) {
            Ok(data) => data,
            Err(e) => {
                warn!(
                    "vault parse failed ({}), starting empty: {:?}",
                    self.path.display(),
                    e
                );
                VaultData::default()
            }
        }
    }

    fn write(&self, data: &VaultData) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(data)?;
        write_atomic(&self.path, &bytes)
            .with_context(|| format!("write vault: {}", self.path.display()))
    }

    async fn add(&self, meme: Meme) -> Result<()> {
        let _g = self.guard.lock().await;
        let mut data = self.read();
        data.memes.push(meme);
        self.write(&data)
    }

    async fn pick_next(&self) -> Result<Option<Meme>> {
        let _g = self.guard.lock().await;
        let mut data = self.read();
        if data.memes.is_empty() {
            return Ok(None);
        }

        let mut available: Vec<&Meme> = data
            .memes
            .iter()
            .filter(|m| !data.cycle_sent.contains(&m.file_id))
            .collect();

        // everything was already sent this cycle: start a new one
        if available.is_empty() {
            data.cycle_sent.clear();
            self.write(&data)?;
            available = data.memes.iter().collect();
        }

        Ok(available
            .choose(&mut rand::thread_rng())
            .map(|m| (*m).clone()))
    }

    async fn mark_sent(&self, file_id: &str) -> Result<()> {
        let _g = self.guard.lock().await;
        let mut data = self.read();
        data.cycle_sent.insert(file_id.to_string());
        self.write(&data)
    }

    async fn stats(&self) -> (usize, usize) {
        let _g = self.guard.lock().await;
        let data = self.read();
        (data.memes.len(), data.cycle_sent.len())
    }
}

fn ctx_perm_hint(ctx: &str) -> &'static str {
    match ctx {
        "send_message" => {
            "bot must be able to post in that chat; in private the user may not have /start-ed the bot or has blocked it"
        }
        "send_photo" | "send_video" | "send_animation" => {
            "bot needs permission to send media in the target chat, and the file id must belong to this bot"
        }
        _ => "check that the bot is a member of the chat and was granted the required permissions",
    }
}

async fn api_log<R>(ctx: &str, req: R) -> Option<<R::Payload as Payload>::Output>
where
    R: Request + HasPayload,
{
    match req.send().await {
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

async fn send_meme(bot: &Bot, chat_id: ChatId, meme: &Meme) -> Result<()> {
    let media = InputFile::file_id(meme.file_id.clone());
    match meme.kind {
        MemeKind::Photo => {
            bot.send_photo(chat_id, media)
                .send()
                .await
                .context("send_photo")?;
        }
        MemeKind::Video => {
            bot.send_video(chat_id, media)
                .send()
                .await
                .context("send_video")?;
        }
        MemeKind::Animation => {
            bot.send_animation(chat_id, media)
                .send()
                .await
                .context("send_animation")?;
        }
    }
    Ok(())
}

fn parse_command(text: &str, bot_username: &str) -> Option<String> {
    let first = text.trim().split_whitespace().next()?;
    let stripped = first.strip_prefix('/')?;
    if stripped.is_empty() {
        return None;
    }
    match stripped.split_once('@') {
        Some((cmd, addressee)) => {
            if addressee.eq_ignore_ascii_case(bot_username) {
                Some(cmd.to_ascii_lowercase())
            } else {
                None
            }
        }
        None => Some(stripped.to_ascii_lowercase()),
    }
}

async fn handle_command(bot: &Bot, state: &AppState, msg: &Message, cmd: &str) -> Result<bool> {
    match cmd {
        "let" => {
            let _ = api_log("send_message", bot.send_message(msg.chat.id, INTRO_TEXT)).await;
        }
        "meme" => handle_meme_command(bot, state, msg).await?,
        "stats" => {
            let (total, sent) = state.store.stats().await;
            let text = format!(
                "Сейф: {} мемів.\nУ цьому циклі вже відправлено: {}.",
                total, sent
            );
            let _ = api_log("send_message", bot.send_message(msg.chat.id, text)).await;
        }
        _ => return Ok(false),
    }
    Ok(true)
}

async fn handle_meme_command(bot: &Bot, state: &AppState, msg: &Message) -> Result<()> {
    let reply_to = msg.chat.id;

    if state.quiet.contains(Local::now().time()) {
        let text = format!(
            "Тиха година 😴 {}. Я не постю, бо мене потім теж зненавидять.",
            state.quiet.label()
        );
        let _ = api_log("send_message", bot.send_message(reply_to, text)).await;
        return Ok(());
    }

    let Some(target) = state.target_chat else {
        let _ = api_log(
            "send_message",
            bot.send_message(
                reply_to,
                "posting.target_chat_id не заданий у конфігу (я не знаю, куди кидати меми).",
            ),
        )
        .await;
        return Ok(());
    };

    let Some(meme) = state.store.pick_next().await? else {
        let _ = api_log(
            "send_message",
            bot.send_message(
                reply_to,
                "У мене ще порожній сейф. Закинь мені в приват перші меми 🙂",
            ),
        )
        .await;
        return Ok(());
    };

    match send_meme(bot, target, &meme).await {
        Ok(()) => {
            state.store.mark_sent(&meme.file_id).await?;
            let _ = api_log(
                "send_message",
                bot.send_message(reply_to, "Окей, кинула мем у чат ✅"),
            )
            .await;
        }
        Err(e) => {
            // not marked sent: the meme stays in rotation
            warn!("manual post dispatch failed: {:?}", e);
            let _ = api_log(
                "send_message",
                bot.send_message(
                    reply_to,
                    "Не вийшло закинути мем у чат 😕 Він лишився в сейфі, спробуй ще раз.",
                ),
            )
            .await;
        }
    }
    Ok(())
}

async fn handle_private_submission(bot: &Bot, state: &AppState, msg: &Message) -> Result<()> {
    let added_by = msg
        .from
        .as_ref()
        .map(|u| match &u.username {
            Some(name) => format!("@{}", name),
            None => u.first_name.clone(),
        })
        .unwrap_or_else(|| "unknown".to_string());

    let accepted = if let Some(sizes) = msg.photo() {
        // Telegram sends several resolutions, the last one is the largest
        sizes
            .last()
            .map(|p| (p.file.id.clone(), MemeKind::Photo, "Забрала в сейф 🧳✅"))
    } else if let Some(animation) = msg.animation() {
        Some((
            animation.file.id.clone(),
            MemeKind::Animation,
            "Гіфку сховала. Краса ✨✅",
        ))
    } else if let Some(video) = msg.video() {
        Some((
            video.file.id.clone(),
            MemeKind::Video,
            "Відео в сейфі. Я горда собою ✅",
        ))
    } else {
        None
    };

    let Some((file_id, kind, ack)) = accepted else {
        let _ = api_log(
            "send_message",
            bot.send_message(
                msg.chat.id,
                "Я харчуюся тільки мемами: 🖼🎞📹. Кинь контент — і я засяю.",
            ),
        )
        .await;
        return Ok(());
    };

    let meme = Meme {
        file_id,
        kind,
        added_by,
        added_at: Utc::now(),
    };

    match state.store.add(meme).await {
        Ok(()) => {
            let _ = api_log("send_message", bot.send_message(msg.chat.id, ack)).await;
        }
        Err(e) => {
            warn!("failed to store submission: {:?}", e);
            let _ = api_log(
                "send_message",
                bot.send_message(msg.chat.id, "Сейф заклинило 😞 Спробуй закинути ще раз."),
            )
            .await;
        }
    }
    Ok(())
}

async fn handle_group_text(bot: &Bot, state: &AppState, msg: &Message) -> Result<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    if !state.trigger.matches(text) {
        return Ok(());
    }

    if let Some(image) = &state.trigger.image_file_id {
        match bot
            .send_photo(msg.chat.id, InputFile::file_id(image.clone()))
            .send()
            .await
        {
            Ok(_) => return Ok(()),
            Err(e) => warn!("trigger image failed, falling back to text: {:?}", e),
        }
    }

    if let Some(phrase) = state.trigger.random_reply() {
        let _ = api_log(
            "send_message",
            bot.send_message(msg.chat.id, phrase)
                .parse_mode(ParseMode::Markdown),
        )
        .await;
    }
    Ok(())
}

async fn autopost_once(bot: &Bot, state: &AppState) {
    if state.quiet.contains(Local::now().time()) {
        return;
    }
    let Some(target) = state.target_chat else {
        return;
    };

    let meme = match state.store.pick_next().await {
        Ok(Some(m)) => m,
        Ok(None) => return,
        Err(e) => {
            warn!("autopost pick failed: {:?}", e);
            return;
        }
    };

    match send_meme(bot, target, &meme).await {
        Ok(()) => {
            if let Err(e) = state.store.mark_sent(&meme.file_id).await {
                warn!("autopost mark_sent failed: {:?}", e);
            }
        }
        Err(e) => warn!("autopost dispatch failed, meme stays in rotation: {:?}", e),
    }
}

async fn autopost_task(
    bot: Bot,
    state: Arc<AppState>,
    interval: Duration,
    startup_delay: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    tokio::select! {
        _ = shutdown_rx.recv() => { return; }
        _ = tokio::time::sleep(startup_delay) => {}
    }

    // interval fires immediately, so the first post lands right after the delay
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => { break; }
            _ = ticker.tick() => {
                autopost_once(&bot, &state).await;
            }
        }
    }
}

fn schema() -> UpdateHandler<anyhow::Error> {
    dptree::entry().branch(Update::filter_message().endpoint(
        |bot: Bot, state: Arc<AppState>, msg: Message| async move {
            if let Some(text) = msg.text() {
                if let Some(cmd) = parse_command(text, &state.bot_username) {
                    match handle_command(&bot, &state, &msg, &cmd).await {
                        Ok(true) => return Ok(()),
                        Ok(false) => {}
                        Err(e) => {
                            warn!("command /{} failed: {:?}", cmd, e);
                            return Ok(());
                        }
                    }
                }
            }

            let res = if msg.chat.is_private() {
                handle_private_submission(&bot, &state, &msg).await
            } else {
                handle_group_text(&bot, &state, &msg).await
            };
            if let Err(e) = res {
                warn!("update handling failed: {:?}", e);
            }
            Ok(())
        },
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let config_path = parse_config_arg(&args).unwrap_or_else(|| PathBuf::from("config.yaml"));

    let cfg = load_config(&config_path)?;
    validate_config(&cfg)?;

    let filter = cfg.bot.log_level.clone().unwrap_or_else(|| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let bot = Bot::new(cfg.bot.token.trim().to_string());
    let me = bot.get_me().send().await?;
    let bot_username = me.user.username.clone().unwrap_or_else(|| "bot".into());

    let data_file = cfg
        .storage
        .data_file
        .clone()
        .unwrap_or_else(|| DEFAULT_DATA_FILE.to_string());

    let state = Arc::new(AppState {
        bot_username,
        target_chat: cfg.posting.target_chat_id.filter(|id| *id != 0).map(ChatId),
        quiet: quiet_hours(&cfg.posting)?,
        trigger: Trigger::from_config(&cfg.trigger)?,
        store: MemeStore::new(PathBuf::from(data_file)),
    });

    let (total, sent) = state.store.stats().await;
    info!("vault loaded: {} memes, {} already sent this cycle", total, sent);
    if state.target_chat.is_none() {
        warn!("posting.target_chat_id not set: submissions work, but nothing will be posted");
    }

    let (shutdown_tx, _shutdown_rx0) = broadcast::channel::<()>(8);

    let shutdown_ctrl = shutdown_tx.clone();
    let ctrl_handle = tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_ctrl.send(());
    });

    let interval = Duration::from_secs(
        cfg.posting
            .autopost_interval_secs
            .unwrap_or(DEFAULT_AUTOPOST_INTERVAL_SECS),
    );
    let startup_delay = Duration::from_secs(
        cfg.posting
            .startup_delay_secs
            .unwrap_or(DEFAULT_STARTUP_DELAY_SECS),
    );
    let h_autopost = tokio::spawn(autopost_task(
        bot.clone(),
        state.clone(),
        interval,
        startup_delay,
        shutdown_tx.subscribe(),
    ));

    info!("Start polling as @{}", state.bot_username);

    Dispatcher::builder(bot, schema())
        .dependencies(dptree::deps![state])
        .default_handler(|upd| async move {
            let _ = upd;
        })
        .error_handler(LoggingErrorHandler::with_custom_text("Dispatcher error"))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    let _ = shutdown_tx.send(());
    let _ = ctrl_handle.await;
    let _ = h_autopost.await;

    Ok(())
}

fn parse_config_arg(args: &[String]) -> Option<PathBuf> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--config" && i + 1 < args.len() {
            return Some(PathBuf::from(&args[i + 1]));
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meme(id: &str) -> Meme {
        Meme {
            file_id: id.to_string(),
            kind: MemeKind::Photo,
            added_by: "@tester".to_string(),
            added_at: Utc::now(),
        }
    }

    fn store_in(dir: &tempfile::TempDir) -> MemeStore {
        MemeStore::new(dir.path().join("memes_data.json"))
    }

    fn hms(h: u32, m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, s).unwrap()
    }

    #[test]
    fn quiet_hours_boundaries() {
        let q = QuietHours {
            start: parse_hhmm("22:00").unwrap(),
            end: parse_hhmm("08:00").unwrap(),
        };
        assert!(q.contains(hms(22, 0, 0)));
        assert!(q.contains(hms(7, 59, 59)));
        assert!(!q.contains(hms(8, 0, 0)));
        assert!(!q.contains(hms(21, 59, 59)));
        assert!(q.contains(hms(0, 0, 0)));
        assert!(!q.contains(hms(12, 0, 0)));
    }

    #[test]
    fn hhmm_parsing() {
        assert_eq!(parse_hhmm("22:00"), NaiveTime::from_hms_opt(22, 0, 0));
        assert_eq!(parse_hhmm(" 7:05 "), NaiveTime::from_hms_opt(7, 5, 0));
        assert_eq!(parse_hhmm("24:00"), None);
        assert_eq!(parse_hhmm("22:60"), None);
        assert_eq!(parse_hhmm("22"), None);
        assert_eq!(parse_hhmm("a:b"), None);
        assert_eq!(parse_hhmm("10:20:30"), None);
    }

    #[test]
    fn command_parsing() {
        assert_eq!(parse_command("/meme", "memebot"), Some("meme".into()));
        assert_eq!(parse_command("/MEME", "memebot"), Some("meme".into()));
        assert_eq!(
            parse_command("/stats extra words", "memebot"),
            Some("stats".into())
        );
        assert_eq!(
            parse_command("/stats@MemeBot", "memebot"),
            Some("stats".into())
        );
        assert_eq!(parse_command("/stats@otherbot", "memebot"), None);
        assert_eq!(parse_command("hello", "memebot"), None);
        assert_eq!(parse_command("/", "memebot"), None);
        assert_eq!(parse_command("", "memebot"), None);
    }

    #[test]
    fn trigger_matches_default_keywords() {
        let trigger = Trigger::from_config(&TriggerConfig::default()).unwrap();
        assert!(trigger.matches("хтось знову слухає ЮТУБ МЮЗІК, жах"));
        assert!(trigger.matches("Youtube Music >>> all"));
        assert!(!trigger.matches("spotify forever"));
    }

    #[test]
    fn trigger_matches_configured_regex() {
        let cfg = TriggerConfig {
            keywords: vec!["ytm".into()],
            regex: vec![r"(?i)\byt\s*music\b".into()],
            ..TriggerConfig::default()
        };
        let trigger = Trigger::from_config(&cfg).unwrap();
        assert!(trigger.matches("YTM знову"));
        assert!(trigger.matches("yt music again"));
        assert!(!trigger.matches("youtube"));
    }

    #[test]
    fn config_validation() {
        let cfg: Config = serde_yaml::from_str("bot:\n  token: \"123:abc\"\n").unwrap();
        assert!(validate_config(&cfg).is_ok());

        let cfg: Config = serde_yaml::from_str("bot:\n  token: \"  \"\n").unwrap();
        assert!(validate_config(&cfg).is_err());

        let cfg: Config = serde_yaml::from_str(
            "bot:\n  token: \"123:abc\"\nposting:\n  autopost_interval_secs: 0\n",
        )
        .unwrap();
        assert!(validate_config(&cfg).is_err());

        let cfg: Config = serde_yaml::from_str(
            "bot:\n  token: \"123:abc\"\nposting:\n  quiet_start: \"25:00\"\n",
        )
        .unwrap();
        assert!(validate_config(&cfg).is_err());

        let cfg: Config = serde_yaml::from_str(
            "bot:\n  token: \"123:abc\"\ntrigger:\n  regex: [\"(unclosed\"]\n",
        )
        .unwrap();
        assert!(validate_config(&cfg).is_err());
    }

    #[tokio::test]
    async fn empty_store_picks_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.pick_next().await.unwrap().is_none());
        assert_eq!(store.stats().await, (0, 0));
    }

    #[tokio::test]
    async fn corrupt_or_partial_record_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memes_data.json");

        std::fs::write(&path, "{not json at all").unwrap();
        let store = MemeStore::new(path.clone());
        assert_eq!(store.stats().await, (0, 0));
        assert!(store.pick_next().await.unwrap().is_none());

        std::fs::write(&path, r#"{"memes": []}"#).unwrap();
        let store = MemeStore::new(path);
        assert_eq!(store.stats().await, (0, 0));
    }

    #[tokio::test]
    async fn duplicate_cycle_entries_collapse_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memes_data.json");
        std::fs::write(
            &path,
            r#"{
                "memes": [
                    {"file_id": "x", "kind": "photo", "added_by": "@a", "added_at": "2025-01-01T00:00:00Z"},
                    {"file_id": "y", "kind": "video", "added_by": "@b", "added_at": "2025-01-02T00:00:00Z"}
                ],
                "cycle_sent": ["x", "x"]
            }"#,
        )
        .unwrap();
        let store = MemeStore::new(path);
        assert_eq!(store.stats().await, (2, 1));
    }

    #[tokio::test]
    async fn cycle_never_repeats_until_reset() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        for id in ["a", "b", "c"] {
            store.add(meme(id)).await.unwrap();
        }

        let mut seen = BTreeSet::new();
        for _ in 0..3 {
            let picked = store.pick_next().await.unwrap().unwrap();
            assert!(seen.insert(picked.file_id.clone()), "repeat within cycle");
            store.mark_sent(&picked.file_id).await.unwrap();
        }
        assert_eq!(seen.len(), 3);
        assert_eq!(store.stats().await, (3, 3));

        // 4th pick: the cycle resets and an earlier item may come back
        let picked = store.pick_next().await.unwrap().unwrap();
        assert!(seen.contains(&picked.file_id));
        assert_eq!(store.stats().await, (3, 0));
    }

    #[tokio::test]
    async fn single_item_repeats_every_call() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.add(meme("only")).await.unwrap();

        let first = store.pick_next().await.unwrap().unwrap();
        assert_eq!(first.file_id, "only");
        store.mark_sent(&first.file_id).await.unwrap();

        let second = store.pick_next().await.unwrap().unwrap();
        assert_eq!(second.file_id, "only");
    }

    #[tokio::test]
    async fn unmarked_pick_stays_available() {
        // dispatch failed: the caller never marks, so the item stays eligible
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.add(meme("a")).await.unwrap();

        let picked = store.pick_next().await.unwrap().unwrap();
        assert_eq!(picked.file_id, "a");
        assert_eq!(store.stats().await, (1, 0));

        let again = store.pick_next().await.unwrap().unwrap();
        assert_eq!(again.file_id, "a");
    }

    #[tokio::test]
    async fn resubmission_creates_second_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.add(meme("same")).await.unwrap();
        store.add(meme("same")).await.unwrap();
        assert_eq!(store.stats().await, (2, 0));
    }

    #[tokio::test]
    async fn state_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memes_data.json");

        let store = MemeStore::new(path.clone());
        store.add(meme("a")).await.unwrap();
        store.mark_sent("a").await.unwrap();

        let reopened = MemeStore::new(path);
        assert_eq!(reopened.stats().await, (1, 1));
        // the only item was already sent, so the next pick resets the cycle
        let picked = reopened.pick_next().await.unwrap().unwrap();
        assert_eq!(picked.file_id, "a");
        assert_eq!(reopened.stats().await, (1, 0));
    }

    #[tokio::test]
    async fn selection_eventually_covers_all_items() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        for id in ["a", "b", "c"] {
            store.add(meme(id)).await.unwrap();
        }

        let mut counts: std::collections::HashMap<String, u32> = std::collections::HashMap::new();
        for _ in 0..200 {
            let picked = store.pick_next().await.unwrap().unwrap();
            *counts.entry(picked.file_id).or_default() += 1;
        }
        assert_eq!(counts.len(), 3, "uniform choice should hit every item");
    }
}
