use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use teloxide::payloads::{
    DeleteWebhookSetters, EditMessageTextSetters, GetUpdatesSetters, SendMessageSetters,
};
use teloxide::prelude::*;
use teloxide::types::{AllowedUpdate, BotCommand, CallbackQuery, MessageId, ParseMode, UpdateKind};
use teloxide::{ApiError, RequestError};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{AnimeApi, Category};
use crate::config::Config;
use crate::render::{self, Callback, Reply};

const LONG_POLL_SECS: u32 = 30;
const RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Search(String),
    Recent(u32),
    Test,
    Unknown,
}

/// Anything that is not one of the known slash commands maps to
/// [`Command::Unknown`]. A `@botname` suffix on the command is ignored.
pub fn parse_command(text: &str) -> Command {
    let text = text.trim();
    let Some(body) = text.strip_prefix('/') else {
        return Command::Unknown;
    };
    let (head, rest) = body
        .split_once(char::is_whitespace)
        .unwrap_or((body, ""));
    let name = head.split('@').next().unwrap_or(head).to_ascii_lowercase();
    let rest = rest.trim();

    match name.as_str() {
        "start" => Command::Start,
        "help" => Command::Help,
        "search" => Command::Search(rest.to_string()),
        "recent" => Command::Recent(rest.parse::<u32>().unwrap_or(1).max(1)),
        "test" => Command::Test,
        _ => Command::Unknown,
    }
}

pub struct BotRuntime {
    bot: Bot,
    api: Arc<AnimeApi>,
    shutdown: CancellationToken,
    poll_interval: Duration,
    closed: AtomicBool,
}

/// Connect to Telegram and serve updates until `shutdown` is cancelled, then
/// release everything the core holds.
pub async fn run(
    config: &Config,
    api: Arc<AnimeApi>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    // Client timeout must outlast the long-poll timeout.
    let client = teloxide::net::default_reqwest_settings()
        .timeout(Duration::from_secs(u64::from(LONG_POLL_SECS) + 15))
        .build()?;
    let bot = Bot::with_client(&config.bot_token, client);

    let runtime = Arc::new(BotRuntime::new(bot, api, shutdown, config.shutdown_poll));
    let result = runtime.serve().await;
    runtime.shutdown().await;
    result
}

impl BotRuntime {
    pub fn new(
        bot: Bot,
        api: Arc<AnimeApi>,
        shutdown: CancellationToken,
        poll_interval: Duration,
    ) -> Self {
        Self {
            bot,
            api,
            shutdown,
            poll_interval,
            closed: AtomicBool::new(false),
        }
    }

    async fn serve(self: &Arc<Self>) -> anyhow::Result<()> {
        let me = self.bot.get_me().await?;
        self.bot.delete_webhook().drop_pending_updates(true).send().await?;

        let commands = vec![
            BotCommand::new("start", "Welcome message"),
            BotCommand::new("search", "Search anime by name"),
            BotCommand::new("recent", "Recently released episodes"),
            BotCommand::new("test", "Check upstream API status"),
            BotCommand::new("help", "Show available commands"),
        ];
        if let Err(e) = self.bot.set_my_commands(commands).await {
            warn!("failed to register bot commands: {e}");
        }
        info!(username = ?me.username, "telegram bot connected");

        let poller = tokio::spawn(Arc::clone(self).poll_updates());
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            ticker.tick().await;
            if self.shutdown.is_cancelled() {
                info!("shutdown requested");
                break;
            }
            if poller.is_finished() {
                warn!("telegram polling task ended unexpectedly");
                break;
            }
        }

        self.shutdown.cancel();
        if let Err(e) = poller.await {
            error!(error = %e, "telegram polling task failed");
        }
        Ok(())
    }

    /// Stop polling and release the upstream session. Only the first call
    /// does anything; later calls return false.
    pub async fn shutdown(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("bot runtime already shut down");
            return false;
        }
        info!("shutting down bot runtime");
        self.shutdown.cancel();
        self.api.shutdown().await;
        info!("bot runtime stopped");
        true
    }

    async fn poll_updates(self: Arc<Self>) {
        info!("starting telegram polling loop");
        let mut offset: i32 = 0;
        let mut handlers = JoinSet::new();

        loop {
            while let Some(finished) = handlers.try_join_next() {
                if let Err(e) = finished
                    && e.is_panic()
                {
                    error!(error = %e, "update handler panicked");
                }
            }

            let result = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                result = self
                    .bot
                    .get_updates()
                    .offset(offset)
                    .timeout(LONG_POLL_SECS)
                    .allowed_updates(vec![AllowedUpdate::Message, AllowedUpdate::CallbackQuery])
                    .send() => result,
            };

            match result {
                Ok(updates) => {
                    debug!(count = updates.len(), "got telegram updates");
                    for update in updates {
                        offset = update.id.as_offset();
                        let runtime = Arc::clone(&self);
                        handlers.spawn(async move { runtime.dispatch(update.kind).await });
                    }
                }
                Err(e) => {
                    warn!(error = %e, "telegram getUpdates failed");
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RETRY_DELAY) => {}
                    }
                }
            }
        }

        let in_flight = handlers.len();
        handlers.shutdown().await;
        info!(aborted = in_flight, "telegram polling stopped");
    }

    async fn dispatch(&self, kind: UpdateKind) {
        let result = match kind {
            UpdateKind::Message(msg) => {
                let chat = msg.chat.id;
                let result = self.handle_message(msg).await;
                if result.is_err()
                    && let Err(e) = self.send(chat, render::failure()).await
                {
                    warn!(error = %e, "failed to report handler error");
                }
                result
            }
            UpdateKind::CallbackQuery(query) => self.handle_callback(query).await,
            other => {
                debug!("ignoring update: {other:?}");
                Ok(())
            }
        };
        if let Err(e) = result {
            error!(error = %e, "error handling telegram update");
        }
    }

    async fn handle_message(&self, msg: Message) -> anyhow::Result<()> {
        let Some(text) = msg.text() else {
            return Ok(());
        };
        let chat = msg.chat.id;
        let command = parse_command(text);
        debug!(chat_id = chat.0, ?command, "received command");

        match command {
            Command::Start | Command::Help => {
                let first_name = msg.from.as_ref().map(|user| user.first_name.as_str());
                self.send(chat, render::welcome(first_name)).await
            }
            Command::Search(query) if query.is_empty() => {
                self.send(chat, render::search_usage()).await
            }
            Command::Search(query) => {
                info!(chat_id = chat.0, query = %query, "search requested");
                let pending = self
                    .send_pending(chat, &format!("Searching '{query}'..."))
                    .await?;
                let records = self.api.search(&query).await;
                let source = self.source_name().await;
                let reply = render::search_results(&query, source.as_deref(), &records);
                self.edit(chat, pending, reply).await
            }
            Command::Recent(page) => {
                let pending = self.send_pending(chat, "Getting recent episodes...").await?;
                let records = self.api.recent(page).await;
                let source = self.source_name().await;
                let reply = render::recent_results(page, source.as_deref(), &records);
                self.edit(chat, pending, reply).await
            }
            Command::Test => {
                let pending = self.send_pending(chat, "Testing streaming APIs...").await?;
                let backend = self.api.resolve().await.filter(|backend| backend.is_live());
                let reply = render::backend_status(
                    backend
                        .as_deref()
                        .map(|backend| (backend.name(), backend.base_url())),
                );
                self.edit(chat, pending, reply).await
            }
            Command::Unknown => self.send(chat, render::command_list()).await,
        }
    }

    async fn handle_callback(&self, query: CallbackQuery) -> anyhow::Result<()> {
        self.bot.answer_callback_query(&query.id).await?;

        let Some(callback) = query.data.as_deref().and_then(Callback::parse) else {
            debug!(data = ?query.data, "ignoring unknown callback");
            return Ok(());
        };
        let Some(message) = query.message.as_ref() else {
            return Ok(());
        };
        let (chat, message_id) = (message.chat().id, message.id());

        let reply = match callback {
            Callback::Watch(anime_id) => {
                self.edit(chat, message_id, pending_reply("Loading episodes..."))
                    .await?;
                let episodes = self.api.list_episodes(&anime_id).await;
                let source = self.source_name().await;
                render::episode_list(&anime_id, source.as_deref(), &episodes)
            }
            Callback::Episode(episode_id) => {
                self.streams(chat, message_id, &episode_id, Category::Sub)
                    .await?
            }
            Callback::Dub(episode_id) => {
                self.streams(chat, message_id, &episode_id, Category::Dub)
                    .await?
            }
        };
        self.edit(chat, message_id, reply).await
    }

    async fn streams(
        &self,
        chat: ChatId,
        message_id: MessageId,
        episode_id: &str,
        category: Category,
    ) -> anyhow::Result<Reply> {
        self.edit(chat, message_id, pending_reply("Finding streams..."))
            .await?;
        let sources = self
            .api
            .stream_sources(episode_id, None, Some(category))
            .await;
        let source = self.source_name().await;
        Ok(render::stream_list(
            episode_id,
            category,
            source.as_deref(),
            &sources,
        ))
    }

    async fn source_name(&self) -> Option<String> {
        self.api
            .active_backend()
            .await
            .map(|backend| backend.name().to_string())
    }

    async fn send(&self, chat: ChatId, reply: Reply) -> anyhow::Result<()> {
        let mut request = self
            .bot
            .send_message(chat, reply.text)
            .parse_mode(ParseMode::Html);
        if let Some(keyboard) = reply.keyboard {
            request = request.reply_markup(keyboard);
        }
        request.await?;
        Ok(())
    }

    async fn send_pending(&self, chat: ChatId, text: &str) -> anyhow::Result<MessageId> {
        let sent = self
            .bot
            .send_message(chat, render::pending(text))
            .parse_mode(ParseMode::Html)
            .await?;
        Ok(sent.id)
    }

    async fn edit(&self, chat: ChatId, message_id: MessageId, reply: Reply) -> anyhow::Result<()> {
        let mut request = self
            .bot
            .edit_message_text(chat, message_id, reply.text)
            .parse_mode(ParseMode::Html);
        if let Some(keyboard) = reply.keyboard {
            request = request.reply_markup(keyboard);
        }
        if let Err(e) = request.await {
            if is_unchanged(&e) {
                return Ok(());
            }
            return Err(e.into());
        }
        Ok(())
    }
}

fn pending_reply(text: &str) -> Reply {
    Reply {
        text: render::pending(text),
        keyboard: None,
    }
}

fn is_unchanged(e: &RequestError) -> bool {
    matches!(e, RequestError::Api(ApiError::MessageNotModified))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiSettings;
    use crate::registry::Registry;

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("/start"), Command::Start);
        assert_eq!(parse_command("/help@anime_bot"), Command::Help);
        assert_eq!(
            parse_command("/search  One Piece "),
            Command::Search("One Piece".to_string())
        );
        assert_eq!(parse_command("/search"), Command::Search(String::new()));
        assert_eq!(
            parse_command("/SEARCH@anime_bot naruto"),
            Command::Search("naruto".to_string())
        );
        assert_eq!(parse_command("/recent"), Command::Recent(1));
        assert_eq!(parse_command("/recent 3"), Command::Recent(3));
        assert_eq!(parse_command("/recent 0"), Command::Recent(1));
        assert_eq!(parse_command("/recent soon"), Command::Recent(1));
        assert_eq!(parse_command("/test"), Command::Test);
        assert_eq!(parse_command("hello"), Command::Unknown);
        assert_eq!(parse_command("/unknown"), Command::Unknown);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let api = Arc::new(AnimeApi::new(Registry::builtin(), ApiSettings::default()));
        let token = CancellationToken::new();
        let runtime = BotRuntime::new(
            Bot::new("test-token"),
            Arc::clone(&api),
            token.clone(),
            Duration::from_millis(10),
        );

        assert!(runtime.shutdown().await);
        assert!(token.is_cancelled());
        assert!(!runtime.shutdown().await);
        assert!(!api.shutdown().await);
        assert!(api.search("naruto").await.is_empty());
    }

    #[tokio::test]
    async fn test_polling_stops_on_cancel() {
        let api = Arc::new(AnimeApi::new(Registry::builtin(), ApiSettings::default()));
        let token = CancellationToken::new();
        token.cancel();
        let runtime = Arc::new(BotRuntime::new(
            Bot::new("test-token"),
            api,
            token,
            Duration::from_millis(10),
        ));

        tokio::time::timeout(Duration::from_secs(5), runtime.poll_updates())
            .await
            .expect("polling loop exits once cancelled");
    }
}
