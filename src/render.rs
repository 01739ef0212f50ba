//! Reply text and inline keyboards for the bot. Everything here is pure so
//! the formatting decisions can be tested without Telegram.

use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};
use teloxide::utils::html::escape;

use crate::api::Category;
use crate::records::{AnimeRecord, EpisodeRecord, StreamFormat, StreamSource};

/// Telegram rejects callback data longer than this many bytes.
pub const CALLBACK_DATA_LIMIT: usize = 64;
pub const MAX_RECORDS: usize = 5;
pub const MAX_EPISODES: usize = 10;
pub const MAX_SOURCES: usize = 5;

const BUTTON_TITLE_CHARS: usize = 15;

#[derive(Debug, Clone)]
pub struct Reply {
    pub text: String,
    pub keyboard: Option<InlineKeyboardMarkup>,
}

impl Reply {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            keyboard: None,
        }
    }

    fn with_buttons(text: String, buttons: Vec<Vec<InlineKeyboardButton>>) -> Self {
        Self {
            text,
            keyboard: (!buttons.is_empty()).then(|| InlineKeyboardMarkup::new(buttons)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callback {
    Watch(String),
    Episode(String),
    Dub(String),
}

impl Callback {
    pub fn encode(&self) -> String {
        match self {
            Callback::Watch(id) => format!("watch:{id}"),
            Callback::Episode(id) => format!("ep:{id}"),
            Callback::Dub(id) => format!("dub:{id}"),
        }
    }

    pub fn parse(data: &str) -> Option<Self> {
        if let Some(id) = data.strip_prefix("watch:") {
            return (!id.is_empty()).then(|| Callback::Watch(id.to_string()));
        }
        if let Some(id) = data.strip_prefix("ep:") {
            return (!id.is_empty()).then(|| Callback::Episode(id.to_string()));
        }
        if let Some(id) = data.strip_prefix("dub:") {
            return (!id.is_empty()).then(|| Callback::Dub(id.to_string()));
        }
        None
    }

    /// `None` when the encoded data would not fit in a button.
    fn button(&self, label: String) -> Option<InlineKeyboardButton> {
        let data = self.encode();
        (data.len() <= CALLBACK_DATA_LIMIT).then(|| InlineKeyboardButton::callback(label, data))
    }
}

pub fn welcome(first_name: Option<&str>) -> Reply {
    let greeting = match first_name {
        Some(name) => format!("🍿 <b>Welcome to Anime Bot, {}!</b> 🍿", escape(name)),
        None => "🍿 <b>Welcome to Anime Bot!</b> 🍿".to_string(),
    };
    Reply::text(format!(
        "{greeting}\n\n\
         🎬 <b>Available commands:</b>\n\
         • <code>/search &lt;anime name&gt;</code> - Search anime\n\
         • <code>/recent [page]</code> - Recent episodes\n\
         • <code>/test</code> - Check API status\n\
         • <code>/help</code> - Show help\n\n\
         ⚠️ <b>Note:</b> Educational purposes only.\n\n\
         💡 <b>Try:</b> <code>/search One Piece</code>"
    ))
}

pub fn command_list() -> Reply {
    Reply::text(
        "❓ <b>Commands:</b>\n\
         • <code>/start</code> - Start\n\
         • <code>/search &lt;name&gt;</code> - Search anime\n\
         • <code>/recent [page]</code> - Recent episodes\n\
         • <code>/test</code> - Test APIs\n\
         • <code>/help</code> - Help",
    )
}

pub fn search_usage() -> Reply {
    Reply::text(
        "🔍 <b>Usage:</b> <code>/search &lt;anime name&gt;</code>\n\n\
         Example: <code>/search Naruto</code>",
    )
}

pub fn pending(text: &str) -> String {
    format!("⏳ <b>{}</b>", escape(text))
}

pub fn search_results(query: &str, source: Option<&str>, records: &[AnimeRecord]) -> Reply {
    if records.is_empty() {
        return Reply::text(format!(
            "❌ <b>No anime found for '{}'</b>\n\n💡 Try a different spelling or check /test",
            escape(query)
        ));
    }

    let mut text = format!(
        "🔍 <b>Results for '{}'</b>\n📡 <i>Source: {}</i>\n\n",
        escape(query),
        escape(source.unwrap_or("Unknown"))
    );
    let mut buttons = Vec::new();
    for (index, record) in records.iter().take(MAX_RECORDS).enumerate() {
        text.push_str(&format!(
            "<b>{}. {}</b>\n📺 Episodes: {}\n",
            index + 1,
            escape(&record.title),
            record.episodes
        ));
        if record.sub_episodes > 0 || record.dub_episodes > 0 {
            text.push_str(&format!(
                "🗣 Sub {} / Dub {}\n",
                record.sub_episodes, record.dub_episodes
            ));
        }
        if let Some(year) = record.year {
            text.push_str(&format!("📅 {year}\n"));
        }
        if let Some(score) = record.score {
            text.push_str(&format!("⭐ {score}\n"));
        }
        text.push_str(&format!("🆔 <code>{}</code>\n\n", escape(&record.id)));

        let label = format!("🎬 Watch {}", shorten(&record.title, BUTTON_TITLE_CHARS));
        if let Some(button) = Callback::Watch(record.id.clone()).button(label) {
            buttons.push(vec![button]);
        }
    }
    text.push_str("⚠️ <i>Educational purposes only.</i>");
    Reply::with_buttons(text, buttons)
}

pub fn recent_results(page: u32, source: Option<&str>, records: &[EpisodeRecord]) -> Reply {
    if records.is_empty() {
        return Reply::text("❌ <b>No recent episodes</b>\n\nTry /test to check APIs");
    }

    let mut text = format!(
        "📺 <b>Recent Episodes</b> (page {})\n📡 <i>Source: {}</i>\n\n",
        page.max(1),
        escape(source.unwrap_or("Unknown"))
    );
    let mut buttons = Vec::new();
    for (index, record) in records.iter().take(MAX_RECORDS).enumerate() {
        text.push_str(&format!(
            "<b>{}. {}</b>\n📺 Episode: {}\n\n",
            index + 1,
            escape(&record.title),
            record.number
        ));
        let label = format!("▶️ Watch Ep {}", record.number);
        if let Some(button) = Callback::Episode(record.id.clone()).button(label) {
            buttons.push(vec![button]);
        }
    }
    text.push_str("⚠️ <i>Educational purposes only.</i>");
    Reply::with_buttons(text, buttons)
}

pub fn episode_list(anime_id: &str, source: Option<&str>, episodes: &[EpisodeRecord]) -> Reply {
    if episodes.is_empty() {
        return Reply::text(format!(
            "❌ <b>No episodes found</b> for <code>{}</code>\n\n🔄 Search more: /search",
            escape(anime_id)
        ));
    }

    let mut text = format!(
        "🎬 <b>Episodes</b> for <code>{}</code>\n📡 <i>Source: {}</i>\n\n",
        escape(anime_id),
        escape(source.unwrap_or("Unknown"))
    );
    let mut buttons = Vec::new();
    for record in episodes.iter().take(MAX_EPISODES) {
        text.push_str(&format!(
            "• Ep {}: {}\n",
            record.number,
            escape(&record.title)
        ));
        let label = format!("▶️ Ep {}", record.number);
        if let Some(button) = Callback::Episode(record.id.clone()).button(label) {
            buttons.push(vec![button]);
        }
    }
    if episodes.len() > MAX_EPISODES {
        text.push_str(&format!(
            "\n… and {} more",
            episodes.len() - MAX_EPISODES
        ));
    }
    Reply::with_buttons(text, buttons)
}

/// Offers a button to retry the same episode in the other audio category.
pub fn stream_list(
    episode_id: &str,
    category: Category,
    source: Option<&str>,
    sources: &[StreamSource],
) -> Reply {
    let switch = match category {
        Category::Sub => Callback::Dub(episode_id.to_string()).button("🗣 Try dub".to_string()),
        Category::Dub => {
            Callback::Episode(episode_id.to_string()).button("💬 Back to sub".to_string())
        }
    };
    let buttons: Vec<Vec<InlineKeyboardButton>> = switch.into_iter().map(|b| vec![b]).collect();

    if sources.is_empty() {
        return Reply::with_buttons(
            format!(
                "❌ <b>No {} streams available</b> for <code>{}</code>\n\n🔄 More episodes: /recent",
                category.as_str(),
                escape(episode_id)
            ),
            buttons,
        );
    }

    let mut text = format!(
        "▶️ <b>Streams ({})</b> for <code>{}</code>\n📡 <i>Source: {}</i>\n\n",
        category.as_str(),
        escape(episode_id),
        escape(source.unwrap_or("Unknown"))
    );
    for stream in sources.iter().take(MAX_SOURCES) {
        let format = match stream.format {
            StreamFormat::Hls => "HLS",
            StreamFormat::File => "file",
        };
        text.push_str(&format!(
            "<b>{}</b> ({format})\n{}\n",
            escape(&stream.quality),
            escape(&stream.url)
        ));
        if !stream.subtitles.is_empty() {
            let languages: Vec<String> = stream
                .subtitles
                .iter()
                .map(|track| escape(&track.language))
                .collect();
            text.push_str(&format!("💬 {}\n", languages.join(", ")));
        }
        text.push('\n');
    }
    text.push_str("⚠️ <i>Educational purposes only.</i>");
    Reply::with_buttons(text, buttons)
}

pub fn backend_status(active: Option<(&str, &str)>) -> Reply {
    match active {
        Some((name, base_url)) => Reply::text(format!(
            "✅ <b>Streaming APIs: WORKING</b>\n\n\
             <b>Active API:</b> {}\n\
             <b>URL:</b> <code>{}</code>\n\n\
             Try: <code>/search Naruto</code>",
            escape(name),
            escape(base_url)
        )),
        None => Reply::text(
            "❌ <b>All APIs currently down</b>\n\n⏰ Please try again in a few minutes.",
        ),
    }
}

pub fn failure() -> Reply {
    Reply::text("😅 <b>Error occurred.</b>\n\nTry again, or check /test")
}

fn shorten(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut short: String = text.chars().take(max_chars).collect();
    short.push('…');
    short
}
