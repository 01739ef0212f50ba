//! Translates each backend's response layout into canonical records.
//!
//! Every backend gets one [`ExtractionTable`]. For each canonical field the
//! table lists candidate keys in priority order; the first key holding a
//! usable value wins. Dotted keys descend into nested objects and the empty
//! key denotes the payload root.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::error::FetchError;
use crate::records::{
    AnimeRecord, EpisodeCount, EpisodeNumber, EpisodeRecord, StreamFormat, StreamSource,
    SubtitleTrack, UNKNOWN_TITLE,
};
use crate::registry::{Operation, ResponseShape};

static YEAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{4})\b").expect("valid year pattern"));

type Keys = &'static [&'static str];

struct AnimeFields {
    title: Keys,
    episodes: Keys,
    id: Keys,
    year: Keys,
    score: Keys,
    sub: Keys,
    dub: Keys,
}

struct EpisodeFields {
    title: Keys,
    number: Keys,
    id: Keys,
}

struct StreamFields {
    url: Keys,
    quality: Keys,
    subtitle_url: Keys,
    subtitle_lang: Keys,
}

struct ExtractionTable {
    search: Keys,
    recent: Keys,
    episodes: Keys,
    stream: Keys,
    subtitles: Keys,
    anime: AnimeFields,
    recent_episode: EpisodeFields,
    episode: EpisodeFields,
    source: StreamFields,
}

impl ExtractionTable {
    fn lists(&self, operation: Operation) -> Keys {
        match operation {
            Operation::Search => self.search,
            Operation::Recent => self.recent,
            Operation::Episodes => self.episodes,
            Operation::Stream => self.stream,
        }
    }
}

const EPISODE_FIELDS: EpisodeFields = EpisodeFields {
    title: &["title", "name"],
    number: &["episodeNumber", "episode", "number"],
    id: &["id", "episodeId"],
};

const STREAM_FIELDS: StreamFields = StreamFields {
    url: &["url", "file"],
    quality: &["quality", "label"],
    subtitle_url: &["url", "file"],
    subtitle_lang: &["lang", "label"],
};

const CONSUMET_ANIME: AnimeFields = AnimeFields {
    title: &["title", "name"],
    episodes: &["totalEpisodes", "episodes"],
    id: &["id", "animeId"],
    year: &["releaseDate", "year"],
    score: &["rating"],
    sub: &["sub"],
    dub: &["dub"],
};

static HIANIME: ExtractionTable = ExtractionTable {
    search: &["data.animes", "data.response"],
    recent: &[
        "data.latestEpisodeAnimes",
        "data.recentlyAdded",
        "data.episodes",
    ],
    episodes: &["data.episodes"],
    stream: &["data.sources"],
    subtitles: &["data.tracks", "data.subtitles"],
    anime: AnimeFields {
        title: &["title", "name"],
        episodes: &["totalEpisodes", "episodes.eps"],
        id: &["id", "animeId"],
        year: &["year", "releaseDate"],
        score: &["malScore", "rating"],
        sub: &["episodes.sub"],
        dub: &["episodes.dub"],
    },
    recent_episode: EPISODE_FIELDS,
    episode: EPISODE_FIELDS,
    source: STREAM_FIELDS,
};

static CONSUMET: ExtractionTable = ExtractionTable {
    search: &["results"],
    recent: &["results"],
    episodes: &["episodes"],
    stream: &["sources"],
    subtitles: &["subtitles"],
    anime: CONSUMET_ANIME,
    recent_episode: EPISODE_FIELDS,
    episode: EPISODE_FIELDS,
    source: STREAM_FIELDS,
};

static ZEN: ExtractionTable = ExtractionTable {
    search: &["results", ""],
    recent: &["results", ""],
    episodes: &["episodes", ""],
    stream: &["sources", ""],
    subtitles: &["subtitles"],
    anime: CONSUMET_ANIME,
    recent_episode: EPISODE_FIELDS,
    episode: EPISODE_FIELDS,
    source: STREAM_FIELDS,
};

static ANILIST: ExtractionTable = ExtractionTable {
    search: &["data.Page.media"],
    recent: &["data.Page.airingSchedules"],
    episodes: &["data.Media.streamingEpisodes"],
    stream: &[],
    subtitles: &[],
    anime: AnimeFields {
        title: &["title.english", "title.romaji", "title.native"],
        episodes: &["episodes"],
        id: &["id"],
        year: &["seasonYear", "startDate.year"],
        score: &["averageScore"],
        sub: &[],
        dub: &[],
    },
    recent_episode: EpisodeFields {
        title: &["media.title.english", "media.title.romaji"],
        number: &["episode"],
        id: &["media.id"],
    },
    episode: EpisodeFields {
        title: &["title"],
        number: &["episode", "number"],
        id: &["url"],
    },
    source: STREAM_FIELDS,
};

fn table(shape: ResponseShape) -> &'static ExtractionTable {
    match shape {
        ResponseShape::HiAnime => &HIANIME,
        ResponseShape::Consumet => &CONSUMET,
        ResponseShape::Zen => &ZEN,
        ResponseShape::AniList => &ANILIST,
    }
}

/// Number of elements in the result list a payload carries for `operation`.
pub fn result_count(
    shape: ResponseShape,
    operation: Operation,
    payload: &Value,
) -> Result<usize, FetchError> {
    Ok(result_list(payload, table(shape).lists(operation))?.len())
}

pub fn normalize_anime(
    shape: ResponseShape,
    operation: Operation,
    payload: &Value,
) -> Result<Vec<AnimeRecord>, FetchError> {
    let fields = &table(shape).anime;
    let items = result_list(payload, table(shape).lists(operation))?;
    let records: Vec<AnimeRecord> = items
        .iter()
        .filter_map(|item| anime_record(item, fields))
        .collect();
    log_dropped(shape, operation, items.len(), records.len());
    Ok(records)
}

/// Episode listing or recent releases, depending on `operation`.
pub fn normalize_episodes(
    shape: ResponseShape,
    operation: Operation,
    payload: &Value,
) -> Result<Vec<EpisodeRecord>, FetchError> {
    let table = table(shape);
    let fields = match operation {
        Operation::Recent => &table.recent_episode,
        _ => &table.episode,
    };
    let items = result_list(payload, table.lists(operation))?;
    let records: Vec<EpisodeRecord> = items
        .iter()
        .filter_map(|item| episode_record(item, fields))
        .collect();
    log_dropped(shape, operation, items.len(), records.len());
    Ok(records)
}

/// Stream sources in backend order. Subtitle tracks are response-wide and
/// attach to every source.
pub fn normalize_streams(
    shape: ResponseShape,
    payload: &Value,
) -> Result<Vec<StreamSource>, FetchError> {
    let table = table(shape);
    let items = result_list(payload, table.stream)?;
    let subtitles = subtitle_tracks(payload, table.subtitles, &table.source);
    let sources: Vec<StreamSource> = items
        .iter()
        .filter_map(|item| stream_source(item, &table.source, &subtitles))
        .collect();
    log_dropped(shape, Operation::Stream, items.len(), sources.len());
    Ok(sources)
}

fn log_dropped(shape: ResponseShape, operation: Operation, total: usize, kept: usize) {
    if kept < total {
        debug!(
            shape = ?shape,
            operation = %operation,
            dropped = total - kept,
            kept,
            "dropped records missing a required field"
        );
    }
}

fn anime_record(item: &Value, fields: &AnimeFields) -> Option<AnimeRecord> {
    let id = text_field(item, fields.id)?;
    Some(AnimeRecord {
        id,
        title: text_field(item, fields.title).unwrap_or_else(|| UNKNOWN_TITLE.to_string()),
        episodes: count_field(item, fields.episodes)
            .map(EpisodeCount::Known)
            .unwrap_or(EpisodeCount::Unknown),
        year: year_field(item, fields.year),
        score: score_field(item, fields.score),
        sub_episodes: count_field(item, fields.sub).unwrap_or(0),
        dub_episodes: count_field(item, fields.dub).unwrap_or(0),
    })
}

fn episode_record(item: &Value, fields: &EpisodeFields) -> Option<EpisodeRecord> {
    let id = text_field(item, fields.id)?;
    Some(EpisodeRecord {
        id,
        title: text_field(item, fields.title).unwrap_or_else(|| UNKNOWN_TITLE.to_string()),
        number: count_field(item, fields.number)
            .map(EpisodeNumber::Number)
            .unwrap_or(EpisodeNumber::Latest),
    })
}

fn stream_source(
    item: &Value,
    fields: &StreamFields,
    subtitles: &[SubtitleTrack],
) -> Option<StreamSource> {
    let url = text_field(item, fields.url)?;
    Some(StreamSource {
        quality: text_field(item, fields.quality).unwrap_or_else(|| "default".to_string()),
        format: stream_format(item, &url),
        url,
        subtitles: subtitles.to_vec(),
    })
}

fn subtitle_tracks(payload: &Value, lists: Keys, fields: &StreamFields) -> Vec<SubtitleTrack> {
    let Some(items) = lists
        .iter()
        .find_map(|path| lookup(payload, path).and_then(Value::as_array))
    else {
        return Vec::new();
    };

    items
        .iter()
        .filter(|item| item.get("kind").and_then(Value::as_str) != Some("thumbnails"))
        .filter_map(|item| {
            Some(SubtitleTrack {
                url: text_field(item, fields.subtitle_url)?,
                language: text_field(item, fields.subtitle_lang)
                    .unwrap_or_else(|| "unknown".to_string()),
            })
        })
        .collect()
}

fn stream_format(item: &Value, url: &str) -> StreamFormat {
    if let Some(segmented) = item.get("isM3U8").and_then(Value::as_bool) {
        return if segmented {
            StreamFormat::Hls
        } else {
            StreamFormat::File
        };
    }
    if let Some(kind) = item.get("type").and_then(Value::as_str)
        && matches!(kind.to_ascii_lowercase().as_str(), "hls" | "m3u8")
    {
        return StreamFormat::Hls;
    }

    let path = url.split(['?', '#']).next().unwrap_or(url);
    if path.to_ascii_lowercase().ends_with(".m3u8") {
        StreamFormat::Hls
    } else {
        StreamFormat::File
    }
}

/// First candidate path holding a non-empty array. An empty array at any
/// candidate is an empty result; no array at all is a shape mismatch.
fn result_list<'a>(payload: &'a Value, paths: Keys) -> Result<&'a [Value], FetchError> {
    let mut found_array = false;
    for path in paths {
        if let Some(items) = lookup(payload, path).and_then(Value::as_array) {
            if !items.is_empty() {
                return Ok(items);
            }
            found_array = true;
        }
    }

    if found_array {
        Ok(&[])
    } else {
        Err(FetchError::ShapeMismatch {
            expected: describe_paths(paths),
        })
    }
}

fn describe_paths(paths: Keys) -> String {
    if paths.is_empty() {
        return "(none)".to_string();
    }
    paths
        .iter()
        .map(|path| if path.is_empty() { "<root>" } else { path })
        .collect::<Vec<_>>()
        .join(" | ")
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    let mut current = value;
    for key in path.split('.') {
        current = current.get(key)?;
    }
    if current.is_null() { None } else { Some(current) }
}

fn text_field(value: &Value, keys: Keys) -> Option<String> {
    keys.iter().find_map(|key| match lookup(value, key)? {
        Value::String(text) if !text.trim().is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    })
}

fn count_field(value: &Value, keys: Keys) -> Option<u32> {
    keys.iter().find_map(|key| match lookup(value, key)? {
        Value::Number(number) => number.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(text) => text.trim().parse::<u32>().ok(),
        _ => None,
    })
}

fn score_field(value: &Value, keys: Keys) -> Option<f64> {
    keys.iter().find_map(|key| match lookup(value, key)? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    })
}

fn year_field(value: &Value, keys: Keys) -> Option<i32> {
    keys.iter().find_map(|key| match lookup(value, key)? {
        Value::Number(number) => number.as_i64().and_then(|n| i32::try_from(n).ok()),
        Value::String(text) => YEAR
            .captures(text)
            .and_then(|caps| caps[1].parse::<i32>().ok()),
        _ => None,
    })
}
