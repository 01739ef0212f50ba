use std::fmt;

/// Shown when a backend omits a title.
pub const UNKNOWN_TITLE: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpisodeCount {
    Known(u32),
    Unknown,
}

impl fmt::Display for EpisodeCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EpisodeCount::Known(count) => write!(f, "{count}"),
            EpisodeCount::Unknown => f.write_str("Unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpisodeNumber {
    Number(u32),
    Latest,
}

impl fmt::Display for EpisodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EpisodeNumber::Number(number) => write!(f, "{number}"),
            EpisodeNumber::Latest => f.write_str("Latest"),
        }
    }
}

/// Backend-agnostic anime entry.
///
/// `score` keeps the backend's native scale (0-10 or 0-100); only one
/// backend's data is ever shown in a session.
#[derive(Debug, Clone, PartialEq)]
pub struct AnimeRecord {
    pub id: String,
    pub title: String,
    pub episodes: EpisodeCount,
    pub year: Option<i32>,
    pub score: Option<f64>,
    pub sub_episodes: u32,
    pub dub_episodes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpisodeRecord {
    pub id: String,
    pub title: String,
    pub number: EpisodeNumber,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    /// Segmented playlist (HLS / m3u8).
    Hls,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtitleTrack {
    pub language: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSource {
    pub quality: String,
    pub format: StreamFormat,
    pub url: String,
    pub subtitles: Vec<SubtitleTrack>,
}
