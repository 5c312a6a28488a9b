//! Core domain model for chartwatch: genre targets, chart entries and persisted rows.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "chartwatch-core";

/// Column width used by the relational store for text columns.
pub const DEFAULT_TRUNCATE_LEN: usize = 255;

/// Hard cap on entries accepted from a single chart page.
pub const MAX_CHART_ENTRIES: usize = 100;

/// Separator placed between artist names when an entry credits several artists.
pub const ARTIST_SEPARATOR: &str = " & ";

/// Beatport genre chart pages scraped when no override is configured.
pub const DEFAULT_GENRE_URLS: &[&str] = &[
    "https://www.beatport.com/genre/140-deep-dubstep-grime/95/top-100",
    "https://www.beatport.com/genre/amapiano/98/top-100",
    "https://www.beatport.com/genre/afro-house/89/top-100",
    "https://www.beatport.com/genre/ambient-experimental/100/top-100",
    "https://www.beatport.com/genre/bass-club/85/top-100",
    "https://www.beatport.com/genre/bass-house/91/top-100",
    "https://www.beatport.com/genre/brazilian-funk/101/top-100",
    "https://www.beatport.com/genre/breaks-breakbeat-uk-bass/9/top-100",
    "https://www.beatport.com/genre/dance-pop/39/top-100",
    "https://www.beatport.com/genre/deep-house/12/top-100",
    "https://www.beatport.com/genre/downtempo/63/top-100",
    "https://www.beatport.com/genre/drum-bass/1/top-100",
    "https://www.beatport.com/genre/dubstep/18/top-100",
    "https://www.beatport.com/genre/electro-classic-detroit-modern/94/top-100",
    "https://www.beatport.com/genre/electronica/3/top-100",
    "https://www.beatport.com/genre/funky-house/81/top-100",
    "https://www.beatport.com/genre/hard-dance-hardcore-neo-rave/8/top-100",
    "https://www.beatport.com/genre/hard-techno/2/top-100",
    "https://www.beatport.com/genre/house/5/top-100",
    "https://www.beatport.com/genre/indie-dance/37/top-100",
    "https://www.beatport.com/genre/jackin-house/97/top-100",
    "https://www.beatport.com/genre/mainstage/96/top-100",
    "https://www.beatport.com/genre/melodic-house-techno/90/top-100",
    "https://www.beatport.com/genre/minimal-deep-tech/14/top-100",
    "https://www.beatport.com/genre/nu-disco-disco/50/top-100",
    "https://www.beatport.com/genre/organic-house/93/top-100",
    "https://www.beatport.com/genre/progressive-house/15/top-100",
    "https://www.beatport.com/genre/psy-trance/13/top-100",
    "https://www.beatport.com/genre/tech-house/11/top-100",
    "https://www.beatport.com/genre/techno-peak-time-driving/6/top-100",
    "https://www.beatport.com/genre/techno-raw-deep-hypnotic/92/top-100",
    "https://www.beatport.com/genre/trance-main-floor/7/top-100",
    "https://www.beatport.com/genre/trance-raw-deep-hypnotic/99/top-100",
    "https://www.beatport.com/genre/trap-future-bass/38/top-100",
    "https://www.beatport.com/genre/uk-garage-bassline/86/top-100",
];

/// A genre chart page and the slug derived from its URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenreTarget {
    pub url: String,
    pub slug: String,
}

impl GenreTarget {
    pub fn from_url(url: impl Into<String>) -> Self {
        let url = url.into();
        let slug = genre_slug_from_url(&url);
        Self { url, slug }
    }
}

pub fn default_genre_targets() -> Vec<GenreTarget> {
    DEFAULT_GENRE_URLS
        .iter()
        .map(|url| GenreTarget::from_url(*url))
        .collect()
}

/// Returns the path segment following a literal `genre` segment, or the whole
/// URL when no such segment exists.
pub fn genre_slug_from_url(url: &str) -> String {
    let mut parts = url.split('/');
    while let Some(part) = parts.next() {
        if part == "genre" {
            if let Some(slug) = parts.next() {
                return slug.to_string();
            }
        }
    }
    url.to_string()
}

/// Trims surrounding whitespace and keeps at most `len` characters.
pub fn truncate(value: Option<&str>, len: usize) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.chars().count() <= len {
        return Some(trimmed.to_string());
    }
    Some(trimmed.chars().take(len).collect())
}

/// One accepted row of a chart page, before it is attached to a genre.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartEntry {
    pub rank: u32,
    pub title: String,
    pub artists: String,
}

/// A ranked chart entry tagged with the genre it was scraped from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackRecord {
    pub genre: String,
    pub rank: u32,
    pub title: String,
    pub artists: String,
}

impl TrackRecord {
    pub fn from_entry(genre: &str, entry: ChartEntry) -> Self {
        Self {
            genre: genre.to_string(),
            rank: entry.rank,
            title: entry.title,
            artists: entry.artists,
        }
    }
}

/// Row shape of the `beatport_top100` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartRow {
    pub artist: String,
    pub title: String,
    pub rank: i32,
    pub date: NaiveDate,
    pub genre: String,
}

impl ChartRow {
    /// Builds the persisted form of a record, applying column truncation.
    pub fn from_record(record: &TrackRecord, date: NaiveDate) -> Self {
        Self {
            artist: truncate(Some(&record.artists), DEFAULT_TRUNCATE_LEN).unwrap_or_default(),
            title: truncate(Some(&record.title), DEFAULT_TRUNCATE_LEN).unwrap_or_default(),
            rank: i32::try_from(record.rank).unwrap_or(i32::MAX),
            date,
            genre: truncate(Some(&record.genre), DEFAULT_TRUNCATE_LEN).unwrap_or_default(),
        }
    }

    pub fn conflict_key(&self) -> (&str, &str, NaiveDate, &str) {
        (&self.artist, &self.title, self.date, &self.genre)
    }
}
