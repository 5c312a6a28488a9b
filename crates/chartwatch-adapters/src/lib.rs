//! Chart page extraction: turns Beatport Top 100 markup into ranked entries.
//!
//! The site has shipped more than one markup generation. The current one marks
//! rows with `data-testid="tracks-table-row"` and uses hashed class names; older
//! ones use `bucket`/`buk-track` classes. Layouts are tried in priority order and
//! the first one that finds rows is authoritative.

use chartwatch_core::{ChartEntry, ARTIST_SEPARATOR, MAX_CHART_ENTRIES};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "chartwatch-adapters";

const TRACKS_TABLE_ROW: &str = r#"div[data-testid="tracks-table-row"]"#;
const TRACK_TITLE_LINK: &str = r#"a[title][href*="/track"]"#;
const ANY_TITLE_LINK: &str = "a[title]";
const ARTIST_CONTAINERS: &[&str] = &[r#"div[class*="ArtistNames"]"#, ".ArtistNames"];
const LINK: &str = "a";

const LEGACY_ROWS: &[&str] = &[
    "li.bucket-item",
    "li.buk-track",
    "li.track",
    "div.bucket-track",
    "div.track",
];
const BROAD_ROWS: &str = r#"[class*="bucket"]"#;
const BROAD_ROW_LIMIT: usize = 200;

const LEGACY_TITLES: &[&str] = &[
    ".buk-track-primary-title",
    ".buk-track-title",
    ".track-title",
    "h3",
    "a.track-title",
    "a.buk-track-title",
    "a.bp-focusable",
];
const LEGACY_ARTISTS: &[&str] = &[
    ".buk-track-artists",
    ".track-artists",
    "p.buk-track-artists",
    ".artists",
    ".buk-track-artists a",
    "span.track-artists",
];

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector {selector:?}: {message}")]
    Selector { selector: String, message: String },
}

/// Which markup generation produced the entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChartLayout {
    TracksTable,
    LegacyBucket,
    BroadBucket,
    Unrecognized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartExtraction {
    pub layout: ChartLayout,
    pub entries: Vec<ChartEntry>,
}

/// Compiled selector chains. Build once, reuse for every genre.
#[derive(Debug)]
pub struct ChartExtractor {
    row: Selector,
    track_title_link: Selector,
    any_title_link: Selector,
    artist_containers: Vec<Selector>,
    link: Selector,
    legacy_rows: Vec<Selector>,
    broad_rows: Selector,
    legacy_titles: Vec<Selector>,
    legacy_artists: Vec<Selector>,
}

fn compile(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|e| ExtractError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn compile_all(selectors: &[&str]) -> Result<Vec<Selector>, ExtractError> {
    selectors.iter().map(|s| compile(s)).collect()
}

/// Text nodes trimmed, empties dropped, joined by single spaces.
fn visible_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Numbers accepted rows densely from 1, skipping rows with no title and no
/// artists, and stops at the chart cap.
fn rank_rows(rows: impl Iterator<Item = (String, String)>) -> Vec<ChartEntry> {
    let mut entries = Vec::new();
    for (title, artists) in rows {
        if title.is_empty() && artists.is_empty() {
            continue;
        }
        entries.push(ChartEntry {
            rank: entries.len() as u32 + 1,
            title,
            artists,
        });
        if entries.len() >= MAX_CHART_ENTRIES {
            break;
        }
    }
    entries
}

impl ChartExtractor {
    pub fn new() -> Result<Self, ExtractError> {
        Ok(Self {
            row: compile(TRACKS_TABLE_ROW)?,
            track_title_link: compile(TRACK_TITLE_LINK)?,
            any_title_link: compile(ANY_TITLE_LINK)?,
            artist_containers: compile_all(ARTIST_CONTAINERS)?,
            link: compile(LINK)?,
            legacy_rows: compile_all(LEGACY_ROWS)?,
            broad_rows: compile(BROAD_ROWS)?,
            legacy_titles: compile_all(LEGACY_TITLES)?,
            legacy_artists: compile_all(LEGACY_ARTISTS)?,
        })
    }

    /// Extracts ranked entries from one chart page. Never fails; a page nothing
    /// matches yields an empty extraction.
    pub fn extract(&self, markup: &str) -> ChartExtraction {
        let document = Html::parse_document(markup);

        let rows = document.select(&self.row).collect::<Vec<_>>();
        if !rows.is_empty() {
            return ChartExtraction {
                layout: ChartLayout::TracksTable,
                entries: rank_rows(rows.into_iter().map(|row| self.tracks_table_fields(row))),
            };
        }

        let legacy = self
            .legacy_rows
            .iter()
            .map(|sel| document.select(sel).collect::<Vec<_>>())
            .find(|found| !found.is_empty());
        let (layout, items) = match legacy {
            Some(items) => (ChartLayout::LegacyBucket, items),
            None => (
                ChartLayout::BroadBucket,
                document
                    .select(&self.broad_rows)
                    .take(BROAD_ROW_LIMIT)
                    .collect::<Vec<_>>(),
            ),
        };
        if items.is_empty() {
            return ChartExtraction {
                layout: ChartLayout::Unrecognized,
                entries: Vec::new(),
            };
        }

        ChartExtraction {
            layout,
            entries: rank_rows(items.into_iter().map(|item| self.legacy_fields(item))),
        }
    }

    pub fn extract_entries(&self, markup: &str) -> Vec<ChartEntry> {
        self.extract(markup).entries
    }

    fn tracks_table_fields(&self, row: ElementRef<'_>) -> (String, String) {
        let title = row
            .select(&self.track_title_link)
            .next()
            .or_else(|| row.select(&self.any_title_link).next())
            .map(|link| match link.value().attr("title").map(str::trim) {
                Some(attr) if !attr.is_empty() => attr.to_string(),
                _ => visible_text(link),
            })
            .unwrap_or_default();

        let artists = self
            .artist_containers
            .iter()
            .find_map(|sel| row.select(sel).next())
            .map(|container| self.artist_names(container))
            .unwrap_or_default();

        (title, artists)
    }

    fn legacy_fields(&self, item: ElementRef<'_>) -> (String, String) {
        let title = self
            .legacy_titles
            .iter()
            .find_map(|sel| {
                item.select(sel)
                    .next()
                    .map(visible_text)
                    .filter(|text| !text.is_empty())
            })
            .unwrap_or_default();

        let artists = self
            .legacy_artists
            .iter()
            .find_map(|sel| {
                item.select(sel)
                    .next()
                    .filter(|el| !visible_text(*el).is_empty())
            })
            .map(|el| self.artist_names(el))
            .unwrap_or_default();

        (title, artists)
    }

    /// Linked artist names joined with the separator, or the container's own
    /// text when it has no links.
    fn artist_names(&self, container: ElementRef<'_>) -> String {
        let names = container.select(&self.link).map(visible_text).collect::<Vec<_>>();
        if names.is_empty() {
            visible_text(container)
        } else {
            names.join(ARTIST_SEPARATOR)
        }
    }
}
