//! Scrape pipeline orchestration: genre loop, pacing, and record sinks.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chartwatch_adapters::{ChartExtractor, ChartLayout};
use chartwatch_core::{default_genre_targets, ChartRow, GenreTarget, TrackRecord};
use chartwatch_storage::{HttpClientConfig, HttpFetcher, PageArchive};
use chrono::{DateTime, Local, NaiveDate, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{Connection, Postgres, QueryBuilder};
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "chartwatch-sync";

pub const CHART_TABLE: &str = "beatport_top100";

/// Rows per INSERT statement; keeps bind parameters well under the Postgres limit.
const UPSERT_CHUNK_ROWS: usize = 1000;

const CREATE_CHART_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS beatport_top100 (
    artist     VARCHAR(255),
    title      VARCHAR(255),
    rank       INTEGER,
    date       DATE,
    scraped_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    genre      VARCHAR(255),
    CONSTRAINT beatport_top100_entry_key UNIQUE (artist, title, date, genre)
)
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Csv,
    Postgres,
}

impl FromStr for SinkKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" | "file" => Ok(Self::Csv),
            "postgres" | "postgresql" | "db" => Ok(Self::Postgres),
            other => anyhow::bail!("unknown sink {other:?}; expected csv or postgres"),
        }
    }
}

/// Connection parameters for the relational sink.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: Option<String>,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            host: "localhost".to_string(),
            port: 5432,
            database: "beatport".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
        }
    }
}

impl DbConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            host: std::env::var("PGHOST").unwrap_or(defaults.host),
            port: std::env::var("PGPORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            database: std::env::var("PGDATABASE").unwrap_or(defaults.database),
            user: std::env::var("PGUSER").unwrap_or(defaults.user),
            password: std::env::var("PGPASSWORD").unwrap_or(defaults.password),
        }
    }

    /// `DATABASE_URL` wins over the individual `PG*` parameters when set.
    pub fn connect_options(&self) -> Result<PgConnectOptions> {
        if let Some(url) = &self.database_url {
            return PgConnectOptions::from_str(url).context("parsing DATABASE_URL");
        }
        Ok(PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.user)
            .password(&self.password))
    }

    /// Redacted description for logs.
    pub fn describe(&self) -> String {
        match &self.database_url {
            Some(_) => "DATABASE_URL".to_string(),
            None => format!("{}@{}:{}/{}", self.user, self.host, self.port, self.database),
        }
    }
}

/// Randomized pause between genres: `base` plus up to `jitter` extra.
#[derive(Debug, Clone, Copy)]
pub struct PacingPolicy {
    pub base: Duration,
    pub jitter: Duration,
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            jitter: Duration::from_millis(1500),
        }
    }
}

impl PacingPolicy {
    pub fn none() -> Self {
        Self {
            base: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    pub fn next_delay(&self, rng: &mut impl Rng) -> Duration {
        let extra = self.jitter.mul_f64(rng.gen::<f64>());
        self.base + extra
    }
}

#[derive(Debug, Clone, Deserialize)]
struct GenresFile {
    genres: Vec<String>,
}

/// Loads chart URLs from a YAML file of the form `genres: [url, ...]`.
pub fn load_genre_targets(path: impl AsRef<Path>) -> Result<Vec<GenreTarget>> {
    let path = path.as_ref();
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let parsed: GenresFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(parsed
        .genres
        .into_iter()
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
        .map(GenreTarget::from_url)
        .collect())
}

#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    pub targets: Vec<GenreTarget>,
    pub http: HttpClientConfig,
    pub pacing: PacingPolicy,
    pub sink: SinkKind,
    pub output_dir: PathBuf,
    pub archive_dir: Option<PathBuf>,
    pub db: DbConfig,
    pub scheduler_enabled: bool,
    pub scrape_cron: String,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            targets: default_genre_targets(),
            http: HttpClientConfig::default(),
            pacing: PacingPolicy::default(),
            sink: SinkKind::Csv,
            output_dir: PathBuf::from("."),
            archive_dir: None,
            db: DbConfig::default(),
            scheduler_enabled: false,
            scrape_cron: "0 0 6 * * *".to_string(),
        }
    }
}

impl ScrapeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut http = defaults.http.clone();
        if let Ok(user_agent) = std::env::var("CHARTWATCH_USER_AGENT") {
            http.user_agent = user_agent;
        }
        if let Some(secs) = std::env::var("CHARTWATCH_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            http.timeout = Duration::from_secs(secs);
        }
        let sink = match std::env::var("CHARTWATCH_SINK") {
            Ok(value) => value.parse::<SinkKind>().unwrap_or_else(|err| {
                warn!(%err, "ignoring CHARTWATCH_SINK");
                defaults.sink
            }),
            Err(_) => defaults.sink,
        };

        Self {
            targets: defaults.targets,
            http,
            pacing: defaults.pacing,
            sink,
            output_dir: std::env::var("CHARTWATCH_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            archive_dir: std::env::var("CHARTWATCH_ARCHIVE_DIR").ok().map(PathBuf::from),
            db: DbConfig::from_env(),
            scheduler_enabled: std::env::var("CHARTWATCH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            scrape_cron: std::env::var("CHARTWATCH_SCRAPE_CRON").unwrap_or(defaults.scrape_cron),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SinkStatus {
    NotRun,
    Written { sink: String, rows: usize, target: String },
    Failed { sink: String, error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ScrapeRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub genres_attempted: usize,
    pub genres_fetched: usize,
    pub genres_failed: Vec<String>,
    pub genres_empty: Vec<String>,
    pub records: usize,
    pub sink: SinkStatus,
}

#[derive(Debug, Clone)]
pub struct ScrapeOutcome {
    pub records: Vec<TrackRecord>,
    pub summary: ScrapeRunSummary,
}

enum GenreOutcome {
    FetchFailed,
    Parsed {
        layout: ChartLayout,
        records: Vec<TrackRecord>,
    },
}

/// Sequential fetch → extract → accumulate over the configured genres.
pub struct ScrapePipeline {
    config: ScrapeConfig,
    http: HttpFetcher,
    extractor: ChartExtractor,
    archive: Option<PageArchive>,
}

impl ScrapePipeline {
    pub fn new(config: ScrapeConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http.clone())?;
        let extractor = ChartExtractor::new().context("compiling chart selectors")?;
        let archive = config.archive_dir.clone().map(PageArchive::new);
        Ok(Self {
            config,
            http,
            extractor,
            archive,
        })
    }

    pub fn config(&self) -> &ScrapeConfig {
        &self.config
    }

    pub async fn run(&self) -> ScrapeOutcome {
        self.run_targets(&self.config.targets).await
    }

    /// Failed fetches and empty charts are logged and skipped; the run itself
    /// never fails.
    pub async fn run_targets(&self, targets: &[GenreTarget]) -> ScrapeOutcome {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let mut records = Vec::new();
        let mut genres_fetched = 0usize;
        let mut genres_failed = Vec::new();
        let mut genres_empty = Vec::new();

        info!(%run_id, genres = targets.len(), "starting scrape run");

        for (idx, target) in targets.iter().enumerate() {
            let span = info_span!("scrape_genre", slug = %target.slug);
            match self.scrape_genre(target, started_at).instrument(span).await {
                GenreOutcome::FetchFailed => genres_failed.push(target.slug.clone()),
                GenreOutcome::Parsed {
                    layout,
                    records: genre_records,
                } => {
                    genres_fetched += 1;
                    if genre_records.is_empty() {
                        warn!(
                            slug = %target.slug,
                            ?layout,
                            "no tracks parsed; page markup may have changed"
                        );
                        genres_empty.push(target.slug.clone());
                    } else {
                        info!(slug = %target.slug, ?layout, tracks = genre_records.len(), "parsed chart");
                    }
                    records.extend(genre_records);
                }
            }

            if idx + 1 < targets.len() {
                let delay = self.config.pacing.next_delay(&mut rand::thread_rng());
                tokio::time::sleep(delay).await;
            }
        }

        let summary = ScrapeRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            genres_attempted: targets.len(),
            genres_fetched,
            genres_failed,
            genres_empty,
            records: records.len(),
            sink: SinkStatus::NotRun,
        };
        ScrapeOutcome { records, summary }
    }

    /// `fetched_at` is the run start, so every page of one run shares an
    /// archive stamp.
    async fn scrape_genre(&self, target: &GenreTarget, fetched_at: DateTime<Utc>) -> GenreOutcome {
        info!(url = %target.url, "fetching chart");
        let markup = match self.http.fetch_text(&target.url).await {
            Ok(markup) => markup,
            Err(err) => {
                warn!(%err, "skipping genre after fetch failure");
                return GenreOutcome::FetchFailed;
            }
        };

        if let Some(archive) = &self.archive {
            match archive.store_page(fetched_at, &target.slug, &markup).await {
                Ok(stored) => info!(path = %stored.relative_path.display(), "archived page"),
                Err(err) => warn!(error = %format!("{err:#}"), "could not archive page"),
            }
        }

        let extraction = self.extractor.extract(&markup);
        GenreOutcome::Parsed {
            layout: extraction.layout,
            records: extraction
                .entries
                .into_iter()
                .map(|entry| TrackRecord::from_entry(&target.slug, entry))
                .collect(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Config(String),
}

#[derive(Debug, Clone)]
pub struct SinkReport {
    pub rows: usize,
    pub target: String,
}

/// Accepts the accumulated records of one run and persists them.
#[async_trait]
pub trait RecordSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn persist(&self, records: &[TrackRecord]) -> Result<SinkReport, SinkError>;
}

pub const CSV_HEADER: [&str; 4] = ["genre", "title", "artists", "rank"];

/// Writes `beatport_top100_<date>.csv` into the output directory.
#[derive(Debug, Clone)]
pub struct CsvSink {
    output_dir: PathBuf,
    date: NaiveDate,
}

impl CsvSink {
    pub fn new(output_dir: impl Into<PathBuf>, date: NaiveDate) -> Self {
        Self {
            output_dir: output_dir.into(),
            date,
        }
    }

    pub fn file_name(date: NaiveDate) -> String {
        format!("beatport_top100_{}.csv", date.format("%Y-%m-%d"))
    }

    pub fn path(&self) -> PathBuf {
        self.output_dir.join(Self::file_name(self.date))
    }
}

pub fn render_csv(records: &[TrackRecord]) -> Result<Vec<u8>, SinkError> {
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::CRLF)
        .from_writer(Vec::new());
    writer.write_record(CSV_HEADER)?;
    for record in records {
        writer.write_record([
            record.genre.as_str(),
            record.title.as_str(),
            record.artists.as_str(),
            record.rank.to_string().as_str(),
        ])?;
    }
    writer.into_inner().map_err(|e| SinkError::Io(e.into_error()))
}

#[async_trait]
impl RecordSink for CsvSink {
    fn name(&self) -> &'static str {
        "csv"
    }

    async fn persist(&self, records: &[TrackRecord]) -> Result<SinkReport, SinkError> {
        let bytes = render_csv(records)?;
        fs::create_dir_all(&self.output_dir).await?;
        let path = self.path();
        fs::write(&path, bytes).await?;
        info!(rows = records.len(), path = %path.display(), "wrote csv");
        Ok(SinkReport {
            rows: records.len(),
            target: path.display().to_string(),
        })
    }
}

/// Upserts rows into `beatport_top100` over a single connection per call.
#[derive(Debug, Clone)]
pub struct PostgresSink {
    db: DbConfig,
    date: NaiveDate,
}

impl PostgresSink {
    pub fn new(db: DbConfig, date: NaiveDate) -> Self {
        Self { db, date }
    }

    async fn connect(&self) -> Result<PgConnection, SinkError> {
        let options = self
            .db
            .connect_options()
            .map_err(|e| SinkError::Config(format!("{e:#}")))?;
        Ok(PgConnection::connect_with(&options).await?)
    }
}

pub async fn ensure_chart_table(conn: &mut PgConnection) -> Result<(), sqlx::Error> {
    sqlx::query(CREATE_CHART_TABLE_SQL).execute(&mut *conn).await?;
    Ok(())
}

/// Collapses rows sharing a conflict key, keeping the last one in its first
/// position. A single `ON CONFLICT DO UPDATE` statement cannot touch a row twice.
pub fn collapse_conflicts(rows: Vec<ChartRow>) -> Vec<ChartRow> {
    let mut positions: HashMap<(String, String, NaiveDate, String), usize> = HashMap::new();
    let mut out: Vec<ChartRow> = Vec::with_capacity(rows.len());
    for row in rows {
        let key = (
            row.artist.clone(),
            row.title.clone(),
            row.date,
            row.genre.clone(),
        );
        match positions.get(&key) {
            Some(&pos) => out[pos] = row,
            None => {
                positions.insert(key, out.len());
                out.push(row);
            }
        }
    }
    out
}

async fn upsert_rows(conn: &mut PgConnection, rows: &[ChartRow]) -> Result<u64, sqlx::Error> {
    let mut affected = 0u64;
    for chunk in rows.chunks(UPSERT_CHUNK_ROWS) {
        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("INSERT INTO beatport_top100 (artist, title, rank, date, genre) ");
        qb.push_values(chunk, |mut b, row| {
            b.push_bind(row.artist.clone())
                .push_bind(row.title.clone())
                .push_bind(row.rank)
                .push_bind(row.date)
                .push_bind(row.genre.clone());
        });
        qb.push(
            " ON CONFLICT (artist, title, date, genre) DO UPDATE SET \
                rank = EXCLUDED.rank, \
                scraped_at = CURRENT_TIMESTAMP",
        );
        affected += qb.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(affected)
}

async fn write_batch(conn: &mut PgConnection, rows: &[ChartRow]) -> Result<u64, sqlx::Error> {
    ensure_chart_table(conn).await?;
    let mut tx = conn.begin().await?;
    match upsert_rows(&mut *tx, rows).await {
        Ok(affected) => {
            tx.commit().await?;
            Ok(affected)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(%rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}

#[async_trait]
impl RecordSink for PostgresSink {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn persist(&self, records: &[TrackRecord]) -> Result<SinkReport, SinkError> {
        let rows = collapse_conflicts(
            records
                .iter()
                .map(|r| ChartRow::from_record(r, self.date))
                .collect(),
        );
        let mut conn = self.connect().await?;
        let result = write_batch(&mut conn, &rows).await;
        if let Err(err) = conn.close().await {
            warn!(%err, "closing database connection");
        }
        let affected = result?;
        info!(rows = rows.len(), affected, table = CHART_TABLE, "upserted chart rows");
        Ok(SinkReport {
            rows: rows.len(),
            target: format!("{} ({})", CHART_TABLE, self.db.describe()),
        })
    }
}

/// Creates the chart table if it does not exist.
pub async fn ensure_schema(db: &DbConfig) -> Result<()> {
    let options = db.connect_options()?;
    let mut conn = PgConnection::connect_with(&options)
        .await
        .with_context(|| format!("connecting to {}", db.describe()))?;
    let result = ensure_chart_table(&mut conn)
        .await
        .context("creating beatport_top100");
    if let Err(err) = conn.close().await {
        warn!(%err, "closing database connection");
    }
    result
}

pub fn sink_for(config: &ScrapeConfig, date: NaiveDate) -> Box<dyn RecordSink> {
    match config.sink {
        SinkKind::Csv => Box::new(CsvSink::new(config.output_dir.clone(), date)),
        SinkKind::Postgres => Box::new(PostgresSink::new(config.db.clone(), date)),
    }
}

/// Hands the records to the sink. Failures are logged and reported in the
/// status, never propagated.
pub async fn persist_records(sink: &dyn RecordSink, records: &[TrackRecord]) -> SinkStatus {
    match sink.persist(records).await {
        Ok(report) => SinkStatus::Written {
            sink: sink.name().to_string(),
            rows: report.rows,
            target: report.target,
        },
        Err(err) => {
            error!(sink = sink.name(), %err, "sink write failed; batch rolled back");
            SinkStatus::Failed {
                sink: sink.name().to_string(),
                error: err.to_string(),
            }
        }
    }
}

/// One full run: scrape every configured genre, then persist with the
/// configured sink.
pub async fn run_scrape_once(config: ScrapeConfig) -> Result<ScrapeRunSummary> {
    let date = Local::now().date_naive();
    let sink = sink_for(&config, date);
    let pipeline = ScrapePipeline::new(config)?;
    let outcome = pipeline.run().await;
    let mut summary = outcome.summary;
    summary.sink = persist_records(sink.as_ref(), &outcome.records).await;
    summary.finished_at = Utc::now();
    match serde_json::to_string(&summary) {
        Ok(json) => info!(summary = %json, "scrape run complete"),
        Err(err) => warn!(%err, "serializing run summary"),
    }
    Ok(summary)
}

pub async fn run_scrape_once_from_env() -> Result<ScrapeRunSummary> {
    run_scrape_once(ScrapeConfig::from_env()).await
}

/// Builds a cron scheduler that runs the scrape with `config` on
/// `config.scrape_cron`. Returns `None` when scheduling is disabled.
pub async fn maybe_build_scheduler(config: &ScrapeConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job_config = config.clone();
    let job = Job::new_async(config.scrape_cron.as_str(), move |_uuid, _l| {
        let config = job_config.clone();
        Box::pin(async move {
            match run_scrape_once(config).await {
                Ok(summary) => info!(run_id = %summary.run_id, records = summary.records, "scheduled scrape finished"),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled scrape failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.scrape_cron))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::extract::{Path as AxumPath, State};
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use chartwatch_storage::BackoffPolicy;
    use chrono::NaiveDateTime;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tempfile::tempdir;

    fn chart_page(rows: &[(&str, &[&str])]) -> String {
        let body = rows
            .iter()
            .map(|(title, artists)| {
                let links = artists
                    .iter()
                    .map(|a| format!(r#"<a href="/artist/{a}/1">{a}</a>"#))
                    .collect::<String>();
                format!(
                    r#"<div data-testid="tracks-table-row">
                         <a href="/track/x/1" title="{title}">{title}</a>
                         <div class="ArtistNames-sc-1">{links}</div>
                       </div>"#
                )
            })
            .collect::<String>();
        format!("<html><body>{body}</body></html>")
    }

    #[derive(Clone, Default)]
    struct Hits {
        broken: Arc<AtomicUsize>,
    }

    async fn genre_page(
        State(hits): State<Hits>,
        AxumPath((slug, _id)): AxumPath<(String, String)>,
    ) -> (StatusCode, String) {
        match slug.as_str() {
            "house" => (
                StatusCode::OK,
                chart_page(&[("Home", &["Frankie"]), ("Jack", &["A", "B"])]),
            ),
            "techno" => (StatusCode::OK, chart_page(&[("Pulse", &["C"])])),
            "broken" => {
                hits.broken.fetch_add(1, Ordering::SeqCst);
                (StatusCode::INTERNAL_SERVER_ERROR, "down".to_string())
            }
            _ => (
                StatusCode::OK,
                "<html><body><p>new layout</p></body></html>".to_string(),
            ),
        }
    }

    async fn spawn_site() -> (String, Hits) {
        let hits = Hits::default();
        let app = Router::new()
            .route("/genre/{slug}/{id}/top-100", get(genre_page))
            .with_state(hits.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), hits)
    }

    fn test_config(base: &str, slugs: &[&str]) -> ScrapeConfig {
        ScrapeConfig {
            targets: slugs
                .iter()
                .enumerate()
                .map(|(i, slug)| GenreTarget::from_url(format!("{base}/genre/{slug}/{i}/top-100")))
                .collect(),
            http: HttpClientConfig {
                timeout: Duration::from_secs(5),
                backoff: BackoffPolicy {
                    max_attempts: 3,
                    unit: Duration::from_millis(2),
                },
                ..Default::default()
            },
            pacing: PacingPolicy::none(),
            ..Default::default()
        }
    }

    fn record(genre: &str, rank: u32, title: &str, artists: &str) -> TrackRecord {
        TrackRecord {
            genre: genre.into(),
            rank,
            title: title.into(),
            artists: artists.into(),
        }
    }

    #[tokio::test]
    async fn failed_genre_is_skipped_and_run_continues() {
        let (base, hits) = spawn_site().await;
        let pipeline = ScrapePipeline::new(test_config(&base, &["broken", "house"])).unwrap();
        let outcome = pipeline.run().await;

        assert_eq!(hits.broken.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.summary.genres_attempted, 2);
        assert_eq!(outcome.summary.genres_fetched, 1);
        assert_eq!(outcome.summary.genres_failed, vec!["broken".to_string()]);
        assert_eq!(
            outcome.records,
            vec![
                record("house", 1, "Home", "Frankie"),
                record("house", 2, "Jack", "A & B"),
            ]
        );
    }

    #[tokio::test]
    async fn records_keep_genre_order_and_empty_genres_are_flagged() {
        let (base, _hits) = spawn_site().await;
        let pipeline =
            ScrapePipeline::new(test_config(&base, &["techno", "mystery", "house"])).unwrap();
        let outcome = pipeline.run().await;

        let order = outcome
            .records
            .iter()
            .map(|r| (r.genre.as_str(), r.rank))
            .collect::<Vec<_>>();
        assert_eq!(order, vec![("techno", 1), ("house", 1), ("house", 2)]);
        assert_eq!(outcome.summary.genres_empty, vec!["mystery".to_string()]);
        assert!(outcome.summary.genres_failed.is_empty());
        assert_eq!(outcome.summary.records, 3);
    }

    #[tokio::test]
    async fn fetched_pages_are_archived_when_configured() {
        let (base, _hits) = spawn_site().await;
        let dir = tempdir().unwrap();
        let mut config = test_config(&base, &["techno", "house"]);
        config.archive_dir = Some(dir.path().to_path_buf());
        config.pacing = PacingPolicy {
            base: Duration::from_millis(1100),
            jitter: Duration::ZERO,
        };
        let pipeline = ScrapePipeline::new(config).unwrap();
        pipeline.run().await;

        let stamp_dirs = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect::<Vec<_>>();
        assert_eq!(stamp_dirs.len(), 1, "one run shares one stamp: {stamp_dirs:?}");
        let mut slugs = std::fs::read_dir(&stamp_dirs[0])
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        slugs.sort();
        assert_eq!(slugs, vec!["house".to_string(), "techno".to_string()]);
    }

    #[tokio::test]
    async fn pipeline_pauses_between_genres_even_after_failures() {
        let (base, _hits) = spawn_site().await;
        let pacing = Duration::from_millis(40);
        let mut config = test_config(&base, &["broken", "house", "techno"]);
        config.pacing = PacingPolicy {
            base: pacing,
            jitter: Duration::ZERO,
        };
        let pipeline = ScrapePipeline::new(config).unwrap();

        let started = std::time::Instant::now();
        let outcome = pipeline.run().await;
        let elapsed = started.elapsed();

        assert_eq!(outcome.summary.genres_failed, vec!["broken".to_string()]);
        assert_eq!(outcome.summary.genres_fetched, 2);
        assert!(
            elapsed >= pacing * 2,
            "expected two pauses of {pacing:?}, run took {elapsed:?}"
        );
    }

    #[test]
    fn pacing_delay_stays_within_bounds() {
        let policy = PacingPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let delay = policy.next_delay(&mut rng);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_millis(2500));
        }
        assert_eq!(PacingPolicy::none().next_delay(&mut rng), Duration::ZERO);
    }

    #[test]
    fn sink_kind_parses_aliases() {
        assert_eq!("CSV".parse::<SinkKind>().unwrap(), SinkKind::Csv);
        assert_eq!("postgresql".parse::<SinkKind>().unwrap(), SinkKind::Postgres);
        assert!("parquet".parse::<SinkKind>().is_err());
    }

    #[test]
    fn genre_file_overrides_targets() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("genres.yaml");
        std::fs::write(
            &path,
            "genres:\n  - https://www.beatport.com/genre/house/5/top-100\n  - \"  \"\n  - https://example.com/custom\n",
        )
        .unwrap();
        let targets = load_genre_targets(&path).unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].slug, "house");
        assert_eq!(targets[1].slug, "https://example.com/custom");
    }

    #[test]
    fn csv_has_fixed_header_and_column_order() {
        let bytes = render_csv(&[record("deep-house", 1, "Title, with comma", "A & B")]).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(
            text,
            "genre,title,artists,rank\r\ndeep-house,\"Title, with comma\",A & B,1\r\n"
        );
    }

    #[tokio::test]
    async fn csv_sink_writes_dated_file_even_when_empty() {
        let dir = tempdir().unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();
        let sink = CsvSink::new(dir.path().join("out"), date);
        let status = persist_records(&sink, &[]).await;
        assert!(matches!(status, SinkStatus::Written { rows: 0, .. }));

        let path = dir.path().join("out").join("beatport_top100_2026-10-16.csv");
        let mut reader = csv::Reader::from_path(&path).unwrap();
        assert_eq!(
            reader.headers().unwrap().iter().collect::<Vec<_>>(),
            CSV_HEADER.to_vec()
        );
        assert_eq!(reader.records().count(), 0);
    }

    #[tokio::test]
    async fn csv_sink_round_trips_records() {
        let dir = tempdir().unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();
        let sink = CsvSink::new(dir.path(), date);
        let records = vec![
            record("house", 1, "Home", "Frankie"),
            record("house", 2, "Jack", "A & B"),
        ];
        sink.persist(&records).await.unwrap();

        let mut reader = csv::Reader::from_path(sink.path()).unwrap();
        let rows = reader
            .records()
            .map(|r| r.unwrap().iter().map(str::to_string).collect::<Vec<_>>())
            .collect::<Vec<_>>();
        assert_eq!(rows[1], vec!["house", "Jack", "A & B", "2"]);
    }

    #[test]
    fn collapse_conflicts_keeps_latest_rank() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();
        let rows = vec![
            ChartRow::from_record(&record("house", 3, "Dup", "X"), date),
            ChartRow::from_record(&record("house", 4, "Other", "Y"), date),
            ChartRow::from_record(&record("house", 9, "Dup", "X"), date),
        ];
        let out = collapse_conflicts(rows);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].title, "Dup");
        assert_eq!(out[0].rank, 9);
    }

    #[tokio::test]
    async fn unreachable_database_is_reported_not_raised() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let db = DbConfig {
            host: "127.0.0.1".into(),
            port,
            ..Default::default()
        };
        let sink = PostgresSink::new(db, NaiveDate::from_ymd_opt(2026, 10, 16).unwrap());
        let status = persist_records(&sink, &[record("house", 1, "T", "A")]).await;
        assert!(matches!(status, SinkStatus::Failed { .. }));
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL"]
    async fn postgres_upsert_is_idempotent_per_day() {
        let db = DbConfig {
            database_url: Some(std::env::var("DATABASE_URL").unwrap()),
            ..Default::default()
        };
        let genre = format!("test-{}", Uuid::new_v4());
        let date = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();
        let sink = PostgresSink::new(db.clone(), date);

        let mut conn = PgConnection::connect_with(&db.connect_options().unwrap())
            .await
            .unwrap();
        let select = "SELECT rank, scraped_at FROM beatport_top100 WHERE genre = $1";

        sink.persist(&[record(&genre, 5, "Same", "Artist")]).await.unwrap();
        let first: Vec<(i32, NaiveDateTime)> = sqlx::query_as(select)
            .bind(&genre)
            .fetch_all(&mut conn)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        sink.persist(&[record(&genre, 2, "Same", "Artist")]).await.unwrap();
        let second: Vec<(i32, NaiveDateTime)> = sqlx::query_as(select)
            .bind(&genre)
            .fetch_all(&mut conn)
            .await
            .unwrap();
        sqlx::query("DELETE FROM beatport_top100 WHERE genre = $1")
            .bind(&genre)
            .execute(&mut conn)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].0, 2);
        assert!(second[0].1 > first[0].1, "scraped_at should advance on update");
    }
}
