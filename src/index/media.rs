//! SQLite media index.
//!
//! Query syntax: whitespace separated terms, all of which must match.
//! A term is either `field:value` or a bare word matched against the title.
//! Values containing spaces are double-quoted (`title:"the matrix"`).
//! Text fields match case-insensitive substrings, numeric fields match
//! exactly.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{IndexError, Record, StorageIndex, FILENAME_SEPARATOR};

/// Category of an indexed file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Movie,
    Episode,
}

impl MediaKind {
    fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Movie => "movie",
            MediaKind::Episode => "episode",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "movie" => Some(MediaKind::Movie),
            "episode" => Some(MediaKind::Episode),
            _ => None,
        }
    }
}

/// One row of the index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRecord {
    pub kind: MediaKind,
    pub title: String,
    pub year: Option<i32>,
    pub series: Option<String>,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    pub path: PathBuf,
}

impl MediaRecord {
    pub fn movie(title: impl Into<String>, year: Option<i32>, path: impl Into<PathBuf>) -> Self {
        Self {
            kind: MediaKind::Movie,
            title: title.into(),
            year,
            series: None,
            season: None,
            episode: None,
            path: path.into(),
        }
    }

    pub fn episode(
        series: impl Into<String>,
        season: u32,
        episode: u32,
        title: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            kind: MediaKind::Episode,
            title: title.into(),
            year: None,
            series: Some(series.into()),
            season: Some(season),
            episode: Some(episode),
            path: path.into(),
        }
    }

    /// Human readable part of the record
    pub fn describe(&self) -> String {
        match self.kind {
            MediaKind::Movie => match self.year {
                Some(year) => format!("{} ({})", self.title, year),
                None => self.title.clone(),
            },
            MediaKind::Episode => {
                let head = format!(
                    "{} S{:02}E{:02}",
                    self.series.as_deref().unwrap_or("Unknown"),
                    self.season.unwrap_or(0),
                    self.episode.unwrap_or(0)
                );
                if self.title.is_empty() {
                    head
                } else {
                    format!("{} - {}", head, self.title)
                }
            }
        }
    }

    /// Render the record the way it is returned to callers: the description,
    /// then the file name a friend can download it by.
    pub fn render(&self) -> Record {
        format!(
            "{}{}{}",
            self.describe(),
            FILENAME_SEPARATOR,
            self.path.to_string_lossy()
        )
    }
}

/// A parsed query term
#[derive(Debug, Clone, PartialEq)]
enum Term {
    Kind(MediaKind),
    Text { column: &'static str, value: String },
    Number { column: &'static str, value: i64 },
}

/// Media index backed by SQLite
pub struct MediaIndex {
    conn: Arc<Mutex<Connection>>,
}

impl MediaIndex {
    /// Open or create an index database
    pub fn open(path: &Path) -> Result<Self, IndexError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                IndexError::unavailable(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| {
            IndexError::unavailable(format!("cannot open {}: {}", path.display(), e))
        })?;
        Self::from_connection(conn)
    }

    /// Open an in-memory index (for testing)
    pub fn open_in_memory() -> Result<Self, IndexError> {
        let conn = Connection::open_in_memory().map_err(sqlite_unavailable)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, IndexError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS media (
                path TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                title TEXT NOT NULL,
                year INTEGER,
                series TEXT,
                season INTEGER,
                episode INTEGER
            );
            "#,
        )
        .map_err(sqlite_unavailable)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert a record, replacing any previous record for the same path
    pub fn upsert(&self, record: &MediaRecord) -> Result<(), IndexError> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO media (path, kind, title, year, series, season, episode)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                record.path.to_string_lossy(),
                record.kind.as_str(),
                record.title,
                record.year,
                record.series,
                record.season,
                record.episode,
            ],
        )
        .map_err(sqlite_unavailable)?;
        Ok(())
    }

    /// Number of indexed files
    pub fn len(&self) -> Result<usize, IndexError> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM media", [], |row| row.get(0))
            .map_err(sqlite_unavailable)?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool, IndexError> {
        Ok(self.len()? == 0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, IndexError> {
        self.conn
            .lock()
            .map_err(|_| IndexError::unavailable("index lock poisoned"))
    }

    fn run_query(conn: &Connection, terms: &[Term]) -> Result<Vec<Record>, IndexError> {
        let mut clauses = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        for term in terms {
            values.push(match term {
                Term::Kind(kind) => {
                    clauses.push(format!("kind = ?{}", values.len() + 1));
                    Value::Text(kind.as_str().to_string())
                }
                Term::Text { column, value } => {
                    clauses.push(format!(
                        "{} LIKE ?{} ESCAPE '\\'",
                        column,
                        values.len() + 1
                    ));
                    Value::Text(format!("%{}%", escape_like(value)))
                }
                Term::Number { column, value } => {
                    clauses.push(format!("{} = ?{}", column, values.len() + 1));
                    Value::Integer(*value)
                }
            });
        }

        let sql = format!(
            "SELECT kind, title, year, series, season, episode, path FROM media WHERE {} \
             ORDER BY COALESCE(series, title) COLLATE NOCASE, season, episode, title COLLATE NOCASE, path",
            clauses.join(" AND ")
        );

        let mut stmt = conn.prepare(&sql).map_err(sqlite_unavailable)?;
        let mut rows = stmt
            .query(params_from_iter(values.iter()))
            .map_err(sqlite_unavailable)?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().map_err(sqlite_unavailable)? {
            let kind: String = row.get(0).map_err(sqlite_unavailable)?;
            let Some(kind) = MediaKind::parse(&kind) else {
                warn!(kind = %kind, "Skipping row with unknown media kind");
                continue;
            };
            let path: String = row.get(6).map_err(sqlite_unavailable)?;
            let record = MediaRecord {
                kind,
                title: row.get(1).map_err(sqlite_unavailable)?,
                year: row.get(2).map_err(sqlite_unavailable)?,
                series: row.get(3).map_err(sqlite_unavailable)?,
                season: row.get(4).map_err(sqlite_unavailable)?,
                episode: row.get(5).map_err(sqlite_unavailable)?,
                path: PathBuf::from(path),
            };
            records.push(record.render());
        }

        Ok(records)
    }
}

#[async_trait]
impl StorageIndex for MediaIndex {
    async fn query(&self, text: &str) -> Result<Vec<Record>, IndexError> {
        let terms = parse_query(text)?;
        debug!(query = %text, terms = terms.len(), "Running index query");

        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| IndexError::unavailable("index lock poisoned"))?;
            Self::run_query(&conn, &terms)
        })
        .await
        .map_err(|e| IndexError::unavailable(format!("index task failed: {}", e)))?
    }
}

fn sqlite_unavailable(e: rusqlite::Error) -> IndexError {
    IndexError::unavailable(format!("SQLite error: {}", e))
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Split on whitespace outside double quotes; quotes are dropped.
fn tokenize(text: &str) -> Result<Vec<String>, IndexError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut quoted = false;

    for c in text.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                quoted = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() || quoted {
                    tokens.push(std::mem::take(&mut current));
                }
                quoted = false;
            }
            c => current.push(c),
        }
    }

    if in_quotes {
        return Err(IndexError::malformed("unbalanced quote"));
    }
    if !current.is_empty() || quoted {
        tokens.push(current);
    }

    Ok(tokens)
}

fn parse_query(text: &str) -> Result<Vec<Term>, IndexError> {
    let tokens = tokenize(text)?;
    if tokens.is_empty() {
        return Err(IndexError::malformed("empty query"));
    }

    tokens.iter().map(|token| parse_term(token)).collect()
}

fn parse_term(token: &str) -> Result<Term, IndexError> {
    let Some((field, value)) = token.split_once(':') else {
        if token.is_empty() {
            return Err(IndexError::malformed("empty term"));
        }
        return Ok(Term::Text {
            column: "title",
            value: token.to_string(),
        });
    };

    if value.is_empty() {
        return Err(IndexError::malformed(format!("no value for field '{}'", field)));
    }

    match field.to_lowercase().as_str() {
        "type" | "kind" => MediaKind::parse(&value.to_lowercase())
            .map(Term::Kind)
            .ok_or_else(|| IndexError::malformed(format!("unknown media type '{}'", value))),
        "title" => Ok(text_term("title", value)),
        "series" => Ok(text_term("series", value)),
        "path" => Ok(text_term("path", value)),
        "year" => number_term("year", value),
        "season" => number_term("season", value),
        "episode" => number_term("episode", value),
        other => Err(IndexError::malformed(format!("unknown field '{}'", other))),
    }
}

fn text_term(column: &'static str, value: &str) -> Term {
    Term::Text {
        column,
        value: value.to_string(),
    }
}

fn number_term(column: &'static str, value: &str) -> Result<Term, IndexError> {
    value
        .parse::<i64>()
        .map(|value| Term::Number { column, value })
        .map_err(|_| IndexError::malformed(format!("'{}' expects a number, got '{}'", column, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index() -> MediaIndex {
        let index = MediaIndex::open_in_memory().unwrap();
        index
            .upsert(&MediaRecord::movie("The Matrix", Some(1999), "Movies/The.Matrix.1999.avi"))
            .unwrap();
        index
            .upsert(&MediaRecord::movie("Alien", Some(1979), "Movies/Alien.mkv"))
            .unwrap();
        index
            .upsert(&MediaRecord::movie("The Matrix Reloaded", None, "Movies/reloaded.avi"))
            .unwrap();
        index
            .upsert(&MediaRecord::episode("Black Adder", 1, 2, "Born to be King", "tv/ba.s01e02.avi"))
            .unwrap();
        index
            .upsert(&MediaRecord::episode("Black Adder", 1, 1, "", "tv/ba.s01e01.avi"))
            .unwrap();
        index
    }

    /// Descriptions only, file names dropped
    fn described(records: Vec<Record>) -> Vec<String> {
        records
            .iter()
            .map(|r| match r.split_once(FILENAME_SEPARATOR) {
                Some((description, _)) => description.to_string(),
                None => r.clone(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_movies_query() {
        let index = sample_index();
        let records = described(index.query_movies().await.unwrap());
        assert_eq!(
            records,
            vec!["Alien (1979)", "The Matrix (1999)", "The Matrix Reloaded"]
        );
    }

    #[tokio::test]
    async fn test_title_field() {
        let index = sample_index();
        let records = described(index.query("title:matrix").await.unwrap());
        assert_eq!(records, vec!["The Matrix (1999)", "The Matrix Reloaded"]);
    }

    #[tokio::test]
    async fn test_terms_are_anded() {
        let index = sample_index();
        let records = described(index.query("matrix year:1999").await.unwrap());
        assert_eq!(records, vec!["The Matrix (1999)"]);
    }

    #[tokio::test]
    async fn test_records_carry_file_name() {
        let index = sample_index();
        let records = index.query("path:movies/the").await.unwrap();
        assert_eq!(records, vec!["The Matrix (1999)\tMovies/The.Matrix.1999.avi"]);
        assert_eq!(
            crate::index::record_filename(&records[0]),
            Some("Movies/The.Matrix.1999.avi")
        );
    }

    #[tokio::test]
    async fn test_quoted_value() {
        let index = sample_index();
        let records = described(index.query("title:\"matrix reloaded\"").await.unwrap());
        assert_eq!(records, vec!["The Matrix Reloaded"]);
    }

    #[tokio::test]
    async fn test_episodes_ordered_by_season_and_episode() {
        let index = sample_index();
        let records = described(index.query("series:adder").await.unwrap());
        assert_eq!(
            records,
            vec![
                "Black Adder S01E01",
                "Black Adder S01E02 - Born to be King"
            ]
        );
    }

    #[tokio::test]
    async fn test_like_wildcards_are_literal() {
        let index = sample_index();
        assert!(index.query("title:%").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_match_is_empty() {
        let index = sample_index();
        assert!(index.query("title:zardoz").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_queries() {
        let index = sample_index();
        for query in ["", "   ", "foo:bar", "year:abc", "title:", "type:song", "title:\"open"] {
            let result = index.query(query).await;
            assert!(
                matches!(result, Err(IndexError::MalformedQuery(_))),
                "expected malformed for {:?}, got {:?}",
                query,
                result
            );
        }
    }

    #[test]
    fn test_upsert_replaces_by_path() {
        let index = MediaIndex::open_in_memory().unwrap();
        index.upsert(&MediaRecord::movie("Old", None, "/a.avi")).unwrap();
        index.upsert(&MediaRecord::movie("New", None, "/a.avi")).unwrap();
        assert_eq!(index.len().unwrap(), 1);
    }

    #[test]
    fn test_open_on_disk() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("index.db");
        let index = MediaIndex::open(&path).unwrap();
        assert!(index.is_empty().unwrap());
        assert!(path.exists());
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("a  title:\"b c\" d").unwrap(),
            vec!["a", "title:b c", "d"]
        );
        assert_eq!(tokenize("title:\"\"").unwrap(), vec!["title:"]);
        assert!(tokenize("\"x").is_err());
    }

    #[test]
    fn test_render() {
        assert_eq!(MediaRecord::movie("Brazil", None, "Brazil.avi").describe(), "Brazil");
        assert_eq!(
            MediaRecord::movie("Brazil", None, "Brazil.avi").render(),
            "Brazil\tBrazil.avi"
        );
        assert_eq!(
            MediaRecord::episode("Lost", 2, 10, "Pilot", "Lost/lost.s02e10.avi").render(),
            "Lost S02E10 - Pilot\tLost/lost.s02e10.avi"
        );
    }
}
