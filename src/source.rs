//! Message source: the ordered stream of chat messages to mine.
//!
//! [`SqliteSource`] reads from a single table whose columns are detected
//! with `PRAGMA table_info`:
//!
//! | Role          | Column                                   | Required |
//! |---------------|------------------------------------------|----------|
//! | id            | `id`                                     | yes      |
//! | text          | first of `text`, `message`, `content`, `body` | yes |
//! | date          | `date`                                   | no       |
//! | topic id      | `topic_id`                               | no       |
//! | topic title   | `topic_title`                            | no       |
//!
//! Rows are always returned in ascending id order, starting strictly after
//! the caller's watermark. A topic filter whose column does not exist is
//! ignored with a warning.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use sqlx::Sqlite;
use sqlx::Row;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::is_plain_identifier;
use crate::db;
use crate::models::Message;

const TEXT_COLUMN_CANDIDATES: [&str; 4] = ["text", "message", "content", "body"];

/// Row filters pushed down into the query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFilters {
    /// Minimum text length in characters.
    pub min_text_len: Option<usize>,
    pub topic_id: Option<i64>,
    /// Substring match on the topic title.
    pub topic_title_contains: Option<String>,
    /// Cap on rows returned per fetch.
    pub limit_rows: Option<usize>,
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("database not found: {}", .0.display())]
    Missing(PathBuf),
    #[error("invalid table name '{0}'")]
    InvalidTable(String),
    #[error("table '{0}' does not exist")]
    NoSuchTable(String),
    #[error("table '{table}' must have an `id` column (found: {columns})")]
    MissingId { table: String, columns: String },
    #[error("table '{table}' must have one of text|message|content|body (found: {columns})")]
    MissingText { table: String, columns: String },
    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),
}

/// Where messages come from.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Human-readable description for logs and the run report.
    fn describe(&self) -> String;

    /// Messages with `id > after_id` matching `filters`, ascending by id.
    async fn fetch_messages(
        &self,
        after_id: i64,
        filters: &MessageFilters,
    ) -> Result<Vec<Message>, SourceError>;

    /// How many messages [`MessageSource::fetch_messages`] would return.
    async fn count_messages(
        &self,
        after_id: i64,
        filters: &MessageFilters,
    ) -> Result<u64, SourceError>;
}

/// Detected column layout of the source table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMap {
    pub text: String,
    pub date: Option<String>,
    pub topic_id: Option<String>,
    pub topic_title: Option<String>,
}

impl ColumnMap {
    /// Pick roles from the table's column names.
    pub fn detect(table: &str, columns: &[String]) -> Result<Self, SourceError> {
        let has = |name: &str| columns.iter().any(|c| c == name);
        let listing = || columns.join(", ");

        if !has("id") {
            return Err(SourceError::MissingId {
                table: table.to_string(),
                columns: listing(),
            });
        }
        let text = TEXT_COLUMN_CANDIDATES
            .iter()
            .find(|&&c| has(c))
            .ok_or_else(|| SourceError::MissingText {
                table: table.to_string(),
                columns: listing(),
            })?;

        let optional = |name: &str| has(name).then(|| name.to_string());
        Ok(Self {
            text: text.to_string(),
            date: optional("date"),
            topic_id: optional("topic_id"),
            topic_title: optional("topic_title"),
        })
    }
}

enum Bind {
    Int(i64),
    Text(String),
}

pub struct SqliteSource {
    pool: SqlitePool,
    db_path: PathBuf,
    table: String,
    columns: ColumnMap,
}

impl SqliteSource {
    /// Open `db_path` read-only and detect the layout of `table`.
    pub async fn open(db_path: &Path, table: &str) -> Result<Self, SourceError> {
        if !is_plain_identifier(table) {
            return Err(SourceError::InvalidTable(table.to_string()));
        }
        if !db_path.is_file() {
            return Err(SourceError::Missing(db_path.to_path_buf()));
        }

        let pool = db::connect_readonly(db_path).await?;

        let rows = sqlx::query(&format!("PRAGMA table_info(\"{}\")", table))
            .fetch_all(&pool)
            .await?;
        let columns: Vec<String> = rows
            .iter()
            .map(|r| r.try_get::<String, _>("name"))
            .collect::<Result<_, _>>()?;
        if columns.is_empty() {
            return Err(SourceError::NoSuchTable(table.to_string()));
        }

        let columns = ColumnMap::detect(table, &columns)?;
        debug!(table, ?columns, "detected source columns");

        Ok(Self {
            pool,
            db_path: db_path.to_path_buf(),
            table: table.to_string(),
            columns,
        })
    }

    pub fn columns(&self) -> &ColumnMap {
        &self.columns
    }

    /// `WHERE` clause and its bind values, shared by fetch and count.
    fn where_clause(&self, after_id: i64, filters: &MessageFilters) -> (String, Vec<Bind>) {
        let text = &self.columns.text;
        let mut clauses = vec!["\"id\" > ?".to_string(), format!("\"{}\" IS NOT NULL", text)];
        let mut binds = vec![Bind::Int(after_id)];

        if let Some(min) = filters.min_text_len {
            clauses.push(format!("length(\"{}\") >= ?", text));
            binds.push(Bind::Int(min as i64));
        }
        if let Some(topic_id) = filters.topic_id {
            match self.columns.topic_id {
                Some(ref col) => {
                    clauses.push(format!("\"{}\" = ?", col));
                    binds.push(Bind::Int(topic_id));
                }
                None => warn!(table = %self.table, "no topic_id column; topic id filter ignored"),
            }
        }
        if let Some(ref needle) = filters.topic_title_contains {
            match self.columns.topic_title {
                Some(ref col) => {
                    clauses.push(format!("\"{}\" LIKE ?", col));
                    binds.push(Bind::Text(format!("%{}%", needle)));
                }
                None => {
                    warn!(table = %self.table, "no topic_title column; topic title filter ignored")
                }
            }
        }

        (clauses.join(" AND "), binds)
    }

    fn select_list(&self) -> String {
        let cols = &self.columns;
        let mut select = vec![
            "\"id\" AS id".to_string(),
            format!("CAST(\"{}\" AS TEXT) AS text", cols.text),
        ];
        select.push(match cols.date {
            Some(ref c) => format!("CAST(\"{}\" AS TEXT) AS date", c),
            None => "NULL AS date".to_string(),
        });
        select.push(match cols.topic_id {
            Some(ref c) => format!("CAST(\"{}\" AS INTEGER) AS topic_id", c),
            None => "NULL AS topic_id".to_string(),
        });
        select.push(match cols.topic_title {
            Some(ref c) => format!("CAST(\"{}\" AS TEXT) AS topic_title", c),
            None => "NULL AS topic_title".to_string(),
        });
        select.join(", ")
    }
}

#[async_trait]
impl MessageSource for SqliteSource {
    fn describe(&self) -> String {
        format!("sqlite:{}#{}", self.db_path.display(), self.table)
    }

    async fn fetch_messages(
        &self,
        after_id: i64,
        filters: &MessageFilters,
    ) -> Result<Vec<Message>, SourceError> {
        let (clause, binds) = self.where_clause(after_id, filters);
        let mut sql = format!(
            "SELECT {} FROM \"{}\" WHERE {} ORDER BY \"id\" ASC",
            self.select_list(),
            self.table,
            clause
        );
        if filters.limit_rows.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query::<Sqlite>(&sql);
        for bind in binds {
            query = match bind {
                Bind::Int(v) => query.bind(v),
                Bind::Text(v) => query.bind(v),
            };
        }
        if let Some(limit) = filters.limit_rows {
            query = query.bind(limit as i64);
        }

        let rows = query.fetch_all(&self.pool).await?;
        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            messages.push(Message {
                id: row.try_get("id")?,
                text: row.try_get::<Option<String>, _>("text")?.unwrap_or_default(),
                date: row.try_get("date")?,
                topic_id: row.try_get("topic_id")?,
                topic_title: row.try_get("topic_title")?,
            });
        }
        Ok(messages)
    }

    async fn count_messages(
        &self,
        after_id: i64,
        filters: &MessageFilters,
    ) -> Result<u64, SourceError> {
        let (clause, binds) = self.where_clause(after_id, filters);
        let sql = format!("SELECT COUNT(*) FROM \"{}\" WHERE {}", self.table, clause);

        let mut query = sqlx::query_scalar::<Sqlite, i64>(&sql);
        for bind in binds {
            query = match bind {
                Bind::Int(v) => query.bind(v),
                Bind::Text(v) => query.bind(v),
            };
        }
        let count = query.fetch_one(&self.pool).await?.max(0) as u64;

        Ok(match filters.limit_rows {
            Some(limit) => count.min(limit as u64),
            None => count,
        })
    }
}
