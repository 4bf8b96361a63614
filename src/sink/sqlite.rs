//! SQLite-backed [`Sink`].
//!
//! Relations are created from their [`Relation`] schema on first use.
//! Each session holds one pooled connection for its whole lifetime, so
//! concurrent loader workers never share a connection. Timestamps are stored
//! as microseconds since the Unix epoch.

use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::{Connection, QueryBuilder, Sqlite, SqlitePool};
use tracing::info;

use crate::error::IngestError;
use crate::models::{FileRecord, LineRecord};

use super::{
    ColumnType, Provisioned, RangeDeletion, Relation, Sink, SinkSession, LOG_FILES, LOG_LINES,
};

/// Rows per INSERT statement; keeps bind parameters well under SQLite's limit.
const MAX_ROWS_PER_STATEMENT: usize = 1000;

/// SQLite implementation of the [`Sink`] trait.
pub struct SqliteSink {
    pool: SqlitePool,
}

impl SqliteSink {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn relation_exists(&self, name: &str) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
    }

    async fn ensure_indexes(&self, relation: &Relation) -> Result<(), sqlx::Error> {
        for (index, columns) in relation.indexes {
            let sql = format!(
                "CREATE INDEX IF NOT EXISTS {} ON {}({})",
                index, relation.name, columns
            );
            sqlx::query(&sql).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn sql_type(ty: ColumnType) -> &'static str {
    match ty {
        ColumnType::Integer | ColumnType::Timestamp => "INTEGER",
        ColumnType::Text => "TEXT",
    }
}

fn create_table_sql(relation: &Relation) -> String {
    let mut defs: Vec<String> = relation
        .columns
        .iter()
        .map(|c| {
            let mut def = format!("{} {}", c.name, sql_type(c.ty));
            if c.required {
                def.push_str(" NOT NULL");
            }
            if relation.primary_key == Some(c.name) {
                def.push_str(" PRIMARY KEY");
            }
            def
        })
        .collect();

    if let Some((column, target, target_column)) = relation.foreign_key {
        defs.push(format!(
            "FOREIGN KEY ({}) REFERENCES {}({})",
            column, target, target_column
        ));
    }

    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        relation.name,
        defs.join(",\n    ")
    )
}

#[async_trait]
impl Sink for SqliteSink {
    async fn ensure_relation(&self, relation: &Relation) -> Result<Provisioned, IngestError> {
        let exists = self
            .relation_exists(relation.name)
            .await
            .map_err(|e| IngestError::provisioning(relation.name, e))?;

        if !exists {
            sqlx::query(&create_table_sql(relation))
                .execute(&self.pool)
                .await
                .map_err(|e| IngestError::provisioning(relation.name, e))?;
        }

        self.ensure_indexes(relation)
            .await
            .map_err(|e| IngestError::provisioning(relation.name, e))?;

        Ok(if exists {
            Provisioned::Exists
        } else {
            Provisioned::Created
        })
    }

    async fn open_session(&self) -> Result<Box<dyn SinkSession>, IngestError> {
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| IngestError::persistence(LOG_FILES.name, e))?;
        Ok(Box::new(SqliteSession { conn }))
    }

    async fn query_max_modified_time(
        &self,
        system_tag: &str,
    ) -> Result<Option<DateTime<Utc>>, IngestError> {
        let query_err = |e: sqlx::Error| IngestError::WatermarkQuery {
            system: system_tag.to_string(),
            message: e.to_string(),
        };

        // No relation yet means no rows for anyone.
        if !self.relation_exists(LOG_FILES.name).await.map_err(query_err)? {
            return Ok(None);
        }

        let max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(modified_at) FROM log_files WHERE sys = ?")
                .bind(system_tag)
                .fetch_one(&self.pool)
                .await
                .map_err(query_err)?;

        match max {
            None => Ok(None),
            Some(micros) => DateTime::from_timestamp_micros(micros)
                .map(Some)
                .ok_or_else(|| IngestError::WatermarkQuery {
                    system: system_tag.to_string(),
                    message: format!("stored modified_at {} is out of range", micros),
                }),
        }
    }

    async fn delete_rows_in_range(
        &self,
        system_tag: &str,
        from: DateTime<Utc>,
    ) -> Result<RangeDeletion, IngestError> {
        let cleanup_err = |e: sqlx::Error| IngestError::Cleanup {
            system: system_tag.to_string(),
            message: e.to_string(),
        };

        if !self.relation_exists(LOG_FILES.name).await.map_err(cleanup_err)?
            || !self.relation_exists(LOG_LINES.name).await.map_err(cleanup_err)?
        {
            return Ok(RangeDeletion::default());
        }

        let started = Instant::now();
        let from_micros = from.timestamp_micros();
        let mut tx = self.pool.begin().await.map_err(cleanup_err)?;

        let lines = sqlx::query(
            r#"
            DELETE FROM log_lines WHERE file_id IN (
                SELECT id FROM log_files WHERE sys = ? AND modified_at >= ?
            )
            "#,
        )
        .bind(system_tag)
        .bind(from_micros)
        .execute(&mut *tx)
        .await
        .map_err(cleanup_err)?
        .rows_affected();

        let files = sqlx::query("DELETE FROM log_files WHERE sys = ? AND modified_at >= ?")
            .bind(system_tag)
            .bind(from_micros)
            .execute(&mut *tx)
            .await
            .map_err(cleanup_err)?
            .rows_affected();

        tx.commit().await.map_err(cleanup_err)?;

        info!(
            "Range delete finished in {:?}: {} file rows, {} line rows affected",
            started.elapsed(),
            files,
            lines
        );
        Ok(RangeDeletion { files, lines })
    }
}

struct SqliteSession {
    conn: PoolConnection<Sqlite>,
}

#[async_trait]
impl SinkSession for SqliteSession {
    async fn insert_files(&mut self, rows: &[FileRecord]) -> Result<(), IngestError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut tx = self
            .conn
            .begin()
            .await
            .map_err(|e| IngestError::persistence(LOG_FILES.name, e))?;

        for chunk in rows.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("INSERT INTO log_files (id, sys, path, modified_at, size) ");
            builder.push_values(chunk, |mut b, r| {
                b.push_bind(r.id)
                    .push_bind(&r.system_tag)
                    .push_bind(&r.path)
                    .push_bind(r.modified_at.timestamp_micros())
                    .push_bind(r.size_bytes);
            });
            builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|e| IngestError::persistence(LOG_FILES.name, e))?;
        }

        tx.commit()
            .await
            .map_err(|e| IngestError::persistence(LOG_FILES.name, e))
    }

    async fn insert_lines(&mut self, rows: &[LineRecord]) -> Result<(), IngestError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut tx = self
            .conn
            .begin()
            .await
            .map_err(|e| IngestError::persistence(LOG_LINES.name, e))?;

        for chunk in rows.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("INSERT INTO log_lines (file_id, line_num, line_text) ");
            builder.push_values(chunk, |mut b, r| {
                b.push_bind(r.file_id)
                    .push_bind(r.line_number)
                    .push_bind(&r.text);
            });
            builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|e| IngestError::persistence(LOG_LINES.name, e))?;
        }

        tx.commit()
            .await
            .map_err(|e| IngestError::persistence(LOG_LINES.name, e))
    }

    async fn close(self: Box<Self>) -> Result<(), IngestError> {
        // Dropping the pooled connection returns it to the pool.
        drop(self.conn);
        Ok(())
    }
}
