// ABOUTME: SQLite-backed artifact store using sqlx
// ABOUTME: Single-statement upserts give atomic replacement and version bumps

use super::{validate_name, ArtifactError, ArtifactStore, Result};
use crate::types::CodeArtifact;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};

pub struct SqliteArtifactStore {
    pool: SqlitePool,
}

fn read_err(e: sqlx::Error) -> ArtifactError {
    ArtifactError::ReadFailure(e.to_string())
}

fn write_err(e: sqlx::Error) -> ArtifactError {
    ArtifactError::WriteFailure(e.to_string())
}

fn parse_timestamp(column: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ArtifactError::ReadFailure(format!("bad {} '{}': {}", column, value, e)))
}

impl SqliteArtifactStore {
    /// Connect to `database_url`, creating the file if needed, and run migrations
    pub async fn open(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(write_err)?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(write_err)?;

        let store = Self::new(pool);
        store.migrate().await?;

        info!("Opened SQLite artifact store at {}", database_url);
        Ok(store)
    }

    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| ArtifactError::WriteFailure(format!("migration failed: {}", e)))
    }

    fn row_to_artifact(row: SqliteRow) -> Result<CodeArtifact> {
        let last_run_at = row
            .get::<Option<String>, _>("last_run_at")
            .map(|s| parse_timestamp("last_run_at", &s))
            .transpose()?;

        Ok(CodeArtifact {
            name: row.get("name"),
            source: row.get("source"),
            created_at: parse_timestamp("created_at", &row.get::<String, _>("created_at"))?,
            updated_at: parse_timestamp("updated_at", &row.get::<String, _>("updated_at"))?,
            last_run_at,
            version: row.get("version"),
        })
    }
}

#[async_trait]
impl ArtifactStore for SqliteArtifactStore {
    async fn save(&self, name: &str, source: &str) -> Result<CodeArtifact> {
        validate_name(name)?;

        let now = Utc::now().to_rfc3339();
        let row = sqlx::query(
            r#"
            INSERT INTO artifacts (name, source, created_at, updated_at, version)
            VALUES (?1, ?2, ?3, ?3, 1)
            ON CONFLICT(name) DO UPDATE SET
                source = excluded.source,
                updated_at = excluded.updated_at,
                version = artifacts.version + 1
            RETURNING name, source, created_at, updated_at, last_run_at, version
            "#,
        )
        .bind(name)
        .bind(source)
        .bind(&now)
        .fetch_one(&self.pool)
        .await
        .map_err(write_err)?;

        let artifact = Self::row_to_artifact(row)?;
        debug!("Saved artifact {} (version {})", name, artifact.version);
        Ok(artifact)
    }

    async fn load(&self, name: &str) -> Result<CodeArtifact> {
        validate_name(name)?;

        let row = sqlx::query(
            r#"
            SELECT name, source, created_at, updated_at, last_run_at, version
            FROM artifacts
            WHERE name = ?1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(read_err)?;

        match row {
            Some(row) => Self::row_to_artifact(row),
            None => Err(ArtifactError::NotFound(name.to_string())),
        }
    }

    async fn list(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT name FROM artifacts ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(read_err)?;

        Ok(rows.into_iter().map(|row| row.get("name")).collect())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        validate_name(name)?;

        let result = sqlx::query("DELETE FROM artifacts WHERE name = ?1")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(write_err)?;

        if result.rows_affected() == 0 {
            return Err(ArtifactError::NotFound(name.to_string()));
        }
        info!("Deleted artifact {}", name);
        Ok(())
    }

    async fn mark_run(&self, name: &str, at: DateTime<Utc>) -> Result<()> {
        validate_name(name)?;

        let result = sqlx::query("UPDATE artifacts SET last_run_at = ?1 WHERE name = ?2")
            .bind(at.to_rfc3339())
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(write_err)?;

        if result.rows_affected() == 0 {
            return Err(ArtifactError::NotFound(name.to_string()));
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "sqlite"
    }
}
