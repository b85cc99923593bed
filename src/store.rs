//! SQLite-backed store for games, branches, rounds, and tags.
//!
//! One logical connection (single-connection pool) with WAL journaling,
//! foreign keys on, and a 5 s busy timeout. Transactions compose through
//! [`Store::begin`]; calling `begin` on an open transaction nests via
//! savepoints, and a dropped inner scope rolls back only itself.

pub mod branches;
pub mod games;
pub mod rounds;
pub mod tags;

pub use branches::BranchRow;
pub use games::{AdvanceSnapshot, GameRow};
pub use rounds::{RoundLink, RoundRow};
pub use tags::TagRow;

use crate::error::Result;
use anyhow::Context as _;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::path::Path;
use std::time::Duration;

/// Relational store over a single SQLite database.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `path` and initialize the
    /// schema.
    pub async fn connect(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5))
            .pragma("wal_autocheckpoint", "2000");

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open database at {}", path.display()))?;

        let store = Self { pool };
        store.initialize().await?;
        tracing::info!(path = %path.display(), "store connected and initialized");
        Ok(store)
    }

    /// Open an in-memory database, mainly for tests.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("failed to open in-memory database")?;

        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    /// Access the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin a write transaction. Nested `begin` calls on the returned
    /// transaction create savepoints.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self
            .pool
            .begin()
            .await
            .context("failed to begin transaction")?)
    }

    /// Cheap connection health check, run on a fixed interval by the service
    /// loop.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("store health ping failed")?;
        Ok(())
    }

    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS games (
                game_id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel_id TEXT UNIQUE,
                main_message_id TEXT,
                candidate_custom_input_ids TEXT NOT NULL DEFAULT '[]',
                head_branch_id INTEGER,
                system_prompt TEXT NOT NULL,
                host_user_id TEXT NOT NULL,
                is_frozen BOOLEAN NOT NULL DEFAULT 0,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (head_branch_id) REFERENCES branches (branch_id) ON DELETE SET NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create games table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS branches (
                branch_id INTEGER PRIMARY KEY AUTOINCREMENT,
                game_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                tip_round_id INTEGER,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(game_id, name),
                FOREIGN KEY (game_id) REFERENCES games (game_id) ON DELETE CASCADE,
                FOREIGN KEY (tip_round_id) REFERENCES rounds (round_id) ON DELETE SET NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create branches table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rounds (
                round_id INTEGER PRIMARY KEY AUTOINCREMENT,
                game_id INTEGER NOT NULL,
                parent_id INTEGER NOT NULL CHECK(parent_id >= -1),
                player_choice TEXT NOT NULL,
                assistant_response TEXT NOT NULL,
                llm_usage TEXT,
                model_name TEXT,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (game_id) REFERENCES games (game_id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create rounds table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tags (
                tag_id INTEGER PRIMARY KEY AUTOINCREMENT,
                game_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                round_id INTEGER NOT NULL,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(game_id, name),
                FOREIGN KEY (game_id) REFERENCES games (game_id) ON DELETE CASCADE,
                FOREIGN KEY (round_id) REFERENCES rounds (round_id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create tags table")?;

        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS update_game_updated_at
            AFTER UPDATE ON games
            FOR EACH ROW
            WHEN NEW.updated_at = OLD.updated_at
            BEGIN
                UPDATE games SET updated_at = CURRENT_TIMESTAMP WHERE game_id = OLD.game_id;
            END
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create games updated_at trigger")?;

        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS update_branch_updated_at
            AFTER UPDATE ON branches
            FOR EACH ROW
            WHEN NEW.updated_at = OLD.updated_at
            BEGIN
                UPDATE branches SET updated_at = CURRENT_TIMESTAMP WHERE branch_id = OLD.branch_id;
            END
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create branches updated_at trigger")?;

        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_games_main_msg ON games(main_message_id)",
            "CREATE INDEX IF NOT EXISTS idx_branches_game ON branches(game_id)",
            "CREATE INDEX IF NOT EXISTS idx_rounds_game ON rounds(game_id)",
            "CREATE INDEX IF NOT EXISTS idx_rounds_parent ON rounds(parent_id)",
            "CREATE INDEX IF NOT EXISTS idx_tags_game ON tags(game_id)",
            "CREATE INDEX IF NOT EXISTS idx_tags_round ON tags(round_id)",
        ] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("failed to create index")?;
        }

        Ok(())
    }
}

/// SQLite extended error code for UNIQUE constraint violations.
pub(crate) const SQLITE_CONSTRAINT_UNIQUE: &str = "2067";

/// Whether a sqlx error is a UNIQUE constraint violation.
pub(crate) fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db) if db.code().as_deref() == Some(SQLITE_CONSTRAINT_UNIQUE)
    )
}
