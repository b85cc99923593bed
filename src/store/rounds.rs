//! Round rows and the recursive ancestor walk.
//!
//! Rounds are immutable once written and form a tree per game, rooted at
//! parent id −1.

use crate::error::Result;
use crate::store::Store;
use crate::{GameId, RoundId};
use anyhow::Context as _;
use serde_json::Value;
use sqlx::{Row as _, SqliteConnection};

/// A row of the `rounds` table.
#[derive(Debug, Clone)]
pub struct RoundRow {
    pub round_id: RoundId,
    pub game_id: GameId,
    pub parent_id: RoundId,
    pub player_choice: String,
    pub assistant_response: String,
    pub llm_usage: Option<Value>,
    pub model_name: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl RoundRow {
    /// Prompt token count from the stored usage blob, if any.
    pub fn prompt_tokens(&self) -> Option<i64> {
        self.llm_usage
            .as_ref()
            .and_then(|usage| usage.get("prompt_tokens"))
            .and_then(Value::as_i64)
    }
}

/// A minimal (round, parent) edge, enough to draw the branch graph.
#[derive(Debug, Clone, Copy)]
pub struct RoundLink {
    pub round_id: RoundId,
    pub parent_id: RoundId,
}

const ROUND_COLUMNS: &str = "round_id, game_id, parent_id, player_choice, assistant_response, \
     llm_usage, model_name, created_at";

impl Store {
    /// Insert a round and return its id.
    pub async fn create_round(
        &self,
        game_id: GameId,
        parent_id: RoundId,
        player_choice: &str,
        assistant_response: &str,
        llm_usage: Option<&Value>,
        model_name: Option<&str>,
    ) -> Result<RoundId> {
        let done = sqlx::query(
            "INSERT INTO rounds (game_id, parent_id, player_choice, assistant_response, \
             llm_usage, model_name) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(game_id)
        .bind(parent_id)
        .bind(player_choice)
        .bind(assistant_response)
        .bind(llm_usage.map(Value::to_string))
        .bind(model_name)
        .execute(self.pool())
        .await
        .context("failed to insert round")?;

        Ok(done.last_insert_rowid())
    }

    /// Insert a round inside an open transaction (the optimistic-lock
    /// window of advancement).
    pub async fn create_round_tx(
        conn: &mut SqliteConnection,
        game_id: GameId,
        parent_id: RoundId,
        player_choice: &str,
        assistant_response: &str,
        llm_usage: Option<&Value>,
        model_name: Option<&str>,
    ) -> Result<RoundId> {
        let done = sqlx::query(
            "INSERT INTO rounds (game_id, parent_id, player_choice, assistant_response, \
             llm_usage, model_name) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(game_id)
        .bind(parent_id)
        .bind(player_choice)
        .bind(assistant_response)
        .bind(llm_usage.map(Value::to_string))
        .bind(model_name)
        .execute(conn)
        .await
        .context("failed to insert round")?;

        Ok(done.last_insert_rowid())
    }

    pub async fn get_round_info(&self, round_id: RoundId) -> Result<Option<RoundRow>> {
        let row = sqlx::query(&format!(
            "SELECT {ROUND_COLUMNS} FROM rounds WHERE round_id = ?"
        ))
        .bind(round_id)
        .fetch_optional(self.pool())
        .await
        .context("failed to fetch round")?;

        row.map(round_from_row).transpose()
    }

    /// All (round, parent) edges of a game, for graph drawing.
    pub async fn get_all_rounds_for_game(&self, game_id: GameId) -> Result<Vec<RoundLink>> {
        let rows = sqlx::query("SELECT round_id, parent_id FROM rounds WHERE game_id = ?")
            .bind(game_id)
            .fetch_all(self.pool())
            .await
            .context("failed to list rounds")?;

        rows.into_iter()
            .map(|row| {
                Ok(RoundLink {
                    round_id: row.try_get("round_id").context("failed to read round_id")?,
                    parent_id: row
                        .try_get("parent_id")
                        .context("failed to read parent_id")?,
                })
            })
            .collect()
    }

    /// Walk from `round_id` up to at most `limit` rounds and return them in
    /// chronological order (oldest ancestor first, `round_id` last).
    ///
    /// A single recursive CTE so rebuilding a long history is one query.
    pub async fn get_round_ancestors(
        &self,
        round_id: RoundId,
        limit: i64,
    ) -> Result<Vec<RoundRow>> {
        let rows = sqlx::query(
            "WITH RECURSIVE lineage AS ( \
                 SELECT round_id, game_id, parent_id, player_choice, assistant_response, \
                        llm_usage, model_name, created_at, 0 AS depth \
                 FROM rounds WHERE round_id = ? \
                 UNION ALL \
                 SELECT r.round_id, r.game_id, r.parent_id, r.player_choice, \
                        r.assistant_response, r.llm_usage, r.model_name, r.created_at, \
                        l.depth + 1 \
                 FROM rounds r \
                 JOIN lineage l ON r.round_id = l.parent_id \
                 WHERE l.depth + 1 < ? \
             ) \
             SELECT round_id, game_id, parent_id, player_choice, assistant_response, \
                    llm_usage, model_name, created_at \
             FROM lineage ORDER BY depth DESC",
        )
        .bind(round_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .context("failed to walk round ancestors")?;

        rows.into_iter().map(round_from_row).collect()
    }
}

fn round_from_row(row: sqlx::sqlite::SqliteRow) -> Result<RoundRow> {
    let usage_value: Option<String> = row.try_get("llm_usage").ok().flatten();

    Ok(RoundRow {
        round_id: row.try_get("round_id").context("failed to read round_id")?,
        game_id: row.try_get("game_id").context("failed to read game_id")?,
        parent_id: row
            .try_get("parent_id")
            .context("failed to read parent_id")?,
        player_choice: row
            .try_get("player_choice")
            .context("failed to read player_choice")?,
        assistant_response: row
            .try_get("assistant_response")
            .context("failed to read assistant_response")?,
        llm_usage: usage_value.and_then(|raw| serde_json::from_str(&raw).ok()),
        model_name: row.try_get("model_name").ok().flatten(),
        created_at: row
            .try_get::<chrono::NaiveDateTime, _>("created_at")
            .map(|v| v.and_utc())
            .context("failed to read created_at")?,
    })
}
