//! Game row CRUD.

use crate::error::{Result, StoreError};
use crate::store::{Store, is_unique_violation};
use crate::{BranchId, GameId, RoundId};
use anyhow::Context as _;
use sqlx::Row as _;

/// A row of the `games` table.
#[derive(Debug, Clone)]
pub struct GameRow {
    pub game_id: GameId,
    pub channel_id: Option<String>,
    pub main_message_id: Option<String>,
    pub candidate_custom_input_ids: Vec<String>,
    pub head_branch_id: Option<BranchId>,
    pub system_prompt: String,
    pub host_user_id: String,
    pub is_frozen: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

const GAME_COLUMNS: &str = "game_id, channel_id, main_message_id, candidate_custom_input_ids, \
     head_branch_id, system_prompt, host_user_id, is_frozen, created_at, updated_at";

impl Store {
    /// Insert a new game bound to `channel_id` and return its id.
    pub async fn create_game(
        &self,
        channel_id: &str,
        host_user_id: &str,
        system_prompt: &str,
    ) -> Result<GameId> {
        let result = sqlx::query(
            "INSERT INTO games (channel_id, host_user_id, system_prompt) VALUES (?, ?, ?)",
        )
        .bind(channel_id)
        .bind(host_user_id)
        .bind(system_prompt)
        .execute(self.pool())
        .await;

        match result {
            Ok(done) => Ok(done.last_insert_rowid()),
            Err(error) if is_unique_violation(&error) => Err(StoreError::ChannelOccupied {
                channel_id: channel_id.to_string(),
            }
            .into()),
            Err(error) => Err(StoreError::Query(error).into()),
        }
    }

    /// Whether a game is currently bound to the channel.
    pub async fn is_game_running(&self, channel_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM games WHERE channel_id = ?")
            .bind(channel_id)
            .fetch_optional(self.pool())
            .await
            .context("failed to check for a running game")?;
        Ok(row.is_some())
    }

    pub async fn get_game_by_channel_id(&self, channel_id: &str) -> Result<Option<GameRow>> {
        let row = sqlx::query(&format!(
            "SELECT {GAME_COLUMNS} FROM games WHERE channel_id = ?"
        ))
        .bind(channel_id)
        .fetch_optional(self.pool())
        .await
        .context("failed to fetch game by channel")?;

        row.map(game_from_row).transpose()
    }

    pub async fn get_game_by_game_id(&self, game_id: GameId) -> Result<Option<GameRow>> {
        let row = sqlx::query(&format!(
            "SELECT {GAME_COLUMNS} FROM games WHERE game_id = ?"
        ))
        .bind(game_id)
        .fetch_optional(self.pool())
        .await
        .context("failed to fetch game by id")?;

        row.map(game_from_row).transpose()
    }

    pub async fn get_all_games(&self) -> Result<Vec<GameRow>> {
        let rows = sqlx::query(&format!(
            "SELECT {GAME_COLUMNS} FROM games ORDER BY game_id ASC"
        ))
        .fetch_all(self.pool())
        .await
        .context("failed to list games")?;

        rows.into_iter().map(game_from_row).collect()
    }

    pub async fn set_game_frozen_status(&self, game_id: GameId, is_frozen: bool) -> Result<()> {
        sqlx::query("UPDATE games SET is_frozen = ? WHERE game_id = ?")
            .bind(is_frozen)
            .bind(game_id)
            .execute(self.pool())
            .await
            .context("failed to update frozen status")?;
        Ok(())
    }

    /// Record the freshly published main message and reset the candidate
    /// list; a new main message always starts a clean ballot.
    pub async fn update_game_main_message(
        &self,
        game_id: GameId,
        main_message_id: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE games SET main_message_id = ?, candidate_custom_input_ids = '[]' \
             WHERE game_id = ?",
        )
        .bind(main_message_id)
        .bind(game_id)
        .execute(self.pool())
        .await
        .context("failed to update main message")?;
        Ok(())
    }

    pub async fn update_candidate_custom_input_ids(
        &self,
        game_id: GameId,
        candidate_ids: &[String],
    ) -> Result<()> {
        let encoded =
            serde_json::to_string(candidate_ids).context("failed to serialize candidate ids")?;
        sqlx::query("UPDATE games SET candidate_custom_input_ids = ? WHERE game_id = ?")
            .bind(encoded)
            .bind(game_id)
            .execute(self.pool())
            .await
            .context("failed to update candidate ids")?;
        Ok(())
    }

    pub async fn update_game_head_branch(&self, game_id: GameId, branch_id: BranchId) -> Result<()> {
        sqlx::query("UPDATE games SET head_branch_id = ? WHERE game_id = ?")
            .bind(branch_id)
            .bind(game_id)
            .execute(self.pool())
            .await
            .context("failed to update head branch")?;
        Ok(())
    }

    pub async fn update_game_host(&self, game_id: GameId, new_host_id: &str) -> Result<()> {
        sqlx::query("UPDATE games SET host_user_id = ? WHERE game_id = ?")
            .bind(new_host_id)
            .bind(game_id)
            .execute(self.pool())
            .await
            .context("failed to update game host")?;
        Ok(())
    }

    /// Bind an unbound game to a channel. Fails with `ChannelOccupied` if the
    /// channel already hosts a game.
    pub async fn attach_game_to_channel(&self, game_id: GameId, channel_id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE games SET channel_id = ? WHERE game_id = ?")
            .bind(channel_id)
            .bind(game_id)
            .execute(self.pool())
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(error) if is_unique_violation(&error) => Err(StoreError::ChannelOccupied {
                channel_id: channel_id.to_string(),
            }
            .into()),
            Err(error) => Err(StoreError::Query(error).into()),
        }
    }

    /// Unbind a game from its channel and clear the channel-scoped fields.
    pub async fn detach_game_from_channel(&self, game_id: GameId) -> Result<()> {
        sqlx::query(
            "UPDATE games SET \
                channel_id = NULL, \
                main_message_id = NULL, \
                candidate_custom_input_ids = '[]' \
             WHERE game_id = ?",
        )
        .bind(game_id)
        .execute(self.pool())
        .await
        .context("failed to detach game")?;
        Ok(())
    }

    /// Drop a game. Branches, rounds, and tags cascade.
    pub async fn delete_game(&self, game_id: GameId) -> Result<()> {
        sqlx::query("DELETE FROM games WHERE game_id = ?")
            .bind(game_id)
            .execute(self.pool())
            .await
            .context("failed to delete game")?;
        Ok(())
    }

    /// Resolve a game's channel and HEAD tip in one query.
    pub async fn head_tip(&self, game_id: GameId) -> Result<(Option<String>, RoundId)> {
        let row = sqlx::query(
            "SELECT g.channel_id, b.tip_round_id \
             FROM games g \
             LEFT JOIN branches b ON g.head_branch_id = b.branch_id \
             WHERE g.game_id = ?",
        )
        .bind(game_id)
        .fetch_optional(self.pool())
        .await
        .context("failed to fetch head tip")?;

        let Some(row) = row else {
            return Err(StoreError::GameNotFound { id: game_id }.into());
        };

        let tip: Option<RoundId> = row
            .try_get("tip_round_id")
            .context("failed to read tip_round_id")?;
        let Some(tip_round_id) = tip else {
            return Err(StoreError::HeadBranchMissing { game_id }.into());
        };

        let channel_id: Option<String> = row.try_get("channel_id").ok().flatten();
        Ok((channel_id, tip_round_id))
    }
}

/// Everything the advancement path needs to capture before the LLM call.
#[derive(Debug, Clone)]
pub struct AdvanceSnapshot {
    pub channel_id: Option<String>,
    pub main_message_id: Option<String>,
    pub system_prompt: String,
    pub head_branch_id: BranchId,
    pub initial_tip: RoundId,
}

impl Store {
    /// Snapshot the game and its HEAD tip in one statement, so the captured
    /// tip is consistent with the captured branch.
    pub async fn snapshot_for_advance(&self, game_id: GameId) -> Result<AdvanceSnapshot> {
        let row = sqlx::query(
            "SELECT g.channel_id, g.main_message_id, g.system_prompt, g.head_branch_id, \
                    b.tip_round_id \
             FROM games g \
             LEFT JOIN branches b ON g.head_branch_id = b.branch_id \
             WHERE g.game_id = ?",
        )
        .bind(game_id)
        .fetch_optional(self.pool())
        .await
        .context("failed to snapshot game for advancement")?;

        let Some(row) = row else {
            return Err(StoreError::GameNotFound { id: game_id }.into());
        };

        let head_branch_id: Option<BranchId> = row.try_get("head_branch_id").ok().flatten();
        let initial_tip: Option<RoundId> = row.try_get("tip_round_id").ok().flatten();
        let (Some(head_branch_id), Some(initial_tip)) = (head_branch_id, initial_tip) else {
            return Err(StoreError::HeadBranchMissing { game_id }.into());
        };

        Ok(AdvanceSnapshot {
            channel_id: row.try_get("channel_id").ok().flatten(),
            main_message_id: row.try_get("main_message_id").ok().flatten(),
            system_prompt: row
                .try_get("system_prompt")
                .context("failed to read system_prompt")?,
            head_branch_id,
            initial_tip,
        })
    }
}

pub(crate) fn parse_candidate_ids(value: &str) -> Vec<String> {
    serde_json::from_str(value).unwrap_or_default()
}

fn game_from_row(row: sqlx::sqlite::SqliteRow) -> Result<GameRow> {
    let candidates_value: String = row
        .try_get("candidate_custom_input_ids")
        .unwrap_or_else(|_| "[]".to_string());

    Ok(GameRow {
        game_id: row.try_get("game_id").context("failed to read game_id")?,
        channel_id: row.try_get("channel_id").ok().flatten(),
        main_message_id: row.try_get("main_message_id").ok().flatten(),
        candidate_custom_input_ids: parse_candidate_ids(&candidates_value),
        head_branch_id: row.try_get("head_branch_id").ok().flatten(),
        system_prompt: row
            .try_get("system_prompt")
            .context("failed to read system_prompt")?,
        host_user_id: row
            .try_get("host_user_id")
            .context("failed to read host_user_id")?,
        is_frozen: row.try_get::<i64, _>("is_frozen").unwrap_or(0) != 0,
        created_at: row
            .try_get::<chrono::NaiveDateTime, _>("created_at")
            .map(|v| v.and_utc())
            .context("failed to read created_at")?,
        updated_at: row
            .try_get::<chrono::NaiveDateTime, _>("updated_at")
            .map(|v| v.and_utc())
            .context("failed to read updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use crate::error::{Error, StoreError};
    use crate::store::Store;

    #[tokio::test]
    async fn one_game_per_channel() {
        let store = Store::in_memory().await.expect("store should open");
        store
            .create_game("g1", "u1", "世界观: 废土")
            .await
            .expect("first game should be created");

        let error = store
            .create_game("g1", "u2", "another world")
            .await
            .expect_err("second game on the same channel must fail");

        assert!(matches!(
            error,
            Error::Store(StoreError::ChannelOccupied { .. })
        ));
    }

    #[tokio::test]
    async fn attach_rejects_occupied_channel() {
        let store = Store::in_memory().await.expect("store should open");
        let first = store.create_game("g1", "u1", "p1").await.unwrap();
        let second = store.create_game("g2", "u2", "p2").await.unwrap();

        store.detach_game_from_channel(second).await.unwrap();
        let error = store
            .attach_game_to_channel(second, "g1")
            .await
            .expect_err("attach onto an occupied channel must fail");
        assert!(matches!(
            error,
            Error::Store(StoreError::ChannelOccupied { .. })
        ));

        // The original binding is untouched.
        let game = store.get_game_by_channel_id("g1").await.unwrap().unwrap();
        assert_eq!(game.game_id, first);
    }

    #[tokio::test]
    async fn detach_clears_channel_scoped_fields() {
        let store = Store::in_memory().await.expect("store should open");
        let game_id = store.create_game("g1", "u1", "p").await.unwrap();
        store.update_game_main_message(game_id, "m1").await.unwrap();
        store
            .update_candidate_custom_input_ids(game_id, &["m2".to_string()])
            .await
            .unwrap();

        store.detach_game_from_channel(game_id).await.unwrap();

        let game = store.get_game_by_game_id(game_id).await.unwrap().unwrap();
        assert!(game.channel_id.is_none());
        assert!(game.main_message_id.is_none());
        assert!(game.candidate_custom_input_ids.is_empty());
    }

    #[tokio::test]
    async fn new_main_message_resets_candidates() {
        let store = Store::in_memory().await.expect("store should open");
        let game_id = store.create_game("g1", "u1", "p").await.unwrap();
        store
            .update_candidate_custom_input_ids(game_id, &["m2".to_string(), "m3".to_string()])
            .await
            .unwrap();

        store.update_game_main_message(game_id, "m9").await.unwrap();

        let game = store.get_game_by_game_id(game_id).await.unwrap().unwrap();
        assert_eq!(game.main_message_id.as_deref(), Some("m9"));
        assert!(game.candidate_custom_input_ids.is_empty());
    }
}
