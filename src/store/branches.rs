//! Branch row CRUD and the tx-scoped reads used by the optimistic
//! advancement window.

use crate::error::{Result, StoreError};
use crate::store::{Store, is_unique_violation};
use crate::{BranchId, GameId, RoundId};
use anyhow::Context as _;
use sqlx::{Row as _, SqliteConnection};

/// A row of the `branches` table.
#[derive(Debug, Clone)]
pub struct BranchRow {
    pub branch_id: BranchId,
    pub game_id: GameId,
    pub name: String,
    pub tip_round_id: Option<RoundId>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

const BRANCH_COLUMNS: &str =
    "branch_id, game_id, name, tip_round_id, created_at, updated_at";

impl Store {
    /// Create a branch pointing at `tip_round_id`. Name collisions surface
    /// as `NameTaken`.
    pub async fn create_branch(
        &self,
        game_id: GameId,
        name: &str,
        tip_round_id: RoundId,
    ) -> Result<BranchId> {
        let result = sqlx::query(
            "INSERT INTO branches (game_id, name, tip_round_id) VALUES (?, ?, ?)",
        )
        .bind(game_id)
        .bind(name)
        .bind(tip_round_id)
        .execute(self.pool())
        .await;

        match result {
            Ok(done) => Ok(done.last_insert_rowid()),
            Err(error) if is_unique_violation(&error) => Err(StoreError::NameTaken {
                name: name.to_string(),
            }
            .into()),
            Err(error) => Err(StoreError::Query(error).into()),
        }
    }

    pub async fn get_branch_by_name(
        &self,
        game_id: GameId,
        name: &str,
    ) -> Result<Option<BranchRow>> {
        let row = sqlx::query(&format!(
            "SELECT {BRANCH_COLUMNS} FROM branches WHERE game_id = ? AND name = ?"
        ))
        .bind(game_id)
        .bind(name)
        .fetch_optional(self.pool())
        .await
        .context("failed to fetch branch by name")?;

        row.map(branch_from_row).transpose()
    }

    pub async fn get_branch_by_id(&self, branch_id: BranchId) -> Result<Option<BranchRow>> {
        let row = sqlx::query(&format!(
            "SELECT {BRANCH_COLUMNS} FROM branches WHERE branch_id = ?"
        ))
        .bind(branch_id)
        .fetch_optional(self.pool())
        .await
        .context("failed to fetch branch by id")?;

        row.map(branch_from_row).transpose()
    }

    pub async fn get_all_branches_for_game(&self, game_id: GameId) -> Result<Vec<BranchRow>> {
        let rows = sqlx::query(&format!(
            "SELECT {BRANCH_COLUMNS} FROM branches WHERE game_id = ? ORDER BY branch_id ASC"
        ))
        .bind(game_id)
        .fetch_all(self.pool())
        .await
        .context("failed to list branches")?;

        rows.into_iter().map(branch_from_row).collect()
    }

    /// Rename a branch. The UNIQUE constraint is the authoritative duplicate
    /// check.
    pub async fn rename_branch(&self, branch_id: BranchId, new_name: &str) -> Result<()> {
        let result = sqlx::query("UPDATE branches SET name = ? WHERE branch_id = ?")
            .bind(new_name)
            .bind(branch_id)
            .execute(self.pool())
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(error) if is_unique_violation(&error) => Err(StoreError::NameTaken {
                name: new_name.to_string(),
            }
            .into()),
            Err(error) => Err(StoreError::Query(error).into()),
        }
    }

    pub async fn delete_branch(&self, branch_id: BranchId) -> Result<()> {
        sqlx::query("DELETE FROM branches WHERE branch_id = ?")
            .bind(branch_id)
            .execute(self.pool())
            .await
            .context("failed to delete branch")?;
        Ok(())
    }

    /// Move a branch tip (used for advancement, revert, and reset).
    pub async fn update_branch_tip(&self, branch_id: BranchId, round_id: RoundId) -> Result<()> {
        sqlx::query("UPDATE branches SET tip_round_id = ? WHERE branch_id = ?")
            .bind(round_id)
            .bind(branch_id)
            .execute(self.pool())
            .await
            .context("failed to update branch tip")?;
        Ok(())
    }

    /// Delete a branch by name, refusing to delete the game's HEAD branch.
    /// Lookup, HEAD check, and delete happen in one transaction.
    pub async fn delete_branch_checked(&self, game_id: GameId, name: &str) -> Result<()> {
        let mut tx = self.begin().await?;

        let row = sqlx::query("SELECT branch_id FROM branches WHERE game_id = ? AND name = ?")
            .bind(game_id)
            .bind(name)
            .fetch_optional(&mut *tx)
            .await
            .context("failed to fetch branch for delete")?;
        let Some(row) = row else {
            return Err(StoreError::BranchNotFound {
                name: name.to_string(),
            }
            .into());
        };
        let branch_id: BranchId = row
            .try_get("branch_id")
            .context("failed to read branch_id")?;

        let head_branch_id: Option<BranchId> =
            sqlx::query_scalar("SELECT head_branch_id FROM games WHERE game_id = ?")
                .bind(game_id)
                .fetch_one(&mut *tx)
                .await
                .context("failed to read head branch")?;
        if head_branch_id == Some(branch_id) {
            return Err(StoreError::CannotDeleteHead.into());
        }

        sqlx::query("DELETE FROM branches WHERE branch_id = ?")
            .bind(branch_id)
            .execute(&mut *tx)
            .await
            .context("failed to delete branch")?;
        tx.commit().await.context("failed to commit branch delete")?;
        Ok(())
    }

    /// Read a branch tip inside an open transaction.
    pub async fn branch_tip_tx(
        conn: &mut SqliteConnection,
        branch_id: BranchId,
    ) -> Result<Option<RoundId>> {
        let row = sqlx::query("SELECT tip_round_id FROM branches WHERE branch_id = ?")
            .bind(branch_id)
            .fetch_optional(conn)
            .await
            .context("failed to fetch branch tip")?;

        Ok(row.and_then(|r| r.try_get("tip_round_id").ok()))
    }

    /// Move a branch tip inside an open transaction.
    pub async fn update_branch_tip_tx(
        conn: &mut SqliteConnection,
        branch_id: BranchId,
        round_id: RoundId,
    ) -> Result<()> {
        sqlx::query("UPDATE branches SET tip_round_id = ? WHERE branch_id = ?")
            .bind(round_id)
            .bind(branch_id)
            .execute(conn)
            .await
            .context("failed to update branch tip")?;
        Ok(())
    }
}

fn branch_from_row(row: sqlx::sqlite::SqliteRow) -> Result<BranchRow> {
    Ok(BranchRow {
        branch_id: row
            .try_get("branch_id")
            .context("failed to read branch_id")?,
        game_id: row.try_get("game_id").context("failed to read game_id")?,
        name: row.try_get("name").context("failed to read branch name")?,
        tip_round_id: row.try_get("tip_round_id").ok().flatten(),
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
    use crate::{INITIAL_PARENT_ID, SEED_PLAYER_CHOICE};

    async fn seeded_game(store: &Store) -> (i64, i64) {
        let game_id = store.create_game("g1", "u1", "prompt").await.unwrap();
        let round_id = store
            .create_round(game_id, INITIAL_PARENT_ID, SEED_PLAYER_CHOICE, "开场", None, None)
            .await
            .unwrap();
        (game_id, round_id)
    }

    #[tokio::test]
    async fn branch_names_are_unique_per_game() {
        let store = Store::in_memory().await.expect("store should open");
        let (game_id, round_id) = seeded_game(&store).await;

        store.create_branch(game_id, "main", round_id).await.unwrap();
        let error = store
            .create_branch(game_id, "main", round_id)
            .await
            .expect_err("duplicate branch name must fail");
        assert!(matches!(error, Error::Store(StoreError::NameTaken { .. })));

        // The same name is fine on a different game.
        let other = store.create_game("g2", "u2", "p2").await.unwrap();
        let other_round = store
            .create_round(other, INITIAL_PARENT_ID, SEED_PLAYER_CHOICE, "开场", None, None)
            .await
            .unwrap();
        store.create_branch(other, "main", other_round).await.unwrap();
    }

    #[tokio::test]
    async fn rename_respects_uniqueness() {
        let store = Store::in_memory().await.expect("store should open");
        let (game_id, round_id) = seeded_game(&store).await;

        store.create_branch(game_id, "main", round_id).await.unwrap();
        let side = store.create_branch(game_id, "side", round_id).await.unwrap();

        let error = store
            .rename_branch(side, "main")
            .await
            .expect_err("renaming onto an existing name must fail");
        assert!(matches!(error, Error::Store(StoreError::NameTaken { .. })));

        store.rename_branch(side, "side_path").await.unwrap();
        let renamed = store
            .get_branch_by_name(game_id, "side_path")
            .await
            .unwrap()
            .expect("renamed branch should resolve");
        assert_eq!(renamed.branch_id, side);
    }

    #[tokio::test]
    async fn deleting_a_game_cascades_to_branches() {
        let store = Store::in_memory().await.expect("store should open");
        let (game_id, round_id) = seeded_game(&store).await;
        let branch_id = store.create_branch(game_id, "main", round_id).await.unwrap();

        store.delete_game(game_id).await.unwrap();
        assert!(store.get_branch_by_id(branch_id).await.unwrap().is_none());
    }
}
