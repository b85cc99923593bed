//! Tag rows: named static pointers into round history.

use crate::error::{Result, StoreError};
use crate::store::{Store, is_unique_violation};
use crate::{GameId, RoundId, TagId};
use anyhow::Context as _;
use sqlx::Row as _;

/// A row of the `tags` table.
#[derive(Debug, Clone)]
pub struct TagRow {
    pub tag_id: TagId,
    pub game_id: GameId,
    pub name: String,
    pub round_id: RoundId,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

const TAG_COLUMNS: &str = "tag_id, game_id, name, round_id, created_at";

impl Store {
    pub async fn create_tag(
        &self,
        game_id: GameId,
        name: &str,
        round_id: RoundId,
    ) -> Result<TagId> {
        let result = sqlx::query("INSERT INTO tags (game_id, name, round_id) VALUES (?, ?, ?)")
            .bind(game_id)
            .bind(name)
            .bind(round_id)
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

    pub async fn get_tag_by_name(&self, game_id: GameId, name: &str) -> Result<Option<TagRow>> {
        let row = sqlx::query(&format!(
            "SELECT {TAG_COLUMNS} FROM tags WHERE game_id = ? AND name = ?"
        ))
        .bind(game_id)
        .bind(name)
        .fetch_optional(self.pool())
        .await
        .context("failed to fetch tag")?;

        row.map(tag_from_row).transpose()
    }

    pub async fn get_all_tags_for_game(&self, game_id: GameId) -> Result<Vec<TagRow>> {
        let rows = sqlx::query(&format!(
            "SELECT {TAG_COLUMNS} FROM tags WHERE game_id = ? ORDER BY tag_id ASC"
        ))
        .bind(game_id)
        .fetch_all(self.pool())
        .await
        .context("failed to list tags")?;

        rows.into_iter().map(tag_from_row).collect()
    }

    /// Delete a tag by name. Returns whether a row was removed.
    pub async fn delete_tag(&self, game_id: GameId, name: &str) -> Result<bool> {
        let done = sqlx::query("DELETE FROM tags WHERE game_id = ? AND name = ?")
            .bind(game_id)
            .bind(name)
            .execute(self.pool())
            .await
            .context("failed to delete tag")?;

        Ok(done.rows_affected() > 0)
    }
}

fn tag_from_row(row: sqlx::sqlite::SqliteRow) -> Result<TagRow> {
    Ok(TagRow {
        tag_id: row.try_get("tag_id").context("failed to read tag_id")?,
        game_id: row.try_get("game_id").context("failed to read game_id")?,
        name: row.try_get("name").context("failed to read tag name")?,
        round_id: row.try_get("round_id").context("failed to read round_id")?,
        created_at: row
            .try_get::<chrono::NaiveDateTime, _>("created_at")
            .map(|v| v.and_utc())
            .context("failed to read created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use crate::error::{Error, StoreError};
    use crate::store::Store;
    use crate::{INITIAL_PARENT_ID, SEED_PLAYER_CHOICE};

    #[tokio::test]
    async fn tag_names_are_unique_per_game() {
        let store = Store::in_memory().await.expect("store should open");
        let game_id = store.create_game("g1", "u1", "p").await.unwrap();
        let round_id = store
            .create_round(game_id, INITIAL_PARENT_ID, SEED_PLAYER_CHOICE, "开场", None, None)
            .await
            .unwrap();

        store.create_tag(game_id, "act1", round_id).await.unwrap();
        let error = store
            .create_tag(game_id, "act1", round_id)
            .await
            .expect_err("duplicate tag name must fail");
        assert!(matches!(error, Error::Store(StoreError::NameTaken { .. })));
    }

    #[tokio::test]
    async fn deleting_the_tagged_round_cascades() {
        let store = Store::in_memory().await.expect("store should open");
        let game_id = store.create_game("g1", "u1", "p").await.unwrap();
        let round_id = store
            .create_round(game_id, INITIAL_PARENT_ID, SEED_PLAYER_CHOICE, "开场", None, None)
            .await
            .unwrap();
        store.create_tag(game_id, "act1", round_id).await.unwrap();

        sqlx::query("DELETE FROM rounds WHERE round_id = ?")
            .bind(round_id)
            .execute(store.pool())
            .await
            .unwrap();

        assert!(store.get_tag_by_name(game_id, "act1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_reports_whether_a_tag_existed() {
        let store = Store::in_memory().await.expect("store should open");
        let game_id = store.create_game("g1", "u1", "p").await.unwrap();
        let round_id = store
            .create_round(game_id, INITIAL_PARENT_ID, SEED_PLAYER_CHOICE, "开场", None, None)
            .await
            .unwrap();
        store.create_tag(game_id, "act1", round_id).await.unwrap();

        assert!(store.delete_tag(game_id, "act1").await.unwrap());
        assert!(!store.delete_tag(game_id, "act1").await.unwrap());
    }
}
