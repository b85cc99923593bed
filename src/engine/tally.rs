//! Deterministic aggregation of cached reactions into option scores.

use crate::cache::VolatileCache;
use crate::content::ContentFetcher;
use crate::emoji;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Scores plus the human-readable result lines posted back to the channel.
#[derive(Debug, Clone)]
pub struct TallyOutcome {
    /// Option letter (`"A"`..`"G"`) or custom input message id → score.
    /// Letters score by unique voters; custom inputs by net yay − nay.
    /// Custom inputs nobody voted on are absent entirely, so a zero net
    /// score is distinguishable from an untouched ballot entry.
    pub scores: BTreeMap<String, i64>,
    pub result_lines: Vec<String>,
}

impl TallyOutcome {
    /// Keys tied for the highest score, in deterministic order.
    pub fn winners(&self) -> Vec<String> {
        let Some(max) = self.scores.values().max().copied() else {
            return Vec::new();
        };
        self.scores
            .iter()
            .filter(|(_, score)| **score == max)
            .map(|(key, _)| key.clone())
            .collect()
    }
}

/// Reads a group's cached votes and scores the current ballot.
pub struct VoteTally {
    cache: Arc<VolatileCache>,
    content: Arc<ContentFetcher>,
}

impl VoteTally {
    pub fn new(cache: Arc<VolatileCache>, content: Arc<ContentFetcher>) -> Self {
        Self { cache, content }
    }

    /// Score the ballot: preset option letters on the main message plus the
    /// game's current custom input candidates.
    pub async fn tally(
        &self,
        group_id: &str,
        main_message_id: &str,
        candidate_ids: &[String],
    ) -> TallyOutcome {
        let group_votes = self.cache.get_group_vote_cache(group_id).await;

        let mut scores = BTreeMap::new();
        let mut result_lines = vec!["🗳️ 投票结果统计：".to_string()];

        if let Some(main_entry) = group_votes.get(main_message_id) {
            for (letter, emoji_id) in emoji::OPTIONS {
                let count = main_entry.voters(emoji_id) as i64;
                if count > 0 {
                    scores.insert(letter.to_string(), count);
                    result_lines.push(format!("- 选项 {letter}: {count} 票"));
                }
            }
        }

        for candidate_id in candidate_ids {
            let (yay, nay) = group_votes
                .get(candidate_id)
                .map(|entry| (entry.voters(emoji::YAY) as i64, entry.voters(emoji::NAY) as i64))
                .unwrap_or((0, 0));
            let net = yay - nay;

            // Only a ballot entry someone actually voted on races for the win.
            if yay > 0 || nay > 0 {
                scores.insert(candidate_id.clone(), net);
            }

            let content = self
                .content
                .custom_input_content(group_id, candidate_id)
                .await;
            let display = if content.contains("ID:") {
                content
            } else {
                format!("\"{content}\"")
            };
            result_lines.push(format!("- {display}: {net} 票"));
        }

        TallyOutcome {
            scores,
            result_lines,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emoji;
    use crate::error::{GatewayError, Result};
    use crate::gateway::{ChatGateway, ForwardBundle, MemberRole, StructuredMessage};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Gateway stub that only serves message text lookups.
    struct TextOnlyGateway;

    #[async_trait]
    impl ChatGateway for TextOnlyGateway {
        async fn post_text(&self, _: &str, _: &str, _: Option<&str>) -> Result<String> {
            Ok("m".to_string())
        }
        async fn post_image(&self, _: &str, _: &[u8]) -> Result<String> {
            Ok("m".to_string())
        }
        async fn post_structured(&self, _: &str, _: &StructuredMessage) -> Result<String> {
            Ok("m".to_string())
        }
        async fn post_forward_bundle(&self, _: &str, _: &ForwardBundle) -> Result<String> {
            Ok("m".to_string())
        }
        async fn post_private_text(&self, _: &str, _: &str) -> Result<String> {
            Ok("m".to_string())
        }
        async fn set_reaction(&self, _: &str, _: u32, _: bool) -> Result<()> {
            Ok(())
        }
        async fn delete_message(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn fetch_message_text(&self, message_id: &str) -> Result<String> {
            Err(GatewayError::MessageNotFound {
                id: message_id.to_string(),
            }
            .into())
        }
        async fn fetch_reactions(&self, _: &str) -> Result<Vec<(u32, Vec<String>)>> {
            Ok(Vec::new())
        }
        async fn member_role(&self, _: &str, _: &str) -> Result<MemberRole> {
            Ok(MemberRole::Member)
        }
    }

    fn fixture() -> (Arc<VolatileCache>, VoteTally, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cache = VolatileCache::new(
            dir.path().join("cache.json"),
            Duration::from_millis(10),
            Duration::from_secs(24 * 3600),
            Duration::from_secs(3600),
            Duration::from_secs(600),
        );
        let gateway = Arc::new(TextOnlyGateway);
        let content = Arc::new(ContentFetcher::new(cache.clone(), gateway));
        let tally = VoteTally::new(cache.clone(), content);
        (cache, tally, dir)
    }

    #[tokio::test]
    async fn letters_and_custom_inputs_score_together() {
        let (cache, tally, _dir) = fixture();

        // A: {u1, u2}; B: {u3}; custom m2 "向北走": yay {u2, u3}, nay {u1}.
        cache.update_vote("g1", "main", emoji::OPTION_A, "u1", true).await;
        cache.update_vote("g1", "main", emoji::OPTION_A, "u2", true).await;
        cache.update_vote("g1", "main", emoji::OPTION_B, "u3", true).await;
        cache.set_custom_input_content("g1", "m2", "向北走").await;
        cache.update_vote("g1", "m2", emoji::YAY, "u2", true).await;
        cache.update_vote("g1", "m2", emoji::YAY, "u3", true).await;
        cache.update_vote("g1", "m2", emoji::NAY, "u1", true).await;

        let outcome = tally
            .tally("g1", "main", &["m2".to_string()])
            .await;

        assert_eq!(outcome.scores.get("A"), Some(&2));
        assert_eq!(outcome.scores.get("B"), Some(&1));
        assert_eq!(outcome.scores.get("m2"), Some(&1));
        assert_eq!(outcome.winners(), vec!["A".to_string()]);
        assert!(outcome.result_lines.iter().any(|l| l.contains("选项 A: 2 票")));
        assert!(outcome.result_lines.iter().any(|l| l.contains("\"向北走\": 1 票")));
    }

    #[tokio::test]
    async fn untouched_ballot_is_empty_but_zero_net_is_not() {
        let (cache, tally, _dir) = fixture();

        // No votes at all: empty scores (the "no one voted" case).
        let outcome = tally.tally("g1", "main", &["m2".to_string()]).await;
        assert!(outcome.scores.is_empty());

        // One yay and one nay: net zero, but the entry still races.
        cache.update_vote("g1", "m2", emoji::YAY, "u1", true).await;
        cache.update_vote("g1", "m2", emoji::NAY, "u2", true).await;
        let outcome = tally.tally("g1", "main", &["m2".to_string()]).await;
        assert_eq!(outcome.scores.get("m2"), Some(&0));
    }

    #[tokio::test]
    async fn ties_report_every_winner() {
        let (cache, tally, _dir) = fixture();

        cache.update_vote("g1", "main", emoji::OPTION_A, "u1", true).await;
        cache.update_vote("g1", "main", emoji::OPTION_C, "u2", true).await;

        let outcome = tally.tally("g1", "main", &[]).await;
        assert_eq!(outcome.winners(), vec!["A".to_string(), "C".to_string()]);
    }

    #[tokio::test]
    async fn unfetchable_custom_input_falls_back_to_placeholder() {
        let (cache, tally, _dir) = fixture();
        cache.update_vote("g1", "m7", emoji::YAY, "u1", true).await;

        let outcome = tally.tally("g1", "main", &["m7".to_string()]).await;
        // Placeholder text is not quoted.
        assert!(outcome
            .result_lines
            .iter()
            .any(|l| l.contains("自定义输入 (ID: m7)") && !l.contains('"')));
    }
}
