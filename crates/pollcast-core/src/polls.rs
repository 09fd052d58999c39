use chrono::{DateTime, Utc};
use pollcast_db::polls::NewPoll;
use pollcast_db::{to_millis, DbPool};
use pollcast_models::poll::{MAX_OPTIONS, MAX_OPTION_LEN, MAX_QUESTION_LEN, MIN_OPTIONS};
use pollcast_models::{Poll, PollResults};
use uuid::Uuid;

use crate::error::CoreError;
use crate::AppState;

/// Validated poll definition, trimmed and ready to store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollDraft {
    pub question: String,
    pub options: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

pub fn validate_poll(
    question: &str,
    options: &[String],
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<PollDraft, CoreError> {
    let question = question.trim();
    if question.is_empty() || question.chars().count() > MAX_QUESTION_LEN {
        return Err(CoreError::BadRequest(format!(
            "Question must be between 1 and {MAX_QUESTION_LEN} characters"
        )));
    }

    if options.len() < MIN_OPTIONS || options.len() > MAX_OPTIONS {
        return Err(CoreError::BadRequest(format!(
            "A poll needs between {MIN_OPTIONS} and {MAX_OPTIONS} options"
        )));
    }
    let options: Vec<String> = options.iter().map(|o| o.trim().to_string()).collect();
    if options
        .iter()
        .any(|o| o.is_empty() || o.chars().count() > MAX_OPTION_LEN)
    {
        return Err(CoreError::BadRequest(format!(
            "Each option must be between 1 and {MAX_OPTION_LEN} characters"
        )));
    }

    if expires_at <= now {
        return Err(CoreError::BadRequest(
            "Expiry must be in the future".into(),
        ));
    }

    Ok(PollDraft {
        question: question.to_string(),
        options,
        expires_at,
    })
}

pub async fn create_poll(
    pool: &DbPool,
    question: &str,
    options: &[String],
    expires_at: DateTime<Utc>,
    created_by: Option<&str>,
) -> Result<Poll, CoreError> {
    let now = Utc::now();
    let draft = validate_poll(question, options, expires_at, now)?;
    let id = Uuid::new_v4().to_string();

    let row = pollcast_db::polls::create_poll(
        pool,
        &NewPoll {
            id: &id,
            question: &draft.question,
            options: &draft.options,
            created_at: to_millis(now),
            expires_at: to_millis(draft.expires_at),
            created_by,
        },
    )
    .await?;
    tracing::info!(poll_id = %id, options = draft.options.len(), "polls: created");
    Ok(row.into_poll())
}

pub async fn get_poll(pool: &DbPool, poll_id: &str) -> Result<Option<Poll>, CoreError> {
    let row = pollcast_db::polls::get_poll(pool, poll_id).await?;
    Ok(row.map(|row| row.into_poll()))
}

/// Poll plus one count per option, zero-filled. `total_votes` is always the
/// sum of `votes`.
pub async fn get_results(pool: &DbPool, poll_id: &str) -> Result<Option<PollResults>, CoreError> {
    let Some(row) = pollcast_db::polls::get_poll(pool, poll_id).await? else {
        return Ok(None);
    };
    let tally = pollcast_db::votes::tally_votes(pool, poll_id).await?;

    let mut votes = vec![0_i64; row.option_count()];
    for (option_index, count) in tally {
        let slot = usize::try_from(option_index)
            .ok()
            .and_then(|index| votes.get_mut(index));
        match slot {
            Some(slot) => *slot = count,
            None => tracing::warn!(
                poll_id = %poll_id,
                "polls: ignoring {count} votes for out-of-range option {option_index}"
            ),
        }
    }
    let total_votes = votes.iter().sum();

    Ok(Some(PollResults {
        poll: row.into_poll(),
        votes,
        total_votes,
    }))
}

/// Deactivate a poll and announce it. Only the creator may close a poll;
/// polls without a recorded creator may be closed by anyone. Closing an
/// already closed poll succeeds and announces again.
pub async fn close_poll(state: &AppState, poll_id: &str, requested_by: &str) -> Result<(), CoreError> {
    let Some(poll) = pollcast_db::polls::get_poll(&state.db, poll_id).await? else {
        return Err(CoreError::NotFound);
    };
    if poll
        .created_by
        .as_deref()
        .is_some_and(|creator| creator != requested_by)
    {
        return Err(CoreError::Forbidden);
    }

    if !pollcast_db::polls::close_poll(&state.db, poll_id).await? {
        return Err(CoreError::NotFound);
    }
    tracing::info!(poll_id = %poll_id, "polls: closed");
    state.publisher.publish_poll_closed(poll_id).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::memory_state;
    use crate::votes::cast_vote;
    use chrono::Duration;
    use pollcast_bus::PubSub;

    fn options(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn in_one_hour() -> DateTime<Utc> {
        Utc::now() + Duration::hours(1)
    }

    #[test]
    fn validation_trims_and_checks_bounds() {
        let now = Utc::now();
        let later = now + Duration::minutes(5);
        let draft = validate_poll("  Tea? ", &options(&[" yes", "no "]), later, now).unwrap();
        assert_eq!(draft.question, "Tea?");
        assert_eq!(draft.options, vec!["yes", "no"]);

        assert!(validate_poll("   ", &options(&["a", "b"]), later, now).is_err());
        assert!(validate_poll("q", &options(&["only"]), later, now).is_err());
        let eleven: Vec<String> = (0..11).map(|i| i.to_string()).collect();
        assert!(validate_poll("q", &eleven, later, now).is_err());
        assert!(validate_poll("q", &options(&["a", " "]), later, now).is_err());
        assert!(validate_poll("q", &[String::from("a"), "x".repeat(201)], later, now).is_err());
        assert!(validate_poll(&"q".repeat(501), &options(&["a", "b"]), later, now).is_err());
        assert!(validate_poll("q", &options(&["a", "b"]), now, now).is_err());
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let state = memory_state().await;
        let poll = create_poll(&state.db, "Lunch?", &options(&["Pizza", "Sushi"]), in_one_hour(), Some("u1"))
            .await
            .unwrap();
        assert!(poll.is_active);
        assert_eq!(poll.created_by.as_deref(), Some("u1"));

        let loaded = get_poll(&state.db, &poll.id).await.unwrap().expect("poll");
        assert_eq!(loaded.options, vec!["Pizza", "Sushi"]);
        assert!(get_poll(&state.db, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn results_are_zero_filled_and_summed() {
        let state = memory_state().await;
        let poll = create_poll(&state.db, "Pick", &options(&["A", "B", "C"]), in_one_hour(), None)
            .await
            .unwrap();
        for (voter, option) in [("u1", 2), ("u2", 2), ("u3", 0)] {
            cast_vote(&state.db, &poll.id, voter, option).await.unwrap();
        }

        let results = get_results(&state.db, &poll.id).await.unwrap().expect("results");
        assert_eq!(results.votes, vec![1, 0, 2]);
        assert_eq!(results.total_votes, 3);

        let empty = create_poll(&state.db, "None yet", &options(&["A", "B"]), in_one_hour(), None)
            .await
            .unwrap();
        let results = get_results(&state.db, &empty.id).await.unwrap().unwrap();
        assert_eq!(results.votes, vec![0, 0]);
        assert_eq!(results.total_votes, 0);

        assert!(get_results(&state.db, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn close_is_creator_only_and_announces() {
        let state = memory_state().await;
        let mut updates = state.bus.subscribe(&state.config.update_topic).await.unwrap();
        let poll = create_poll(&state.db, "Close me", &options(&["A", "B"]), in_one_hour(), Some("owner"))
            .await
            .unwrap();

        assert!(matches!(
            close_poll(&state, &poll.id, "intruder").await,
            Err(CoreError::Forbidden)
        ));
        assert!(matches!(
            close_poll(&state, "missing", "owner").await,
            Err(CoreError::NotFound)
        ));

        close_poll(&state, &poll.id, "owner").await.unwrap();
        let closed = get_poll(&state.db, &poll.id).await.unwrap().unwrap();
        assert!(!closed.is_active);

        let payload = updates.recv().await.expect("poll_closed");
        let event: pollcast_models::UpdateEvent = serde_json::from_str(&payload).unwrap();
        assert_eq!(event, pollcast_models::UpdateEvent::poll_closed(poll.id.clone()));

        assert!(matches!(
            cast_vote(&state.db, &poll.id, "late", 0).await,
            Err(CoreError::NotFoundOrClosed)
        ));
    }
}
