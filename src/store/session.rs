//! Participant session snapshot.
//!
//! A single row (id = 1) holding the MessagePack-encoded snapshot.

use rusqlite::{OptionalExtension, params};

use super::TileStore;
use crate::error::{Result, TileCacheError};
use crate::types::{ParticipantSession, now_millis};

const SESSION_ID: i64 = 1;

impl TileStore {
    /// Overwrite the stored snapshot.
    pub async fn save_participant_session(&self, session: &ParticipantSession) -> Result<()> {
        let data = rmp_serde::to_vec_named(session).map_err(TileCacheError::serialization)?;
        let now = now_millis();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO session (id, data, updated_at) VALUES (?1, ?2, ?3)",
                params![SESSION_ID, data, now],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_participant_session(&self) -> Result<Option<ParticipantSession>> {
        let data: Option<Vec<u8>> = self
            .with_conn(|conn| {
                let data = conn
                    .query_row(
                        "SELECT data FROM session WHERE id = ?1",
                        params![SESSION_ID],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(data)
            })
            .await?;

        data.map(|bytes| rmp_serde::from_slice(&bytes).map_err(TileCacheError::serialization))
            .transpose()
    }

    pub async fn clear_participant_session(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM session WHERE id = ?1", params![SESSION_ID])?;
            Ok(())
        })
        .await
    }

    pub async fn has_participant_session(&self) -> Result<bool> {
        self.with_conn(|conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM session WHERE id = ?1)",
                params![SESSION_ID],
                |row| row.get(0),
            )?;
            Ok(exists)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PendingRequest;

    fn sample_session() -> ParticipantSession {
        ParticipantSession {
            run_id: "run-42".to_string(),
            category_id: "cat-m21".to_string(),
            competition_id: "comp-1".to_string(),
            participant_id: "p-9".to_string(),
            participant_name: Some("Alex".to_string()),
            run_active: true,
            finished: false,
            start_time: Some(1_700_000_000_000),
            elapsed_display: "00:12:03".to_string(),
            checkpoint_count: 4,
            pending_requests: vec![PendingRequest {
                id: "req-1".to_string(),
                method: "POST".to_string(),
                endpoint: "/runs/run-42/checkpoints".to_string(),
                body: Some(r#"{"station":"S5"}"#.to_string()),
                created_at: 1_700_000_100_000,
            }],
        }
    }

    #[tokio::test]
    async fn test_session_roundtrip() {
        let store = TileStore::in_memory();
        assert!(!store.has_participant_session().await.unwrap());
        assert!(store.get_participant_session().await.unwrap().is_none());

        let session = sample_session();
        store.save_participant_session(&session).await.unwrap();
        assert!(store.has_participant_session().await.unwrap());
        assert_eq!(
            store.get_participant_session().await.unwrap(),
            Some(session)
        );
    }

    #[tokio::test]
    async fn test_session_is_overwritten_then_cleared() {
        let store = TileStore::in_memory();
        let mut session = sample_session();
        store.save_participant_session(&session).await.unwrap();

        session.checkpoint_count = 5;
        session.pending_requests.clear();
        store.save_participant_session(&session).await.unwrap();

        let loaded = store.get_participant_session().await.unwrap().unwrap();
        assert_eq!(loaded.checkpoint_count, 5);
        assert!(loaded.pending_requests.is_empty());

        store.clear_participant_session().await.unwrap();
        assert!(!store.has_participant_session().await.unwrap());
    }
}
