use anyhow::{Context, Result};
use rusqlite::{params, Row};

use crate::db::{
    connection::Database,
    helpers::{parse_datetime, parse_optional_datetime, to_i64, to_u32, to_u64},
};
use crate::models::{ActiveSession, ScheduledSession};

fn row_to_scheduled(row: &Row) -> Result<ScheduledSession> {
    let scheduled_at: String = row.get("scheduled_at")?;
    let expires_at: String = row.get("expires_at")?;

    Ok(ScheduledSession {
        chain_id: row.get("chain_id")?,
        scheduled_at: parse_datetime(&scheduled_at, "scheduled_at")?,
        expires_at: parse_datetime(&expires_at, "expires_at")?,
        auxiliary_signal: row.get("auxiliary_signal")?,
    })
}

fn row_to_active(row: &Row) -> Result<ActiveSession> {
    let started_at: String = row.get("started_at")?;

    Ok(ActiveSession {
        chain_id: row.get("chain_id")?,
        started_at: parse_datetime(&started_at, "started_at")?,
        duration: to_u32(row.get("duration")?, "duration")?,
        is_paused: row.get("is_paused")?,
        paused_at: parse_optional_datetime(row.get("paused_at")?, "paused_at")?,
        total_paused_time: to_u64(row.get("total_paused_time")?, "total_paused_time")?,
    })
}

impl Database {
    pub async fn list_scheduled_sessions(&self) -> Result<Vec<ScheduledSession>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT chain_id, scheduled_at, expires_at, auxiliary_signal
                 FROM scheduled_sessions
                 ORDER BY rowid ASC",
            )?;
            let mut rows = stmt.query([])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_scheduled(row)?);
            }
            Ok(sessions)
        })
        .await
    }

    pub async fn replace_scheduled_sessions(&self, sessions: Vec<ScheduledSession>) -> Result<()> {
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM scheduled_sessions", [])?;
            for session in &sessions {
                tx.execute(
                    "INSERT OR REPLACE INTO scheduled_sessions (chain_id, scheduled_at, expires_at, auxiliary_signal)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        session.chain_id,
                        session.scheduled_at.to_rfc3339(),
                        session.expires_at.to_rfc3339(),
                        session.auxiliary_signal,
                    ],
                )
                .with_context(|| format!("failed to insert booking for {}", session.chain_id))?;
            }
            tx.commit().context("failed to commit scheduled sessions")?;
            Ok(())
        })
        .await
    }

    pub async fn load_active_session(&self) -> Result<Option<ActiveSession>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT chain_id, started_at, duration, is_paused, paused_at, total_paused_time
                 FROM active_session
                 WHERE slot = 1",
            )?;
            let mut rows = stmt.query([])?;
            let session = match rows.next()? {
                Some(row) => Some(row_to_active(row)?),
                None => None,
            };
            Ok(session)
        })
        .await
    }

    /// Stores or clears the single active-session row.
    pub async fn store_active_session(&self, session: Option<ActiveSession>) -> Result<()> {
        self.execute(move |conn| {
            let Some(session) = session else {
                conn.execute("DELETE FROM active_session", [])
                    .context("failed to clear active session")?;
                return Ok(());
            };
            conn.execute(
                "INSERT OR REPLACE INTO active_session
                    (slot, chain_id, started_at, duration, is_paused, paused_at, total_paused_time)
                 VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    session.chain_id,
                    session.started_at.to_rfc3339(),
                    session.duration,
                    session.is_paused,
                    session.paused_at.map(|dt| dt.to_rfc3339()),
                    to_i64(session.total_paused_time)?,
                ],
            )
            .context("failed to store active session")?;
            Ok(())
        })
        .await
    }
}
