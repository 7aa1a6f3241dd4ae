use std::collections::HashSet;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use rusqlite::{params, Connection, Row, Transaction};

use crate::db::{
    connection::Database,
    helpers::{parse_datetime, parse_optional_datetime, parse_string_list, to_u32},
};
use crate::models::{Chain, ChainType};
use crate::tree::descendant_ids;

const CHAIN_COLUMNS: &str = "id, parent_id, name, chain_type, sort_order, trigger_action, duration,
     is_durationless, description, auxiliary_signal, auxiliary_duration,
     auxiliary_completion_trigger, current_streak, auxiliary_streak, total_completions,
     total_failures, auxiliary_failures, task_repeat_count, exceptions, auxiliary_exceptions,
     time_limit_hours, group_started_at, group_expires_at, created_at, last_completed_at,
     deleted_at";

fn row_to_chain(row: &Row) -> Result<Chain> {
    let chain_type: String = row.get("chain_type")?;
    let exceptions: String = row.get("exceptions")?;
    let auxiliary_exceptions: String = row.get("auxiliary_exceptions")?;
    let time_limit_hours: Option<i64> = row.get("time_limit_hours")?;
    let created_at: String = row.get("created_at")?;

    Ok(Chain {
        id: row.get("id")?,
        parent_id: row.get("parent_id")?,
        name: row.get("name")?,
        chain_type: ChainType::from(chain_type),
        sort_order: row.get("sort_order")?,
        trigger: row.get("trigger_action")?,
        duration: to_u32(row.get("duration")?, "duration")?,
        is_durationless: row.get("is_durationless")?,
        description: row.get("description")?,
        auxiliary_signal: row.get("auxiliary_signal")?,
        auxiliary_duration: to_u32(row.get("auxiliary_duration")?, "auxiliary_duration")?,
        auxiliary_completion_trigger: row.get("auxiliary_completion_trigger")?,
        current_streak: to_u32(row.get("current_streak")?, "current_streak")?,
        auxiliary_streak: to_u32(row.get("auxiliary_streak")?, "auxiliary_streak")?,
        total_completions: to_u32(row.get("total_completions")?, "total_completions")?,
        total_failures: to_u32(row.get("total_failures")?, "total_failures")?,
        auxiliary_failures: to_u32(row.get("auxiliary_failures")?, "auxiliary_failures")?,
        task_repeat_count: to_u32(row.get("task_repeat_count")?, "task_repeat_count")?,
        exceptions: parse_string_list(&exceptions, "exceptions")?,
        auxiliary_exceptions: parse_string_list(&auxiliary_exceptions, "auxiliary_exceptions")?,
        time_limit_hours: time_limit_hours
            .map(|hours| to_u32(hours, "time_limit_hours"))
            .transpose()?,
        group_started_at: parse_optional_datetime(row.get("group_started_at")?, "group_started_at")?,
        group_expires_at: parse_optional_datetime(row.get("group_expires_at")?, "group_expires_at")?,
        created_at: parse_datetime(&created_at, "created_at")?,
        last_completed_at: parse_optional_datetime(
            row.get("last_completed_at")?,
            "last_completed_at",
        )?,
        deleted_at: parse_optional_datetime(row.get("deleted_at")?, "deleted_at")?,
    })
}

fn query_chains(conn: &Connection, only_active: bool) -> Result<Vec<Chain>> {
    let filter = if only_active {
        "WHERE deleted_at IS NULL"
    } else {
        ""
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT {CHAIN_COLUMNS} FROM chains {filter} ORDER BY rowid ASC"
    ))?;
    let mut rows = stmt.query([])?;
    let mut chains = Vec::new();
    while let Some(row) = rows.next()? {
        chains.push(row_to_chain(row)?);
    }
    Ok(chains)
}

fn insert_chain(tx: &Transaction<'_>, chain: &Chain) -> Result<()> {
    tx.execute(
        &format!(
            "INSERT INTO chains ({CHAIN_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)"
        ),
        params![
            chain.id,
            chain.parent_id,
            chain.name,
            chain.chain_type.as_str(),
            chain.sort_order,
            chain.trigger,
            chain.duration,
            chain.is_durationless,
            chain.description,
            chain.auxiliary_signal,
            chain.auxiliary_duration,
            chain.auxiliary_completion_trigger,
            chain.current_streak,
            chain.auxiliary_streak,
            chain.total_completions,
            chain.total_failures,
            chain.auxiliary_failures,
            chain.task_repeat_count,
            serde_json::to_string(&chain.exceptions)?,
            serde_json::to_string(&chain.auxiliary_exceptions)?,
            chain.time_limit_hours,
            chain.group_started_at.map(|dt| dt.to_rfc3339()),
            chain.group_expires_at.map(|dt| dt.to_rfc3339()),
            chain.created_at.to_rfc3339(),
            chain.last_completed_at.map(|dt| dt.to_rfc3339()),
            chain.deleted_at.map(|dt| dt.to_rfc3339()),
        ],
    )
    .with_context(|| format!("failed to insert chain {}", chain.id))?;
    Ok(())
}

/// Deletes `roots`, their descendants and everything keyed by those ids.
fn purge_chains(tx: &Transaction<'_>, roots: &[String]) -> Result<Vec<String>> {
    let all = query_chains(tx, false)?;
    let mut doomed: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for root in roots {
        let ids = std::iter::once(root.clone()).chain(descendant_ids(&all, root));
        for id in ids {
            if seen.insert(id.clone()) {
                doomed.push(id);
            }
        }
    }

    for id in &doomed {
        tx.execute("DELETE FROM chains WHERE id = ?1", params![id])?;
        tx.execute("DELETE FROM scheduled_sessions WHERE chain_id = ?1", params![id])?;
        tx.execute("DELETE FROM completion_history WHERE chain_id = ?1", params![id])?;
        tx.execute("DELETE FROM task_time_stats WHERE chain_id = ?1", params![id])?;
        tx.execute("DELETE FROM active_session WHERE chain_id = ?1", params![id])?;
    }
    Ok(doomed)
}

impl Database {
    pub async fn list_chains(&self) -> Result<Vec<Chain>> {
        self.execute(|conn| query_chains(conn, false)).await
    }

    pub async fn list_active_chains(&self) -> Result<Vec<Chain>> {
        self.execute(|conn| query_chains(conn, true)).await
    }

    /// Replaces the whole chain table in one transaction.
    pub async fn replace_chains(&self, chains: Vec<Chain>) -> Result<()> {
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM chains", [])?;
            for chain in &chains {
                insert_chain(&tx, chain)?;
            }
            tx.commit().context("failed to commit chain replacement")?;
            Ok(())
        })
        .await
    }

    pub async fn delete_chain_permanently(&self, id: String) -> Result<bool> {
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let exists: i64 = tx.query_row(
                "SELECT COUNT(*) FROM chains WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            if exists == 0 {
                return Ok(false);
            }
            purge_chains(&tx, &[id])?;
            tx.commit().context("failed to commit chain deletion")?;
            Ok(true)
        })
        .await
    }

    /// Purges chains soft-deleted more than `days` ago.
    pub async fn purge_deleted_chains(&self, days: u32) -> Result<Vec<String>> {
        self.execute(move |conn| {
            let cutoff = Utc::now() - Duration::days(i64::from(days));
            let tx = conn.transaction()?;
            let expired: Vec<String> = query_chains(&tx, false)?
                .into_iter()
                .filter(|c| c.deleted_at.is_some_and(|at| at < cutoff))
                .map(|c| c.id)
                .collect();
            if expired.is_empty() {
                return Ok(Vec::new());
            }
            let purged = purge_chains(&tx, &expired)?;
            tx.commit().context("failed to commit recycle bin cleanup")?;
            Ok(purged)
        })
        .await
    }
}
