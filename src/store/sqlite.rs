//! SQLite persistence for the whole pipeline: messages (idempotency ledger),
//! tasks, goals, accounts, the calendar-event cache, the weekly hour ledger,
//! and exhausted-job records.
//!
//! Timestamps are stored as RFC 3339 TEXT and parsed with chrono. All
//! user-owned tables are scoped by `user_id` and every accessor takes a
//! [`RequestContext`]; there is no unscoped query path.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::types::{
    Account, CalendarEvent, CalendarEventUpsert, Direction, EventType, Goal, HistoryTurn,
    MessageStatus, NewGoal, NewTask, Priority, RequestContext, StoredMessage, Task, TaskStatus,
    WorkWeek,
};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(db_path: &str) -> anyhow::Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Isolated in-memory database for tests. Single connection: a pooled
    /// `:memory:` database is per-connection.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(":memory:")
            .in_memory(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                external_id TEXT NOT NULL UNIQUE,
                direction TEXT NOT NULL,
                from_addr TEXT NOT NULL,
                to_addr TEXT NOT NULL,
                body TEXT NOT NULL,
                status TEXT NOT NULL,
                user_id TEXT NOT NULL,
                task_id TEXT,
                created_at TEXT NOT NULL,
                processed_at TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_user ON messages(user_id, created_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                raw_text TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                priority TEXT NOT NULL,
                category TEXT NOT NULL,
                status TEXT NOT NULL,
                alignment_score REAL NOT NULL DEFAULT 0.5,
                pushback_reason TEXT,
                due_at TEXT,
                estimated_hours REAL,
                account_id TEXT,
                user_id TEXT NOT NULL,
                source_message_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                completed_at TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tasks_user_status ON tasks(user_id, status)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS task_transitions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                from_status TEXT NOT NULL,
                to_status TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS goals (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                category TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 2,
                target_date TEXT,
                success_criteria TEXT,
                embedding BLOB NOT NULL,
                user_id TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                account_type TEXT NOT NULL,
                email TEXT NOT NULL DEFAULT '',
                is_primary INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS calendar_events (
                id TEXT PRIMARY KEY,
                external_event_id TEXT NOT NULL UNIQUE,
                account_id TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                location TEXT,
                event_type TEXT NOT NULL DEFAULT 'personal',
                is_auto_blocked INTEGER NOT NULL DEFAULT 0,
                task_id TEXT,
                synced_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_events_account_start
             ON calendar_events(account_id, start_time)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS work_weeks (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                week_start_date TEXT NOT NULL,
                total_hours REAL NOT NULL DEFAULT 0,
                events_json TEXT NOT NULL DEFAULT '[]',
                alert_sent_at TEXT,
                triggered_at TEXT,
                updated_at TEXT NOT NULL,
                UNIQUE(user_id, week_start_date)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS job_failures (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_kind TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                error TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== messages ====================

    /// Record a fresh inbound message. Returns `None` when the external ID
    /// was already recorded; the uniqueness constraint is the idempotency
    /// guard, so a violation is "already processed", not an error.
    pub async fn try_record_inbound(
        &self,
        ctx: &RequestContext,
        external_id: &str,
        from_addr: &str,
        to_addr: &str,
        body: &str,
    ) -> anyhow::Result<Option<StoredMessage>> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        let result = sqlx::query(
            "INSERT INTO messages (id, external_id, direction, from_addr, to_addr, body, status, user_id, created_at)
             VALUES (?, ?, 'inbound', ?, ?, ?, 'received', ?, ?)",
        )
        .bind(&id)
        .bind(external_id)
        .bind(from_addr)
        .bind(to_addr)
        .bind(body)
        .bind(&ctx.user_id)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(Some(StoredMessage {
                id,
                external_id: external_id.to_string(),
                direction: Direction::Inbound,
                from_addr: from_addr.to_string(),
                to_addr: to_addr.to_string(),
                body: body.to_string(),
                status: MessageStatus::Received,
                user_id: ctx.user_id.clone(),
                task_id: None,
                created_at: now,
                processed_at: None,
            })),
            Err(e) if is_unique_violation(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically move a message into `processing`. Returns false when
    /// another worker holds it or it is already processed; the caller must
    /// then skip all side effects. `failed` is claimable again so retries
    /// can re-enter.
    pub async fn claim_for_processing(&self, external_id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE messages SET status = 'processing'
             WHERE external_id = ? AND status IN ('received', 'failed')",
        )
        .bind(external_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_message_status(
        &self,
        external_id: &str,
        status: MessageStatus,
        task_id: Option<&str>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE messages
             SET status = ?, processed_at = ?, task_id = COALESCE(?, task_id)
             WHERE external_id = ?",
        )
        .bind(status.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(task_id)
        .bind(external_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find_message(&self, external_id: &str) -> anyhow::Result<Option<StoredMessage>> {
        let row = sqlx::query("SELECT * FROM messages WHERE external_id = ?")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(message_from_row).transpose()
    }

    /// Record an assistant reply so it shows up in conversation history.
    pub async fn record_outbound(
        &self,
        ctx: &RequestContext,
        to_addr: &str,
        body: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO messages (id, external_id, direction, from_addr, to_addr, body, status, user_id, created_at)
             VALUES (?, ?, 'outbound', '', ?, ?, 'processed', ?, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(format!("out-{}", uuid::Uuid::new_v4()))
        .bind(to_addr)
        .bind(body)
        .bind(&ctx.user_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Last `limit` turns, oldest first. Inbound maps to "user", outbound to
    /// "assistant".
    pub async fn recent_history(
        &self,
        ctx: &RequestContext,
        limit: u32,
    ) -> anyhow::Result<Vec<HistoryTurn>> {
        let rows = sqlx::query(
            "SELECT direction, body FROM messages
             WHERE user_id = ?
             ORDER BY created_at DESC
             LIMIT ?",
        )
        .bind(&ctx.user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut turns: Vec<HistoryTurn> = rows
            .into_iter()
            .map(|row| {
                let direction: String = row.get("direction");
                HistoryTurn {
                    role: if direction == "inbound" { "user" } else { "assistant" },
                    content: row.get("body"),
                }
            })
            .collect();
        turns.reverse();
        Ok(turns)
    }

    // ==================== tasks ====================

    pub async fn create_task(&self, ctx: &RequestContext, input: NewTask) -> anyhow::Result<Task> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO tasks (
                id, raw_text, title, description, priority, category, status,
                alignment_score, pushback_reason, due_at, estimated_hours,
                account_id, user_id, source_message_id, created_at, updated_at, completed_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)",
        )
        .bind(&id)
        .bind(&input.raw_text)
        .bind(&input.title)
        .bind(&input.description)
        .bind(input.priority.as_str())
        .bind(&input.category)
        .bind(input.status.as_str())
        .bind(input.alignment_score)
        .bind(&input.pushback_reason)
        .bind(input.due_at.map(|d| d.to_rfc3339()))
        .bind(input.estimated_hours)
        .bind(&input.account_id)
        .bind(&ctx.user_id)
        .bind(&input.source_message_id)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(Task {
            id,
            raw_text: input.raw_text,
            title: input.title,
            description: input.description,
            priority: input.priority,
            category: input.category,
            status: input.status,
            alignment_score: input.alignment_score,
            pushback_reason: input.pushback_reason,
            due_at: input.due_at,
            estimated_hours: input.estimated_hours,
            account_id: input.account_id,
            user_id: ctx.user_id.clone(),
            source_message_id: input.source_message_id,
            created_at: now,
            completed_at: None,
        })
    }

    pub async fn find_task(&self, ctx: &RequestContext, id: &str) -> anyhow::Result<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(&ctx.user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(task_from_row).transpose()
    }

    /// Case-insensitive title search over non-deleted tasks, newest first.
    /// Used by the action executor's fuzzy matcher.
    pub async fn find_tasks_by_title(
        &self,
        ctx: &RequestContext,
        needle: &str,
    ) -> anyhow::Result<Vec<Task>> {
        let pattern = format!("%{}%", needle.to_lowercase());
        let rows = sqlx::query(
            "SELECT * FROM tasks
             WHERE user_id = ? AND lower(title) LIKE ?
             ORDER BY created_at DESC
             LIMIT 10",
        )
        .bind(&ctx.user_id)
        .bind(pattern)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(task_from_row).collect()
    }

    /// Persist a status change and append to the transition log.
    /// `completed_at` is set only on entry to `completed` and cleared on exit.
    pub async fn record_transition(
        &self,
        ctx: &RequestContext,
        task_id: &str,
        from: TaskStatus,
        to: TaskStatus,
    ) -> anyhow::Result<()> {
        let now = Utc::now().to_rfc3339();
        let completed_at: Option<String> = if to == TaskStatus::Completed {
            Some(now.clone())
        } else {
            None
        };

        sqlx::query(
            "UPDATE tasks SET status = ?, completed_at = ?, updated_at = ?
             WHERE id = ? AND user_id = ?",
        )
        .bind(to.as_str())
        .bind(&completed_at)
        .bind(&now)
        .bind(task_id)
        .bind(&ctx.user_id)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "INSERT INTO task_transitions (task_id, from_status, to_status, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn update_task_title(
        &self,
        ctx: &RequestContext,
        task_id: &str,
        title: &str,
    ) -> anyhow::Result<()> {
        self.update_task_field(ctx, task_id, "title", title).await
    }

    pub async fn update_task_priority(
        &self,
        ctx: &RequestContext,
        task_id: &str,
        priority: Priority,
    ) -> anyhow::Result<()> {
        self.update_task_field(ctx, task_id, "priority", priority.as_str())
            .await
    }

    pub async fn update_task_category(
        &self,
        ctx: &RequestContext,
        task_id: &str,
        category: &str,
    ) -> anyhow::Result<()> {
        self.update_task_field(ctx, task_id, "category", category)
            .await
    }

    async fn update_task_field(
        &self,
        ctx: &RequestContext,
        task_id: &str,
        field: &str,
        value: &str,
    ) -> anyhow::Result<()> {
        // `field` is always a compile-time literal from the wrappers above.
        let query = format!("UPDATE tasks SET {field} = ?, updated_at = ? WHERE id = ? AND user_id = ?");
        sqlx::query(&query)
            .bind(value)
            .bind(Utc::now().to_rfc3339())
            .bind(task_id)
            .bind(&ctx.user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_task_hours(
        &self,
        ctx: &RequestContext,
        task_id: &str,
        hours: f64,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE tasks SET estimated_hours = ?, updated_at = ? WHERE id = ? AND user_id = ?",
        )
        .bind(hours)
        .bind(Utc::now().to_rfc3339())
        .bind(task_id)
        .bind(&ctx.user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_task(&self, ctx: &RequestContext, task_id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ? AND user_id = ?")
            .bind(task_id)
            .bind(&ctx.user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Open work, most urgent first. Feeds query answering and briefings.
    pub async fn list_open_tasks(
        &self,
        ctx: &RequestContext,
        limit: u32,
    ) -> anyhow::Result<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT * FROM tasks
             WHERE user_id = ? AND status IN ('pending', 'active', 'clarification_needed', 'deferred')
             ORDER BY
               CASE priority
                 WHEN 'urgent' THEN 1 WHEN 'high' THEN 2 WHEN 'medium' THEN 3 ELSE 4
               END,
               due_at IS NULL, due_at ASC
             LIMIT ?",
        )
        .bind(&ctx.user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(task_from_row).collect()
    }

    pub async fn list_tasks_by_status(
        &self,
        ctx: &RequestContext,
        status: TaskStatus,
    ) -> anyhow::Result<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT * FROM tasks WHERE user_id = ? AND status = ? ORDER BY created_at DESC",
        )
        .bind(&ctx.user_id)
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(task_from_row).collect()
    }

    /// Week rollover: resurface tasks the killswitch parked in an earlier
    /// week. Only tasks deferred before `deferred_before` (the current week
    /// start) move; a mid-week deferral stays parked until its week ends.
    pub async fn reactivate_deferred_tasks(
        &self,
        ctx: &RequestContext,
        deferred_before: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let now = Utc::now().to_rfc3339();
        let rows = sqlx::query(
            "SELECT id FROM tasks WHERE user_id = ? AND status = 'deferred' AND updated_at < ?",
        )
        .bind(&ctx.user_id)
        .bind(deferred_before.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        let mut moved = 0u64;
        for row in rows {
            let id: String = row.get("id");
            sqlx::query("UPDATE tasks SET status = 'pending', pushback_reason = NULL, updated_at = ? WHERE id = ?")
                .bind(&now)
                .bind(&id)
                .execute(&self.pool)
                .await?;
            sqlx::query(
                "INSERT INTO task_transitions (task_id, from_status, to_status, created_at)
                 VALUES (?, 'deferred', 'pending', ?)",
            )
            .bind(&id)
            .bind(&now)
            .execute(&self.pool)
            .await?;
            moved += 1;
        }
        Ok(moved)
    }

    // ==================== goals ====================

    pub async fn create_goal(&self, ctx: &RequestContext, input: NewGoal) -> anyhow::Result<Goal> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO goals (id, title, description, category, priority, target_date, success_criteria, embedding, user_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&input.title)
        .bind(&input.description)
        .bind(&input.category)
        .bind(input.priority)
        .bind(input.target_date.map(|d| d.to_rfc3339()))
        .bind(&input.success_criteria)
        .bind(encode_embedding(&input.embedding))
        .bind(&ctx.user_id)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(Goal {
            id,
            title: input.title,
            description: input.description,
            category: input.category,
            priority: input.priority,
            target_date: input.target_date,
            success_criteria: input.success_criteria,
            embedding: input.embedding,
            user_id: ctx.user_id.clone(),
            created_at: now,
        })
    }

    pub async fn list_goals(&self, ctx: &RequestContext) -> anyhow::Result<Vec<Goal>> {
        let rows = sqlx::query(
            "SELECT * FROM goals WHERE user_id = ? ORDER BY priority ASC, created_at ASC",
        )
        .bind(&ctx.user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(goal_from_row).collect()
    }

    // ==================== accounts ====================

    pub async fn upsert_account(&self, account: &Account) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO accounts (id, user_id, account_type, email, is_primary)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               user_id = excluded.user_id,
               account_type = excluded.account_type,
               email = excluded.email,
               is_primary = excluded.is_primary",
        )
        .bind(&account.id)
        .bind(&account.user_id)
        .bind(&account.account_type)
        .bind(&account.email)
        .bind(account.is_primary as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_accounts(&self, ctx: &RequestContext) -> anyhow::Result<Vec<Account>> {
        let rows = sqlx::query("SELECT * FROM accounts WHERE user_id = ?")
            .bind(&ctx.user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(account_from_row).collect())
    }

    /// Account matching the given type, falling back to the primary account.
    pub async fn account_for_type(
        &self,
        ctx: &RequestContext,
        account_type: &str,
    ) -> anyhow::Result<Option<Account>> {
        let row = sqlx::query(
            "SELECT * FROM accounts WHERE user_id = ? AND account_type = ? LIMIT 1",
        )
        .bind(&ctx.user_id)
        .bind(account_type)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = row {
            return Ok(Some(account_from_row(row)));
        }

        let primary = sqlx::query(
            "SELECT * FROM accounts WHERE user_id = ? AND is_primary = 1 LIMIT 1",
        )
        .bind(&ctx.user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(primary.map(account_from_row))
    }

    // ==================== calendar events ====================

    pub async fn upsert_event(&self, input: &CalendarEventUpsert) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO calendar_events (
                id, external_event_id, account_id, title, description,
                start_time, end_time, location, event_type, is_auto_blocked,
                task_id, synced_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(external_event_id) DO UPDATE SET
               title = excluded.title,
               description = excluded.description,
               start_time = excluded.start_time,
               end_time = excluded.end_time,
               location = excluded.location,
               event_type = excluded.event_type,
               task_id = COALESCE(excluded.task_id, calendar_events.task_id),
               synced_at = excluded.synced_at",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&input.external_event_id)
        .bind(&input.account_id)
        .bind(&input.title)
        .bind(&input.description)
        .bind(input.start_time.to_rfc3339())
        .bind(input.end_time.to_rfc3339())
        .bind(&input.location)
        .bind(input.event_type.as_str())
        .bind(input.is_auto_blocked as i32)
        .bind(&input.task_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Events overlapping [start, end) on any of the given accounts,
    /// half-open semantics: back-to-back events do not overlap.
    pub async fn events_overlapping(
        &self,
        account_ids: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<CalendarEvent>> {
        if account_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; account_ids.len()].join(", ");
        let sql = format!(
            "SELECT * FROM calendar_events
             WHERE account_id IN ({placeholders})
             AND start_time < ? AND end_time > ?
             ORDER BY start_time ASC"
        );
        let mut query = sqlx::query(&sql);
        for id in account_ids {
            query = query.bind(id);
        }
        query = query.bind(end.to_rfc3339()).bind(start.to_rfc3339());
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(event_from_row).collect()
    }

    /// All protected-hours events for one user's week: event_type is the
    /// protected type OR the owning account is of the protected type.
    pub async fn protected_events_in_week(
        &self,
        ctx: &RequestContext,
        week_start: DateTime<Utc>,
        week_end: DateTime<Utc>,
        protected_account_type: &str,
    ) -> anyhow::Result<Vec<CalendarEvent>> {
        let rows = sqlx::query(
            "SELECT ce.* FROM calendar_events ce
             JOIN accounts a ON ce.account_id = a.id
             WHERE a.user_id = ?
             AND ce.start_time >= ? AND ce.start_time < ?
             AND (ce.event_type = 'work' OR a.account_type = ?)
             ORDER BY ce.start_time ASC",
        )
        .bind(&ctx.user_id)
        .bind(week_start.to_rfc3339())
        .bind(week_end.to_rfc3339())
        .bind(protected_account_type)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(event_from_row).collect()
    }

    pub async fn find_event_by_external_id(
        &self,
        external_event_id: &str,
    ) -> anyhow::Result<Option<CalendarEvent>> {
        let row = sqlx::query("SELECT * FROM calendar_events WHERE external_event_id = ?")
            .bind(external_event_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(event_from_row).transpose()
    }

    pub async fn delete_event_by_external_id(&self, external_event_id: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM calendar_events WHERE external_event_id = ?")
            .bind(external_event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drop cached events inside the sync window that a fresh sync no longer
    /// returned; they were deleted upstream.
    pub async fn delete_stale_events(
        &self,
        account_id: &str,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        fresh_external_ids: &[String],
    ) -> anyhow::Result<u64> {
        if fresh_external_ids.is_empty() {
            let result = sqlx::query(
                "DELETE FROM calendar_events
                 WHERE account_id = ? AND start_time >= ? AND start_time <= ?",
            )
            .bind(account_id)
            .bind(window_start.to_rfc3339())
            .bind(window_end.to_rfc3339())
            .execute(&self.pool)
            .await?;
            return Ok(result.rows_affected());
        }

        let placeholders = vec!["?"; fresh_external_ids.len()].join(", ");
        let sql = format!(
            "DELETE FROM calendar_events
             WHERE account_id = ? AND start_time >= ? AND start_time <= ?
             AND external_event_id NOT IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql)
            .bind(account_id)
            .bind(window_start.to_rfc3339())
            .bind(window_end.to_rfc3339());
        for id in fresh_external_ids {
            query = query.bind(id);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Upcoming events by fuzzy title, across all of the user's accounts.
    pub async fn find_events_by_title(
        &self,
        ctx: &RequestContext,
        needle: &str,
        after: DateTime<Utc>,
    ) -> anyhow::Result<Vec<CalendarEvent>> {
        let pattern = format!("%{}%", needle.to_lowercase());
        let rows = sqlx::query(
            "SELECT ce.* FROM calendar_events ce
             JOIN accounts a ON ce.account_id = a.id
             WHERE a.user_id = ? AND lower(ce.title) LIKE ? AND ce.start_time >= ?
             ORDER BY ce.start_time ASC
             LIMIT 5",
        )
        .bind(&ctx.user_id)
        .bind(pattern)
        .bind(after.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(event_from_row).collect()
    }

    pub async fn upcoming_events(
        &self,
        ctx: &RequestContext,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: u32,
    ) -> anyhow::Result<Vec<CalendarEvent>> {
        let rows = sqlx::query(
            "SELECT ce.* FROM calendar_events ce
             JOIN accounts a ON ce.account_id = a.id
             WHERE a.user_id = ? AND ce.start_time >= ? AND ce.start_time < ?
             ORDER BY ce.start_time ASC
             LIMIT ?",
        )
        .bind(&ctx.user_id)
        .bind(from.to_rfc3339())
        .bind(to.to_rfc3339())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(event_from_row).collect()
    }

    // ==================== work weeks ====================

    /// Idempotent upsert of the derived weekly total. Never increments in
    /// place, so concurrent recomputations converge on the same value.
    pub async fn upsert_week_hours(
        &self,
        ctx: &RequestContext,
        week_start_date: &str,
        total_hours: f64,
        events_json: &str,
    ) -> anyhow::Result<WorkWeek> {
        sqlx::query(
            "INSERT INTO work_weeks (id, user_id, week_start_date, total_hours, events_json, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id, week_start_date) DO UPDATE SET
               total_hours = excluded.total_hours,
               events_json = excluded.events_json,
               updated_at = excluded.updated_at",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&ctx.user_id)
        .bind(week_start_date)
        .bind(total_hours)
        .bind(events_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        self.get_week(ctx, week_start_date)
            .await?
            .ok_or_else(|| anyhow::anyhow!("work week row missing after upsert"))
    }

    pub async fn get_week(
        &self,
        ctx: &RequestContext,
        week_start_date: &str,
    ) -> anyhow::Result<Option<WorkWeek>> {
        let row = sqlx::query(
            "SELECT * FROM work_weeks WHERE user_id = ? AND week_start_date = ?",
        )
        .bind(&ctx.user_id)
        .bind(week_start_date)
        .fetch_optional(&self.pool)
        .await?;
        row.map(week_from_row).transpose()
    }

    pub async fn mark_alert_sent(
        &self,
        ctx: &RequestContext,
        week_start_date: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE work_weeks SET alert_sent_at = ?, updated_at = ?
             WHERE user_id = ? AND week_start_date = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .bind(&ctx.user_id)
        .bind(week_start_date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_triggered(
        &self,
        ctx: &RequestContext,
        week_start_date: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE work_weeks SET triggered_at = ?, updated_at = ?
             WHERE user_id = ? AND week_start_date = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .bind(&ctx.user_id)
        .bind(week_start_date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ==================== job failures ====================

    /// Exhausted jobs are recorded for operator visibility, never dropped.
    pub async fn record_job_failure(
        &self,
        job_kind: &str,
        payload_json: &str,
        error: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO job_failures (job_kind, payload_json, error, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(job_kind)
        .bind(payload_json)
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn count_job_failures(&self) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM job_failures")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}

// ==================== row mapping ====================

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.kind() == sqlx::error::ErrorKind::UniqueViolation
    )
}

fn parse_ts(s: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

fn parse_opt_ts(s: Option<String>) -> anyhow::Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn message_from_row(row: sqlx::sqlite::SqliteRow) -> anyhow::Result<StoredMessage> {
    let direction: String = row.get("direction");
    let status: String = row.get("status");
    let created_at: String = row.get("created_at");
    Ok(StoredMessage {
        id: row.get("id"),
        external_id: row.get("external_id"),
        direction: if direction == "outbound" {
            Direction::Outbound
        } else {
            Direction::Inbound
        },
        from_addr: row.get("from_addr"),
        to_addr: row.get("to_addr"),
        body: row.get("body"),
        status: MessageStatus::parse(&status).unwrap_or(MessageStatus::Received),
        user_id: row.get("user_id"),
        task_id: row.get("task_id"),
        created_at: parse_ts(&created_at)?,
        processed_at: parse_opt_ts(row.get("processed_at"))?,
    })
}

fn task_from_row(row: sqlx::sqlite::SqliteRow) -> anyhow::Result<Task> {
    let priority: String = row.get("priority");
    let status: String = row.get("status");
    let created_at: String = row.get("created_at");
    Ok(Task {
        id: row.get("id"),
        raw_text: row.get("raw_text"),
        title: row.get("title"),
        description: row.get("description"),
        priority: Priority::parse(&priority),
        category: row.get("category"),
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Pending),
        alignment_score: row.get("alignment_score"),
        pushback_reason: row.get("pushback_reason"),
        due_at: parse_opt_ts(row.get("due_at"))?,
        estimated_hours: row.get("estimated_hours"),
        account_id: row.get("account_id"),
        user_id: row.get("user_id"),
        source_message_id: row.get("source_message_id"),
        created_at: parse_ts(&created_at)?,
        completed_at: parse_opt_ts(row.get("completed_at"))?,
    })
}

fn goal_from_row(row: sqlx::sqlite::SqliteRow) -> anyhow::Result<Goal> {
    let created_at: String = row.get("created_at");
    let blob: Vec<u8> = row.get("embedding");
    Ok(Goal {
        id: row.get("id"),
        title: row.get("title"),
        description: row.get("description"),
        category: row.get("category"),
        priority: row.get("priority"),
        target_date: parse_opt_ts(row.get("target_date"))?,
        success_criteria: row.get("success_criteria"),
        embedding: decode_embedding(&blob),
        user_id: row.get("user_id"),
        created_at: parse_ts(&created_at)?,
    })
}

fn account_from_row(row: sqlx::sqlite::SqliteRow) -> Account {
    let is_primary: i32 = row.get("is_primary");
    Account {
        id: row.get("id"),
        user_id: row.get("user_id"),
        account_type: row.get("account_type"),
        email: row.get("email"),
        is_primary: is_primary != 0,
    }
}

fn event_from_row(row: sqlx::sqlite::SqliteRow) -> anyhow::Result<CalendarEvent> {
    let start_time: String = row.get("start_time");
    let end_time: String = row.get("end_time");
    let synced_at: String = row.get("synced_at");
    let event_type: String = row.get("event_type");
    let is_auto_blocked: i32 = row.get("is_auto_blocked");
    Ok(CalendarEvent {
        id: row.get("id"),
        external_event_id: row.get("external_event_id"),
        account_id: row.get("account_id"),
        title: row.get("title"),
        description: row.get("description"),
        start_time: parse_ts(&start_time)?,
        end_time: parse_ts(&end_time)?,
        location: row.get("location"),
        event_type: EventType::parse(&event_type),
        is_auto_blocked: is_auto_blocked != 0,
        task_id: row.get("task_id"),
        synced_at: parse_ts(&synced_at)?,
    })
}

fn week_from_row(row: sqlx::sqlite::SqliteRow) -> anyhow::Result<WorkWeek> {
    Ok(WorkWeek {
        id: row.get("id"),
        user_id: row.get("user_id"),
        week_start_date: row.get("week_start_date"),
        total_hours: row.get("total_hours"),
        events_json: row.get("events_json"),
        alert_sent_at: parse_opt_ts(row.get("alert_sent_at"))?,
        triggered_at: parse_opt_ts(row.get("triggered_at"))?,
    })
}

/// Embeddings are stored as little-endian f32 bytes.
fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
