use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates `scheduled_tasks` and `task_logs` (idempotent). Log rows cascade
/// with their task; the connection must have `PRAGMA foreign_keys=ON` for
/// the cascade to take effect.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS scheduled_tasks (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            name             TEXT    NOT NULL UNIQUE,
            cron_schedule    TEXT    NOT NULL,
            status           TEXT    NOT NULL DEFAULT 'idle'
                             CHECK (status IN ('idle', 'running', 'retrying', 'completed', 'failed')),
            last_run_at      TEXT,               -- RFC 3339 or NULL
            next_run_at      TEXT,               -- RFC 3339 or NULL
            last_log_message TEXT,
            created_at       TEXT    NOT NULL,
            updated_at       TEXT    NOT NULL
        );

        CREATE TABLE IF NOT EXISTS task_logs (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id     INTEGER NOT NULL REFERENCES scheduled_tasks (id) ON DELETE CASCADE,
            level       TEXT    NOT NULL CHECK (level IN ('info', 'warn', 'error')),
            message     TEXT    NOT NULL,
            created_at  TEXT    NOT NULL
        );

        -- Log tail query: WHERE task_id = ? ORDER BY created_at DESC LIMIT ?
        CREATE INDEX IF NOT EXISTS idx_task_logs_task_created
            ON task_logs (task_id, created_at DESC);
        ",
    )?;
    Ok(())
}
