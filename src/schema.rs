pub const SCHEMA_VERSION: &str = "1";

pub const CREATE_SCHEMA_SQL: &str = r#"
BEGIN TRANSACTION;

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', '1');

CREATE TABLE IF NOT EXISTS permission_windows (
    window_id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    intervals TEXT NOT NULL DEFAULT '[]'  -- JSON array of {day, start, end}
);

CREATE TABLE IF NOT EXISTS load_progress (
    load_progress_id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    origin_date INTEGER,                  -- Unix timestamp (UTC)
    data_load_progress INTEGER,           -- Unix timestamp (UTC)
    default_days INTEGER NOT NULL DEFAULT 0 CHECK (default_days >= 0),
    date_strategy INTEGER NOT NULL DEFAULT 0,
    is_locked BOOLEAN NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS cache_progress (
    cache_progress_id INTEGER PRIMARY KEY AUTOINCREMENT,
    load_progress_id INTEGER NOT NULL UNIQUE,
    cache_fill_progress INTEGER,          -- Unix timestamp (UTC)
    chunk_period INTEGER NOT NULL CHECK (chunk_period > 0), -- seconds
    lag_period INTEGER,                   -- seconds
    permission_window_id INTEGER,
    FOREIGN KEY (load_progress_id) REFERENCES load_progress(load_progress_id),
    FOREIGN KEY (permission_window_id) REFERENCES permission_windows(window_id)
);

CREATE TABLE IF NOT EXISTS load_tables (
    load_progress_id INTEGER NOT NULL,
    table_name TEXT NOT NULL,
    position INTEGER NOT NULL DEFAULT 0,
    primary_key TEXT NOT NULL,            -- JSON array of column names
    columns TEXT NOT NULL,                -- JSON array of column names
    date_column TEXT,
    PRIMARY KEY (load_progress_id, table_name),
    FOREIGN KEY (load_progress_id) REFERENCES load_progress(load_progress_id)
);

CREATE TABLE IF NOT EXISTS entity_locks (
    entity TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    locked_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS load_runs (
    run_id INTEGER PRIMARY KEY AUTOINCREMENT,
    load_progress_id INTEGER NOT NULL,
    window_start INTEGER NOT NULL,
    window_end INTEGER NOT NULL,
    status INTEGER NOT NULL,              -- 0 running, 1 completed, 2 failed
    start_time INTEGER NOT NULL,
    end_time INTEGER,
    inserts INTEGER,
    updates INTEGER,
    message TEXT
);

CREATE TABLE IF NOT EXISTS load_run_tables (
    run_id INTEGER NOT NULL,
    table_name TEXT NOT NULL,
    inserts INTEGER NOT NULL,
    updates INTEGER NOT NULL,
    PRIMARY KEY (run_id, table_name),
    FOREIGN KEY (run_id) REFERENCES load_runs(run_id)
);

CREATE INDEX IF NOT EXISTS idx_load_runs_progress ON load_runs (load_progress_id, run_id);

CREATE TABLE IF NOT EXISTS fetch_failures (
    failure_id INTEGER PRIMARY KEY AUTOINCREMENT,
    load_progress_id INTEGER NOT NULL,
    window_start INTEGER NOT NULL,
    window_end INTEGER NOT NULL,
    message TEXT NOT NULL,
    recorded_at INTEGER NOT NULL
);

COMMIT;
"#;
