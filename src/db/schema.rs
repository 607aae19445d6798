//! Schema for the offline store. Timestamps are epoch milliseconds.

pub const SCHEMA: &str = r#"
-- Mutation intents waiting for delivery
CREATE TABLE IF NOT EXISTS mutation_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    category TEXT NOT NULL,
    action TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    method TEXT NOT NULL,
    payload TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_mutation_queue_actionable
    ON mutation_queue(status, created_at, id);

-- Intents that exhausted their retry budget, kept for inspection
CREATE TABLE IF NOT EXISTS dead_letters (
    id INTEGER PRIMARY KEY,
    category TEXT NOT NULL,
    action TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    method TEXT NOT NULL,
    payload TEXT,
    created_at INTEGER NOT NULL,
    attempts INTEGER NOT NULL,
    last_error TEXT,
    failed_at INTEGER NOT NULL
);

-- Read-through cache with per-entry expiry
CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY,
    category TEXT NOT NULL,
    value TEXT NOT NULL,
    cached_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_expires ON cache_entries(expires_at);

-- Cumulative counters that outlive the rows they count
CREATE TABLE IF NOT EXISTS sync_counters (
    name TEXT PRIMARY KEY,
    value INTEGER NOT NULL DEFAULT 0
);

INSERT OR IGNORE INTO sync_counters (name, value) VALUES ('delivered', 0);
INSERT OR IGNORE INTO sync_counters (name, value) VALUES ('lost', 0);
"#;
