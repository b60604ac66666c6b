//! Table DDL.
//!
//! Table names are compile-time constants; cleanup iterates `TABLES` and
//! never interpolates caller input into SQL text.

pub const CREATE_SESSIONS_TABLE: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    port INTEGER NOT NULL,
    ip TEXT NOT NULL,
    first_seen_at DATETIME NOT NULL,
    last_seen_at DATETIME NOT NULL,
    connection_num INTEGER DEFAULT 1,
    total_bytes INTEGER DEFAULT 0,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP
)";

pub const CREATE_BAN_HISTORY_TABLE: &str = "
CREATE TABLE IF NOT EXISTS ban_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    port INTEGER NOT NULL,
    ip TEXT NOT NULL,
    banned_at DATETIME NOT NULL,
    expire_at DATETIME NOT NULL,
    duration INTEGER NOT NULL,
    strategy TEXT NOT NULL,
    reason TEXT,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP
)";

pub const CREATE_STATISTICS_TABLE: &str = "
CREATE TABLE IF NOT EXISTS statistics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    port INTEGER NOT NULL,
    hour DATETIME NOT NULL,
    unique_ips INTEGER NOT NULL,
    total_bans INTEGER NOT NULL,
    avg_sessions REAL NOT NULL,
    max_sessions INTEGER NOT NULL,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP
)";

/// Every statement run at startup, one statement per entry.
pub const ALL_STATEMENTS: &[&str] = &[
    CREATE_SESSIONS_TABLE,
    "CREATE INDEX IF NOT EXISTS idx_sessions_port_ip ON sessions(port, ip)",
    "CREATE INDEX IF NOT EXISTS idx_sessions_first_seen ON sessions(first_seen_at)",
    CREATE_BAN_HISTORY_TABLE,
    "CREATE INDEX IF NOT EXISTS idx_ban_port_ip ON ban_history(port, ip)",
    "CREATE INDEX IF NOT EXISTS idx_ban_time ON ban_history(banned_at)",
    CREATE_STATISTICS_TABLE,
    // Uniqueness on (port, hour) enables the hourly upsert.
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_stats_port_hour ON statistics(port, hour)",
];

/// Tables subject to retention pruning.
pub const TABLES: &[&str] = &["sessions", "ban_history", "statistics"];
