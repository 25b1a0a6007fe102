use rusqlite::Connection;

/// Bump when `SCHEMA` changes. A mismatch drops and recreates every table;
/// sessions and prekeys are then rebuilt by the usual bootstrap.
const SCHEMA_VERSION: i64 = 1;

/// Open (or create) the key database and bring its schema up to date.
///
/// Returns the connection and whether the schema was recreated.
pub fn open(path: &str) -> Result<(Connection, bool), rusqlite::Error> {
    let conn = Connection::open(path)?;

    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;

    let current: i64 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .unwrap_or(0);

    let schema_reset = current != SCHEMA_VERSION;
    if schema_reset {
        if current != 0 {
            tracing::info!(
                old = current,
                new = SCHEMA_VERSION,
                "key database schema mismatch; recreating"
            );
        }
        drop_all_tables(&conn)?;
        conn.execute_batch(SCHEMA)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    }

    Ok((conn, schema_reset))
}

fn drop_all_tables(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch("PRAGMA foreign_keys=OFF;")?;

    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'")?;
    let tables: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .filter_map(Result::ok)
        .collect();
    drop(stmt);

    for table in &tables {
        conn.execute_batch(&format!("DROP TABLE IF EXISTS \"{table}\";"))?;
    }

    conn.execute_batch("PRAGMA foreign_keys=ON;")
}

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS sessions (
    name TEXT NOT NULL,
    device_id INTEGER NOT NULL,
    record BLOB NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (name, device_id)
);

CREATE TABLE IF NOT EXISTS prekeys (
    id INTEGER PRIMARY KEY,
    record BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS signed_prekeys (
    id INTEGER PRIMARY KEY,
    record BLOB NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS trusted_identities (
    name TEXT NOT NULL,
    device_id INTEGER NOT NULL,
    identity_key BLOB NOT NULL,
    first_seen INTEGER NOT NULL,
    PRIMARY KEY (name, device_id)
);

CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
";

/// Current UNIX timestamp in milliseconds.
pub fn timestamp_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(i64::MAX)
}
