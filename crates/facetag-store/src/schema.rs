use rusqlite::Connection;

pub fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

pub fn apply_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS person_map (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  foreign_id TEXT NOT NULL,
  local_id TEXT NOT NULL,
  local_entity_type TEXT NOT NULL,
  created INTEGER NOT NULL,
  changed INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_person_map_local ON person_map(local_entity_type, local_id);
CREATE INDEX IF NOT EXISTS idx_person_map_foreign ON person_map(foreign_id);

CREATE TABLE IF NOT EXISTS work_queue (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  queue TEXT NOT NULL,
  item_key TEXT NOT NULL,
  payload TEXT NOT NULL,
  attempts INTEGER NOT NULL DEFAULT 0,
  last_error TEXT,
  created INTEGER NOT NULL,
  UNIQUE(queue, item_key)
);

CREATE INDEX IF NOT EXISTS idx_work_queue_queue ON work_queue(queue, id);

CREATE TABLE IF NOT EXISTS tag_outbox (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  entity_type TEXT NOT NULL,
  entity_id TEXT NOT NULL,
  tag_field TEXT NOT NULL,
  tags TEXT NOT NULL,
  created INTEGER NOT NULL,
  UNIQUE(entity_type, entity_id, tag_field)
);
"#,
    )
}
