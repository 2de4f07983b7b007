//! Durable storage.
//!
//! SQLite is the only durable state in a node. Writes that touch multiple
//! rows (group create/rotate, session create) run inside transactions; the
//! connection lives behind an async mutex held only across a single call,
//! never across other awaits.

mod files;
mod schema;

pub use files::{ContentStore, FileRecord, FileService, MemoryContentStore, PutOutcome, CHUNK_SIZE};
pub use schema::{CREATE_SCHEMA, SCHEMA_VERSION};

use crate::error::{Error, Result};
use rusqlite::{params, Connection, OpenFlags};
use std::path::Path;

/// A registered user row.
#[derive(Debug, Clone)]
pub struct UserRecord {
    /// Time-ordered 128-bit identifier.
    pub id: String,
    /// Unique username, lowercased.
    pub username: String,
    /// Salt the client used for the password proof.
    pub server_salt: Vec<u8>,
    /// Argon2id verifier.
    pub password_hash: Vec<u8>,
    /// Long-term Ed25519 public key.
    pub public_key: Vec<u8>,
    /// Per-user second-factor secret.
    pub second_factor_secret: Vec<u8>,
    /// Creation time (Unix seconds).
    pub created_at: i64,
}

/// A device session row.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    /// Session identifier.
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// Bound device.
    pub device_id: String,
    /// Refresh expiry (Unix seconds).
    pub expires_at: i64,
}

/// A group row, optionally carrying the caller's member view.
#[derive(Debug, Clone)]
pub struct GroupRecord {
    /// Group identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Creator user id.
    pub creator_id: String,
    /// Creation time (Unix seconds).
    pub created_at: i64,
    /// Current key version.
    pub key_version: i64,
    /// Number of members.
    pub member_count: i64,
    /// The group key sealed to the requesting member, when queried per-user.
    pub encrypted_key: Option<Vec<u8>>,
}

/// A group member row.
#[derive(Debug, Clone)]
pub struct MemberRecord {
    /// Group identifier.
    pub group_id: String,
    /// Member user id.
    pub user_id: String,
    /// Join time (Unix seconds).
    pub joined_at: i64,
    /// `admin` or `member`.
    pub role: String,
    /// Group key sealed to this member.
    pub encrypted_key: Vec<u8>,
    /// Key version this member holds.
    pub key_version: i64,
}

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// SQLite DSN; `:memory:` opens an in-memory database.
    pub dsn: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: "murmur.db".to_string(),
        }
    }
}

/// SQLite database handle.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create the database and apply the schema.
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        let conn = if config.dsn == ":memory:" {
            Connection::open_in_memory()
        } else {
            if let Some(parent) = Path::new(&config.dsn).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| Error::Storage(format!("create directory: {}", e)))?;
                }
            }
            Connection::open_with_flags(
                &config.dsn,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
        }
        .map_err(|e| Error::Storage(format!("open database: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .map_err(|e| Error::Storage(format!("set pragmas: {}", e)))?;

        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    /// Open an in-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::open(&DatabaseConfig {
            dsn: ":memory:".to_string(),
        })
    }

    fn init_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA)
            .map_err(|e| Error::Storage(format!("create schema: {}", e)))?;

        let have: Option<i32> = self
            .conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .map(Some)
            .or_else(ignore_no_rows)?;
        if have.is_none() {
            self.conn.execute(
                "INSERT INTO schema_version (version) VALUES (?)",
                params![SCHEMA_VERSION],
            )?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    /// Insert a new user. Fails with `UsernameTaken` on a username clash.
    pub fn create_user(&self, user: &UserRecord) -> Result<()> {
        let result = self.conn.execute(
            r#"
            INSERT INTO users (id, username, server_salt, password_hash, public_key,
                               second_factor_secret, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                user.id,
                user.username,
                user.server_salt,
                user.password_hash,
                user.public_key,
                user.second_factor_secret,
                user.created_at,
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(Error::UsernameTaken),
            Err(e) => Err(e.into()),
        }
    }

    /// Look up a user by (lowercased) username.
    pub fn find_user_by_username(&self, username: &str) -> Result<Option<UserRecord>> {
        self.conn
            .query_row(
                r#"
                SELECT id, username, server_salt, password_hash, public_key,
                       second_factor_secret, created_at
                FROM users WHERE username = ?
                "#,
                params![username],
                |row| {
                    Ok(UserRecord {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        server_salt: row.get(2)?,
                        password_hash: row.get(3)?,
                        public_key: row.get(4)?,
                        second_factor_secret: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                },
            )
            .map(Some)
            .or_else(ignore_no_rows)
    }

    /// Fetch a user's registered public key.
    pub fn get_public_key(&self, user_id: &str) -> Result<Option<Vec<u8>>> {
        self.conn
            .query_row(
                "SELECT public_key FROM users WHERE id = ?",
                params![user_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(ignore_no_rows)
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Create (or replace) the session for a (user, device) pair.
    pub fn create_session(
        &self,
        id: &str,
        user_id: &str,
        device_id: &str,
        refresh_hash: &[u8],
        expires_at: i64,
    ) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO sessions
                (id, user_id, device_id, refresh_token_hash, expires_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
            params![
                id,
                user_id,
                device_id,
                refresh_hash,
                expires_at,
                chrono::Utc::now().timestamp()
            ],
        )?;
        Ok(())
    }

    /// Look up a session by its refresh token hash.
    pub fn session_by_refresh_hash(&self, refresh_hash: &[u8]) -> Result<Option<SessionRecord>> {
        self.conn
            .query_row(
                r#"
                SELECT id, user_id, device_id, expires_at
                FROM sessions WHERE refresh_token_hash = ?
                "#,
                params![refresh_hash],
                |row| {
                    Ok(SessionRecord {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        device_id: row.get(2)?,
                        expires_at: row.get(3)?,
                    })
                },
            )
            .map(Some)
            .or_else(ignore_no_rows)
    }

    /// Atomically replace a session's refresh hash.
    ///
    /// Keyed by the old hash, so a concurrent refresh with the same token
    /// can win at most once.
    pub fn rotate_refresh_hash(&self, old_hash: &[u8], new_hash: &[u8]) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE sessions SET refresh_token_hash = ? WHERE refresh_token_hash = ?",
            params![new_hash, old_hash],
        )?;
        Ok(rows > 0)
    }

    /// Remove the session bound to a (user, device) pair.
    pub fn delete_session(&self, user_id: &str, device_id: &str) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM sessions WHERE user_id = ? AND device_id = ?",
            params![user_id, device_id],
        )?;
        Ok(rows > 0)
    }

    // ------------------------------------------------------------------
    // Audit
    // ------------------------------------------------------------------

    /// Append an audit row.
    pub fn write_audit(&self, user_id: &str, device_id: &str, event_type: &str) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO audit_logs (user_id, device_id, event_type, created_at)
            VALUES (?, ?, ?, ?)
            "#,
            params![user_id, device_id, event_type, chrono::Utc::now().timestamp()],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Insert an envelope; duplicate (conversation, message) ids are ignored.
    pub fn insert_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        envelope: &[u8],
        sent_at: i64,
    ) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT OR IGNORE INTO messages
                (conversation_id, message_id, envelope, sent_at, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
            params![
                conversation_id,
                message_id,
                envelope,
                sent_at,
                chrono::Utc::now().timestamp()
            ],
        )?;
        Ok(())
    }

    /// Select envelopes for a conversation ordered by (sent_at, message_id).
    pub fn select_messages(
        &self,
        conversation_id: &str,
        since_unix: i64,
        limit: i64,
    ) -> Result<Vec<(Vec<u8>, i64)>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT envelope, sent_at FROM messages
            WHERE conversation_id = ? AND sent_at >= ?
            ORDER BY sent_at ASC, message_id ASC
            LIMIT ?
            "#,
        )?;

        let rows = stmt.query_map(params![conversation_id, since_unix, limit], |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Delete a single envelope. Returns whether a row was removed.
    pub fn delete_message(&self, conversation_id: &str, message_id: &str) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM messages WHERE conversation_id = ? AND message_id = ?",
            params![conversation_id, message_id],
        )?;
        Ok(rows > 0)
    }

    // ------------------------------------------------------------------
    // Groups
    // ------------------------------------------------------------------

    /// Insert a group and its creator (as admin) in one transaction.
    pub fn create_group(
        &mut self,
        group_id: &str,
        name: &str,
        creator_id: &str,
        group_key: &[u8],
        creator_sealed_key: &[u8],
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let tx = self.conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO groups (id, name, creator_id, created_at, group_key, key_version)
            VALUES (?, ?, ?, ?, ?, 1)
            "#,
            params![group_id, name, creator_id, now, group_key],
        )?;
        tx.execute(
            r#"
            INSERT INTO group_members (group_id, user_id, joined_at, role, encrypted_key, key_version)
            VALUES (?, ?, ?, 'admin', ?, 1)
            "#,
            params![group_id, creator_id, now, creator_sealed_key],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Current (group_key, key_version) for a group.
    pub fn group_key(&self, group_id: &str) -> Result<Option<(Vec<u8>, i64)>> {
        self.conn
            .query_row(
                "SELECT group_key, key_version FROM groups WHERE id = ?",
                params![group_id],
                |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?)),
            )
            .map(Some)
            .or_else(ignore_no_rows)
    }

    /// Role of a user within a group, if a member.
    pub fn member_role(&self, group_id: &str, user_id: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT role FROM group_members WHERE group_id = ? AND user_id = ?",
                params![group_id, user_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(ignore_no_rows)
    }

    /// Insert a member row; re-adding an existing member is a no-op.
    pub fn insert_member(
        &self,
        group_id: &str,
        user_id: &str,
        role: &str,
        sealed_key: &[u8],
        key_version: i64,
    ) -> Result<bool> {
        let rows = self.conn.execute(
            r#"
            INSERT OR IGNORE INTO group_members
                (group_id, user_id, joined_at, role, encrypted_key, key_version)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
            params![
                group_id,
                user_id,
                chrono::Utc::now().timestamp(),
                role,
                sealed_key,
                key_version
            ],
        )?;
        Ok(rows > 0)
    }

    /// Remove a member row. Returns whether a row was removed.
    pub fn delete_member(&self, group_id: &str, user_id: &str) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM group_members WHERE group_id = ? AND user_id = ?",
            params![group_id, user_id],
        )?;
        Ok(rows > 0)
    }

    /// Remaining members with their registered public keys.
    pub fn members_with_public_keys(&self, group_id: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT gm.user_id, u.public_key
            FROM group_members gm JOIN users u ON u.id = gm.user_id
            WHERE gm.group_id = ?
            ORDER BY gm.joined_at
            "#,
        )?;
        let rows = stmt.query_map(params![group_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Swap in a new group key and re-seal it to every member atomically.
    ///
    /// Returns the new key version.
    pub fn rotate_group_key(
        &mut self,
        group_id: &str,
        new_key: &[u8],
        sealed_keys: &[(String, Vec<u8>)],
    ) -> Result<i64> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE groups SET group_key = ?, key_version = key_version + 1 WHERE id = ?",
            params![new_key, group_id],
        )?;
        let version: i64 = tx.query_row(
            "SELECT key_version FROM groups WHERE id = ?",
            params![group_id],
            |row| row.get(0),
        )?;
        for (user_id, sealed) in sealed_keys {
            tx.execute(
                r#"
                UPDATE group_members SET encrypted_key = ?, key_version = ?
                WHERE group_id = ? AND user_id = ?
                "#,
                params![sealed, version, group_id, user_id],
            )?;
        }
        tx.commit()?;
        Ok(version)
    }

    /// Groups a user belongs to, with the key sealed to that user.
    pub fn user_groups(&self, user_id: &str) -> Result<Vec<GroupRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT g.id, g.name, g.creator_id, g.created_at, g.key_version,
                   gm.encrypted_key,
                   (SELECT COUNT(*) FROM group_members WHERE group_id = g.id)
            FROM groups g JOIN group_members gm ON g.id = gm.group_id
            WHERE gm.user_id = ?
            ORDER BY g.created_at DESC
            "#,
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok(GroupRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                creator_id: row.get(2)?,
                created_at: row.get(3)?,
                key_version: row.get(4)?,
                encrypted_key: Some(row.get(5)?),
                member_count: row.get(6)?,
            })
        })?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// All member rows of a group.
    pub fn group_members(&self, group_id: &str) -> Result<Vec<MemberRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT user_id, joined_at, role, encrypted_key, key_version
            FROM group_members WHERE group_id = ?
            ORDER BY joined_at
            "#,
        )?;
        let rows = stmt.query_map(params![group_id], |row| {
            Ok(MemberRecord {
                group_id: group_id.to_string(),
                user_id: row.get(0)?,
                joined_at: row.get(1)?,
                role: row.get(2)?,
                encrypted_key: row.get(3)?,
                key_version: row.get(4)?,
            })
        })?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------

    /// Record a stored file.
    pub fn insert_file(&self, file: &FileRecord) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO files (id, user_id, cid, name, mime, size_bytes, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                file.id,
                file.user_id,
                file.cid,
                file.name,
                file.mime,
                file.size_bytes,
                file.created_at
            ],
        )?;
        Ok(())
    }

    /// Look up a file row by content id.
    pub fn file_by_cid(&self, cid: &str) -> Result<Option<FileRecord>> {
        self.conn
            .query_row(
                r#"
                SELECT id, user_id, cid, name, mime, size_bytes, created_at
                FROM files WHERE cid = ?
                "#,
                params![cid],
                |row| {
                    Ok(FileRecord {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        cid: row.get(2)?,
                        name: row.get(3)?,
                        mime: row.get(4)?,
                        size_bytes: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                },
            )
            .map(Some)
            .or_else(ignore_no_rows)
    }
}

fn ignore_no_rows<T>(e: rusqlite::Error) -> Result<Option<T>> {
    match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(other.into()),
    }
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
