//! SQLite-backed user credential store: password hashing, complexity
//! rules, brute-force lockout, and password reset tokens.

use chrono::Utc;
use dashmap::DashMap;
use rand::RngCore;
use rusqlite::Connection;
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;

const MAX_ATTEMPTS: u32 = 5;
const LOCKOUT_DURATION_SECONDS: i64 = 300;
const LOCKOUT_WINDOW_SECONDS: i64 = 300;

#[derive(Debug, Clone, Serialize)]
pub struct UserRecord {
    pub username: String,
    pub role: String,
    pub created_at: String,
    pub last_login: Option<String>,
    pub is_active: bool,
    pub needs_password_update: bool,
}

struct LockoutEntry {
    attempts: u32,
    lockout_until: i64,
    window_start: i64,
}

pub struct CredentialStore {
    conn: Mutex<Connection>,
    lockouts: DashMap<String, LockoutEntry>,
}

fn now_ts() -> i64 {
    Utc::now().timestamp()
}

fn lockout_key(username: &str, ip: Option<&str>) -> String {
    match ip {
        Some(ip) => format!("{username}:{ip}"),
        None => username.to_string(),
    }
}

impl CredentialStore {
    pub fn open(db_path: &Path) -> rusqlite::Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                username TEXT PRIMARY KEY,
                password_hash TEXT NOT NULL,
                salt TEXT NOT NULL,
                role TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_login TEXT,
                reset_token TEXT,
                reset_token_expires TEXT,
                is_active INTEGER DEFAULT 1,
                needs_password_update INTEGER DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS login_attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL,
                ip_address TEXT,
                success INTEGER NOT NULL,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_login_attempts_timestamp ON login_attempts(timestamp);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            lockouts: DashMap::new(),
        })
    }

    fn hash_password(password: &str) -> String {
        bcrypt::hash(password, 12).expect("bcrypt hashing with a valid cost never fails")
    }

    fn verify_password(password: &str, stored_hash: &str, stored_salt: &str) -> bool {
        if stored_hash.starts_with("$2b$") || stored_hash.starts_with("$2a$") {
            bcrypt::verify(password, stored_hash).unwrap_or(false)
        } else {
            // Legacy salted SHA-256, kept only so pre-existing installs can
            // still authenticate; never used for newly created passwords.
            use sha2::{Digest, Sha256};
            let mut hasher = Sha256::new();
            hasher.update(format!("{password}{stored_salt}").as_bytes());
            let computed = hex::encode(hasher.finalize());
            computed == stored_hash
        }
    }

    /// 12+ chars, upper, lower, digit, symbol.
    pub fn validate_password_complexity(password: &str) -> Vec<String> {
        let mut missing = Vec::new();
        if password.chars().count() < 12 {
            missing.push(format!("At least 12 characters (currently {})", password.chars().count()));
        }
        if !password.chars().any(|c| c.is_ascii_uppercase()) {
            missing.push("At least one uppercase letter (A-Z)".to_string());
        }
        if !password.chars().any(|c| c.is_ascii_lowercase()) {
            missing.push("At least one lowercase letter (a-z)".to_string());
        }
        if !password.chars().any(|c| c.is_ascii_digit()) {
            missing.push("At least one number (0-9)".to_string());
        }
        const SYMBOLS: &str = "!@#$%^&*()_+-=[]{};:'\"\\|,.<>/?`~";
        if !password.chars().any(|c| SYMBOLS.contains(c)) {
            missing.push("At least one symbol (!@#$%^&*()_+-=[]{}etc.)".to_string());
        }
        missing
    }

    fn check_brute_force(&self, username: &str, ip: Option<&str>) -> Option<i64> {
        let key = lockout_key(username, ip);
        if let Some(entry) = self.lockouts.get(&key) {
            let now = now_ts();
            if now < entry.lockout_until {
                return Some(entry.lockout_until - now);
            }
        }
        self.lockouts.remove(&key);
        None
    }

    fn record_login_attempt(&self, username: &str, ip: Option<&str>, success: bool) {
        {
            let conn = self.conn.lock().unwrap();
            let _ = conn.execute(
                "INSERT INTO login_attempts (username, ip_address, success, timestamp) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![username, ip, success as i64, Utc::now().to_rfc3339()],
            );
        }

        let key = lockout_key(username, ip);
        if success {
            self.lockouts.remove(&key);
            return;
        }

        let now = now_ts();
        let mut entry = self.lockouts.entry(key).or_insert(LockoutEntry {
            attempts: 0,
            lockout_until: 0,
            window_start: now,
        });
        if now - entry.window_start > LOCKOUT_WINDOW_SECONDS {
            entry.attempts = 0;
            entry.window_start = now;
        }
        entry.attempts += 1;
        if entry.attempts >= MAX_ATTEMPTS {
            entry.lockout_until = now + LOCKOUT_DURATION_SECONDS;
            tracing::warn!(username, ip = ?ip, "account_locked_brute_force");
        }
    }

    pub fn create_user(&self, username: &str, password: &str, role: &str) -> Result<(), String> {
        let missing = Self::validate_password_complexity(password);
        if !missing.is_empty() {
            return Err(format!(
                "Password does not meet complexity requirements:\n{}",
                missing.iter().map(|m| format!("  - {m}")).collect::<Vec<_>>().join("\n")
            ));
        }
        if role != "admin" && role != "viewer" {
            return Err("Role must be 'admin' or 'viewer'".to_string());
        }

        let hash = Self::hash_password(password);
        let mut salt_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut salt_bytes);
        let salt = hex::encode(salt_bytes);

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO users (username, password_hash, salt, role, created_at, is_active, needs_password_update)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, 0)",
            rusqlite::params![username, hash, salt, role, Utc::now().to_rfc3339()],
        )
        .map_err(|e| format!("Error creating user: {e}"))?;
        Ok(())
    }

    /// Returns `Ok(role)` on success.
    pub fn authenticate(&self, username: &str, password: &str, ip: Option<&str>) -> Result<String, String> {
        if let Some(remaining) = self.check_brute_force(username, ip) {
            return Err(format!("Account locked. Try again in {remaining} seconds."));
        }

        let row = {
            let conn = self.conn.lock().unwrap();
            conn.query_row(
                "SELECT password_hash, salt, role, is_active FROM users WHERE username = ?1",
                [username],
                |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?, r.get::<_, i64>(3)?)),
            )
            .ok()
        };

        let Some((hash, salt, role, is_active)) = row else {
            self.record_login_attempt(username, ip, false);
            return Err("Invalid username or password".to_string());
        };

        if is_active == 0 {
            self.record_login_attempt(username, ip, false);
            return Err("Account is disabled".to_string());
        }

        if !Self::verify_password(password, &hash, &salt) {
            self.record_login_attempt(username, ip, false);
            return Err("Invalid username or password".to_string());
        }

        self.record_login_attempt(username, ip, true);
        let conn = self.conn.lock().unwrap();
        let _ = conn.execute(
            "UPDATE users SET last_login = ?1 WHERE username = ?2",
            rusqlite::params![Utc::now().to_rfc3339(), username],
        );
        Ok(role)
    }

    pub fn change_password(&self, username: &str, old_password: &str, new_password: &str) -> Result<(), String> {
        self.authenticate(username, old_password, None)?;

        let missing = Self::validate_password_complexity(new_password);
        if !missing.is_empty() {
            return Err(format!(
                "Password does not meet complexity requirements:\n{}",
                missing.iter().map(|m| format!("  - {m}")).collect::<Vec<_>>().join("\n")
            ));
        }

        let hash = Self::hash_password(new_password);
        let mut salt_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut salt_bytes);
        let salt = hex::encode(salt_bytes);

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE users SET password_hash = ?1, salt = ?2, needs_password_update = 0 WHERE username = ?3",
            rusqlite::params![hash, salt, username],
        )
        .map_err(|e| format!("Error changing password: {e}"))?;
        Ok(())
    }

    /// Admin-forced reset, bypassing the old-password check; flips
    /// `needs_password_update` so the UI can prompt the user.
    pub fn force_password_update(&self, username: &str, new_password: &str) -> Result<(), String> {
        let missing = Self::validate_password_complexity(new_password);
        if !missing.is_empty() {
            return Err(format!(
                "Password does not meet complexity requirements:\n{}",
                missing.iter().map(|m| format!("  - {m}")).collect::<Vec<_>>().join("\n")
            ));
        }
        let hash = Self::hash_password(new_password);
        let mut salt_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut salt_bytes);
        let salt = hex::encode(salt_bytes);

        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE users SET password_hash = ?1, salt = ?2, needs_password_update = 1 WHERE username = ?3",
            rusqlite::params![hash, salt, username],
        )
        .map_err(|e| format!("Error updating password: {e}"))?;
        if updated == 0 {
            return Err("User not found".to_string());
        }
        Ok(())
    }

    pub fn check_password_needs_update(&self, username: &str) -> bool {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT needs_password_update FROM users WHERE username = ?1",
            [username],
            |r| r.get::<_, i64>(0),
        )
        .map(|v| v != 0)
        .unwrap_or(false)
    }

    /// Returns a (one-time, unhashed) token valid for one hour.
    pub fn generate_reset_token(&self, username: &str) -> Result<String, String> {
        let mut token_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut token_bytes);
        let token = hex::encode(token_bytes);
        let expires = (Utc::now() + chrono::Duration::hours(1)).to_rfc3339();

        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE users SET reset_token = ?1, reset_token_expires = ?2 WHERE username = ?3",
            rusqlite::params![token, expires, username],
        )
        .map_err(|e| format!("Error generating reset token: {e}"))?;
        if updated == 0 {
            return Err("User not found".to_string());
        }
        Ok(token)
    }

    pub fn reset_password_with_token(&self, token: &str, new_password: &str) -> Result<(), String> {
        let missing = Self::validate_password_complexity(new_password);
        if !missing.is_empty() {
            return Err(format!(
                "Password does not meet complexity requirements:\n{}",
                missing.iter().map(|m| format!("  - {m}")).collect::<Vec<_>>().join("\n")
            ));
        }

        let (username, expires): (String, String) = {
            let conn = self.conn.lock().unwrap();
            conn.query_row(
                "SELECT username, reset_token_expires FROM users WHERE reset_token = ?1",
                [token],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .map_err(|_| "Invalid or expired reset token".to_string())?
        };

        let expires_at = chrono::DateTime::parse_from_rfc3339(&expires)
            .map_err(|_| "Invalid or expired reset token".to_string())?;
        if Utc::now() > expires_at {
            return Err("Invalid or expired reset token".to_string());
        }

        let hash = Self::hash_password(new_password);
        let mut salt_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut salt_bytes);
        let salt = hex::encode(salt_bytes);

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE users SET password_hash = ?1, salt = ?2, reset_token = NULL, reset_token_expires = NULL
             WHERE username = ?3",
            rusqlite::params![hash, salt, username],
        )
        .map_err(|e| format!("Error resetting password: {e}"))?;
        Ok(())
    }

    pub fn list_users(&self) -> Vec<UserRecord> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT username, role, created_at, last_login, is_active, needs_password_update FROM users")
            .expect("static query");
        stmt.query_map([], |r| {
            Ok(UserRecord {
                username: r.get(0)?,
                role: r.get(1)?,
                created_at: r.get(2)?,
                last_login: r.get(3)?,
                is_active: r.get::<_, i64>(4)? != 0,
                needs_password_update: r.get::<_, i64>(5)? != 0,
            })
        })
        .expect("static query")
        .filter_map(Result::ok)
        .collect()
    }

    pub fn delete_user(&self, username: &str) -> Result<(), String> {
        let conn = self.conn.lock().unwrap();
        let role: String = conn
            .query_row("SELECT role FROM users WHERE username = ?1", [username], |r| r.get(0))
            .map_err(|_| "User not found".to_string())?;

        if role == "admin" {
            let admin_count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM users WHERE role = 'admin' AND is_active = 1",
                    [],
                    |r| r.get(0),
                )
                .unwrap_or(0);
            if admin_count <= 1 {
                return Err("Cannot delete the last admin user".to_string());
            }
        }

        conn.execute("DELETE FROM users WHERE username = ?1", [username])
            .map_err(|e| format!("Error deleting user: {e}"))?;
        Ok(())
    }

    pub fn get_login_history(&self, username: Option<&str>, limit: usize) -> Vec<serde_json::Value> {
        let conn = self.conn.lock().unwrap();
        let (query, param): (&str, Option<&str>) = match username {
            Some(u) => (
                "SELECT username, ip_address, success, timestamp FROM login_attempts WHERE username = ?1 ORDER BY id DESC LIMIT ?2",
                Some(u),
            ),
            None => (
                "SELECT username, ip_address, success, timestamp FROM login_attempts ORDER BY id DESC LIMIT ?1",
                None,
            ),
        };

        let mut rows = Vec::new();
        let mut push_rows = |mut stmt: rusqlite::Statement, params: &[&dyn rusqlite::ToSql]| {
            if let Ok(mut mapped) = stmt.query_map(params, |r| {
                Ok(serde_json::json!({
                    "username": r.get::<_, String>(0)?,
                    "ip_address": r.get::<_, Option<String>>(1)?,
                    "success": r.get::<_, i64>(2)? != 0,
                    "timestamp": r.get::<_, String>(3)?,
                }))
            }) {
                while let Some(Ok(v)) = mapped.next() {
                    rows.push(v);
                }
            }
        };

        let limit = limit as i64;
        if let Some(p) = param {
            if let Ok(stmt) = conn.prepare(query) {
                push_rows(stmt, &[&p, &limit]);
            }
        } else if let Ok(stmt) = conn.prepare(query) {
            push_rows(stmt, &[&limit]);
        }
        rows
    }
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile_shim::temp_db_path;

    mod tempfile_shim {
        use std::path::PathBuf;
        pub fn temp_db_path(name: &str) -> PathBuf {
            let mut p = std::env::temp_dir();
            p.push(format!("fleet-test-{name}-{}.db", std::process::id()));
            p
        }
    }

    #[test]
    fn password_complexity_rejects_short_passwords() {
        assert!(!CredentialStore::validate_password_complexity("short1!").is_empty());
        assert!(CredentialStore::validate_password_complexity("LongEnoughPass1!").is_empty());
    }

    #[test]
    fn create_and_authenticate_user() {
        let path = temp_db_path("auth");
        let store = CredentialStore::open(&path).unwrap();
        store.create_user("alice", "SuperSecret123!", "admin").unwrap();
        assert!(store.authenticate("alice", "SuperSecret123!", None).is_ok());
        assert!(store.authenticate("alice", "WrongPassword1!", None).is_err());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn brute_force_lockout_after_five_failures() {
        let path = temp_db_path("lockout");
        let store = CredentialStore::open(&path).unwrap();
        store.create_user("bob", "SuperSecret123!", "admin").unwrap();
        for _ in 0..5 {
            let _ = store.authenticate("bob", "WrongPassword1!", Some("1.2.3.4"));
        }
        let result = store.authenticate("bob", "SuperSecret123!", Some("1.2.3.4"));
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("locked"));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn cannot_delete_last_admin() {
        let path = temp_db_path("lastadmin");
        let store = CredentialStore::open(&path).unwrap();
        store.create_user("only-admin", "SuperSecret123!", "admin").unwrap();
        let err = store.delete_user("only-admin").unwrap_err();
        assert_eq!(err, "Cannot delete the last admin user");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn reset_token_round_trip() {
        let path = temp_db_path("reset");
        let store = CredentialStore::open(&path).unwrap();
        store.create_user("carol", "SuperSecret123!", "admin").unwrap();
        let token = store.generate_reset_token("carol").unwrap();
        store.reset_password_with_token(&token, "EvenBetterPass1!").unwrap();
        assert!(store.authenticate("carol", "EvenBetterPass1!", None).is_ok());
        std::fs::remove_file(&path).ok();
    }
}
