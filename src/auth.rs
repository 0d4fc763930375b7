//! Email/password authentication with bcrypt.
//!
//! Operator accounts live in the `users` table. Sessions are kept
//! in-memory and identified by an opaque token that the shell passes back
//! into every gated entry point; nothing in the crate reads an ambient
//! "current user". Repeated failed logins lock the terminal out for a
//! cooldown period.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::DbState;
use crate::error::{is_unique_violation, Error, Result};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const MAX_FAILED_ATTEMPTS: u32 = 5;
const LOCKOUT_MINUTES: i64 = 15;
const SESSION_INACTIVITY_MINUTES: i64 = 30;
const SESSION_MAX_DURATION_HOURS: i64 = 12;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// An active operator session.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub email: String,
    pub login_time: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl Session {
    /// Check whether this session has expired (inactivity or max duration).
    fn is_expired(&self) -> bool {
        let now = Utc::now();
        if now >= self.expires_at {
            return true;
        }
        if now - self.last_activity > Duration::minutes(SESSION_INACTIVITY_MINUTES) {
            return true;
        }
        false
    }
}

/// Lockout tracking entry.
struct LockoutEntry {
    attempts: u32,
    last_attempt: DateTime<Utc>,
}

/// In-memory authentication state embedded by the UI shell.
pub struct AuthState {
    sessions: Mutex<HashMap<String, Session>>,
    lockout: Mutex<LockoutEntry>,
}

impl AuthState {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            lockout: Mutex::new(LockoutEntry {
                attempts: 0,
                last_attempt: Utc::now(),
            }),
        }
    }
}

impl Default for AuthState {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Check whether the terminal is currently locked out.
fn check_lockout(lockout: &LockoutEntry) -> Result<()> {
    if lockout.attempts >= MAX_FAILED_ATTEMPTS {
        let elapsed = Utc::now() - lockout.last_attempt;
        if elapsed < Duration::minutes(LOCKOUT_MINUTES) {
            let remaining = LOCKOUT_MINUTES - elapsed.num_minutes();
            return Err(Error::Unauthorized(format!(
                "Too many failed attempts. Try again in {remaining} minute(s)."
            )));
        }
        // Lockout period has elapsed — will be reset on next successful login
    }
    Ok(())
}

/// Record a failed login attempt.
fn record_failure(lockout: &mut LockoutEntry) {
    lockout.attempts += 1;
    lockout.last_attempt = Utc::now();
    warn!(attempts = lockout.attempts, "failed login attempt");
}

/// Reset the lockout counter (on successful login).
fn reset_lockout(lockout: &mut LockoutEntry) {
    lockout.attempts = 0;
    lockout.last_attempt = Utc::now();
}

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

/// Create an operator account.
///
/// Emails are trimmed and lower-cased before storage; a second sign-up
/// with the same email surfaces `Duplicate`. bcrypt embeds its salt in
/// the hash string, so only the hash is stored.
pub fn sign_up(db: &DbState, email: &str, password: &str) -> Result<()> {
    let email = normalize_email(email);
    if email.is_empty() || password.is_empty() {
        return Err(Error::Validation("email and password are required".into()));
    }

    let hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)
        .map_err(|e| Error::Internal(format!("password hash: {e}")))?;

    let conn = db.lock()?;
    conn.execute(
        "INSERT INTO users (email, password_hash, created_at) VALUES (?1, ?2, ?3)",
        params![email, hash, Utc::now()],
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            Error::Duplicate(format!("account '{email}'"))
        } else {
            Error::from(e)
        }
    })?;

    info!(email = %email, "operator account created");
    Ok(())
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// Verify credentials and open a session.
pub fn login(db: &DbState, auth: &AuthState, email: &str, password: &str) -> Result<Session> {
    let email = normalize_email(email);
    if email.is_empty() || password.is_empty() {
        return Err(Error::Validation("email and password are required".into()));
    }

    {
        let lockout = auth.lockout.lock().unwrap();
        check_lockout(&lockout)?;
    }

    let stored: Option<String> = {
        let conn = db.lock()?;
        conn.query_row(
            "SELECT password_hash FROM users WHERE email = ?1",
            params![email],
            |row| row.get(0),
        )
        .optional()?
    };

    let verified = stored
        .map(|hash| bcrypt::verify(password, &hash).unwrap_or(false))
        .unwrap_or(false);

    if !verified {
        let mut lockout = auth.lockout.lock().unwrap();
        record_failure(&mut lockout);
        return Err(Error::Unauthorized("invalid email or password".into()));
    }

    {
        let mut lockout = auth.lockout.lock().unwrap();
        reset_lockout(&mut lockout);
    }

    let now = Utc::now();
    let session = Session {
        token: Uuid::new_v4().to_string(),
        email: email.clone(),
        login_time: now,
        last_activity: now,
        expires_at: now + Duration::hours(SESSION_MAX_DURATION_HOURS),
    };

    auth.sessions
        .lock()
        .unwrap()
        .insert(session.token.clone(), session.clone());

    info!(email = %email, "login successful");
    Ok(session)
}

/// Invalidate a session token.
pub fn logout(auth: &AuthState, token: &str) {
    let mut sessions = auth.sessions.lock().unwrap();
    if sessions.remove(token).is_some() {
        info!("session logged out");
    }
}

/// The authorization gate: succeed iff the token names a live session.
///
/// Touches the session's last-activity timestamp; expired sessions are
/// removed on sight.
pub fn require_session(auth: &AuthState, token: &str) -> Result<()> {
    let mut sessions = auth.sessions.lock().unwrap();
    match sessions.get_mut(token) {
        Some(session) if !session.is_expired() => {
            session.last_activity = Utc::now();
            Ok(())
        }
        Some(_) => {
            sessions.remove(token);
            Err(Error::Unauthorized("session expired".into()))
        }
        None => Err(Error::Unauthorized("not logged in".into())),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rusqlite::Connection;
    use std::path::PathBuf;

    fn test_db() -> DbState {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .expect("pragma setup");
        db::run_migrations_for_test(&conn);
        DbState {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        }
    }

    #[test]
    fn test_sign_up_and_login_round_trip() {
        let db = test_db();
        let auth = AuthState::new();

        sign_up(&db, "Op@Example.com ", "hunter2").unwrap();
        // Email lookup is case/whitespace-normalized
        let session = login(&db, &auth, " op@example.COM", "hunter2").unwrap();
        assert_eq!(session.email, "op@example.com");
        assert!(require_session(&auth, &session.token).is_ok());
    }

    #[test]
    fn test_sign_up_rejects_duplicate_email() {
        let db = test_db();
        sign_up(&db, "op@example.com", "hunter2").unwrap();
        let err = sign_up(&db, "OP@EXAMPLE.COM", "other").unwrap_err();
        assert!(matches!(err, Error::Duplicate(_)));
    }

    #[test]
    fn test_sign_up_requires_email_and_password() {
        let db = test_db();
        assert!(matches!(
            sign_up(&db, "  ", "pw"),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            sign_up(&db, "op@example.com", ""),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_login_rejects_wrong_password_and_unknown_email() {
        let db = test_db();
        let auth = AuthState::new();
        sign_up(&db, "op@example.com", "hunter2").unwrap();

        assert!(matches!(
            login(&db, &auth, "op@example.com", "wrong"),
            Err(Error::Unauthorized(_))
        ));
        assert!(matches!(
            login(&db, &auth, "ghost@example.com", "hunter2"),
            Err(Error::Unauthorized(_))
        ));
    }

    #[test]
    fn test_lockout_after_repeated_failures() {
        let db = test_db();
        let auth = AuthState::new();
        sign_up(&db, "op@example.com", "hunter2").unwrap();

        for _ in 0..MAX_FAILED_ATTEMPTS {
            let _ = login(&db, &auth, "op@example.com", "wrong");
        }
        // Even the correct password is refused while locked out
        let err = login(&db, &auth, "op@example.com", "hunter2").unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
        assert!(err.to_string().contains("Too many failed attempts"));
    }

    #[test]
    fn test_logout_invalidates_token() {
        let db = test_db();
        let auth = AuthState::new();
        sign_up(&db, "op@example.com", "hunter2").unwrap();
        let session = login(&db, &auth, "op@example.com", "hunter2").unwrap();

        logout(&auth, &session.token);
        assert!(matches!(
            require_session(&auth, &session.token),
            Err(Error::Unauthorized(_))
        ));
    }

    #[test]
    fn test_expired_session_is_rejected_and_removed() {
        let auth = AuthState::new();
        let past = Utc::now() - Duration::hours(1);
        auth.sessions.lock().unwrap().insert(
            "stale".into(),
            Session {
                token: "stale".into(),
                email: "op@example.com".into(),
                login_time: past,
                last_activity: past,
                expires_at: past,
            },
        );

        assert!(matches!(
            require_session(&auth, "stale"),
            Err(Error::Unauthorized(_))
        ));
        assert!(auth.sessions.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_token_is_rejected() {
        let auth = AuthState::new();
        assert!(matches!(
            require_session(&auth, "nope"),
            Err(Error::Unauthorized(_))
        ));
    }
}
