use chrono::{Duration, SecondsFormat, Utc};

use crate::DbPool;

/// Timestamps are stored as RFC 3339 text with fixed microsecond precision
/// so `expires_at > ?` comparisons work as plain string comparisons.
pub fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn minutes_from_now(minutes: i64) -> String {
    (Utc::now() + Duration::minutes(minutes)).to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Verification codes stay valid for this many minutes after issuance.
pub const CODE_TTL_MINUTES: i64 = 10;

pub fn run_migrations(pool: &DbPool) -> Result<(), Box<dyn std::error::Error>> {
    let conn = pool.get()?;

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            student_id    TEXT UNIQUE NOT NULL,
            email         TEXT UNIQUE NOT NULL,
            name          TEXT,
            password_hash TEXT,
            is_active     INTEGER NOT NULL DEFAULT 1,
            is_staff      INTEGER NOT NULL DEFAULT 0,
            date_joined   TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS auth_tokens (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id     INTEGER UNIQUE NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            token       TEXT UNIQUE NOT NULL,
            created_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_auth_tokens_token ON auth_tokens(token);

        CREATE TABLE IF NOT EXISTS verification_codes (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id     INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            code        TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            expires_at  TEXT NOT NULL,
            is_used     INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_verification_codes_user ON verification_codes(user_id);

        CREATE TABLE IF NOT EXISTS themes (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            title         TEXT NOT NULL,
            theme_type    TEXT NOT NULL CHECK (theme_type IN ('share', 'discussion', 'ad', 'notice')),
            description   TEXT NOT NULL DEFAULT '',
            author_id     INTEGER NOT NULL REFERENCES users(id),
            starts_at     TEXT,
            ends_at       TEXT,
            first_post_id INTEGER REFERENCES posts(id),
            created_at    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS posts (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            theme_id    INTEGER NOT NULL REFERENCES themes(id),
            parent_id   INTEGER REFERENCES posts(id),
            title       TEXT,
            content     TEXT,
            author_id   INTEGER NOT NULL REFERENCES users(id),
            is_active   INTEGER NOT NULL DEFAULT 1,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_posts_theme ON posts(theme_id);
        CREATE INDEX IF NOT EXISTS idx_posts_parent ON posts(parent_id);

        CREATE TABLE IF NOT EXISTS post_images (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            post_id     INTEGER NOT NULL REFERENCES posts(id) ON DELETE CASCADE,
            image_path  TEXT NOT NULL,
            sort_order  INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_post_images_post ON post_images(post_id);

        CREATE TABLE IF NOT EXISTS post_links (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            source_post_id INTEGER NOT NULL REFERENCES posts(id) ON DELETE CASCADE,
            target_post_id INTEGER NOT NULL REFERENCES posts(id) ON DELETE CASCADE,
            created_at     TEXT NOT NULL,
            UNIQUE(source_post_id, target_post_id)
        );
        ",
    )?;

    Ok(())
}
