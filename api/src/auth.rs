use axum::{extract::State, http::HeaderMap, Json};
use hetaoshu_shared::{
    AuthResponse, ChangePassword, Login, MessageResponse, PublicKeyResponse, SendCode,
    SendCodeResponse, SetPassword, TokenResponse, UpdateProfile, User,
};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::ApiError;
use crate::{crypto, db, AppState};

// ── Token plumbing ──

pub(crate) const USER_COLUMNS: &str =
    "u.id, u.student_id, u.email, u.name, u.is_active, u.is_staff, u.date_joined";

pub(crate) fn user_at(row: &rusqlite::Row<'_>, base: usize) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(base)?,
        student_id: row.get(base + 1)?,
        email: row.get(base + 2)?,
        name: row.get(base + 3)?,
        is_active: row.get(base + 4)?,
        is_staff: row.get(base + 5)?,
        date_joined: row.get(base + 6)?,
    })
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .ok_or(ApiError::Unauthorized)
}

pub(crate) fn user_for_token(conn: &Connection, token: &str) -> Result<User, ApiError> {
    conn.query_row(
        &format!(
            "SELECT {USER_COLUMNS} FROM auth_tokens t
             JOIN users u ON u.id = t.user_id
             WHERE t.token = ?1 AND u.is_active = 1"
        ),
        [token],
        |row| user_at(row, 0),
    )
    .optional()?
    .ok_or(ApiError::Unauthorized)
}

fn load_user(conn: &Connection, user_id: i64) -> Result<User, ApiError> {
    conn.query_row(
        &format!("SELECT {USER_COLUMNS} FROM users u WHERE u.id = ?1"),
        [user_id],
        |row| user_at(row, 0),
    )
    .optional()?
    .ok_or(ApiError::NotFound("user"))
}

fn get_or_create_token(conn: &Connection, user_id: i64) -> Result<String, ApiError> {
    if let Some(token) = conn
        .query_row(
            "SELECT token FROM auth_tokens WHERE user_id = ?1",
            [user_id],
            |row| row.get(0),
        )
        .optional()?
    {
        return Ok(token);
    }
    let token = crypto::generate_token();
    conn.execute(
        "INSERT INTO auth_tokens (user_id, token, created_at) VALUES (?1, ?2, ?3)",
        params![user_id, token, db::now()],
    )?;
    Ok(token)
}

fn rotate_token(conn: &Connection, user_id: i64) -> Result<String, ApiError> {
    conn.execute("DELETE FROM auth_tokens WHERE user_id = ?1", [user_id])?;
    let token = crypto::generate_token();
    conn.execute(
        "INSERT INTO auth_tokens (user_id, token, created_at) VALUES (?1, ?2, ?3)",
        params![user_id, token, db::now()],
    )?;
    Ok(token)
}

/// First-contact users get the last four characters of their student id
/// as a display name.
fn default_name(student_id: &str) -> String {
    let chars: Vec<char> = student_id.chars().collect();
    chars[chars.len().saturating_sub(4)..].iter().collect()
}

// ── Handlers ──

/// GET /api/auth/public-key — PEM key the frontend encrypts credentials with.
pub async fn public_key(State(state): State<AppState>) -> Json<PublicKeyResponse> {
    Json(PublicKeyResponse {
        public_key: state.cipher.public_key_pem().to_string(),
    })
}

/// POST /api/auth/send-code — create the user on first contact, issue a
/// 6-digit code, email it. On mail failure the code row is deleted again.
pub async fn send_code(
    State(state): State<AppState>,
    Json(payload): Json<SendCode>,
) -> Result<Json<SendCodeResponse>, ApiError> {
    let student_id = payload.student_id.trim().to_string();
    if student_id.is_empty() {
        return Err(ApiError::validation("student_id is required"));
    }
    let email = format!("{student_id}@{}", state.email_domain);

    let pool = state.db.clone();
    let sid = student_id.clone();
    let user_email = email.clone();
    let (code_id, code) = tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;
        let user_id: i64 = match conn
            .query_row(
                "SELECT id FROM users WHERE student_id = ?1 AND email = ?2",
                params![sid, user_email],
                |row| row.get(0),
            )
            .optional()?
        {
            Some(id) => id,
            None => {
                conn.execute(
                    "INSERT INTO users (student_id, email, name, date_joined) VALUES (?1, ?2, ?3, ?4)",
                    params![sid, user_email, default_name(&sid), db::now()],
                )?;
                conn.last_insert_rowid()
            }
        };

        let code = crypto::generate_code();
        conn.execute(
            "INSERT INTO verification_codes (user_id, code, created_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
            params![user_id, code, db::now(), db::minutes_from_now(db::CODE_TTL_MINUTES)],
        )?;
        Ok::<_, ApiError>((conn.last_insert_rowid(), code))
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;

    let mailer = state.mailer.clone();
    let mail_to = email.clone();
    let sent = tokio::task::spawn_blocking(move || mailer.send_verification_code(&mail_to, &code))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    if let Err(send_err) = sent {
        // The user never received this code; take the record back out.
        let pool = state.db.clone();
        let _ = tokio::task::spawn_blocking(move || -> Result<(), ApiError> {
            let conn = pool.get()?;
            conn.execute("DELETE FROM verification_codes WHERE id = ?1", [code_id])?;
            Ok(())
        })
        .await;
        tracing::warn!(%student_id, "verification mail failed, code rolled back");
        return Err(send_err);
    }

    Ok(Json(SendCodeResponse {
        message: "verification code sent".to_string(),
        student_id,
    }))
}

/// POST /api/auth/set-password — consume a valid code, store the password
/// hash, hand back a token. Code and passwords arrive RSA-encrypted.
pub async fn set_password(
    State(state): State<AppState>,
    Json(payload): Json<SetPassword>,
) -> Result<Json<AuthResponse>, ApiError> {
    let student_id = payload.student_id.trim().to_string();
    let code = state.cipher.decrypt(&payload.code)?;
    let password = state.cipher.decrypt(&payload.password)?;
    let confirm = state.cipher.decrypt(&payload.confirm_password)?;
    if password != confirm {
        return Err(ApiError::validation("passwords do not match"));
    }
    if password.is_empty() {
        return Err(ApiError::validation("password must not be empty"));
    }
    let email = format!("{student_id}@{}", state.email_domain);

    let pool = state.db.clone();
    let response = tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;
        let user_id: i64 = conn
            .query_row(
                "SELECT id FROM users WHERE student_id = ?1 AND email = ?2",
                params![student_id, email],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(ApiError::NotFound("user"))?;

        // Conditional update doubles as the consumption check: expired or
        // already-used codes match zero rows, and two concurrent consumers
        // cannot both see an affected row.
        let consumed = conn.execute(
            "UPDATE verification_codes SET is_used = 1
             WHERE user_id = ?1 AND code = ?2 AND is_used = 0 AND expires_at > ?3",
            params![user_id, code, db::now()],
        )?;
        if consumed == 0 {
            return Err(ApiError::validation("invalid or expired verification code"));
        }

        let hash = crypto::hash_password(&password)?;
        conn.execute(
            "UPDATE users SET password_hash = ?1 WHERE id = ?2",
            params![hash, user_id],
        )?;

        let token = get_or_create_token(&conn, user_id)?;
        let user = load_user(&conn, user_id)?;
        Ok::<_, ApiError>(AuthResponse { token, user })
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;

    Ok(Json(response))
}

/// POST /api/auth/login — password arrives RSA-encrypted.
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<Login>,
) -> Result<Json<AuthResponse>, ApiError> {
    let student_id = payload.student_id.trim().to_string();
    let password = state.cipher.decrypt(&payload.password)?;

    let pool = state.db.clone();
    let response = tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;
        let row = conn
            .query_row(
                "SELECT id, password_hash FROM users WHERE student_id = ?1 AND is_active = 1",
                [&student_id],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()?;

        // Users without a password set fail the same way as bad passwords.
        let (user_id, hash) = match row {
            Some((id, Some(hash))) => (id, hash),
            _ => return Err(ApiError::InvalidCredentials),
        };
        if !crypto::verify_password(&password, &hash) {
            return Err(ApiError::InvalidCredentials);
        }

        let token = get_or_create_token(&conn, user_id)?;
        let user = load_user(&conn, user_id)?;
        Ok::<_, ApiError>(AuthResponse { token, user })
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;

    Ok(Json(response))
}

/// POST /api/auth/logout — drop the caller's token row.
pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<MessageResponse>, ApiError> {
    let token = bearer_token(&headers)?;

    let pool = state.db.clone();
    tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;
        let deleted = conn.execute("DELETE FROM auth_tokens WHERE token = ?1", [&token])?;
        if deleted == 0 {
            return Err(ApiError::Unauthorized);
        }
        Ok(())
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;

    Ok(Json(MessageResponse {
        message: "logged out".to_string(),
    }))
}

/// GET /api/auth/profile — the calling user.
pub async fn profile(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<User>, ApiError> {
    let token = bearer_token(&headers)?;

    let pool = state.db.clone();
    let user = tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;
        user_for_token(&conn, &token)
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;

    Ok(Json(user))
}

/// PUT /api/auth/profile — name is the only mutable field.
pub async fn update_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<UpdateProfile>,
) -> Result<Json<User>, ApiError> {
    let token = bearer_token(&headers)?;

    let pool = state.db.clone();
    let user = tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;
        let user = user_for_token(&conn, &token)?;
        if let Some(name) = payload.name {
            let name = ammonia::clean(name.trim());
            conn.execute(
                "UPDATE users SET name = ?1 WHERE id = ?2",
                params![name, user.id],
            )?;
        }
        load_user(&conn, user.id)
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;

    Ok(Json(user))
}

/// PUT /api/auth/change-password — verifies the current password, stores
/// the new hash, and rotates the token. Both fields arrive RSA-encrypted.
pub async fn change_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ChangePassword>,
) -> Result<Json<TokenResponse>, ApiError> {
    let token = bearer_token(&headers)?;
    let current = state.cipher.decrypt(&payload.current_password)?;
    let new_password = state.cipher.decrypt(&payload.new_password)?;
    if new_password.is_empty() {
        return Err(ApiError::validation("new password must not be empty"));
    }

    let pool = state.db.clone();
    let response = tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;
        let user = user_for_token(&conn, &token)?;
        let hash: Option<String> = conn.query_row(
            "SELECT password_hash FROM users WHERE id = ?1",
            [user.id],
            |row| row.get(0),
        )?;
        let matches = hash
            .map(|h| crypto::verify_password(&current, &h))
            .unwrap_or(false);
        if !matches {
            return Err(ApiError::validation("current password is incorrect"));
        }

        let new_hash = crypto::hash_password(&new_password)?;
        conn.execute(
            "UPDATE users SET password_hash = ?1 WHERE id = ?2",
            params![new_hash, user.id],
        )?;
        let token = rotate_token(&conn, user.id)?;
        Ok::<_, ApiError>(TokenResponse { token })
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;

    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use axum::extract::State;

    #[tokio::test]
    async fn verification_flow_sets_password_and_logs_in() {
        let state = testing::state();

        send_code(
            State(state.clone()),
            Json(SendCode {
                student_id: "20210001".to_string(),
            }),
        )
        .await
        .unwrap();

        let code = testing::latest_code(&state, "20210001");
        let payload = SetPassword {
            student_id: "20210001".to_string(),
            code: state.cipher.encrypt(&code),
            password: state.cipher.encrypt("NewPassword123"),
            confirm_password: state.cipher.encrypt("NewPassword123"),
        };
        let response = set_password(State(state.clone()), Json(payload.clone()))
            .await
            .unwrap();
        assert_eq!(response.0.user.student_id, "20210001");
        assert_eq!(response.0.user.email, "20210001@slai.edu.cn");
        assert_eq!(response.0.user.name.as_deref(), Some("0001"));
        assert_eq!(response.0.token.len(), 40);

        // The code was consumed; replaying the same request must fail.
        let replay = set_password(State(state.clone()), Json(payload)).await;
        assert!(matches!(replay, Err(ApiError::Validation(_))));

        let login_ok = login(
            State(state.clone()),
            Json(Login {
                student_id: "20210001".to_string(),
                password: state.cipher.encrypt("NewPassword123"),
            }),
        )
        .await
        .unwrap();
        assert_eq!(login_ok.0.token, response.0.token);

        let login_bad = login(
            State(state.clone()),
            Json(Login {
                student_id: "20210001".to_string(),
                password: state.cipher.encrypt("WrongPassword"),
            }),
        )
        .await;
        assert!(matches!(login_bad, Err(ApiError::InvalidCredentials)));
    }

    #[tokio::test]
    async fn mail_failure_rolls_back_the_code() {
        let mut state = testing::state();
        state.mailer = std::sync::Arc::new(crate::mailer::Mailer::Failing);

        let result = send_code(
            State(state.clone()),
            Json(SendCode {
                student_id: "20210009".to_string(),
            }),
        )
        .await;
        assert!(matches!(result, Err(ApiError::Internal(_))));

        let conn = state.db.get().unwrap();
        let codes: i64 = conn
            .query_row("SELECT COUNT(*) FROM verification_codes", [], |row| row.get(0))
            .unwrap();
        assert_eq!(codes, 0);
        // The user record itself survives the failed send.
        let users: i64 = conn
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .unwrap();
        assert_eq!(users, 1);
    }

    #[tokio::test]
    async fn expired_code_never_validates() {
        let state = testing::state();
        send_code(
            State(state.clone()),
            Json(SendCode {
                student_id: "20210002".to_string(),
            }),
        )
        .await
        .unwrap();

        let code = testing::latest_code(&state, "20210002");
        {
            let conn = state.db.get().unwrap();
            conn.execute(
                "UPDATE verification_codes SET expires_at = ?1",
                [crate::db::minutes_from_now(-1)],
            )
            .unwrap();
        }

        let result = set_password(
            State(state.clone()),
            Json(SetPassword {
                student_id: "20210002".to_string(),
                code: state.cipher.encrypt(&code),
                password: state.cipher.encrypt("NewPassword123"),
                confirm_password: state.cipher.encrypt("NewPassword123"),
            }),
        )
        .await;
        assert!(matches!(result, Err(ApiError::Validation(_))));
    }

    #[tokio::test]
    async fn mismatched_passwords_rejected() {
        let state = testing::state();
        let result = set_password(
            State(state.clone()),
            Json(SetPassword {
                student_id: "20210003".to_string(),
                code: state.cipher.encrypt("123456"),
                password: state.cipher.encrypt("one-password"),
                confirm_password: state.cipher.encrypt("another-password"),
            }),
        )
        .await;
        assert!(matches!(result, Err(ApiError::Validation(_))));
    }

    #[tokio::test]
    async fn logout_invalidates_token() {
        let state = testing::state();
        let auth = testing::register(&state, "20210004").await;

        profile(State(state.clone()), testing::auth_headers(&auth.token))
            .await
            .unwrap();

        logout(State(state.clone()), testing::auth_headers(&auth.token))
            .await
            .unwrap();

        let after = profile(State(state.clone()), testing::auth_headers(&auth.token)).await;
        assert!(matches!(after, Err(ApiError::Unauthorized)));
    }

    #[tokio::test]
    async fn profile_update_changes_name_only() {
        let state = testing::state();
        let auth = testing::register(&state, "20210005").await;

        let updated = update_profile(
            State(state.clone()),
            testing::auth_headers(&auth.token),
            Json(UpdateProfile {
                name: Some("张三".to_string()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(updated.0.name.as_deref(), Some("张三"));
        assert_eq!(updated.0.student_id, auth.user.student_id);
    }

    #[tokio::test]
    async fn change_password_rotates_token() {
        let state = testing::state();
        let auth = testing::register(&state, "20210006").await;

        let wrong = change_password(
            State(state.clone()),
            testing::auth_headers(&auth.token),
            Json(ChangePassword {
                current_password: state.cipher.encrypt("not-the-password"),
                new_password: state.cipher.encrypt("RotatedPassword1"),
            }),
        )
        .await;
        assert!(matches!(wrong, Err(ApiError::Validation(_))));

        let rotated = change_password(
            State(state.clone()),
            testing::auth_headers(&auth.token),
            Json(ChangePassword {
                current_password: state.cipher.encrypt(testing::DEFAULT_PASSWORD),
                new_password: state.cipher.encrypt("RotatedPassword1"),
            }),
        )
        .await
        .unwrap();
        assert_ne!(rotated.0.token, auth.token);

        // The old token is gone, the new one works.
        let stale = profile(State(state.clone()), testing::auth_headers(&auth.token)).await;
        assert!(matches!(stale, Err(ApiError::Unauthorized)));
        profile(State(state.clone()), testing::auth_headers(&rotated.0.token))
            .await
            .unwrap();

        let relogin = login(
            State(state.clone()),
            Json(Login {
                student_id: auth.user.student_id.clone(),
                password: state.cipher.encrypt("RotatedPassword1"),
            }),
        )
        .await
        .unwrap();
        assert_eq!(relogin.0.token, rotated.0.token);
    }
}
