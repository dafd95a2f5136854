use std::collections::HashMap;
use std::path::Path as FsPath;

use axum::{
    extract::{Multipart, Path, Query, State},
    http::HeaderMap,
    Json,
};
use hetaoshu_shared::{
    Paginated, PostImage, ReplyTreeNode, Theme, ThemeDetail, ThemeType,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;

use crate::error::ApiError;
use crate::{auth, db, posts, tree, AppState};

// ── Query params ──

#[derive(Deserialize)]
pub struct ThemeListParams {
    page: Option<i64>,
}

// ── Row mapping ──

const THEME_COLUMNS: &str =
    "t.id, t.title, t.theme_type, t.description, t.starts_at, t.ends_at, t.first_post_id, t.created_at";

fn theme_at(row: &rusqlite::Row<'_>) -> rusqlite::Result<Theme> {
    let theme_type: String = row.get(2)?;
    Ok(Theme {
        id: row.get(0)?,
        title: row.get(1)?,
        // Unknown type text falls back to notice, like the frontend does.
        theme_type: ThemeType::parse(&theme_type).unwrap_or(ThemeType::Notice),
        description: row.get(3)?,
        starts_at: row.get(4)?,
        ends_at: row.get(5)?,
        first_post_id: row.get(6)?,
        created_at: row.get(7)?,
        author: auth::user_at(row, 8)?,
        reply_count: row.get(15)?,
    })
}

fn theme_select(where_clause: &str) -> String {
    format!(
        "SELECT {THEME_COLUMNS},
                {user},
                (SELECT COUNT(*) FROM posts p
                 WHERE p.theme_id = t.id AND p.is_active = 1 AND p.id <> t.first_post_id)
         FROM themes t JOIN users u ON t.author_id = u.id
         {where_clause}",
        user = auth::USER_COLUMNS,
    )
}

pub(crate) fn load_theme(conn: &Connection, theme_id: i64) -> Result<Theme, ApiError> {
    conn.query_row(&theme_select("WHERE t.id = ?1"), [theme_id], |row| {
        theme_at(row)
    })
    .optional()?
    .ok_or(ApiError::NotFound("theme"))
}

// ── Transactional creation ──

pub(crate) struct NewTheme {
    pub title: String,
    pub theme_type: ThemeType,
    pub description: String,
    pub content: String,
    pub starts_at: Option<String>,
    pub ends_at: Option<String>,
}

/// Theme, first post, and image rows land in one transaction; a theme is
/// never persisted without its first post.
pub(crate) fn insert_theme(
    conn: &mut Connection,
    author_id: i64,
    new: &NewTheme,
    image_paths: &[String],
) -> rusqlite::Result<(i64, i64)> {
    let now = db::now();
    let tx = conn.transaction()?;

    tx.execute(
        "INSERT INTO themes (title, theme_type, description, author_id, starts_at, ends_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            new.title,
            new.theme_type.as_str(),
            new.description,
            author_id,
            new.starts_at,
            new.ends_at,
            now
        ],
    )?;
    let theme_id = tx.last_insert_rowid();

    tx.execute(
        "INSERT INTO posts (theme_id, parent_id, title, content, author_id, created_at, updated_at)
         VALUES (?1, NULL, ?2, ?3, ?4, ?5, ?5)",
        params![theme_id, new.title, new.content, author_id, now],
    )?;
    let post_id = tx.last_insert_rowid();

    tx.execute(
        "UPDATE themes SET first_post_id = ?1 WHERE id = ?2",
        params![post_id, theme_id],
    )?;

    for (index, path) in image_paths.iter().enumerate() {
        tx.execute(
            "INSERT INTO post_images (post_id, image_path, sort_order, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![post_id, path, index as i64, now],
        )?;
    }

    tx.commit()?;
    Ok((theme_id, post_id))
}

// ── Handlers ──

/// GET /api/themes?page=1
pub async fn list_themes(
    State(state): State<AppState>,
    Query(params): Query<ThemeListParams>,
) -> Result<Json<Paginated<Theme>>, ApiError> {
    let page = params.page.unwrap_or(1).max(1);
    let per_page: i64 = 20;
    let offset = (page - 1) * per_page;

    let pool = state.db.clone();
    let result = tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;

        let total: i64 = conn
            .query_row("SELECT COUNT(*) FROM themes", [], |row| row.get(0))
            .unwrap_or(0);

        let mut stmt = conn.prepare(&theme_select(
            "ORDER BY t.created_at DESC, t.id DESC LIMIT ?1 OFFSET ?2",
        ))?;
        let themes = stmt
            .query_map(params![per_page, offset], |row| theme_at(row))?
            .filter_map(|r| r.ok())
            .collect::<Vec<_>>();

        Ok::<_, ApiError>(Paginated {
            items: themes,
            total,
            page,
            per_page,
        })
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;

    Ok(Json(result))
}

/// POST /api/themes — multipart: title, theme_type, description, content,
/// optional starts_at/ends_at, repeated `images` file parts. Theme, first
/// post, and images are created all-or-nothing.
pub async fn create_theme(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<ThemeDetail>, ApiError> {
    let token = auth::bearer_token(&headers)?;

    let mut title = String::new();
    let mut theme_type = None;
    let mut description = String::new();
    let mut content = String::new();
    let mut starts_at = None;
    let mut ends_at = None;
    let mut images: Vec<(Option<String>, Vec<u8>)> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| ApiError::validation("malformed multipart body"))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("title") => {
                title = field
                    .text()
                    .await
                    .map_err(|_| ApiError::validation("malformed multipart body"))?;
            }
            Some("theme_type") => {
                let raw = field
                    .text()
                    .await
                    .map_err(|_| ApiError::validation("malformed multipart body"))?;
                theme_type = Some(
                    ThemeType::parse(raw.trim())
                        .ok_or_else(|| ApiError::validation("invalid theme_type"))?,
                );
            }
            Some("description") => {
                description = field
                    .text()
                    .await
                    .map_err(|_| ApiError::validation("malformed multipart body"))?;
            }
            Some("content") => {
                content = field
                    .text()
                    .await
                    .map_err(|_| ApiError::validation("malformed multipart body"))?;
            }
            Some("starts_at") => {
                starts_at = Some(
                    field
                        .text()
                        .await
                        .map_err(|_| ApiError::validation("malformed multipart body"))?,
                );
            }
            Some("ends_at") => {
                ends_at = Some(
                    field
                        .text()
                        .await
                        .map_err(|_| ApiError::validation("malformed multipart body"))?,
                );
            }
            Some("images") => {
                let file_name = field.file_name().map(str::to_string);
                let data = field
                    .bytes()
                    .await
                    .map_err(|_| ApiError::validation("malformed multipart body"))?;
                images.push((file_name, data.to_vec()));
            }
            _ => {}
        }
    }

    let title = ammonia::clean(title.trim());
    let content = ammonia::clean(content.trim());
    let description = ammonia::clean(description.trim());
    if title.is_empty() || content.is_empty() {
        return Err(ApiError::validation("title and content are required"));
    }
    let new = NewTheme {
        title,
        theme_type: theme_type.ok_or_else(|| ApiError::validation("theme_type is required"))?,
        description,
        content,
        starts_at,
        ends_at,
    };

    let pool = state.db.clone();
    let media_root = state.media_root.clone();
    let detail = tokio::task::spawn_blocking(move || {
        let mut conn = pool.get()?;
        let user = auth::user_for_token(&conn, &token)?;

        let mut saved = Vec::with_capacity(images.len());
        for (file_name, data) in &images {
            saved.push(posts::save_upload(&media_root, file_name.as_deref(), data)?);
        }

        match insert_theme(&mut conn, user.id, &new, &saved) {
            Ok((theme_id, post_id)) => {
                let theme = load_theme(&conn, theme_id)?;
                let first_post = posts::load_post(&conn, post_id)?;
                Ok(ThemeDetail { theme, first_post })
            }
            Err(e) => {
                // Nothing was committed; the files must not outlive the rows.
                for file in &saved {
                    let _ = std::fs::remove_file(FsPath::new(&media_root).join(file));
                }
                Err(ApiError::from(e))
            }
        }
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;

    Ok(Json(detail))
}

/// GET /api/themes/{id}
pub async fn theme_detail(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ThemeDetail>, ApiError> {
    let pool = state.db.clone();
    let detail = tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;
        let theme = load_theme(&conn, id)?;
        let first_post_id = theme.first_post_id.ok_or(ApiError::NotFound("post"))?;
        let first_post = posts::load_post(&conn, first_post_id)?;
        Ok::<_, ApiError>(ThemeDetail { theme, first_post })
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;

    Ok(Json(detail))
}

/// GET /api/themes/{id}/reply_tree — the nested reply structure rooted at
/// the theme's first post.
pub async fn reply_tree(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ReplyTreeNode>, ApiError> {
    let pool = state.db.clone();
    let media_url = state.media_url.clone();
    let built = tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;

        let first_post_id: Option<i64> = conn
            .query_row("SELECT first_post_id FROM themes WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()?
            .ok_or(ApiError::NotFound("theme"))?;
        let root_id = first_post_id.ok_or(ApiError::NotFound("post"))?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM posts p JOIN users u ON p.author_id = u.id
             WHERE p.theme_id = ?1 AND p.is_active = 1
             ORDER BY p.id",
            posts::POST_COLUMNS,
        ))?;
        let active_posts = stmt
            .query_map([id], |row| posts::post_at(row))?
            .filter_map(|r| r.ok())
            .collect::<Vec<_>>();

        let mut stmt = conn.prepare(
            "SELECT i.id, i.post_id, i.image_path, i.sort_order, i.created_at
             FROM post_images i JOIN posts p ON i.post_id = p.id
             WHERE p.theme_id = ?1 AND p.is_active = 1
             ORDER BY i.post_id, i.sort_order, i.id",
        )?;
        let mut images_by_post: HashMap<i64, Vec<PostImage>> = HashMap::new();
        let rows = stmt.query_map([id], |row| posts::image_at(row, &media_url))?;
        for image in rows {
            let image = image?;
            images_by_post.entry(image.post_id).or_default().push(image);
        }

        let nodes = active_posts
            .into_iter()
            .map(|post| {
                let images = images_by_post.remove(&post.id).unwrap_or_default();
                (post, images)
            })
            .collect();

        tree::build_reply_tree(root_id, nodes).ok_or(ApiError::NotFound("post"))
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;

    Ok(Json(built))
}
