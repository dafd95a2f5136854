use std::path::Path as FsPath;

use axum::{
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use hetaoshu_shared::{
    CreatePost, CreatePostLink, Paginated, Post, PostDetail, PostImage, PostLink, UpdatePost,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;

use crate::error::ApiError;
use crate::{auth, db, AppState};

// ── Query params ──

#[derive(Deserialize)]
pub struct PostListParams {
    theme: i64,
    page: Option<i64>,
}

// ── Row mapping ──

pub(crate) const POST_COLUMNS: &str =
    "p.id, p.theme_id, p.parent_id, p.title, p.content, p.is_active, p.created_at, p.updated_at,
     u.id, u.student_id, u.email, u.name, u.is_active, u.is_staff, u.date_joined";

pub(crate) fn post_at(row: &rusqlite::Row<'_>) -> rusqlite::Result<Post> {
    Ok(Post {
        id: row.get(0)?,
        theme_id: row.get(1)?,
        parent_id: row.get(2)?,
        title: row.get(3)?,
        content: row.get(4)?,
        is_active: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
        author: auth::user_at(row, 8)?,
    })
}

pub(crate) fn image_at(row: &rusqlite::Row<'_>, media_url: &str) -> rusqlite::Result<PostImage> {
    let path: String = row.get(2)?;
    Ok(PostImage {
        id: row.get(0)?,
        post_id: row.get(1)?,
        image: format!("{media_url}/{path}"),
        sort_order: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn link_at(row: &rusqlite::Row<'_>) -> rusqlite::Result<PostLink> {
    Ok(PostLink {
        id: row.get(0)?,
        source_post_id: row.get(1)?,
        target_post_id: row.get(2)?,
        created_at: row.get(3)?,
    })
}

/// Active post with its author, or 404.
pub(crate) fn load_post(conn: &Connection, post_id: i64) -> Result<Post, ApiError> {
    conn.query_row(
        &format!(
            "SELECT {POST_COLUMNS} FROM posts p JOIN users u ON p.author_id = u.id
             WHERE p.id = ?1 AND p.is_active = 1"
        ),
        [post_id],
        |row| post_at(row),
    )
    .optional()?
    .ok_or(ApiError::NotFound("post"))
}

fn images_for_post(
    conn: &Connection,
    post_id: i64,
    media_url: &str,
) -> Result<Vec<PostImage>, ApiError> {
    let mut stmt = conn.prepare(
        "SELECT id, post_id, image_path, sort_order, created_at
         FROM post_images WHERE post_id = ?1
         ORDER BY sort_order, id",
    )?;
    let images = stmt
        .query_map([post_id], |row| image_at(row, media_url))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(images)
}

// ── Media storage ──

/// Writes an upload under `media_root` with a random hex name, preserving
/// a sane extension. Returns the stored file name.
pub(crate) fn save_upload(
    media_root: &str,
    file_name: Option<&str>,
    data: &[u8],
) -> Result<String, ApiError> {
    std::fs::create_dir_all(media_root)
        .map_err(|e| ApiError::Internal(format!("media dir: {e}")))?;

    let ext = file_name
        .and_then(|n| n.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| {
            !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric())
        })
        .unwrap_or_else(|| "bin".to_string());

    use rand::Rng;
    let mut buf = [0u8; 16];
    rand::thread_rng().fill(&mut buf[..]);
    let stem: String = buf.iter().map(|b| format!("{b:02x}")).collect();
    let file = format!("{stem}.{ext}");

    std::fs::write(FsPath::new(media_root).join(&file), data)
        .map_err(|e| ApiError::Internal(format!("writing upload: {e}")))?;
    Ok(file)
}

// ── Handlers ──

/// GET /api/posts?theme=1&page=1 — active posts of a theme, oldest first.
pub async fn list_posts(
    State(state): State<AppState>,
    Query(params): Query<PostListParams>,
) -> Result<Json<Paginated<Post>>, ApiError> {
    let page = params.page.unwrap_or(1).max(1);
    let per_page: i64 = 50;
    let offset = (page - 1) * per_page;
    let theme_id = params.theme;

    let pool = state.db.clone();
    let result = tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;

        conn.query_row("SELECT id FROM themes WHERE id = ?1", [theme_id], |row| {
            row.get::<_, i64>(0)
        })
        .optional()?
        .ok_or(ApiError::NotFound("theme"))?;

        let total: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM posts WHERE theme_id = ?1 AND is_active = 1",
                [theme_id],
                |row| row.get(0),
            )
            .unwrap_or(0);

        let mut stmt = conn.prepare(&format!(
            "SELECT {POST_COLUMNS} FROM posts p JOIN users u ON p.author_id = u.id
             WHERE p.theme_id = ?1 AND p.is_active = 1
             ORDER BY p.id
             LIMIT ?2 OFFSET ?3"
        ))?;
        let items = stmt
            .query_map(params![theme_id, per_page, offset], |row| post_at(row))?
            .filter_map(|r| r.ok())
            .collect::<Vec<_>>();

        Ok::<_, ApiError>(Paginated {
            items,
            total,
            page,
            per_page,
        })
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;

    Ok(Json(result))
}

/// POST /api/posts — create a reply. With no parent given the reply hangs
/// off the theme's first post; an explicit parent must be an active post
/// of the same theme.
pub async fn create_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreatePost>,
) -> Result<Json<Post>, ApiError> {
    let token = auth::bearer_token(&headers)?;

    let title = payload
        .title
        .as_deref()
        .map(|t| ammonia::clean(t.trim()))
        .filter(|t| !t.is_empty());
    let content = payload
        .content
        .as_deref()
        .map(|c| ammonia::clean(c.trim()))
        .filter(|c| !c.is_empty());

    let pool = state.db.clone();
    let post = tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;
        let user = auth::user_for_token(&conn, &token)?;

        let first_post_id: Option<i64> = conn
            .query_row(
                "SELECT first_post_id FROM themes WHERE id = ?1",
                [payload.theme_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(ApiError::NotFound("theme"))?;

        let parent_id = match payload.parent_id {
            Some(parent_id) => {
                let parent = load_post(&conn, parent_id)?;
                if parent.theme_id != payload.theme_id {
                    return Err(ApiError::validation("parent belongs to a different theme"));
                }
                parent_id
            }
            None => first_post_id.ok_or(ApiError::NotFound("post"))?,
        };

        let now = db::now();
        conn.execute(
            "INSERT INTO posts (theme_id, parent_id, title, content, author_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![payload.theme_id, parent_id, title, content, user.id, now],
        )?;
        load_post(&conn, conn.last_insert_rowid())
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;

    Ok(Json(post))
}

/// GET /api/posts/{id} — post with images and both link directions.
pub async fn post_detail(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<PostDetail>, ApiError> {
    let pool = state.db.clone();
    let media_url = state.media_url.clone();
    let detail = tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;
        let post = load_post(&conn, id)?;
        let images = images_for_post(&conn, id, &media_url)?;

        let mut stmt = conn.prepare(
            "SELECT id, source_post_id, target_post_id, created_at
             FROM post_links WHERE source_post_id = ?1 ORDER BY id",
        )?;
        let outgoing_links = stmt
            .query_map([id], link_at)?
            .filter_map(|r| r.ok())
            .collect();

        let mut stmt = conn.prepare(
            "SELECT id, source_post_id, target_post_id, created_at
             FROM post_links WHERE target_post_id = ?1 ORDER BY id",
        )?;
        let incoming_links = stmt
            .query_map([id], link_at)?
            .filter_map(|r| r.ok())
            .collect();

        Ok::<_, ApiError>(PostDetail {
            post,
            images,
            outgoing_links,
            incoming_links,
        })
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;

    Ok(Json(detail))
}

/// PATCH /api/posts/{id} — author only.
pub async fn update_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(payload): Json<UpdatePost>,
) -> Result<Json<Post>, ApiError> {
    let token = auth::bearer_token(&headers)?;

    let pool = state.db.clone();
    let post = tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;
        let user = auth::user_for_token(&conn, &token)?;
        let post = load_post(&conn, id)?;
        if post.author.id != user.id {
            return Err(ApiError::Forbidden);
        }

        if let Some(title) = payload.title.as_deref() {
            conn.execute(
                "UPDATE posts SET title = ?1 WHERE id = ?2",
                params![ammonia::clean(title.trim()), id],
            )?;
        }
        if let Some(content) = payload.content.as_deref() {
            conn.execute(
                "UPDATE posts SET content = ?1 WHERE id = ?2",
                params![ammonia::clean(content.trim()), id],
            )?;
        }
        conn.execute(
            "UPDATE posts SET updated_at = ?1 WHERE id = ?2",
            params![db::now(), id],
        )?;

        load_post(&conn, id)
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;

    Ok(Json(post))
}

/// DELETE /api/posts/{id} — soft delete by the post's author or the
/// theme's author. The first post of a theme cannot be deleted on its own.
pub async fn delete_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let token = auth::bearer_token(&headers)?;

    let pool = state.db.clone();
    tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;
        let user = auth::user_for_token(&conn, &token)?;
        let post = load_post(&conn, id)?;

        let (theme_author_id, first_post_id): (i64, Option<i64>) = conn.query_row(
            "SELECT author_id, first_post_id FROM themes WHERE id = ?1",
            [post.theme_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        if first_post_id == Some(id) {
            return Err(ApiError::validation("the first post of a theme cannot be deleted"));
        }
        if post.author.id != user.id && theme_author_id != user.id {
            return Err(ApiError::Forbidden);
        }

        conn.execute("UPDATE posts SET is_active = 0 WHERE id = ?1", [id])?;
        Ok(())
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;

    Ok(StatusCode::NO_CONTENT)
}

// ── Links ──

/// POST /api/posts/{id}/links — directed link to another post. The
/// (source, target) pair is unique; the reverse direction is a separate
/// link.
pub async fn add_link(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(payload): Json<CreatePostLink>,
) -> Result<Json<PostLink>, ApiError> {
    let token = auth::bearer_token(&headers)?;

    let pool = state.db.clone();
    let link = tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;
        let user = auth::user_for_token(&conn, &token)?;
        let source = load_post(&conn, id)?;
        if source.author.id != user.id {
            return Err(ApiError::Forbidden);
        }
        let target = load_post(&conn, payload.target_post_id)?;

        let exists: Option<i64> = conn
            .query_row(
                "SELECT id FROM post_links WHERE source_post_id = ?1 AND target_post_id = ?2",
                params![source.id, target.id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(ApiError::validation("link already exists"));
        }

        conn.execute(
            "INSERT INTO post_links (source_post_id, target_post_id, created_at) VALUES (?1, ?2, ?3)",
            params![source.id, target.id, db::now()],
        )?;
        let link = conn.query_row(
            "SELECT id, source_post_id, target_post_id, created_at FROM post_links WHERE id = ?1",
            [conn.last_insert_rowid()],
            link_at,
        )?;
        Ok::<_, ApiError>(link)
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;

    Ok(Json(link))
}

/// DELETE /api/links/{id} — only the source post's author.
pub async fn delete_link(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let token = auth::bearer_token(&headers)?;

    let pool = state.db.clone();
    tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;
        let user = auth::user_for_token(&conn, &token)?;

        let source_post_id: i64 = conn
            .query_row(
                "SELECT source_post_id FROM post_links WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(ApiError::NotFound("link"))?;
        let source = load_post(&conn, source_post_id)?;
        if source.author.id != user.id {
            return Err(ApiError::Forbidden);
        }

        conn.execute("DELETE FROM post_links WHERE id = ?1", [id])?;
        Ok(())
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;

    Ok(StatusCode::NO_CONTENT)
}

// ── Images ──

/// GET /api/posts/{id}/images
pub async fn list_images(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<PostImage>>, ApiError> {
    let pool = state.db.clone();
    let media_url = state.media_url.clone();
    let images = tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;
        load_post(&conn, id)?;
        images_for_post(&conn, id, &media_url)
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;

    Ok(Json(images))
}

/// POST /api/posts/{id}/images — multipart `images` parts appended in
/// submission order; author only.
pub async fn upload_images(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    mut multipart: Multipart,
) -> Result<Json<Vec<PostImage>>, ApiError> {
    let token = auth::bearer_token(&headers)?;

    let mut uploads: Vec<(Option<String>, Vec<u8>)> = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| ApiError::validation("malformed multipart body"))?
    {
        if field.name() != Some("images") {
            continue;
        }
        let file_name = field.file_name().map(str::to_string);
        let data = field
            .bytes()
            .await
            .map_err(|_| ApiError::validation("malformed multipart body"))?;
        uploads.push((file_name, data.to_vec()));
    }
    if uploads.is_empty() {
        return Err(ApiError::validation("no images provided"));
    }

    let pool = state.db.clone();
    let media_root = state.media_root.clone();
    let media_url = state.media_url.clone();
    let images = tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;
        let user = auth::user_for_token(&conn, &token)?;
        let post = load_post(&conn, id)?;
        if post.author.id != user.id {
            return Err(ApiError::Forbidden);
        }

        let next_order: i64 = conn.query_row(
            "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM post_images WHERE post_id = ?1",
            [id],
            |row| row.get(0),
        )?;

        let now = db::now();
        for (index, (file_name, data)) in uploads.iter().enumerate() {
            let file = save_upload(&media_root, file_name.as_deref(), data)?;
            conn.execute(
                "INSERT INTO post_images (post_id, image_path, sort_order, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, file, next_order + index as i64, now],
            )?;
        }

        images_for_post(&conn, id, &media_url)
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;

    Ok(Json(images))
}
