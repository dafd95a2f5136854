mod auth;
mod crypto;
mod db;
mod error;
mod mailer;
mod posts;
mod themes;
mod tree;

use std::sync::Arc;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use tower_http::cors::{AllowHeaders, AllowMethods, CorsLayer};
use tower_http::services::ServeDir;
use tracing_subscriber::EnvFilter;

use crypto::CredentialCipher;
use mailer::Mailer;

pub type DbPool = r2d2::Pool<r2d2_sqlite::SqliteConnectionManager>;

#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub cipher: Arc<CredentialCipher>,
    pub mailer: Arc<Mailer>,
    pub email_domain: String,
    pub media_root: String,
    pub media_url: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("hetaoshu_api=info,tower_http=info")),
        )
        .init();

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "hetaoshu.db".to_string());
    let manager = r2d2_sqlite::SqliteConnectionManager::file(&database_url)
        .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
    let pool = r2d2::Pool::new(manager).expect("Failed to create DB pool");

    db::run_migrations(&pool).expect("Failed to run migrations");

    let key_path = std::env::var("RSA_PRIVATE_KEY_PATH")
        .unwrap_or_else(|_| "keys/private.pem".to_string());
    let cipher = CredentialCipher::load(std::path::Path::new(&key_path))
        .expect("Failed to load RSA private key");

    let cors_origin =
        std::env::var("CORS_ORIGIN").unwrap_or_else(|_| "http://localhost:3000".to_string());
    let media_root = std::env::var("MEDIA_ROOT").unwrap_or_else(|_| "media".to_string());

    let state = AppState {
        db: pool,
        cipher: Arc::new(cipher),
        mailer: Arc::new(Mailer::from_env()),
        email_domain: std::env::var("EMAIL_DOMAIN").unwrap_or_else(|_| "slai.edu.cn".to_string()),
        media_root: media_root.clone(),
        media_url: std::env::var("MEDIA_URL").unwrap_or_else(|_| "/media".to_string()),
    };

    let cors = CorsLayer::new()
        .allow_origin(
            cors_origin
                .parse::<axum::http::HeaderValue>()
                .expect("Invalid CORS_ORIGIN"),
        )
        .allow_methods(AllowMethods::any())
        .allow_headers(AllowHeaders::any());

    let app = Router::new()
        .route("/api/health", get(|| async { "ok" }))
        // Auth
        .route("/api/auth/public-key", get(auth::public_key))
        .route("/api/auth/send-code", post(auth::send_code))
        .route("/api/auth/set-password", post(auth::set_password))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/logout", post(auth::logout))
        .route(
            "/api/auth/profile",
            get(auth::profile).put(auth::update_profile),
        )
        .route("/api/auth/change-password", put(auth::change_password))
        // Themes
        .route(
            "/api/themes",
            get(themes::list_themes).post(themes::create_theme),
        )
        .route("/api/themes/{id}", get(themes::theme_detail))
        .route("/api/themes/{id}/reply_tree", get(themes::reply_tree))
        // Posts
        .route(
            "/api/posts",
            get(posts::list_posts).post(posts::create_post),
        )
        .route(
            "/api/posts/{id}",
            get(posts::post_detail)
                .patch(posts::update_post)
                .delete(posts::delete_post),
        )
        .route("/api/posts/{id}/links", post(posts::add_link))
        .route(
            "/api/posts/{id}/images",
            get(posts::list_images).post(posts::upload_images),
        )
        .route("/api/links/{id}", delete(posts::delete_link))
        .nest_service("/media", ServeDir::new(&media_root))
        .layer(cors)
        .with_state(state);

    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    tracing::info!(%addr, "API server listening");
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
