use serde::{Deserialize, Serialize};

// ── Auth ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub student_id: String,
    pub email: String,
    pub name: Option<String>,
    pub is_active: bool,
    pub is_staff: bool,
    pub date_joined: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKeyResponse {
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendCode {
    pub student_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendCodeResponse {
    pub message: String,
    pub student_id: String,
}

/// Credential fields arrive base64-encoded RSA ciphertext, never plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetPassword {
    pub student_id: String,
    pub code: String,
    pub password: String,
    pub confirm_password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Login {
    pub student_id: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateProfile {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangePassword {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

// ── Themes ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThemeType {
    Share,
    Discussion,
    Ad,
    Notice,
}

impl ThemeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThemeType::Share => "share",
            ThemeType::Discussion => "discussion",
            ThemeType::Ad => "ad",
            ThemeType::Notice => "notice",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "share" => Some(ThemeType::Share),
            "discussion" => Some(ThemeType::Discussion),
            "ad" => Some(ThemeType::Ad),
            "notice" => Some(ThemeType::Notice),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Theme {
    pub id: i64,
    pub title: String,
    pub theme_type: ThemeType,
    pub description: String,
    pub author: User,
    pub starts_at: Option<String>,
    pub ends_at: Option<String>,
    pub first_post_id: Option<i64>,
    pub created_at: String,
    pub reply_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThemeDetail {
    pub theme: Theme,
    pub first_post: Post,
}

// ── Posts ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: i64,
    pub theme_id: i64,
    pub parent_id: Option<i64>,
    pub title: Option<String>,
    pub content: Option<String>,
    pub author: User,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePost {
    pub theme_id: i64,
    pub parent_id: Option<i64>,
    pub title: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePost {
    pub title: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostImage {
    pub id: i64,
    pub post_id: i64,
    pub image: String,
    pub sort_order: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostLink {
    pub id: i64,
    pub source_post_id: i64,
    pub target_post_id: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePostLink {
    pub target_post_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostDetail {
    pub post: Post,
    pub images: Vec<PostImage>,
    pub outgoing_links: Vec<PostLink>,
    pub incoming_links: Vec<PostLink>,
}

/// One node of a theme's reply tree: the post itself, its images in
/// sort order, and its direct replies in insertion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyTreeNode {
    pub post: Post,
    pub images: Vec<PostImage>,
    pub children: Vec<ReplyTreeNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paginated<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
}
