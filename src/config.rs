use std::{env, path::PathBuf};

use crate::types::TemplateRef;

pub const DEFAULT_WINDOW_ERROR_CODES: &[i64] = &[131047];

pub const DEFAULT_WINDOW_ERROR_PATTERNS: &[&str] = &[
    r"re-?engagement",
    r"24 hours have passed",
    r"customer service window",
    r"outside (of )?the (allowed )?window",
];

#[derive(Debug, Clone)]
pub struct WhatsappCredentials {
    pub access_token: String,
    pub phone_number_id: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: Option<String>,
    pub credentials: Option<WhatsappCredentials>,
    pub api_base: String,
    pub api_version: String,
    pub verify_token: String,
    pub app_secret: String,
    pub country_code: String,
    pub fallback_template: TemplateRef,
    pub window_error_codes: Vec<i64>,
    pub window_error_patterns: Vec<String>,
    pub status_forward_only: bool,
    pub panel_user: String,
    pub panel_password: String,
    pub public_dir: PathBuf,
}

fn env_text(key: &str) -> String {
    env::var(key)
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}

fn env_or(key: &str, default: &str) -> String {
    let value = env_text(key);
    if value.is_empty() {
        default.to_string()
    } else {
        value
    }
}

fn env_list(key: &str) -> Option<Vec<String>> {
    let value = env_text(key);
    if value.is_empty() {
        return None;
    }
    Some(
        value
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn resolve_database_url() -> Option<String> {
    let url = env_text("DATABASE_URL");
    if !url.is_empty() {
        return Some(url);
    }
    let host = env::var("POSTGRES_HOST").or_else(|_| env::var("PGHOST")).ok()?;
    let port = env::var("POSTGRES_PORT")
        .or_else(|_| env::var("PGPORT"))
        .unwrap_or_else(|_| "5432".to_string());
    let user = env::var("POSTGRES_USER")
        .or_else(|_| env::var("PGUSER"))
        .unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("POSTGRES_PASSWORD")
        .or_else(|_| env::var("PGPASSWORD"))
        .unwrap_or_default();
    let db = env::var("POSTGRES_DB")
        .or_else(|_| env::var("PGDATABASE"))
        .unwrap_or_else(|_| "wa_panel".to_string());
    Some(format!("postgres://{user}:{password}@{host}:{port}/{db}"))
}

impl Config {
    /// Reads the process environment. Call `dotenvy::dotenv()` first.
    pub fn from_env() -> Self {
        let port = env::var("PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(3000);

        let access_token = env_text("WHATSAPP_TOKEN");
        let phone_number_id = env_text("WHATSAPP_PHONE_NUMBER_ID");
        let credentials = if access_token.is_empty() || phone_number_id.is_empty() {
            None
        } else {
            Some(WhatsappCredentials {
                access_token,
                phone_number_id,
            })
        };

        let window_error_codes = env_list("WINDOW_ERROR_CODES")
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.parse::<i64>().ok())
                    .collect()
            })
            .unwrap_or_else(|| DEFAULT_WINDOW_ERROR_CODES.to_vec());
        let window_error_patterns = env_list("WINDOW_ERROR_PATTERNS").unwrap_or_else(|| {
            DEFAULT_WINDOW_ERROR_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect()
        });

        Self {
            port,
            database_url: resolve_database_url(),
            credentials,
            api_base: env_or("WHATSAPP_API_BASE", "https://graph.facebook.com")
                .trim_end_matches('/')
                .to_string(),
            api_version: env_or("WHATSAPP_API_VERSION", "v21.0"),
            verify_token: env_text("VERIFY_TOKEN"),
            app_secret: env_text("WHATSAPP_APP_SECRET"),
            country_code: env_or("COUNTRY_CODE", "55"),
            fallback_template: TemplateRef {
                name: env_or("FALLBACK_TEMPLATE", "hello_world"),
                language: env_or("FALLBACK_TEMPLATE_LANG", "en_US"),
            },
            window_error_codes,
            window_error_patterns,
            status_forward_only: parse_flag(&env_text("STATUS_FORWARD_ONLY")).unwrap_or(true),
            panel_user: env_text("PANEL_USER"),
            panel_password: env_text("PANEL_PASSWORD"),
            public_dir: PathBuf::from(env_or("PUBLIC_DIR", "./public")),
        }
    }

    pub fn panel_auth_enabled(&self) -> bool {
        !self.panel_user.is_empty() && !self.panel_password.is_empty()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            database_url: None,
            credentials: None,
            api_base: "https://graph.facebook.com".to_string(),
            api_version: "v21.0".to_string(),
            verify_token: String::new(),
            app_secret: String::new(),
            country_code: "55".to_string(),
            fallback_template: TemplateRef {
                name: "hello_world".to_string(),
                language: "en_US".to_string(),
            },
            window_error_codes: DEFAULT_WINDOW_ERROR_CODES.to_vec(),
            window_error_patterns: DEFAULT_WINDOW_ERROR_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            status_forward_only: true,
            panel_user: String::new(),
            panel_password: String::new(),
            public_dir: PathBuf::from("./public"),
        }
    }
}
