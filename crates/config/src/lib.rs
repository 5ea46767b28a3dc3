use std::path::PathBuf;
use serde::Deserialize;

/// All configuration for the Compass booking service.
///
/// Precedence (lowest to highest): defaults → config file → env var → CLI arg.
/// CLI arg merging is done by the caller after `Config::load()`.
#[derive(Debug, Clone)]
pub struct Config {
    // Database
    pub db_url: String,

    // Server
    pub port: u16,

    // Logging
    pub log_level: String,
    pub utc: bool,

    // SMTP (confirmation emails; console fallback when server is unset)
    pub smtp_server: Option<String>,
    pub smtp_port: u16,
    pub smtp_username: String,
    pub smtp_password: String,
    pub smtp_from: String,
}

/// Config file layout (~/.compass/config.toml). All fields optional — they
/// layer on top of compiled-in defaults.
#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    db_url: Option<String>,
    port: Option<u16>,
    log_level: Option<String>,
    utc: Option<bool>,
    smtp_server: Option<String>,
    smtp_port: Option<u16>,
    smtp_username: Option<String>,
    smtp_password: Option<String>,
    smtp_from: Option<String>,
}

impl Config {
    /// Config directory: ~/.compass/
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".compass")
    }

    /// Config file path: ~/.compass/config.toml
    pub fn file_path() -> PathBuf {
        Self::dir().join("config.toml")
    }

    /// Load config: defaults → config file → env vars.
    /// CLI args should be merged by the caller afterward.
    pub fn load() -> Self {
        let mut config = Self::defaults();

        // Layer 2: config file
        if let Ok(contents) = std::fs::read_to_string(Self::file_path()) {
            if let Ok(file) = toml::from_str::<FileConfig>(&contents) {
                config.apply_file(file);
            }
        }

        // Layer 3: environment variables
        config.apply_env();

        config
    }

    // --- Private helpers ---

    fn defaults() -> Self {
        Self {
            db_url: "sqlite:compass.db".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            utc: false,
            smtp_server: None,
            smtp_port: 587,
            smtp_username: String::new(),
            smtp_password: String::new(),
            smtp_from: "Compass <no-reply@compass.local>".to_string(),
        }
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(v) = file.db_url { self.db_url = v; }
        if let Some(v) = file.port { self.port = v; }
        if let Some(v) = file.log_level { self.log_level = v; }
        if let Some(v) = file.utc { self.utc = v; }
        if let Some(v) = file.smtp_server { self.smtp_server = Some(v); }
        if let Some(v) = file.smtp_port { self.smtp_port = v; }
        if let Some(v) = file.smtp_username { self.smtp_username = v; }
        if let Some(v) = file.smtp_password { self.smtp_password = v; }
        if let Some(v) = file.smtp_from { self.smtp_from = v; }
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("COMPASS_DB_URL") { self.db_url = v; }
        if let Ok(v) = std::env::var("COMPASS_PORT") {
            if let Ok(p) = v.parse() { self.port = p; }
        }
        if let Ok(v) = std::env::var("COMPASS_LOG_LEVEL") { self.log_level = v; }
        if let Ok(v) = std::env::var("COMPASS_UTC") {
            self.utc = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("COMPASS_SMTP_SERVER") { self.smtp_server = Some(v); }
        if let Ok(v) = std::env::var("COMPASS_SMTP_PORT") {
            if let Ok(p) = v.parse() { self.smtp_port = p; }
        }
        if let Ok(v) = std::env::var("COMPASS_SMTP_USERNAME") { self.smtp_username = v; }
        if let Ok(v) = std::env::var("COMPASS_SMTP_PASSWORD") { self.smtp_password = v; }
        if let Ok(v) = std::env::var("COMPASS_SMTP_FROM") { self.smtp_from = v; }
    }
}
