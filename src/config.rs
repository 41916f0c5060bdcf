//! Process-wide settings, resolved once at startup and injected downward.

use std::path::PathBuf;

pub const DEFAULT_API_URL: &str = "http://localhost:8000/api";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Executor base URL, without a trailing slash.
    pub api_url: String,
    /// Simulate runs locally instead of talking to the executor.
    pub use_mock: bool,
    pub store_path: PathBuf,
    pub openai: OpenAiConfig,
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
}

pub fn normalize_api_url(raw: &str) -> String {
    raw.trim().trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slashes_are_trimmed() {
        assert_eq!(normalize_api_url("http://exec:8000/api/"), "http://exec:8000/api");
        assert_eq!(normalize_api_url(" http://exec/api// "), "http://exec/api");
        assert_eq!(normalize_api_url(DEFAULT_API_URL), DEFAULT_API_URL);
    }
}
