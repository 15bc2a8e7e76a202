use std::time::Duration;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_WS_PATH: &str = "/ws";

/// Settings read from the environment at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub ws_path: String,
    pub delay: Duration,
    pub api_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let port = lookup("GREETING_API_PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        let ws_path = lookup("GREETING_WS_PATH")
            .filter(|p| p.starts_with('/'))
            .unwrap_or_else(|| DEFAULT_WS_PATH.to_string());
        let delay = lookup("GREETING_DELAY_MS")
            .and_then(|ms| ms.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::ZERO);
        let api_key = lookup("GREETING_API_KEY").filter(|k| !k.is_empty());

        Self {
            port,
            ws_path,
            delay,
            api_key,
        }
    }
}
