//! User agent candidates handed out with each allocated proxy

use std::path::Path;

use rand::seq::SliceRandom;
use tracing::{debug, warn};

use crate::error::{FetchError, Result};

const BUILTIN: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_2 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36",
];

#[derive(Debug, Clone)]
pub struct UserAgentPool {
    agents: Vec<String>,
}

impl UserAgentPool {
    pub fn builtin() -> Self {
        Self {
            agents: BUILTIN.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Pool from a list; blank entries are dropped and an empty result
    /// falls back to the built-in agents
    pub fn from_list<I, S>(agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let agents: Vec<String> = agents
            .into_iter()
            .map(|a| a.as_ref().trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();

        if agents.is_empty() {
            warn!("User agent list is empty, using built-in agents");
            return Self::builtin();
        }
        Self { agents }
    }

    /// Load a newline-delimited list
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            FetchError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        let pool = Self::from_list(content.lines());
        debug!(path = %path.display(), agents = pool.len(), "User agents loaded");
        Ok(pool)
    }

    pub fn choose(&self) -> &str {
        let mut rng = rand::thread_rng();
        self.agents
            .choose(&mut rng)
            .map(String::as_str)
            .unwrap_or(BUILTIN[0])
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl Default for UserAgentPool {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_list_drops_blanks() {
        let pool = UserAgentPool::from_list(["Agent/1", "", "  ", "Agent/2\r"]);
        assert_eq!(pool.len(), 2);
        assert!(["Agent/1", "Agent/2"].contains(&pool.choose()));
    }

    #[test]
    fn test_empty_list_falls_back_to_builtin() {
        let pool = UserAgentPool::from_list(Vec::<String>::new());
        assert_eq!(pool.len(), BUILTIN.len());
        assert!(!pool.choose().is_empty());
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let result = UserAgentPool::load("/nonexistent/user-agents.txt").await;
        assert!(matches!(result, Err(FetchError::InvalidConfig(_))));
    }

    #[test]
    fn test_load_list_file() {
        let path = std::env::temp_dir().join(format!("rota-fetch-ua-{}.txt", uuid::Uuid::new_v4()));
        std::fs::write(&path, "Agent/1\n\nAgent/2\n").unwrap();

        let pool = tokio_test::block_on(UserAgentPool::load(&path)).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(pool.len(), 2);
        assert!(["Agent/1", "Agent/2"].contains(&pool.choose()));
    }
}
