use std::collections::HashMap;
use std::sync::Arc;

use texting_robots::Robot;
use tokio::sync::Mutex;

/// Fetches and caches `robots.txt` per host. An unreachable or unparsable
/// robots file allows everything (fail open).
pub struct RobotsPolicy {
    http: reqwest::Client,
    user_agent: String,
    // Workers consult this concurrently; the whole lookup is under one lock
    // so a host's robots.txt is fetched exactly once.
    cache: Mutex<HashMap<String, Option<Arc<Robot>>>>,
}

impl RobotsPolicy {
    pub fn new(http: reqwest::Client, user_agent: impl Into<String>) -> Self {
        Self {
            http,
            user_agent: user_agent.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Whether the crawler may fetch `url`.
    pub async fn can_fetch(&self, url: &str) -> bool {
        let Some(authority) = authority_of(url) else {
            return false;
        };

        let mut cache = self.cache.lock().await;
        if !cache.contains_key(&authority) {
            let robot = self.fetch_robots(&authority).await;
            cache.insert(authority.clone(), robot);
        }

        match &cache[&authority] {
            Some(robot) => robot.allowed(url),
            None => true,
        }
    }

    async fn fetch_robots(&self, authority: &str) -> Option<Arc<Robot>> {
        let robots_url = format!("http://{authority}/robots.txt");
        let resp = match self.http.get(&robots_url).send().await {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(_) | Err(_) => {
                log::debug!("no robots.txt for {authority}, allowing all");
                return None;
            }
        };
        let body = resp.bytes().await.ok()?;
        match Robot::new(&self.user_agent, &body) {
            Ok(robot) => Some(Arc::new(robot)),
            Err(e) => {
                log::debug!("unparsable robots.txt for {authority}: {e}, allowing all");
                None
            }
        }
    }
}

/// Host plus any explicit port, so fixtures and sites on non-default ports
/// resolve their own robots.txt.
fn authority_of(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}
