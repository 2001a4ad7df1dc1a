//! Per-session scraping identity: user-agent rotation and cookie jars.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use rand::seq::SliceRandom;

/// Desktop, mobile and crawler user agents the rotation draws from.
pub const USER_AGENTS: &[&str] = &[
    // Desktop
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/103.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.0 Safari/605.1.15",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv: 97.0) Gecko/20100101 Firefox/97.0",
    // Mobile
    "Mozilla/5.0 (iPhone; CPU iPhone OS 14_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.0 Mobile/15A372 Safari/604.1",
    "Mozilla/5.0 (iPad; CPU OS 13_6_1 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/13.1.2 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (Linux; Android 10; SM-G975F) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/85.0.4183.127 Mobile Safari/537.36",
    "Mozilla/5.0 (Linux; Android 9; Pixel 3) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.120 Mobile Safari/537.36",
    // Crawlers
    "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)",
    "Mozilla/5.0 (compatible; Bingbot/2.0; +http://www.bing.com/bingbot.htm)",
];

/// Headers sent with every fetch to look like a regular browser session.
pub const STEALTH_HEADERS: &[(&str, &str)] = &[
    ("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7"),
    ("Accept-Language", "pt-BR,pt;q=0.9,en-US;q=0.8,en;q=0.7"),
    ("Connection", "keep-alive"),
    ("Upgrade-Insecure-Requests", "1"),
    ("Sec-Fetch-Dest", "document"),
    ("Sec-Fetch-Mode", "navigate"),
    ("Sec-Fetch-Site", "none"),
    ("Sec-Fetch-User", "?1"),
    ("DNT", "1"),
    ("Sec-GPC", "1"),
    ("Referer", "https://www.mercadolivre.com.br/"),
];

/// Cookies every fresh session starts with.
pub const GENERIC_COOKIES: &[(&str, &str)] = &[
    ("cookieConsent", "true"),
    ("geoCountry", "BR"),
    ("webp", "1"),
];

struct UaSession {
    ua: String,
    count: u32,
    start_time: Instant,
}

/// Rotating per-session user agents with usage limits.
pub struct UserAgentManager {
    max_requests: u32,
    session_timeout_secs: u64,
    sessions: Mutex<HashMap<String, UaSession>>,
}

impl Default for UserAgentManager {
    fn default() -> Self {
        Self::new(50, 3600)
    }
}

impl UserAgentManager {
    pub fn new(max_requests: u32, session_timeout_secs: u64) -> Self {
        Self {
            max_requests,
            session_timeout_secs,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the session's agent, rotating after the usage or age limit.
    pub fn get_user_agent(&self, session_id: &str) -> String {
        let mut sessions = self.sessions.lock();
        let needs_new = match sessions.get(session_id) {
            None => true,
            Some(sess) => {
                sess.count >= self.max_requests
                    || sess.start_time.elapsed().as_secs() >= self.session_timeout_secs
            }
        };
        if needs_new {
            let ua = USER_AGENTS
                .choose(&mut rand::thread_rng())
                .copied()
                .unwrap_or(USER_AGENTS[0])
                .to_string();
            sessions.insert(
                session_id.to_string(),
                UaSession {
                    ua,
                    count: 0,
                    start_time: Instant::now(),
                },
            );
        }
        let sess = sessions.get_mut(session_id).expect("session just ensured");
        sess.count += 1;
        sess.ua.clone()
    }

    /// Forces a new agent for one session, or all when None.
    pub fn rotate(&self, session_id: Option<&str>) {
        let mut sessions = self.sessions.lock();
        match session_id {
            Some(id) => {
                sessions.remove(id);
            }
            None => sessions.clear(),
        }
    }
}

/// Per-session cookie jars, seeded from the generic set.
#[derive(Default)]
pub struct CookieManager {
    store: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl CookieManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session cookies as a `Cookie` header value.
    pub fn cookie_header(&self, session_id: &str) -> String {
        let mut store = self.store.lock();
        let jar = store
            .entry(session_id.to_string())
            .or_insert_with(|| {
                GENERIC_COOKIES
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect()
            });
        let mut pairs: Vec<String> = jar.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        pairs.sort();
        pairs.join("; ")
    }

    /// Folds `Set-Cookie` headers from a response into the session jar.
    pub fn update_from_response(&self, session_id: &str, set_cookies: &[String]) {
        let mut store = self.store.lock();
        let jar = store.entry(session_id.to_string()).or_default();
        for raw in set_cookies {
            if let Some(pair) = raw.split(';').next() {
                if let Some((name, value)) = pair.split_once('=') {
                    jar.insert(name.trim().to_string(), value.trim().to_string());
                }
            }
        }
    }

    /// Clears one session's cookies, or all when None.
    pub fn reset(&self, session_id: Option<&str>) {
        let mut store = self.store.lock();
        match session_id {
            Some(id) => {
                store.remove(id);
            }
            None => store.clear(),
        }
    }
}
