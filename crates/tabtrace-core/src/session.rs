//! Session identity management.
//!
//! Four identifiers scope every row: a per-install id persisted across
//! sessions, a per-consumer-lifetime browser session id, the
//! host-assigned tab id, and a per-page-load id minted by the producer.
//! Identity resolution must never block capture; when the handshake or
//! storage fails, everything degrades to `None`.
//!
//! Also hosts the login-identifier scoring helper: a pure ranking over
//! candidate input-field descriptors. Persisting the winning guess is
//! the host's concern.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::SessionConfig;
use crate::error::{Error, Result};

const IDENTITY_FILE: &str = "identity.json";

/// Maximum stored length of a login identifier guess.
pub const LOGIN_ID_MAX_LEN: usize = 128;

// ─── Session identity ────────────────────────────────────────────────

/// Identifiers stamped on every raw event. All optional: a row must
/// never block waiting on identity resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionIdentity {
    pub install_id: Option<String>,
    pub browser_session_id: Option<String>,
    pub tab_id: Option<i64>,
    pub page_session_id: Option<String>,
}

// ─── Identity manager ────────────────────────────────────────────────

/// On-disk identity state.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct IdentityState {
    install_id: Option<String>,
    browser_session_id: Option<String>,
}

/// Consumer-side identity authority.
///
/// Mints and persists the install id, mints the browser session id once
/// per lifetime (optionally persisting it), and answers producer
/// handshakes.
#[derive(Debug)]
pub struct IdentityManager {
    path: PathBuf,
    install_id: String,
    browser_session_id: String,
}

impl IdentityManager {
    /// Load identity state from `state_dir`, minting and persisting any
    /// missing identifiers.
    pub fn load_or_create(state_dir: &Path, config: &SessionConfig) -> Result<Self> {
        std::fs::create_dir_all(state_dir).map_err(|e| Error::Identity {
            path: state_dir.to_path_buf(),
            message: e.to_string(),
        })?;
        let path = state_dir.join(IDENTITY_FILE);

        let mut state = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str::<IdentityState>(&text).unwrap_or_default(),
            Err(_) => IdentityState::default(),
        };

        let mut dirty = false;
        let install_id = state.install_id.clone().unwrap_or_else(|| {
            dirty = true;
            uuid::Uuid::new_v4().to_string()
        });
        let browser_session_id = if config.persist_browser_session {
            state.browser_session_id.clone().unwrap_or_else(|| {
                dirty = true;
                uuid::Uuid::new_v4().to_string()
            })
        } else {
            uuid::Uuid::new_v4().to_string()
        };

        if dirty {
            state.install_id = Some(install_id.clone());
            state.browser_session_id = config
                .persist_browser_session
                .then(|| browser_session_id.clone());
            let text = serde_json::to_string_pretty(&state)?;
            std::fs::write(&path, text).map_err(|e| Error::Identity {
                path: path.clone(),
                message: e.to_string(),
            })?;
        }

        Ok(Self {
            path,
            install_id,
            browser_session_id,
        })
    }

    #[must_use]
    pub fn install_id(&self) -> &str {
        &self.install_id
    }

    #[must_use]
    pub fn browser_session_id(&self) -> &str {
        &self.browser_session_id
    }

    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.path
    }

    /// Answer a producer handshake.
    #[must_use]
    pub fn hello_ack(&self, tab_id: Option<i64>) -> crate::event::HelloAck {
        crate::event::HelloAck {
            browser_session_id: Some(self.browser_session_id.clone()),
            tab_id,
        }
    }
}

/// Mint a fresh per-page-load session id.
#[must_use]
pub fn new_page_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ─── Login identifier scoring ────────────────────────────────────────

/// A candidate input field for login-identifier guessing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginFieldCandidate {
    pub name: Option<String>,
    pub id: Option<String>,
    pub placeholder: Option<String>,
    pub input_type: Option<String>,
    pub value: Option<String>,
}

const LOGIN_TERMS: &[&str] = &[
    "login", "userid", "user", "email", "account", "아이디", "사번",
];

fn login_score(c: &LoginFieldCandidate) -> u32 {
    let haystack = format!(
        "{}{}{}",
        c.name.as_deref().unwrap_or(""),
        c.id.as_deref().unwrap_or(""),
        c.placeholder.as_deref().unwrap_or("")
    )
    .to_lowercase();

    let mut score = 0;
    if LOGIN_TERMS.iter().any(|t| haystack.contains(t)) {
        score += 2;
    }
    match c.input_type.as_deref().map(str::to_lowercase).as_deref() {
        Some("text" | "email") => score += 1,
        _ => {}
    }
    if c.value.as_deref().is_some_and(|v| v.trim().len() >= 3) {
        score += 2;
    }
    score
}

/// Rank candidates and return the best non-empty value, truncated to
/// [`LOGIN_ID_MAX_LEN`] characters. Returns None when no candidate has
/// a usable value.
#[must_use]
pub fn guess_login_id(candidates: &[LoginFieldCandidate]) -> Option<String> {
    candidates
        .iter()
        .filter(|c| c.value.as_deref().is_some_and(|v| !v.trim().is_empty()))
        .max_by_key(|c| login_score(c))
        .and_then(|c| c.value.as_deref())
        .map(|v| v.trim().chars().take(LOGIN_ID_MAX_LEN).collect())
}
