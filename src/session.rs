// Stored session credential: the signed-in user id and the bearer token the
// REST calls and the realtime authenticate frame derive their identity from.

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::info;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Read;
use std::path::PathBuf;

#[derive(Serialize, Deserialize, Clone)]
pub struct Session {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Session {
    pub fn new(user_id: &str, token: &str) -> Self {
        Session {
            user_id: user_id.to_string(),
            token: Some(BASE64.encode(token)),
        }
    }

    /// Decoded bearer token, if one is stored.
    pub fn bearer_token(&self) -> Option<String> {
        self.token.as_ref().and_then(|encoded| {
            BASE64
                .decode(encoded)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
    }
}

pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join("staychat");

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

pub fn save_session(session: &Session) -> Result<()> {
    let session_path = get_session_path()?;
    let file = File::create(session_path)?;
    serde_json::to_writer_pretty(file, session)?;

    info!("Session saved for {}", session.user_id);
    Ok(())
}

pub fn load_session() -> Result<Option<Session>> {
    let session_path = get_session_path()?;

    if !session_path.exists() {
        return Ok(None);
    }

    let session_path_str = session_path.display().to_string();

    let mut file = File::open(session_path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    let session: Session = serde_json::from_str(&contents)?;
    info!("Loaded session for {} from {}", session.user_id, session_path_str);

    Ok(Some(session))
}

pub fn clear_session() -> Result<()> {
    let session_path = get_session_path()?;
    if session_path.exists() {
        fs::remove_file(session_path)?;
    }
    Ok(())
}

static SESSION_PATH_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

/// Point the session file somewhere else, for tests. Takes effect once per
/// process.
pub fn override_session_path(path: PathBuf) -> Result<()> {
    SESSION_PATH_OVERRIDE
        .set(path)
        .map_err(|_| anyhow!("Session path override already set"))
}

fn get_session_path() -> Result<PathBuf> {
    if let Some(path) = SESSION_PATH_OVERRIDE.get() {
        return Ok(path.clone());
    }
    Ok(get_config_dir()?.join("session.json"))
}
