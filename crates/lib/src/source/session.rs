//! Session file (stored bot token) and the interactive credential prompt.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionData {
    bot_token: String,
}

/// `<dir>/<name>.session`, holding the token obtained at interactive login.
#[derive(Debug, Clone)]
pub struct SessionFile {
    path: PathBuf,
}

impl SessionFile {
    pub fn new(dir: &Path, name: &str) -> Self {
        Self {
            path: dir.join(format!("{}.session", name)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored token, if the file exists and parses.
    pub fn load(&self) -> Option<String> {
        let s = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str::<SessionData>(&s) {
            Ok(d) if !d.bot_token.trim().is_empty() => Some(d.bot_token.trim().to_string()),
            Ok(_) => None,
            Err(e) => {
                log::warn!("session file {} is unreadable: {}", self.path.display(), e);
                None
            }
        }
    }

    pub fn save(&self, token: &str) -> std::io::Result<()> {
        if let Some(dir) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let data = SessionData {
            bot_token: token.to_string(),
        };
        let json = serde_json::to_string_pretty(&data).map_err(std::io::Error::other)?;
        std::fs::write(&self.path, json)?;
        restrict_permissions(&self.path)?;
        log::info!("session saved to {}", self.path.display());
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Asks a human for a credential. Only reached on the attended path.
#[async_trait]
pub trait CredentialPrompt: Send + Sync {
    async fn ask_bot_token(&self) -> Result<String, String>;
}

/// Reads the token from the controlling terminal (stdin).
pub struct StdinPrompt;

#[async_trait]
impl CredentialPrompt for StdinPrompt {
    async fn ask_bot_token(&self) -> Result<String, String> {
        tokio::task::spawn_blocking(|| {
            use std::io::{self, BufRead, Write};
            let mut stderr = io::stderr();
            write!(stderr, "Enter bot token (from @BotFather): ").map_err(|e| e.to_string())?;
            stderr.flush().map_err(|e| e.to_string())?;
            let mut line = String::new();
            let n = io::stdin()
                .lock()
                .read_line(&mut line)
                .map_err(|e| e.to_string())?;
            if n == 0 {
                return Err("stdin closed".to_string());
            }
            Ok(line.trim().to_string())
        })
        .await
        .map_err(|e| e.to_string())?
    }
}
