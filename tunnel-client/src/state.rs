//! The client auto-resume file (`spec.md` §4.3 "Init", §6 "CLI-visible
//! surface").
//!
//! A single user-scoped JSON document written atomically with `0600`
//! permissions, loaded on startup and offered back to the server for
//! auto-resume — but only when the stored `server_url` and `protocol`
//! match the current invocation, per `spec.md` §4.3.

use std::io::Write as _;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeState {
    pub tunnel_id: String,
    pub subdomain: String,
    pub public_url: String,
    pub local_url: String,
    pub server_url: String,
    pub protocol: String,
    #[serde(default)]
    pub host: Option<String>,
    pub created_at: i64,
    pub last_used: i64,
}

fn state_file_path() -> Option<PathBuf> {
    let mut dir = dirs::config_dir()?;
    dir.push("tunnel-client");
    Some(dir.join("resume.json"))
}

/// The path the resume file is read from/written to, exposed so callers
/// (and tests) can inspect the file directly without duplicating
/// `dirs::config_dir()` resolution.
pub fn resume_file_path() -> Option<PathBuf> {
    state_file_path()
}

/// Loads the saved identity, returning `None` if no file exists, it is
/// corrupt, or `server_url`/`protocol` no longer match the current
/// invocation (`spec.md` §4.3: "offered back to the server only if the
/// stored serverURL and protocol match the current invocation").
pub fn load(server_url: &str, protocol: &str) -> Option<ResumeState> {
    let path = state_file_path()?;
    let bytes = std::fs::read(&path).ok()?;
    let state: ResumeState = match serde_json::from_slice(&bytes) {
        Ok(s) => s,
        Err(e) => {
            warn!("resume state file is corrupt, ignoring: {e}");
            return None;
        }
    };
    if state.server_url != server_url || state.protocol != protocol {
        return None;
    }
    Some(state)
}

/// Persists the current identity atomically (write to a temp file in the
/// same directory, then rename) with `0600` permissions.
pub fn save(state: &ResumeState) -> std::io::Result<()> {
    let Some(path) = state_file_path() else {
        return Ok(());
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec_pretty(state)?;

    let tmp_path = path.with_extension("json.tmp");
    {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    set_owner_only_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

#[cfg(unix)]
fn set_owner_only_permissions(path: &std::path::Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_path: &std::path::Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_state_round_trips_through_json() {
        let state = ResumeState {
            tunnel_id: "t1".into(),
            subdomain: "foo".into(),
            public_url: "http://foo.example.test".into(),
            local_url: "http://127.0.0.1:9000".into(),
            server_url: "ws://relay.example.test:7070".into(),
            protocol: "http".into(),
            host: None,
            created_at: 100,
            last_used: 200,
        };
        let json = serde_json::to_string(&state).unwrap();
        let back: ResumeState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tunnel_id, state.tunnel_id);
        assert_eq!(back.subdomain, state.subdomain);
    }
}
