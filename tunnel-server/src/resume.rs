//! Authentication and the resume/takeover decision tree
//! (`spec.md` §4.4 "Authentication", "Identity resolution", "Atomic
//! takeover").

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use tunnel_protocol::subdomain::{random_subdomain, validate_subdomain};
use tunnel_protocol::{ErrorKind, Protocol, TunnelIdentity};

use crate::auth::{classify_token, TokenClass};
use crate::session::TunnelSession;
use crate::state::AppState;

pub struct AuthResult {
    pub user_id: String,
    pub per_minute: u32,
    pub per_day: u32,
}

/// Classifies and validates the `init` token per `spec.md` §4.4: a
/// `ur_`-prefixed token is an API key, anything else a bearer credential.
pub async fn authenticate(state: &AppState, token: &str) -> Result<AuthResult, ErrorKind> {
    if token.is_empty() {
        return Err(ErrorKind::AuthRequired);
    }
    match classify_token(token) {
        TokenClass::ApiKey(_) => {
            let quota = state.api_keys.validate(token).await?;
            Ok(AuthResult {
                user_id: quota.user_id,
                per_minute: quota.per_minute,
                per_day: quota.per_day,
            })
        }
        TokenClass::Bearer(_) => {
            let user_id = state.jwt.validate(token).await?;
            Ok(AuthResult {
                user_id,
                per_minute: 0,
                per_day: 0,
            })
        }
    }
}

/// The `init` fields relevant to identity resolution.
pub struct InitFields {
    pub protocol: Protocol,
    pub local_url: String,
    pub host: Option<String>,
    pub subdomain: Option<String>,
    pub tunnel_id: Option<String>,
    pub force_new: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    New,
    Resumed,
}

/// The four-way identity-resolution decision tree of `spec.md` §4.4.
pub async fn resolve_identity(
    state: &AppState,
    fields: &InitFields,
    user_id: &str,
) -> Result<(TunnelIdentity, Outcome), ErrorKind> {
    if fields.force_new {
        return allocate_new(state, fields, user_id).await;
    }

    if fields.subdomain.is_none() && fields.tunnel_id.is_none() && fields.host.is_none() {
        return auto_find(state, fields, user_id).await;
    }

    requested_resume(state, fields, user_id).await
}

async fn auto_find(
    state: &AppState,
    fields: &InitFields,
    user_id: &str,
) -> Result<(TunnelIdentity, Outcome), ErrorKind> {
    let mut candidates = state
        .registry
        .list_by_user_and_protocol(user_id, fields.protocol)
        .await;

    // Preserve order {unconnected-matching-localURL, unconnected-first}
    // on top of the registry's own active-first/most-recent ordering.
    candidates.sort_by_key(|t| {
        let connected = state.sessions.contains_key(&t.subdomain);
        let matches_local = t.local_url == fields.local_url;
        match (connected, matches_local) {
            (false, true) => 0,
            (false, false) => 1,
            (true, _) => 2,
        }
    });

    if let Some(identity) = candidates
        .into_iter()
        .find(|t| !state.sessions.contains_key(&t.subdomain))
    {
        return Ok((identity, Outcome::Resumed));
    }

    // All of the user's tunnels for this protocol are currently
    // connected: fall through to a fresh identity.
    allocate_new(state, fields, user_id).await
}

async fn requested_resume(
    state: &AppState,
    fields: &InitFields,
    user_id: &str,
) -> Result<(TunnelIdentity, Outcome), ErrorKind> {
    let mut existing = None;
    if let Some(host) = &fields.host {
        existing = state.registry.get_by_custom_domain(host).await;
    }
    if existing.is_none() {
        if let Some(subdomain) = &fields.subdomain {
            existing = state.registry.get_by_subdomain(subdomain).await;
        }
    }
    if existing.is_none() {
        if let Some(tunnel_id) = &fields.tunnel_id {
            if let Ok(id) = Uuid::parse_str(tunnel_id) {
                existing = state.registry.get_by_id(id).await;
            }
        }
    }

    match existing {
        Some(identity) => {
            if let Some(session) = state.sessions.get(&identity.subdomain) {
                if session.is_alive() {
                    return Err(ErrorKind::TunnelAlreadyActive);
                }
            }
            if identity.owner_user_id != user_id {
                return Err(ErrorKind::Validation);
            }
            if identity.protocol != fields.protocol {
                return Err(ErrorKind::ProtocolMismatch);
            }
            Ok((identity, Outcome::Resumed))
        }
        None => allocate_new(state, fields, user_id).await,
    }
}

async fn allocate_new(
    state: &AppState,
    fields: &InitFields,
    user_id: &str,
) -> Result<(TunnelIdentity, Outcome), ErrorKind> {
    let subdomain = match &fields.subdomain {
        Some(requested) => {
            validate_subdomain(requested).map_err(|_| ErrorKind::Validation)?;
            if state.registry.get_by_subdomain(requested).await.is_some() {
                return Err(ErrorKind::SubdomainUnavailable);
            }
            requested.clone()
        }
        None => loop {
            let candidate = random_subdomain();
            if state.registry.get_by_subdomain(&candidate).await.is_none() {
                break candidate;
            }
        },
    };

    let now = crate::registry::now();
    let identity = TunnelIdentity::new(
        subdomain,
        fields.protocol,
        fields.local_url.clone(),
        user_id.to_string(),
        fields.host.clone(),
        now,
    );
    // Open question (b): the upsert must agree with the id we just
    // generated — the session's identity is treated as immutable post-init.
    let resolved_id = state.registry.upsert_by_subdomain(identity.clone()).await;
    debug_assert_eq!(resolved_id, identity.id);
    Ok((identity, Outcome::New))
}

/// Atomically swaps `new_session` into the registry under its subdomain,
/// returning whether a live session was replaced. Any previous session is
/// marked dead and scheduled for a delayed close so its reader task
/// observes the nulled handle and exits silently (`spec.md` §4.4 "Atomic
/// takeover").
pub fn register_session(state: &AppState, new_session: Arc<TunnelSession>) -> bool {
    let subdomain = new_session.subdomain.clone();
    let previous = state.sessions.insert(subdomain.clone(), new_session);
    match previous {
        Some(old) if old.is_alive() => {
            info!(subdomain, old_tunnel_id = %old.id, "takeover: superseding live session");
            crate::session::schedule_close_after_takeover(old);
            true
        }
        _ => false,
    }
}
