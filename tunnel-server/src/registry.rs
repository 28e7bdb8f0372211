//! The durable tunnel registry, modeled as a trait (`spec.md` §1, §6).
//!
//! The real registry — a relational store behind this interface — is an
//! external collaborator and explicitly out of scope. This module defines
//! the contract the core consumes and ships one concrete adapter,
//! [`InMemoryTunnelRepository`], built on the same `DashMap` the teacher's
//! `AppState` already uses, so the binary is runnable standalone. A
//! production deployment is expected to supply its own implementation
//! (backed by Postgres/SQLite/etc.) of [`TunnelRepository`].

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use tunnel_protocol::{Protocol, TunnelIdentity, TunnelStatus};

#[async_trait]
pub trait TunnelRepository: Send + Sync {
    /// Creates the identity if the subdomain is unknown, otherwise returns
    /// the existing one untouched. Returns the resolved tunnel id.
    async fn upsert_by_subdomain(&self, identity: TunnelIdentity) -> Uuid;

    async fn get_by_id(&self, id: Uuid) -> Option<TunnelIdentity>;
    async fn get_by_subdomain(&self, subdomain: &str) -> Option<TunnelIdentity>;
    async fn get_by_custom_domain(&self, domain: &str) -> Option<TunnelIdentity>;

    /// Ordered `{unconnected-matching-localURL, unconnected-first}` is the
    /// caller's responsibility (the resume-decision code in
    /// `crate::resume`); this just returns "active first, then most
    /// recent" per `spec.md` §6's registry contract.
    async fn list_by_user_and_protocol(
        &self,
        user_id: &str,
        protocol: Protocol,
    ) -> Vec<TunnelIdentity>;

    async fn list_all(&self) -> Vec<TunnelIdentity>;

    async fn update_local_url(&self, id: Uuid, local_url: String);
    async fn update_status(&self, id: Uuid, status: TunnelStatus);
    /// Touches `last_active_at` and, unless `count` is zero, increments
    /// the request counter. Per §9 open question (a): a ping does *not*
    /// advance the aggregate request counter — callers pass `count: 0`
    /// for heartbeat-driven activity touches.
    async fn update_activity(&self, id: Uuid, count: u64);
    async fn associate_with_user(&self, id: Uuid, user_id: String);
    async fn set_public_port(&self, id: Uuid, port: Option<u16>);
}

struct Record {
    identity: TunnelIdentity,
    request_count: AtomicI64,
}

/// In-memory `TunnelRepository`, keyed by subdomain and by id.
pub struct InMemoryTunnelRepository {
    by_subdomain: DashMap<String, Uuid>,
    by_custom_domain: DashMap<String, Uuid>,
    by_id: DashMap<Uuid, Record>,
}

impl InMemoryTunnelRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            by_subdomain: DashMap::new(),
            by_custom_domain: DashMap::new(),
            by_id: DashMap::new(),
        })
    }
}

impl Default for InMemoryTunnelRepository {
    fn default() -> Self {
        Self {
            by_subdomain: DashMap::new(),
            by_custom_domain: DashMap::new(),
            by_id: DashMap::new(),
        }
    }
}

#[async_trait]
impl TunnelRepository for InMemoryTunnelRepository {
    async fn upsert_by_subdomain(&self, identity: TunnelIdentity) -> Uuid {
        if let Some(existing_id) = self.by_subdomain.get(&identity.subdomain).map(|r| *r) {
            return existing_id;
        }
        let id = identity.id;
        self.by_subdomain.insert(identity.subdomain.clone(), id);
        if let Some(domain) = identity.custom_domain.clone() {
            self.by_custom_domain.insert(domain, id);
        }
        self.by_id.insert(
            id,
            Record {
                identity,
                request_count: AtomicI64::new(0),
            },
        );
        id
    }

    async fn get_by_id(&self, id: Uuid) -> Option<TunnelIdentity> {
        self.by_id.get(&id).map(|r| r.identity.clone())
    }

    async fn get_by_subdomain(&self, subdomain: &str) -> Option<TunnelIdentity> {
        let id = *self.by_subdomain.get(subdomain)?;
        self.get_by_id(id).await
    }

    async fn get_by_custom_domain(&self, domain: &str) -> Option<TunnelIdentity> {
        let id = *self.by_custom_domain.get(domain)?;
        self.get_by_id(id).await
    }

    async fn list_by_user_and_protocol(
        &self,
        user_id: &str,
        protocol: Protocol,
    ) -> Vec<TunnelIdentity> {
        let mut out: Vec<TunnelIdentity> = self
            .by_id
            .iter()
            .map(|r| r.identity.clone())
            .filter(|t| t.owner_user_id == user_id && t.protocol == protocol)
            .collect();
        out.sort_by(|a, b| {
            let active_rank = |s: TunnelStatus| matches!(s, TunnelStatus::Active) as u8;
            active_rank(b.status)
                .cmp(&active_rank(a.status))
                .then(b.last_active_at.cmp(&a.last_active_at))
        });
        out
    }

    async fn list_all(&self) -> Vec<TunnelIdentity> {
        self.by_id.iter().map(|r| r.identity.clone()).collect()
    }

    async fn update_local_url(&self, id: Uuid, local_url: String) {
        if let Some(mut r) = self.by_id.get_mut(&id) {
            r.identity.local_url = local_url;
        }
    }

    async fn update_status(&self, id: Uuid, status: TunnelStatus) {
        if let Some(mut r) = self.by_id.get_mut(&id) {
            r.identity.status = status;
        }
    }

    async fn update_activity(&self, id: Uuid, count: u64) {
        if let Some(r) = self.by_id.get(&id) {
            if count > 0 {
                r.request_count.fetch_add(count as i64, Ordering::Relaxed);
            }
        }
        if let Some(mut r) = self.by_id.get_mut(&id) {
            r.identity.last_active_at = now();
        }
    }

    async fn associate_with_user(&self, id: Uuid, user_id: String) {
        if let Some(mut r) = self.by_id.get_mut(&id) {
            r.identity.owner_user_id = user_id;
        }
    }

    async fn set_public_port(&self, id: Uuid, port: Option<u16>) {
        if let Some(mut r) = self.by_id.get_mut(&id) {
            r.identity.public_port = port;
        }
    }
}

pub fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_is_idempotent_by_subdomain() {
        let repo = InMemoryTunnelRepository::new();
        let a = TunnelIdentity::new(
            "foo".into(),
            Protocol::Http,
            "http://127.0.0.1:9000".into(),
            "user-1".into(),
            None,
            now(),
        );
        let first_id = a.id;
        let id1 = repo.upsert_by_subdomain(a).await;
        assert_eq!(id1, first_id);

        let b = TunnelIdentity::new(
            "foo".into(),
            Protocol::Http,
            "http://127.0.0.1:9999".into(),
            "user-1".into(),
            None,
            now(),
        );
        let id2 = repo.upsert_by_subdomain(b).await;
        assert_eq!(id2, first_id, "second upsert must return the existing id");
    }

    #[tokio::test]
    async fn list_by_user_orders_active_first_then_recent() {
        let repo = InMemoryTunnelRepository::new();
        let mut older = TunnelIdentity::new(
            "a".into(),
            Protocol::Http,
            "http://x".into(),
            "u".into(),
            None,
            100,
        );
        older.status = TunnelStatus::Inactive;
        let newer = TunnelIdentity::new(
            "b".into(),
            Protocol::Http,
            "http://y".into(),
            "u".into(),
            None,
            200,
        );
        repo.upsert_by_subdomain(older).await;
        repo.upsert_by_subdomain(newer).await;

        let list = repo.list_by_user_and_protocol("u", Protocol::Http).await;
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].subdomain, "b", "active tunnel must sort first");
    }
}
