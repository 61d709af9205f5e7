//! Persistence seams used by the workers.
//!
//! Production deployments plug a database behind these traits; [`MemoryStore`]
//! backs all three for tests and single-process embedding.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::model::{Aircraft, Chase, Stream, User};
use crate::{Error, Result};

#[async_trait]
pub trait ChaseRepository: Send + Sync {
    /// Newest first.
    async fn list(&self) -> Result<Vec<Chase>>;

    async fn get(&self, id: Uuid) -> Result<Option<Chase>>;

    async fn upsert(&self, chase: Chase) -> Result<Chase>;

    /// Returns `false` when no chase had that id.
    async fn delete(&self, id: Uuid) -> Result<bool>;

    async fn list_live(&self) -> Result<Vec<Chase>>;

    /// `(total, live)` chase counts.
    async fn count(&self) -> Result<(i64, i64)>;

    /// Replace the stream list of a chase. `None` when the chase is gone.
    async fn update_streams(&self, id: Uuid, streams: Vec<Stream>) -> Result<Option<Chase>>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn list(&self) -> Result<Vec<User>>;

    async fn get(&self, id: Uuid) -> Result<Option<User>>;

    async fn upsert(&self, user: User) -> Result<User>;

    async fn delete(&self, id: Uuid) -> Result<bool>;
}

#[async_trait]
pub trait AircraftRepository: Send + Sync {
    /// Most recently seen first.
    async fn list(&self) -> Result<Vec<Aircraft>>;

    async fn get(&self, id: Uuid) -> Result<Option<Aircraft>>;

    async fn upsert(&self, aircraft: Aircraft) -> Result<Aircraft>;

    async fn delete(&self, id: Uuid) -> Result<bool>;

    /// Remove aircraft last seen before `before` and return how many went.
    async fn delete_stale(&self, before: DateTime<Utc>) -> Result<u64>;
}

/// In-memory implementation of every repository.
#[derive(Default)]
pub struct MemoryStore {
    chases: RwLock<HashMap<Uuid, Chase>>,
    users: RwLock<HashMap<Uuid, User>>,
    aircraft: RwLock<HashMap<Uuid, Aircraft>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`Error::Repository`] until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(Error::Repository("store unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChaseRepository for MemoryStore {
    async fn list(&self) -> Result<Vec<Chase>> {
        self.check()?;
        let mut chases: Vec<Chase> = self.chases.read().values().cloned().collect();
        chases.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(chases)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Chase>> {
        self.check()?;
        Ok(self.chases.read().get(&id).cloned())
    }

    async fn upsert(&self, chase: Chase) -> Result<Chase> {
        self.check()?;
        self.chases.write().insert(chase.id, chase.clone());
        Ok(chase)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        self.check()?;
        Ok(self.chases.write().remove(&id).is_some())
    }

    async fn list_live(&self) -> Result<Vec<Chase>> {
        let mut live = ChaseRepository::list(self).await?;
        live.retain(|c| c.live);
        Ok(live)
    }

    async fn count(&self) -> Result<(i64, i64)> {
        self.check()?;
        let chases = self.chases.read();
        let live = chases.values().filter(|c| c.live).count();
        Ok((chases.len() as i64, live as i64))
    }

    async fn update_streams(&self, id: Uuid, streams: Vec<Stream>) -> Result<Option<Chase>> {
        self.check()?;
        let mut chases = self.chases.write();
        Ok(chases.get_mut(&id).map(|chase| {
            chase.streams = streams;
            chase.updated_at = Utc::now();
            chase.clone()
        }))
    }
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn list(&self) -> Result<Vec<User>> {
        self.check()?;
        let mut users: Vec<User> = self.users.read().values().cloned().collect();
        users.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(users)
    }

    async fn get(&self, id: Uuid) -> Result<Option<User>> {
        self.check()?;
        Ok(self.users.read().get(&id).cloned())
    }

    async fn upsert(&self, user: User) -> Result<User> {
        self.check()?;
        self.users.write().insert(user.id, user.clone());
        Ok(user)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        self.check()?;
        Ok(self.users.write().remove(&id).is_some())
    }
}

#[async_trait]
impl AircraftRepository for MemoryStore {
    async fn list(&self) -> Result<Vec<Aircraft>> {
        self.check()?;
        let mut aircraft: Vec<Aircraft> = self.aircraft.read().values().cloned().collect();
        aircraft.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));
        Ok(aircraft)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Aircraft>> {
        self.check()?;
        Ok(self.aircraft.read().get(&id).cloned())
    }

    async fn upsert(&self, aircraft: Aircraft) -> Result<Aircraft> {
        self.check()?;
        self.aircraft.write().insert(aircraft.id, aircraft.clone());
        Ok(aircraft)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        self.check()?;
        Ok(self.aircraft.write().remove(&id).is_some())
    }

    async fn delete_stale(&self, before: DateTime<Utc>) -> Result<u64> {
        self.check()?;
        let mut aircraft = self.aircraft.write();
        let start = aircraft.len();
        aircraft.retain(|_, a| a.last_seen_at >= before);
        Ok((start - aircraft.len()) as u64)
    }
}
