use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::model::{User, UserId};

pub const ADMIN_ROLE: &str = "admin";

/// User lookups the engine needs for `creator`/`closed_by` checks.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn get_user(&self, id: UserId) -> Option<User>;
    async fn get_user_roles(&self, id: UserId) -> Option<Vec<String>>;

    async fn is_admin(&self, id: UserId) -> bool {
        self.get_user_roles(id)
            .await
            .is_some_and(|roles| roles.iter().any(|r| r == ADMIN_ROLE))
    }
}

/// Identity provider backed by a map, optionally seeded from a JSON file.
#[derive(Default)]
pub struct InMemoryDirectory {
    users: DashMap<UserId, User>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON array of users: `[{"id": "...", "name": "...", "roles": ["admin"]}]`.
    pub fn from_json_file(path: &Path) -> std::io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let users: Vec<User> = serde_json::from_str(&raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let dir = Self::new();
        for user in users {
            dir.insert(user);
        }
        Ok(dir)
    }

    pub fn insert(&self, user: User) {
        self.users.insert(user.id, user);
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl IdentityProvider for InMemoryDirectory {
    async fn get_user(&self, id: UserId) -> Option<User> {
        self.users.get(&id).map(|u| u.value().clone())
    }

    async fn get_user_roles(&self, id: UserId) -> Option<Vec<String>> {
        self.users.get(&id).map(|u| u.roles.clone())
    }
}
