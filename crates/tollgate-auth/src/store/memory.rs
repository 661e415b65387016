//! In-memory user store.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::traits::UserStore;
use crate::error::AuthError;
use crate::user::{User, UserId, normalize_username};

/// Users held in a map keyed by normalised username.
///
/// Suitable for tests and single-node deployments with a fixed user list.
#[derive(Debug, Default)]
pub struct MemoryUserStore {
    users: RwLock<HashMap<String, User>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_users<I: IntoIterator<Item = User>>(users: I) -> Self {
        let store = Self::new();
        for user in users {
            store.upsert(user);
        }
        store
    }

    /// Insert or replace a user (e.g. after a password change).
    pub fn upsert(&self, user: User) {
        self.users.write().insert(user.username.clone(), user);
    }

    pub fn remove(&self, username: &str) -> Option<User> {
        self.users.write().remove(&normalize_username(username))
    }

    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, AuthError> {
        Ok(self.users.read().get(&normalize_username(username)).cloned())
    }

    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, AuthError> {
        Ok(self.users.read().values().find(|u| u.id == id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, AuthError> {
        let email = email.trim();
        Ok(self
            .users
            .read()
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }
}
