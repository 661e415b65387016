//! Administrative restriction list.

use std::sync::Arc;
use std::time::Duration;

use tollgate_cache::Cache;

use crate::error::AuthError;
use crate::user::normalize_username;

/// TTL used to lift a restriction; the key disappears right after.
const LIFT_TTL: Duration = Duration::from_millis(1);

/// Cache key of a restricted username.
#[inline]
pub fn restriction_key(username: &str) -> String {
    format!("restricted:{}", normalize_username(username))
}

/// Answers whether a user is barred from proxying.
///
/// A user is restricted iff its key exists. Backed by a shared cache so the
/// controller's writes are visible to every proxy process.
#[derive(Clone)]
pub struct RestrictionService {
    cache: Arc<dyn Cache<bool>>,
}

impl RestrictionService {
    pub fn new(cache: Arc<dyn Cache<bool>>) -> Self {
        Self { cache }
    }

    pub async fn is_restricted(&self, username: &str) -> bool {
        self.cache.get(&restriction_key(username)).await.is_some()
    }

    /// Restrict `username`, forever when `ttl` is `None`.
    pub async fn add_to_restriction_list(
        &self,
        username: &str,
        ttl: Option<Duration>,
    ) -> Result<(), AuthError> {
        let key = restriction_key(username);
        match ttl {
            Some(ttl) => self.cache.set_with_ttl(&key, true, ttl).await?,
            None => self.cache.set(&key, true).await?,
        }
        Ok(())
    }

    pub async fn remove_from_restriction_list(&self, username: &str) -> Result<(), AuthError> {
        self.cache
            .expire(&restriction_key(username), LIFT_TTL)
            .await?;
        Ok(())
    }
}
