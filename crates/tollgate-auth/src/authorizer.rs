//! The authorization use-case run for every client handshake.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::AuthError;
use crate::restriction::RestrictionService;
use crate::service::AuthService;
use crate::store::UserStore;
use crate::traits::AuthBackend;
use crate::user::{AuthorizedUser, Credentials};

/// Resolves the user, verifies the password, then consults the restriction list.
///
/// The restriction check runs after verification so a wrong password never
/// reveals whether an account is restricted.
pub struct Authorizer {
    users: Arc<dyn UserStore>,
    auth: AuthService,
    restrictions: RestrictionService,
}

impl Authorizer {
    pub fn new(
        users: Arc<dyn UserStore>,
        auth: AuthService,
        restrictions: RestrictionService,
    ) -> Self {
        Self {
            users,
            auth,
            restrictions,
        }
    }

    pub fn auth_service(&self) -> &AuthService {
        &self.auth
    }

    pub fn restrictions(&self) -> &RestrictionService {
        &self.restrictions
    }
}

#[async_trait]
impl AuthBackend for Authorizer {
    async fn authorize(&self, credentials: &Credentials) -> Result<AuthorizedUser, AuthError> {
        let Credentials::Basic(basic) = credentials;

        let user = self
            .users
            .find_by_username(&basic.username)
            .await?
            .ok_or(AuthError::Invalid)?;

        let valid = match self.auth.authorize_basic(&user, basic).await {
            Ok(valid) => valid,
            Err(AuthError::Hasher(e)) => {
                debug!(username = %user.username, error = %e, "treating hasher failure as invalid credential");
                false
            }
            Err(e) => return Err(e),
        };
        if !valid {
            return Err(AuthError::Invalid);
        }

        if self.restrictions.is_restricted(&user.username).await {
            return Err(AuthError::Restricted);
        }

        Ok(AuthorizedUser {
            user_id: user.id,
            username: user.username,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use tollgate_cache::MemoryCache;

    use crate::hasher::PasswordHasher;
    use crate::service::tests::CountingHasher;
    use crate::store::MemoryUserStore;
    use crate::user::{BasicCredentials, User, UserId};

    fn authorizer() -> (Authorizer, Arc<CountingHasher>) {
        let hasher = Arc::new(CountingHasher::default());
        let users = MemoryUserStore::from_users([
            User::new(7, "user", "user@example.com", hasher.hash("pass").unwrap()),
            User::new(8, "foo", "foo@example.com", hasher.hash("secret").unwrap()),
            User::new(9, "broken", "broken@example.com", "corrupt"),
        ]);
        let auth = AuthService::new(
            hasher.clone(),
            Arc::new(MemoryCache::<crate::AuthVerdicts>::new(None)),
            Duration::from_secs(60),
        );
        let restrictions = RestrictionService::new(Arc::new(MemoryCache::<bool>::new(None)));
        (
            Authorizer::new(Arc::new(users), auth, restrictions),
            hasher,
        )
    }

    fn basic(user: &str, pass: &str) -> Credentials {
        Credentials::Basic(BasicCredentials::new(user, pass))
    }

    #[tokio::test]
    async fn valid_credentials_yield_identity() {
        let (authorizer, _) = authorizer();
        let identity = authorizer.authorize(&basic("user", "pass")).await.unwrap();
        assert_eq!(identity.user_id, UserId(7));
        assert_eq!(identity.username, "user");
    }

    #[tokio::test]
    async fn wrong_password_is_invalid_and_cached() {
        let (authorizer, hasher) = authorizer();
        for _ in 0..2 {
            assert!(matches!(
                authorizer.authorize(&basic("foo", "bar")).await,
                Err(AuthError::Invalid)
            ));
        }
        assert_eq!(hasher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_user_is_invalid_without_hashing() {
        let (authorizer, hasher) = authorizer();
        assert!(matches!(
            authorizer.authorize(&basic("ghost", "x")).await,
            Err(AuthError::Invalid)
        ));
        assert_eq!(hasher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn restricted_user_is_refused() {
        let (authorizer, _) = authorizer();
        authorizer
            .restrictions()
            .add_to_restriction_list("user", None)
            .await
            .unwrap();
        assert!(matches!(
            authorizer.authorize(&basic("user", "pass")).await,
            Err(AuthError::Restricted)
        ));
    }

    #[tokio::test]
    async fn wrong_password_of_restricted_user_stays_invalid() {
        let (authorizer, _) = authorizer();
        authorizer
            .restrictions()
            .add_to_restriction_list("user", None)
            .await
            .unwrap();
        assert!(matches!(
            authorizer.authorize(&basic("user", "nope")).await,
            Err(AuthError::Invalid)
        ));
    }

    #[tokio::test]
    async fn hasher_failure_reads_as_invalid() {
        let (authorizer, _) = authorizer();
        assert!(matches!(
            authorizer.authorize(&basic("broken", "x")).await,
            Err(AuthError::Invalid)
        ));
    }
}
