//! Backend credential lifecycle.
//!
//! [`TokenStore`] hands out a valid access token, refreshing it through the
//! identity provider when it is about to expire. At most one refresh is in
//! flight at any time; concurrent callers await the same result.

mod identity;
mod store;

use std::{sync::Arc, time::Duration};

use config::AuthConfig;
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use jiff::{SignedDuration, Timestamp};
use secrecy::{ExposeSecret, SecretString};
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

pub use identity::{IdentityProvider, OidcProvider, RefreshedToken};
pub use store::{ClientRegistration, CredentialStore, SqliteCredentialStore, StoredCredential, StoredToken};

use crate::error::AuthError;

/// What a backend call needs from the credential.
#[derive(Debug, Clone)]
pub struct Credential {
    pub access_token: SecretString,
    pub profile_arn: Option<String>,
    pub expires_at: Timestamp,
}

type RefreshFuture = Shared<BoxFuture<'static, Result<Arc<Credential>, AuthError>>>;

#[derive(Clone)]
pub struct TokenStore {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn CredentialStore>,
    provider: Arc<dyn IdentityProvider>,
    refresh_margin: SignedDuration,
    profile_override: Option<String>,
    cache: RwLock<Option<CachedCredential>>,
    in_flight: Mutex<Option<RefreshFuture>>,
}

struct CachedCredential {
    credential: Arc<Credential>,
    /// Set when the backend rejected the token; it must not be handed out again.
    stale: bool,
}

impl TokenStore {
    /// A token store over the vendor CLI database and the configured identity provider.
    pub fn new(config: &AuthConfig, profile_override: Option<String>) -> Self {
        let store = SqliteCredentialStore::new(config.database_path());
        let provider = OidcProvider::new(
            crate::http_client::identity_client(identity::USER_AGENT),
            config.refresh_url.clone(),
        );

        Self::with_parts(
            Arc::new(store),
            Arc::new(provider),
            config.refresh_margin,
            profile_override,
        )
    }

    pub fn with_parts(
        store: Arc<dyn CredentialStore>,
        provider: Arc<dyn IdentityProvider>,
        refresh_margin: Duration,
        profile_override: Option<String>,
    ) -> Self {
        let refresh_margin = SignedDuration::try_from(refresh_margin).unwrap_or(SignedDuration::MAX);

        Self {
            inner: Arc::new(Inner {
                store,
                provider,
                refresh_margin,
                profile_override,
                cache: RwLock::new(None),
                in_flight: Mutex::new(None),
            }),
        }
    }

    /// Returns a credential that stays valid for at least the refresh margin.
    pub async fn get_valid_credential(&self) -> Result<Arc<Credential>, AuthError> {
        if let Some(credential) = self.inner.usable_cached().await {
            return Ok(credential);
        }

        let refresh = {
            let mut in_flight = self.inner.in_flight.lock().await;

            // A refresh that completed while we waited for the gate.
            if let Some(credential) = self.inner.usable_cached().await {
                return Ok(credential);
            }

            match in_flight.as_ref() {
                Some(refresh) => refresh.clone(),
                None => {
                    let inner = self.inner.clone();
                    let refresh = async move { inner.refresh().await }.boxed().shared();
                    *in_flight = Some(refresh.clone());

                    refresh
                }
            }
        };

        let result = refresh.clone().await;

        let mut in_flight = self.inner.in_flight.lock().await;

        if in_flight.as_ref().is_some_and(|current| current.ptr_eq(&refresh)) {
            *in_flight = None;
        }

        result
    }

    /// The cached credential as it is now, without refreshing.
    pub async fn current_credential_snapshot(&self) -> Option<Arc<Credential>> {
        self.inner
            .cache
            .read()
            .await
            .as_ref()
            .map(|cached| cached.credential.clone())
    }

    /// Marks the cached credential as rejected by the backend. The next call to
    /// [`Self::get_valid_credential`] refreshes it.
    pub async fn invalidate(&self) {
        if let Some(cached) = self.inner.cache.write().await.as_mut() {
            log::debug!("Backend rejected the cached access token, refreshing on next use");
            cached.stale = true;
        }
    }

    /// Keeps the credential fresh in the background until `shutdown` is cancelled.
    pub fn spawn_refresher(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let tokens = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(error) = tokens.get_valid_credential().await {
                            log::warn!("Background credential refresh failed: {error}");
                        }
                    }
                }
            }

            log::debug!("Background credential refresher stopped");
        })
    }
}

impl Inner {
    async fn usable_cached(&self) -> Option<Arc<Credential>> {
        let cache = self.cache.read().await;
        let cached = cache.as_ref()?;

        (!cached.stale && self.is_fresh(cached.credential.expires_at)).then(|| cached.credential.clone())
    }

    fn is_fresh(&self, expires_at: Timestamp) -> bool {
        expires_at.duration_since(Timestamp::now()) > self.refresh_margin
    }

    async fn refresh(&self) -> Result<Arc<Credential>, AuthError> {
        let rejected = self
            .cache
            .read()
            .await
            .as_ref()
            .filter(|cached| cached.stale)
            .map(|cached| cached.credential.access_token.clone());

        let stored = self.store.load().await?;

        let rejected_again = rejected
            .as_ref()
            .is_some_and(|rejected| rejected.expose_secret() == stored.token.access_token.expose_secret());

        // Another process may already have rotated the token.
        if !rejected_again && self.is_fresh(stored.token.expires_at) {
            log::debug!("Using stored access token valid until {}", stored.token.expires_at);

            let profile_arn = stored.profile_arn.clone();
            return Ok(self.cache_credential(stored.token, profile_arn).await);
        }

        let now = Timestamp::now();

        if let Some(expires_at) = stored.registration.client_secret_expires_at
            && expires_at <= now
        {
            return Err(AuthError::RegistrationExpired(expires_at));
        }

        log::info!("Refreshing backend access token");

        let refreshed = self
            .provider
            .refresh(&stored.registration, &stored.token.refresh_token)
            .await
            .inspect_err(|error| log::warn!("Access token refresh failed: {error}"))?;

        let expires_at = now
            .checked_add(SignedDuration::from_secs(refreshed.expires_in))
            .map_err(|error| AuthError::Rejected(format!("invalid token lifetime: {error}")))?;

        let token = StoredToken {
            access_token: refreshed.access_token,
            refresh_token: refreshed.refresh_token.unwrap_or(stored.token.refresh_token),
            expires_at,
        };

        self.store.save_token(&token).await?;

        log::info!("Backend access token refreshed, valid until {expires_at}");

        let profile_arn = refreshed.profile_arn.or(stored.profile_arn);
        Ok(self.cache_credential(token, profile_arn).await)
    }

    async fn cache_credential(&self, token: StoredToken, profile_arn: Option<String>) -> Arc<Credential> {
        let credential = Arc::new(Credential {
            access_token: token.access_token,
            profile_arn: self.profile_override.clone().or(profile_arn),
            expires_at: token.expires_at,
        });

        *self.cache.write().await = Some(CachedCredential {
            credential: credential.clone(),
            stale: false,
        });

        credential
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    pub(crate) use super::{
        identity::scripted::{ScriptedProvider, token as refreshed},
        store::memory::MemoryCredentialStore,
    };
}
