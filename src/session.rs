// =============================================================================
// Session Manager — OAuth and token lifecycle per user-broker
// =============================================================================
//
// OAuth state is DB-persisted so callbacks survive restarts, and states are
// consumed atomically (usable at most once). Token refresh is cooperative and
// single-threaded per user-broker: one loop per pairing, scheduled for
// `expires_at - refresh_window`, rescheduling after 30 s on failure. Token
// refreshes fan out to adapters through `set_access_token` and to any other
// subscriber via the token event channel.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::{AdapterRegistry, BrokerCredentials, BrokerError, BrokerResult};
use crate::models::{OAuthState, SessionRow};
use crate::store::Store;
use crate::types::{now_ms, UserBrokerState};

/// OAuth states live for 15 minutes.
const OAUTH_STATE_TTL_MS: i64 = 15 * 60 * 1000;

/// Sessions expiring within this horizon count as unusable at startup.
const STARTUP_EXPIRY_HORIZON_MS: i64 = 60 * 1000;

/// Published when a user-broker's token refreshes, so cached tokens update
/// without a reconnect.
#[derive(Debug, Clone)]
pub struct TokenRefreshed {
    pub user_broker_id: String,
    pub access_token: String,
    pub expires_at: i64,
}

/// Emitted when the operator must complete a browser login.
#[derive(Debug, Clone)]
pub struct LoginRequired {
    pub user_broker_id: String,
    pub broker_id: String,
}

pub struct SessionManager {
    store: Arc<Store>,
    registry: Arc<AdapterRegistry>,
    refresh_window: Duration,
    refresh_retry: Duration,
    token_events: broadcast::Sender<TokenRefreshed>,
    login_requests: broadcast::Sender<LoginRequired>,
}

impl SessionManager {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<AdapterRegistry>,
        refresh_window: Duration,
        refresh_retry: Duration,
    ) -> Arc<Self> {
        let (token_events, _) = broadcast::channel(64);
        let (login_requests, _) = broadcast::channel(64);
        Arc::new(Self {
            store,
            registry,
            refresh_window,
            refresh_retry,
            token_events,
            login_requests,
        })
    }

    pub fn subscribe_token_events(&self) -> broadcast::Receiver<TokenRefreshed> {
        self.token_events.subscribe()
    }

    pub fn subscribe_login_requests(&self) -> broadcast::Receiver<LoginRequired> {
        self.login_requests.subscribe()
    }

    // -------------------------------------------------------------------------
    // Startup
    // -------------------------------------------------------------------------

    /// Load the active session for one user-broker. With no session (or one
    /// expiring within 60 s) the pairing is marked LOGIN_REQUIRED and a
    /// browser-open request is emitted; otherwise the token is pushed to the
    /// adapter and the refresh loop is spawned.
    pub async fn start(self: &Arc<Self>, user_broker_id: &str) -> Result<()> {
        let user_broker = self
            .store
            .get_user_broker(user_broker_id)?
            .with_context(|| format!("unknown user broker {user_broker_id}"))?;

        let session = self.store.latest_session(user_broker_id)?;
        let usable = session
            .as_ref()
            .map(|s| s.expires_at - now_ms() > STARTUP_EXPIRY_HORIZON_MS)
            .unwrap_or(false);

        if !usable {
            warn!(user_broker_id, "no usable session — login required");
            self.mark_login_required(user_broker_id, &user_broker.broker_id)?;
            return Ok(());
        }

        let session = session.expect("checked above");
        if let Some(adapter) = self.registry.get(user_broker_id) {
            adapter.set_access_token(&session.access_token);
        }
        self.store
            .set_user_broker_state(user_broker_id, UserBrokerState::Connected)?;
        info!(
            user_broker_id,
            expires_at = session.expires_at,
            "session restored"
        );

        self.spawn_refresh_loop(user_broker_id.to_string());
        Ok(())
    }

    fn mark_login_required(&self, user_broker_id: &str, broker_id: &str) -> Result<()> {
        self.store
            .set_user_broker_state(user_broker_id, UserBrokerState::LoginRequired)?;
        let _ = self.login_requests.send(LoginRequired {
            user_broker_id: user_broker_id.to_string(),
            broker_id: broker_id.to_string(),
        });
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Token access
    // -------------------------------------------------------------------------

    /// The current access token. Fails with TOKEN_EXPIRED rather than ever
    /// returning a stale token.
    pub fn get_token(&self, user_broker_id: &str) -> BrokerResult<String> {
        let session = self
            .store
            .latest_session(user_broker_id)
            .map_err(|e| BrokerError::Connection(e.to_string()))?
            .ok_or_else(|| {
                BrokerError::NotAuthenticated(format!("no session for {user_broker_id}"))
            })?;
        if session.expires_at <= now_ms() {
            return Err(BrokerError::TokenExpired(format!(
                "session for {user_broker_id} expired at {}",
                session.expires_at
            )));
        }
        Ok(session.access_token)
    }

    // -------------------------------------------------------------------------
    // OAuth flow
    // -------------------------------------------------------------------------

    /// Create and persist a fresh single-use state token for the login
    /// redirect.
    pub fn begin_oauth(&self, user_broker_id: &str, broker_id: &str) -> Result<OAuthState> {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();
        let now = now_ms();
        let state = OAuthState {
            state: token,
            user_broker_id: user_broker_id.to_string(),
            broker_id: broker_id.to_string(),
            created_at: now,
            expires_at: now + OAUTH_STATE_TTL_MS,
            used_at: None,
            deleted_at: None,
        };
        self.store.insert_oauth_state(&state)?;
        info!(user_broker_id, "oauth state issued");
        Ok(state)
    }

    /// Handle the OAuth callback: consume the state atomically, exchange the
    /// code for tokens, persist the session, and fan the token out.
    pub async fn complete_oauth(
        self: &Arc<Self>,
        state_token: &str,
        auth_code: &str,
    ) -> Result<()> {
        let state = self
            .store
            .consume_oauth_state(state_token, now_ms())?
            .context("oauth state is unknown, used or expired")?;

        let adapter = self
            .registry
            .get(&state.user_broker_id)
            .with_context(|| format!("no adapter for {}", state.user_broker_id))?;

        let credentials = BrokerCredentials {
            auth_code: auth_code.to_string(),
            ..Default::default()
        };
        let token = adapter
            .connect(&credentials)
            .await
            .map_err(|e| anyhow::anyhow!("broker connect failed: {e}"))?;

        self.install_session(&state.user_broker_id, token.access_token, token.refresh_token, token.expires_at)?;
        self.spawn_refresh_loop(state.user_broker_id.clone());
        Ok(())
    }

    fn install_session(
        &self,
        user_broker_id: &str,
        access_token: String,
        refresh_token: Option<String>,
        expires_at: i64,
    ) -> Result<()> {
        let now = now_ms();
        self.store.insert_session(&SessionRow {
            id: Uuid::new_v4().to_string(),
            user_broker_id: user_broker_id.to_string(),
            access_token: access_token.clone(),
            refresh_token,
            expires_at,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            version: 1,
        })?;
        self.store
            .set_user_broker_state(user_broker_id, UserBrokerState::Connected)?;

        if let Some(adapter) = self.registry.get(user_broker_id) {
            adapter.set_access_token(&access_token);
        }
        let _ = self.token_events.send(TokenRefreshed {
            user_broker_id: user_broker_id.to_string(),
            access_token,
            expires_at,
        });
        info!(user_broker_id, expires_at, "session installed");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Refresh loop
    // -------------------------------------------------------------------------

    fn spawn_refresh_loop(self: &Arc<Self>, user_broker_id: String) {
        let manager = self.clone();
        tokio::spawn(async move {
            manager.refresh_loop(user_broker_id).await;
        });
    }

    async fn refresh_loop(self: Arc<Self>, user_broker_id: String) {
        loop {
            let session = match self.store.latest_session(&user_broker_id) {
                Ok(Some(session)) => session,
                Ok(None) => {
                    warn!(user_broker_id, "refresh loop found no session — stopping");
                    return;
                }
                Err(e) => {
                    warn!(user_broker_id, error = %e, "refresh loop store error");
                    tokio::time::sleep(self.refresh_retry).await;
                    continue;
                }
            };

            let refresh_at = session.expires_at - self.refresh_window.as_millis() as i64;
            let wait_ms = (refresh_at - now_ms()).max(0);
            tokio::time::sleep(Duration::from_millis(wait_ms as u64)).await;

            match self.refresh_once(&user_broker_id, &session).await {
                Ok(true) => {
                    info!(user_broker_id, "token refreshed");
                }
                Ok(false) => {
                    // No refresh token; the operator must log in again.
                    return;
                }
                Err(e) => {
                    warn!(user_broker_id, error = %e, "token refresh failed — retrying");
                    tokio::time::sleep(self.refresh_retry).await;
                }
            }
        }
    }

    /// One refresh attempt. `Ok(false)` means refresh is impossible (no
    /// refresh token) and LOGIN_REQUIRED has been raised.
    async fn refresh_once(&self, user_broker_id: &str, session: &SessionRow) -> Result<bool> {
        let Some(refresh_token) = session.refresh_token.clone() else {
            let broker_id = self
                .store
                .get_user_broker(user_broker_id)?
                .map(|ub| ub.broker_id)
                .unwrap_or_default();
            self.mark_login_required(user_broker_id, &broker_id)?;
            return Ok(false);
        };

        let adapter = self
            .registry
            .get(user_broker_id)
            .with_context(|| format!("no adapter for {user_broker_id}"))?;

        let credentials = BrokerCredentials {
            auth_code: refresh_token,
            ..Default::default()
        };
        let token = adapter
            .connect(&credentials)
            .await
            .map_err(|e| anyhow::anyhow!("refresh connect failed: {e}"))?;

        self.store.update_session_tokens(
            &session.id,
            &token.access_token,
            token.refresh_token.as_deref(),
            token.expires_at,
        )?;
        if let Some(adapter) = self.registry.get(user_broker_id) {
            adapter.set_access_token(&token.access_token);
        }
        let _ = self.token_events.send(TokenRefreshed {
            user_broker_id: user_broker_id.to_string(),
            access_token: token.access_token,
            expires_at: token.expires_at,
        });
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// Scheduled every 10 minutes: soft-delete expired unused states.
    pub fn sweep_oauth_states(&self) -> Result<usize> {
        let swept = self.store.sweep_expired_oauth_states(now_ms())?;
        if swept > 0 {
            info!(swept, "expired oauth states swept");
        }
        Ok(swept)
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("refresh_window", &self.refresh_window)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::mock::MockBroker;
    use crate::models::UserBroker;
    use crate::types::{ProductType, UserBrokerRole};

    fn setup() -> (Arc<Store>, Arc<AdapterRegistry>, Arc<SessionManager>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let registry = Arc::new(AdapterRegistry::new());
        let manager = SessionManager::new(
            store.clone(),
            registry.clone(),
            Duration::from_secs(300),
            Duration::from_secs(30),
        );
        (store, registry, manager)
    }

    fn seed_user_broker(store: &Store, id: &str) {
        store
            .upsert_user_broker(&UserBroker {
                id: id.into(),
                user_id: "u1".into(),
                broker_id: "b1".into(),
                role: UserBrokerRole::Both,
                state: UserBrokerState::Disconnected,
                paused: false,
                allowed_symbols: vec!["SBIN".into()],
                product_type: ProductType::Cnc,
                created_at: now_ms(),
                updated_at: now_ms(),
                deleted_at: None,
                version: 1,
            })
            .unwrap();
    }

    #[tokio::test]
    async fn startup_without_session_requests_login() {
        let (store, _registry, manager) = setup();
        seed_user_broker(&store, "ub1");
        let mut login_rx = manager.subscribe_login_requests();

        manager.start("ub1").await.unwrap();

        let ub = store.get_user_broker("ub1").unwrap().unwrap();
        assert_eq!(ub.state, UserBrokerState::LoginRequired);
        let req = login_rx.try_recv().unwrap();
        assert_eq!(req.user_broker_id, "ub1");
    }

    #[tokio::test]
    async fn startup_with_live_session_connects() {
        let (store, registry, manager) = setup();
        seed_user_broker(&store, "ub1");
        registry.register("ub1", MockBroker::new());
        store
            .insert_session(&SessionRow {
                id: "sess1".into(),
                user_broker_id: "ub1".into(),
                access_token: "tok".into(),
                refresh_token: Some("refresh".into()),
                expires_at: now_ms() + 3_600_000,
                created_at: now_ms(),
                updated_at: now_ms(),
                deleted_at: None,
                version: 1,
            })
            .unwrap();

        manager.start("ub1").await.unwrap();
        let ub = store.get_user_broker("ub1").unwrap().unwrap();
        assert_eq!(ub.state, UserBrokerState::Connected);
        assert_eq!(manager.get_token("ub1").unwrap(), "tok");
    }

    #[tokio::test]
    async fn get_token_refuses_stale_sessions() {
        let (store, _registry, manager) = setup();
        store
            .insert_session(&SessionRow {
                id: "sess1".into(),
                user_broker_id: "ub1".into(),
                access_token: "tok".into(),
                refresh_token: None,
                expires_at: now_ms() - 1_000,
                created_at: now_ms(),
                updated_at: now_ms(),
                deleted_at: None,
                version: 1,
            })
            .unwrap();

        match manager.get_token("ub1") {
            Err(BrokerError::TokenExpired(_)) => {}
            other => panic!("expected TOKEN_EXPIRED, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oauth_completion_installs_session_and_fans_out() {
        let (store, registry, manager) = setup();
        seed_user_broker(&store, "ub1");
        registry.register("ub1", MockBroker::new());
        let mut token_rx = manager.subscribe_token_events();

        let state = manager.begin_oauth("ub1", "b1").unwrap();
        manager
            .complete_oauth(&state.state, "auth-code")
            .await
            .unwrap();

        let event = token_rx.try_recv().unwrap();
        assert_eq!(event.user_broker_id, "ub1");
        assert_eq!(event.access_token, "mock-token");
        assert_eq!(manager.get_token("ub1").unwrap(), "mock-token");

        // The state is single-use.
        assert!(manager
            .complete_oauth(&state.state, "auth-code")
            .await
            .is_err());
    }
}
