// =============================================================================
// Brokers, user-brokers, sessions and OAuth state persistence
// =============================================================================

use anyhow::{Context, Result};
use rusqlite::{params, Row};

use super::{col_enum, col_json, json_sql, Store};
use crate::models::{BrokerRow, OAuthState, SessionRow, UserBroker};
use crate::types::{now_ms, BrokerKind, UserBrokerState};

const BROKER_COLS: &str =
    "id, code, name, api_base_url, created_at, updated_at, deleted_at, version";

fn broker_from_row(row: &Row<'_>) -> rusqlite::Result<BrokerRow> {
    Ok(BrokerRow {
        id: row.get(0)?,
        code: col_enum(row, 1)?,
        name: row.get(2)?,
        api_base_url: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
        deleted_at: row.get(6)?,
        version: row.get(7)?,
    })
}

const USER_BROKER_COLS: &str = "id, user_id, broker_id, role, state, paused, allowed_symbols, \
     product_type, created_at, updated_at, deleted_at, version";

fn user_broker_from_row(row: &Row<'_>) -> rusqlite::Result<UserBroker> {
    Ok(UserBroker {
        id: row.get(0)?,
        user_id: row.get(1)?,
        broker_id: row.get(2)?,
        role: col_enum(row, 3)?,
        state: col_enum(row, 4)?,
        paused: row.get(5)?,
        allowed_symbols: col_json(row, 6)?,
        product_type: col_enum(row, 7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
        deleted_at: row.get(10)?,
        version: row.get(11)?,
    })
}

const SESSION_COLS: &str = "id, user_broker_id, access_token, refresh_token, expires_at, \
     created_at, updated_at, deleted_at, version";

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: row.get(0)?,
        user_broker_id: row.get(1)?,
        access_token: row.get(2)?,
        refresh_token: row.get(3)?,
        expires_at: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        deleted_at: row.get(7)?,
        version: row.get(8)?,
    })
}

fn oauth_from_row(row: &Row<'_>) -> rusqlite::Result<OAuthState> {
    Ok(OAuthState {
        state: row.get(0)?,
        user_broker_id: row.get(1)?,
        broker_id: row.get(2)?,
        created_at: row.get(3)?,
        expires_at: row.get(4)?,
        used_at: row.get(5)?,
        deleted_at: row.get(6)?,
    })
}

impl Store {
    // -------------------------------------------------------------------------
    // Brokers
    // -------------------------------------------------------------------------

    pub fn upsert_broker(&self, broker: &BrokerRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO brokers (id, code, name, api_base_url, created_at, updated_at, \
                 deleted_at, version) VALUES (?1,?2,?3,?4,?5,?6,?7,?8) \
                 ON CONFLICT(id) DO UPDATE SET code = excluded.code, name = excluded.name, \
                 api_base_url = excluded.api_base_url, updated_at = excluded.updated_at, \
                 version = brokers.version + 1",
                params![
                    broker.id,
                    broker.code.as_str(),
                    broker.name,
                    broker.api_base_url,
                    broker.created_at,
                    broker.updated_at,
                    broker.deleted_at,
                    broker.version,
                ],
            )
            .context("failed to upsert broker")?;
            Ok(())
        })
    }

    pub fn get_broker(&self, id: &str) -> Result<Option<BrokerRow>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {BROKER_COLS} FROM brokers WHERE id = ?1"))?;
            let mut rows = stmt.query_map(params![id], broker_from_row)?;
            Ok(rows.next().transpose()?)
        })
    }

    pub fn find_broker_by_code(&self, code: BrokerKind) -> Result<Option<BrokerRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {BROKER_COLS} FROM brokers WHERE code = ?1 AND deleted_at IS NULL"
            ))?;
            let mut rows = stmt.query_map(params![code.as_str()], broker_from_row)?;
            Ok(rows.next().transpose()?)
        })
    }

    pub fn list_brokers(&self) -> Result<Vec<BrokerRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {BROKER_COLS} FROM brokers WHERE deleted_at IS NULL"
            ))?;
            let rows = stmt.query_map([], broker_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    // -------------------------------------------------------------------------
    // User-brokers
    // -------------------------------------------------------------------------

    pub fn upsert_user_broker(&self, ub: &UserBroker) -> Result<()> {
        let allowed = json_sql(&ub.allowed_symbols)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO user_brokers (id, user_id, broker_id, role, state, paused, \
                 allowed_symbols, product_type, created_at, updated_at, deleted_at, version) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12) \
                 ON CONFLICT(id) DO UPDATE SET role = excluded.role, state = excluded.state, \
                 paused = excluded.paused, allowed_symbols = excluded.allowed_symbols, \
                 product_type = excluded.product_type, updated_at = excluded.updated_at, \
                 version = user_brokers.version + 1",
                params![
                    ub.id,
                    ub.user_id,
                    ub.broker_id,
                    ub.role.as_str(),
                    ub.state.as_str(),
                    ub.paused,
                    allowed,
                    ub.product_type.as_str(),
                    ub.created_at,
                    ub.updated_at,
                    ub.deleted_at,
                    ub.version,
                ],
            )
            .context("failed to upsert user broker")?;
            Ok(())
        })
    }

    pub fn get_user_broker(&self, id: &str) -> Result<Option<UserBroker>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {USER_BROKER_COLS} FROM user_brokers WHERE id = ?1"
            ))?;
            let mut rows = stmt.query_map(params![id], user_broker_from_row)?;
            Ok(rows.next().transpose()?)
        })
    }

    pub fn list_user_brokers(&self) -> Result<Vec<UserBroker>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {USER_BROKER_COLS} FROM user_brokers WHERE deleted_at IS NULL"
            ))?;
            let rows = stmt.query_map([], user_broker_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    pub fn set_user_broker_state(&self, id: &str, state: UserBrokerState) -> Result<bool> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE user_brokers SET state = ?1, updated_at = ?2, version = version + 1 \
                 WHERE id = ?3 AND deleted_at IS NULL",
                params![state.as_str(), now_ms(), id],
            )?;
            Ok(updated > 0)
        })
    }

    // -------------------------------------------------------------------------
    // Sessions
    // -------------------------------------------------------------------------

    pub fn insert_session(&self, session: &SessionRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO user_broker_sessions (id, user_broker_id, access_token, \
                 refresh_token, expires_at, created_at, updated_at, deleted_at, version) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                params![
                    session.id,
                    session.user_broker_id,
                    session.access_token,
                    session.refresh_token,
                    session.expires_at,
                    session.created_at,
                    session.updated_at,
                    session.deleted_at,
                    session.version,
                ],
            )
            .context("failed to insert session")?;
            Ok(())
        })
    }

    /// The latest non-deleted session for a user-broker, regardless of
    /// expiry; callers decide whether it is still usable.
    pub fn latest_session(&self, user_broker_id: &str) -> Result<Option<SessionRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLS} FROM user_broker_sessions \
                 WHERE user_broker_id = ?1 AND deleted_at IS NULL \
                 ORDER BY created_at DESC LIMIT 1"
            ))?;
            let mut rows = stmt.query_map(params![user_broker_id], session_from_row)?;
            Ok(rows.next().transpose()?)
        })
    }

    /// Replace the token set after a successful refresh.
    pub fn update_session_tokens(
        &self,
        id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: i64,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE user_broker_sessions SET access_token = ?1, \
                 refresh_token = COALESCE(?2, refresh_token), expires_at = ?3, \
                 updated_at = ?4, version = version + 1 WHERE id = ?5 AND deleted_at IS NULL",
                params![access_token, refresh_token, expires_at, now_ms(), id],
            )?;
            Ok(updated > 0)
        })
    }

    // -------------------------------------------------------------------------
    // OAuth states
    // -------------------------------------------------------------------------

    pub fn insert_oauth_state(&self, state: &OAuthState) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO oauth_states (state, user_broker_id, broker_id, created_at, \
                 expires_at, used_at, deleted_at) VALUES (?1,?2,?3,?4,?5,?6,?7)",
                params![
                    state.state,
                    state.user_broker_id,
                    state.broker_id,
                    state.created_at,
                    state.expires_at,
                    state.used_at,
                    state.deleted_at,
                ],
            )
            .context("failed to insert oauth state")?;
            Ok(())
        })
    }

    /// Atomically consume a state token. A state is usable at most once:
    /// the predicated UPDATE marks it used, and only the winner gets the row
    /// back.
    pub fn consume_oauth_state(&self, state: &str, now: i64) -> Result<Option<OAuthState>> {
        self.with_conn(|conn| {
            let claimed = conn.execute(
                "UPDATE oauth_states SET used_at = ?1 \
                 WHERE state = ?2 AND used_at IS NULL AND deleted_at IS NULL \
                 AND expires_at > ?3",
                params![now, state, now],
            )?;
            if claimed == 0 {
                return Ok(None);
            }
            let mut stmt = conn.prepare(
                "SELECT state, user_broker_id, broker_id, created_at, expires_at, used_at, \
                 deleted_at FROM oauth_states WHERE state = ?1",
            )?;
            let mut rows = stmt.query_map(params![state], oauth_from_row)?;
            Ok(rows.next().transpose()?)
        })
    }

    /// Soft-delete expired, unused states. Returns how many were swept.
    pub fn sweep_expired_oauth_states(&self, now: i64) -> Result<usize> {
        self.with_conn(|conn| {
            let swept = conn.execute(
                "UPDATE oauth_states SET deleted_at = ?1 \
                 WHERE deleted_at IS NULL AND used_at IS NULL AND expires_at <= ?1",
                params![now],
            )?;
            Ok(swept)
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::{ProductType, UserBrokerRole};

    pub(crate) fn sample_broker(id: &str, code: BrokerKind, url: &str) -> BrokerRow {
        BrokerRow {
            id: id.into(),
            code,
            name: format!("{code} broker"),
            api_base_url: url.into(),
            created_at: now_ms(),
            updated_at: now_ms(),
            deleted_at: None,
            version: 1,
        }
    }

    pub(crate) fn sample_user_broker(id: &str, broker_id: &str, symbols: &[&str]) -> UserBroker {
        UserBroker {
            id: id.into(),
            user_id: "u1".into(),
            broker_id: broker_id.into(),
            role: UserBrokerRole::Exec,
            state: UserBrokerState::Connected,
            paused: false,
            allowed_symbols: symbols.iter().map(|s| s.to_string()).collect(),
            product_type: ProductType::Cnc,
            created_at: now_ms(),
            updated_at: now_ms(),
            deleted_at: None,
            version: 1,
        }
    }

    #[test]
    fn broker_upsert_and_lookup() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_broker(&sample_broker("b1", BrokerKind::Zerodha, "https://api.kite.trade"))
            .unwrap();
        let found = store.find_broker_by_code(BrokerKind::Zerodha).unwrap();
        assert_eq!(found.unwrap().id, "b1");
        assert!(store.find_broker_by_code(BrokerKind::Dhan).unwrap().is_none());
    }

    #[test]
    fn user_broker_roundtrip_with_symbols() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_user_broker(&sample_user_broker("ub1", "b1", &["SBIN", "INFY"]))
            .unwrap();
        let ub = store.get_user_broker("ub1").unwrap().unwrap();
        assert_eq!(ub.allowed_symbols, vec!["SBIN", "INFY"]);
        assert!(ub.is_exec_eligible("SBIN"));
    }

    #[test]
    fn oauth_state_consumed_at_most_once() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_oauth_state(&OAuthState {
                state: "tok1".into(),
                user_broker_id: "ub1".into(),
                broker_id: "b1".into(),
                created_at: 0,
                expires_at: now_ms() + 900_000,
                used_at: None,
                deleted_at: None,
            })
            .unwrap();

        let first = store.consume_oauth_state("tok1", now_ms()).unwrap();
        assert!(first.is_some());
        let second = store.consume_oauth_state("tok1", now_ms()).unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn expired_oauth_state_is_unusable_and_swept() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_oauth_state(&OAuthState {
                state: "old".into(),
                user_broker_id: "ub1".into(),
                broker_id: "b1".into(),
                created_at: 0,
                expires_at: 10,
                used_at: None,
                deleted_at: None,
            })
            .unwrap();

        assert!(store.consume_oauth_state("old", 20).unwrap().is_none());
        assert_eq!(store.sweep_expired_oauth_states(20).unwrap(), 1);
        // Second sweep finds nothing left.
        assert_eq!(store.sweep_expired_oauth_states(20).unwrap(), 0);
    }

    #[test]
    fn session_refresh_replaces_tokens() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_session(&SessionRow {
                id: "sess1".into(),
                user_broker_id: "ub1".into(),
                access_token: "old-token".into(),
                refresh_token: Some("refresh".into()),
                expires_at: 100,
                created_at: now_ms(),
                updated_at: now_ms(),
                deleted_at: None,
                version: 1,
            })
            .unwrap();

        store
            .update_session_tokens("sess1", "new-token", None, 200)
            .unwrap();
        let sess = store.latest_session("ub1").unwrap().unwrap();
        assert_eq!(sess.access_token, "new-token");
        // Refresh token survives a None update.
        assert_eq!(sess.refresh_token.as_deref(), Some("refresh"));
        assert_eq!(sess.expires_at, 200);
    }
}
