// =============================================================================
// SQLite schema
// =============================================================================
//
// WAL mode for concurrent reads during writes. Monetary columns are canonical
// decimal strings; timestamps are epoch milliseconds. Soft delete via
// deleted_at; optimistic concurrency via version.
// =============================================================================

pub const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS brokers (
    id          TEXT PRIMARY KEY,
    code        TEXT NOT NULL,
    name        TEXT NOT NULL,
    api_base_url TEXT NOT NULL,
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL,
    deleted_at  INTEGER,
    version     INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS user_brokers (
    id          TEXT PRIMARY KEY,
    user_id     TEXT NOT NULL,
    broker_id   TEXT NOT NULL,
    role        TEXT NOT NULL,
    state       TEXT NOT NULL,
    paused      INTEGER NOT NULL DEFAULT 0,
    allowed_symbols TEXT NOT NULL DEFAULT '[]',
    product_type TEXT NOT NULL,
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL,
    deleted_at  INTEGER,
    version     INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS user_broker_sessions (
    id            TEXT PRIMARY KEY,
    user_broker_id TEXT NOT NULL,
    access_token  TEXT NOT NULL,
    refresh_token TEXT,
    expires_at    INTEGER NOT NULL,
    created_at    INTEGER NOT NULL,
    updated_at    INTEGER NOT NULL,
    deleted_at    INTEGER,
    version       INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_sessions_user_broker
    ON user_broker_sessions(user_broker_id, expires_at DESC);

CREATE TABLE IF NOT EXISTS oauth_states (
    state          TEXT PRIMARY KEY,
    user_broker_id TEXT NOT NULL,
    broker_id      TEXT NOT NULL,
    created_at     INTEGER NOT NULL,
    expires_at     INTEGER NOT NULL,
    used_at        INTEGER,
    deleted_at     INTEGER
);

CREATE TABLE IF NOT EXISTS portfolios (
    id                  TEXT PRIMARY KEY,
    user_id             TEXT NOT NULL,
    total_capital       TEXT NOT NULL,
    available_capital   TEXT NOT NULL,
    current_exposure    TEXT NOT NULL,
    current_log_exposure TEXT NOT NULL,
    open_trade_count    INTEGER NOT NULL DEFAULT 0,
    daily_loss          TEXT NOT NULL,
    weekly_loss         TEXT NOT NULL,
    cooldown_until      INTEGER,
    paused              INTEGER NOT NULL DEFAULT 0,
    created_at          INTEGER NOT NULL,
    updated_at          INTEGER NOT NULL,
    deleted_at          INTEGER,
    version             INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_portfolios_user ON portfolios(user_id);

CREATE TABLE IF NOT EXISTS watchlists (
    id          TEXT PRIMARY KEY,
    symbol      TEXT NOT NULL,
    exchange    TEXT NOT NULL,
    enabled     INTEGER NOT NULL DEFAULT 1,
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS uq_watchlists_symbol
    ON watchlists(exchange, symbol);

CREATE TABLE IF NOT EXISTS instruments (
    id             TEXT PRIMARY KEY,
    exchange       TEXT NOT NULL,
    trading_symbol TEXT NOT NULL,
    name           TEXT NOT NULL,
    broker_tokens  TEXT NOT NULL DEFAULT '{}',
    lot_size       INTEGER NOT NULL DEFAULT 1,
    tick_size      TEXT NOT NULL,
    created_at     INTEGER NOT NULL,
    updated_at     INTEGER NOT NULL,
    version        INTEGER NOT NULL DEFAULT 1
);

CREATE UNIQUE INDEX IF NOT EXISTS uq_instruments_symbol
    ON instruments(exchange, trading_symbol);

CREATE TABLE IF NOT EXISTS signals (
    id               TEXT PRIMARY KEY,
    symbol           TEXT NOT NULL,
    direction        TEXT NOT NULL,
    signal_type      TEXT NOT NULL,
    status           TEXT NOT NULL,
    signal_day       TEXT NOT NULL,
    zone             TEXT NOT NULL,
    confluence_type  TEXT NOT NULL,
    confluence_score TEXT NOT NULL,
    p_win            TEXT NOT NULL,
    p_fill           TEXT NOT NULL,
    kelly            TEXT NOT NULL,
    ref_price        TEXT NOT NULL,
    bid              TEXT NOT NULL,
    ask              TEXT NOT NULL,
    entry_low        TEXT NOT NULL,
    entry_high       TEXT NOT NULL,
    effective_floor  TEXT NOT NULL,
    effective_ceiling TEXT NOT NULL,
    reason           TEXT NOT NULL,
    expires_at       INTEGER NOT NULL,
    created_at       INTEGER NOT NULL,
    updated_at       INTEGER NOT NULL,
    deleted_at       INTEGER,
    version          INTEGER NOT NULL DEFAULT 1
);

-- At most one live signal per dedupe key.
CREATE UNIQUE INDEX IF NOT EXISTS uq_signals_dedupe
    ON signals(symbol, signal_day, signal_type, direction)
    WHERE deleted_at IS NULL AND status = 'ACTIVE';

CREATE INDEX IF NOT EXISTS idx_signals_status ON signals(status, expires_at);

CREATE TABLE IF NOT EXISTS signal_deliveries (
    id             TEXT PRIMARY KEY,
    signal_id      TEXT NOT NULL,
    user_broker_id TEXT NOT NULL,
    user_id        TEXT NOT NULL,
    status         TEXT NOT NULL,
    intent_id      TEXT,
    user_action    TEXT,
    created_at     INTEGER NOT NULL,
    updated_at     INTEGER NOT NULL,
    deleted_at     INTEGER,
    version        INTEGER NOT NULL DEFAULT 1
);

CREATE UNIQUE INDEX IF NOT EXISTS uq_deliveries_pair
    ON signal_deliveries(signal_id, user_broker_id);

CREATE INDEX IF NOT EXISTS idx_deliveries_status ON signal_deliveries(status);

CREATE TABLE IF NOT EXISTS trade_intents (
    intent_id       TEXT PRIMARY KEY,
    signal_id       TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    broker_id       TEXT NOT NULL,
    user_broker_id  TEXT NOT NULL,
    validation_passed INTEGER NOT NULL,
    errors          TEXT NOT NULL DEFAULT '[]',
    calculated_qty  INTEGER NOT NULL,
    calculated_value TEXT NOT NULL,
    order_type      TEXT NOT NULL,
    limit_price     TEXT,
    product_type    TEXT NOT NULL,
    log_impact      TEXT NOT NULL,
    portfolio_exposure_after TEXT NOT NULL,
    status          TEXT NOT NULL,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL,
    version         INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_intents_status ON trade_intents(status);
CREATE INDEX IF NOT EXISTS idx_intents_pair
    ON trade_intents(signal_id, user_broker_id);

CREATE TABLE IF NOT EXISTS trades (
    id              TEXT PRIMARY KEY,
    portfolio_id    TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    broker_id       TEXT NOT NULL,
    user_broker_id  TEXT NOT NULL,
    signal_id       TEXT NOT NULL,
    intent_id       TEXT NOT NULL,
    symbol          TEXT NOT NULL,
    direction       TEXT NOT NULL,
    status          TEXT NOT NULL,
    entry_price     TEXT NOT NULL,
    entry_qty       INTEGER NOT NULL,
    entry_value     TEXT NOT NULL,
    entry_at        INTEGER,
    zone            TEXT NOT NULL,
    log_loss_floor  TEXT NOT NULL,
    max_log_loss    TEXT NOT NULL,
    target_min_profit TEXT NOT NULL,
    target_price    TEXT NOT NULL,
    target_stretch  TEXT NOT NULL,
    target_primary  TEXT NOT NULL,
    current_price   TEXT,
    current_log_return TEXT,
    unrealized_pnl  TEXT,
    trailing_active INTEGER NOT NULL DEFAULT 0,
    trailing_highest_price TEXT,
    trailing_stop_price    TEXT,
    exit_price      TEXT,
    exit_at         INTEGER,
    exit_trigger    TEXT,
    exit_order_id   TEXT,
    realized_pnl    TEXT,
    realized_log_return TEXT,
    holding_days    INTEGER,
    broker_order_id TEXT,
    client_order_id TEXT NOT NULL,
    last_broker_update_at INTEGER NOT NULL,
    error_code      TEXT,
    error_message   TEXT,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL,
    deleted_at      INTEGER,
    version         INTEGER NOT NULL DEFAULT 1
);

CREATE UNIQUE INDEX IF NOT EXISTS uq_trades_intent ON trades(intent_id);
CREATE UNIQUE INDEX IF NOT EXISTS uq_trades_client_order ON trades(client_order_id);
CREATE UNIQUE INDEX IF NOT EXISTS uq_trades_broker_order
    ON trades(broker_order_id) WHERE broker_order_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_trades_status ON trades(status);
CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol, status);

CREATE TABLE IF NOT EXISTS exit_intents (
    id             TEXT PRIMARY KEY,
    trade_id       TEXT NOT NULL,
    user_broker_id TEXT NOT NULL,
    exit_reason    TEXT NOT NULL,
    calculated_qty INTEGER NOT NULL,
    order_type     TEXT NOT NULL,
    limit_price    TEXT,
    product_type   TEXT NOT NULL,
    status         TEXT NOT NULL,
    broker_order_id TEXT,
    error_code     TEXT,
    error_message  TEXT,
    created_at     INTEGER NOT NULL,
    placed_at      INTEGER,
    filled_at      INTEGER,
    updated_at     INTEGER NOT NULL,
    version        INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_exit_intents_status ON exit_intents(status);
CREATE INDEX IF NOT EXISTS idx_exit_intents_trade ON exit_intents(trade_id, status);

CREATE TABLE IF NOT EXISTS candles (
    symbol     TEXT NOT NULL,
    timeframe  TEXT NOT NULL,
    open_time  INTEGER NOT NULL,
    open       TEXT NOT NULL,
    high       TEXT NOT NULL,
    low        TEXT NOT NULL,
    close      TEXT NOT NULL,
    volume     INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (symbol, timeframe, open_time)
) WITHOUT ROWID;
"#;
