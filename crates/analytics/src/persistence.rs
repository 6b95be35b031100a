use analysis_core::StrategyPerformance;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::SecondsFormat;

use crate::models::{ActivityEvent, StrategyPerformanceRow, TradeRecord};

/// Storage for trade records, strategy statistics and the activity log.
#[async_trait]
pub trait PersistencePort: Send + Sync {
    async fn save_trade(&self, record: &TradeRecord) -> Result<()>;
    async fn save_strategy_performance(&self, perf: &StrategyPerformance) -> Result<()>;
    async fn load_strategy_performance(&self, strategy_id: &str)
        -> Result<Option<StrategyPerformance>>;
    async fn log_activity(&self, event: &ActivityEvent) -> Result<()>;
    /// Record an account equity high; lower values than the stored peak are ignored.
    async fn save_peak_equity(&self, peak: f64) -> Result<()>;
    async fn load_peak_equity(&self) -> Result<Option<f64>>;
}

/// `PersistencePort` over any sqlx-supported database. Rows are scoped by
/// `owner` so several agents can share one database.
pub struct SqlPersistence {
    pool: sqlx::AnyPool,
    owner: String,
}

impl SqlPersistence {
    pub fn new(pool: sqlx::AnyPool, owner: impl Into<String>) -> Self {
        Self {
            pool,
            owner: owner.into(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub async fn init_tables(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS strategy_performance (
                owner TEXT NOT NULL,
                strategy_id TEXT NOT NULL,
                total_trades INTEGER NOT NULL DEFAULT 0,
                winning_trades INTEGER NOT NULL DEFAULT 0,
                losing_trades INTEGER NOT NULL DEFAULT 0,
                total_pnl REAL NOT NULL DEFAULT 0,
                win_rate REAL NOT NULL DEFAULT 0,
                avg_pnl REAL NOT NULL DEFAULT 0,
                sharpe_ratio REAL NOT NULL DEFAULT 0,
                max_drawdown REAL NOT NULL DEFAULT 0,
                peak_pnl REAL NOT NULL DEFAULT 0,
                pnl_mean REAL NOT NULL DEFAULT 0,
                pnl_m2 REAL NOT NULL DEFAULT 0,
                consecutive_wins INTEGER NOT NULL DEFAULT 0,
                consecutive_losses INTEGER NOT NULL DEFAULT 0,
                is_testing INTEGER NOT NULL DEFAULT 1,
                test_trades INTEGER NOT NULL DEFAULT 0,
                test_wins INTEGER NOT NULL DEFAULT 0,
                test_pnl REAL NOT NULL DEFAULT 0,
                test_passed INTEGER NOT NULL DEFAULT -1,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (owner, strategy_id)
            )",
        )
        .execute(&self.pool)
        .await
        .context("creating strategy_performance")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS trade_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner TEXT NOT NULL,
                cycle_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                strategy_id TEXT NOT NULL,
                side TEXT NOT NULL,
                status TEXT NOT NULL,
                order_id TEXT,
                quantity REAL,
                notional REAL,
                price REAL,
                pnl REAL,
                dry_run INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .context("creating trade_records")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS activity_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner TEXT NOT NULL,
                cycle_id TEXT,
                kind TEXT NOT NULL,
                symbol TEXT,
                message TEXT NOT NULL,
                details TEXT,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .context("creating activity_log")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS portfolio_peak (
                owner TEXT PRIMARY KEY,
                peak_value REAL NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .context("creating portfolio_peak")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trade_records_symbol ON trade_records(symbol)")
            .execute(&self.pool)
            .await
            .ok();
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_activity_log_cycle ON activity_log(cycle_id)")
            .execute(&self.pool)
            .await
            .ok();

        Ok(())
    }

    /// Trades recorded for `symbol`, newest first.
    pub async fn trades_for_symbol(&self, symbol: &str) -> Result<Vec<TradeRecord>> {
        let rows: Vec<TradeRow> = sqlx::query_as(
            "SELECT cycle_id, symbol, strategy_id, side, status, order_id, quantity, notional,
                    price, pnl, dry_run, created_at
             FROM trade_records WHERE owner = ? AND symbol = ? ORDER BY id DESC",
        )
        .bind(self.owner.as_str())
        .bind(symbol)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(TradeRecord::from).collect())
    }

    pub async fn activity_count(&self, kind: &str) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM activity_log WHERE owner = ? AND kind = ?")
                .bind(self.owner.as_str())
                .bind(kind)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

#[derive(sqlx::FromRow)]
struct TradeRow {
    cycle_id: String,
    symbol: String,
    strategy_id: String,
    side: String,
    status: String,
    order_id: Option<String>,
    quantity: Option<f64>,
    notional: Option<f64>,
    price: Option<f64>,
    pnl: Option<f64>,
    dry_run: i64,
    created_at: String,
}

impl From<TradeRow> for TradeRecord {
    fn from(row: TradeRow) -> Self {
        TradeRecord {
            cycle_id: row.cycle_id,
            symbol: row.symbol,
            strategy_id: row.strategy_id,
            side: row.side,
            status: row.status,
            order_id: row.order_id,
            quantity: row.quantity,
            notional: row.notional,
            price: row.price,
            pnl: row.pnl,
            dry_run: row.dry_run != 0,
            timestamp: chrono::DateTime::parse_from_rfc3339(&row.created_at)
                .map(|d| d.with_timezone(&chrono::Utc))
                .unwrap_or_else(|_| chrono::Utc::now()),
        }
    }
}

fn tri_state(v: Option<bool>) -> i64 {
    match v {
        Some(true) => 1,
        Some(false) => 0,
        None => -1,
    }
}

#[async_trait]
impl PersistencePort for SqlPersistence {
    async fn save_trade(&self, record: &TradeRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO trade_records
             (owner, cycle_id, symbol, strategy_id, side, status, order_id, quantity, notional,
              price, pnl, dry_run, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(self.owner.as_str())
        .bind(record.cycle_id.as_str())
        .bind(record.symbol.as_str())
        .bind(record.strategy_id.as_str())
        .bind(record.side.as_str())
        .bind(record.status.as_str())
        .bind(record.order_id.clone())
        .bind(record.quantity)
        .bind(record.notional)
        .bind(record.price)
        .bind(record.pnl)
        .bind(record.dry_run as i64)
        .bind(record.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true))
        .execute(&self.pool)
        .await
        .with_context(|| format!("saving trade for {}", record.symbol))?;
        Ok(())
    }

    /// Upsert; a snapshot older than the stored row is ignored so a late
    /// retry cannot roll statistics back.
    async fn save_strategy_performance(&self, perf: &StrategyPerformance) -> Result<()> {
        sqlx::query(
            "INSERT INTO strategy_performance
             (owner, strategy_id, total_trades, winning_trades, losing_trades, total_pnl,
              win_rate, avg_pnl, sharpe_ratio, max_drawdown, peak_pnl, pnl_mean, pnl_m2,
              consecutive_wins, consecutive_losses, is_testing, test_trades, test_wins,
              test_pnl, test_passed, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(owner, strategy_id) DO UPDATE SET
                total_trades = excluded.total_trades,
                winning_trades = excluded.winning_trades,
                losing_trades = excluded.losing_trades,
                total_pnl = excluded.total_pnl,
                win_rate = excluded.win_rate,
                avg_pnl = excluded.avg_pnl,
                sharpe_ratio = excluded.sharpe_ratio,
                max_drawdown = excluded.max_drawdown,
                peak_pnl = excluded.peak_pnl,
                pnl_mean = excluded.pnl_mean,
                pnl_m2 = excluded.pnl_m2,
                consecutive_wins = excluded.consecutive_wins,
                consecutive_losses = excluded.consecutive_losses,
                is_testing = excluded.is_testing,
                test_trades = excluded.test_trades,
                test_wins = excluded.test_wins,
                test_pnl = excluded.test_pnl,
                test_passed = excluded.test_passed,
                updated_at = excluded.updated_at
             WHERE excluded.updated_at >= strategy_performance.updated_at",
        )
        .bind(self.owner.as_str())
        .bind(perf.strategy_id.as_str())
        .bind(perf.total_trades as i64)
        .bind(perf.winning_trades as i64)
        .bind(perf.losing_trades as i64)
        .bind(perf.total_pnl)
        .bind(perf.win_rate)
        .bind(perf.avg_pnl)
        .bind(perf.sharpe_ratio)
        .bind(perf.max_drawdown)
        .bind(perf.peak_pnl)
        .bind(perf.pnl_mean)
        .bind(perf.pnl_m2)
        .bind(perf.consecutive_wins as i64)
        .bind(perf.consecutive_losses as i64)
        .bind(perf.is_testing as i64)
        .bind(perf.test_trades as i64)
        .bind(perf.test_wins as i64)
        .bind(perf.test_pnl)
        .bind(tri_state(perf.test_passed))
        .bind(perf.updated_at.to_rfc3339_opts(SecondsFormat::Millis, true))
        .execute(&self.pool)
        .await
        .with_context(|| format!("saving performance for {}", perf.strategy_id))?;
        Ok(())
    }

    async fn load_strategy_performance(
        &self,
        strategy_id: &str,
    ) -> Result<Option<StrategyPerformance>> {
        let row: Option<StrategyPerformanceRow> = sqlx::query_as(
            "SELECT strategy_id, total_trades, winning_trades, losing_trades, total_pnl,
                    win_rate, avg_pnl, sharpe_ratio, max_drawdown, peak_pnl, pnl_mean, pnl_m2,
                    consecutive_wins, consecutive_losses, is_testing, test_trades, test_wins,
                    test_pnl, test_passed, updated_at
             FROM strategy_performance WHERE owner = ? AND strategy_id = ?",
        )
        .bind(self.owner.as_str())
        .bind(strategy_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("loading performance for {}", strategy_id))?;
        Ok(row.map(StrategyPerformance::from))
    }

    async fn log_activity(&self, event: &ActivityEvent) -> Result<()> {
        let details = if event.details.is_null() {
            None
        } else {
            Some(event.details.to_string())
        };
        sqlx::query(
            "INSERT INTO activity_log (owner, cycle_id, kind, symbol, message, details, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(self.owner.as_str())
        .bind(event.cycle_id.clone())
        .bind(event.kind.as_str())
        .bind(event.symbol.clone())
        .bind(event.message.as_str())
        .bind(details)
        .bind(event.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true))
        .execute(&self.pool)
        .await
        .context("writing activity log")?;
        Ok(())
    }

    async fn save_peak_equity(&self, peak: f64) -> Result<()> {
        sqlx::query(
            "INSERT INTO portfolio_peak (owner, peak_value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(owner) DO UPDATE SET
                peak_value = excluded.peak_value,
                updated_at = excluded.updated_at
             WHERE excluded.peak_value > portfolio_peak.peak_value",
        )
        .bind(self.owner.as_str())
        .bind(peak)
        .bind(chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
        .execute(&self.pool)
        .await
        .context("saving portfolio peak")?;
        Ok(())
    }

    async fn load_peak_equity(&self) -> Result<Option<f64>> {
        let row: Option<(f64,)> =
            sqlx::query_as("SELECT peak_value FROM portfolio_peak WHERE owner = ?")
                .bind(self.owner.as_str())
                .fetch_optional(&self.pool)
                .await
                .context("loading portfolio peak")?;
        Ok(row.map(|(peak,)| peak))
    }
}
