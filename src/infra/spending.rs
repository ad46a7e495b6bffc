//! Usage: Durable spending ledger (daily/monthly UTC windows, pre-flight check, atomic record).

use chrono::{DateTime, Datelike, TimeZone, Utc};
use rusqlite::{params, Connection, Result as SqlResult};
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;

use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpendingCaps {
    pub daily_cap: f64,
    pub monthly_cap: f64,
    pub warn_at_percent: u8,
}

impl Default for SpendingCaps {
    fn default() -> Self {
        Self {
            daily_cap: 5.0,
            monthly_cap: 50.0,
            warn_at_percent: 80,
        }
    }
}

/// A cap crossed its warning threshold during a `record` call. Emitted at
/// most once per window.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SpendingWarning {
    pub cap_type: &'static str,
    pub used: f64,
    pub cap: f64,
    pub percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpendingStatus {
    pub daily_used: f64,
    pub daily_cap: f64,
    pub daily_percent: f64,
    pub daily_resets_at: DateTime<Utc>,
    pub monthly_used: f64,
    pub monthly_cap: f64,
    pub monthly_percent: f64,
    pub monthly_resets_at: DateTime<Utc>,
    pub at_warning: bool,
}

#[derive(Default)]
struct WarnFlags {
    daily: bool,
    monthly: bool,
}

/// The only writer to the spending store. One lock covers the whole
/// read-check-write of each operation so concurrent records cannot
/// double-spend and a window reset cannot lose an in-flight increment.
pub struct SpendingLedger {
    conn: Mutex<Connection>,
    caps: Mutex<SpendingCaps>,
    warned: Mutex<WarnFlags>,
}

impl SpendingLedger {
    pub fn open<P: AsRef<Path>>(path: P, caps: SpendingCaps) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn, caps)
    }

    pub fn in_memory(caps: SpendingCaps) -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, caps)
    }

    fn init(conn: Connection, caps: SpendingCaps) -> SqlResult<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS spending (
                id TEXT PRIMARY KEY,
                amount REAL NOT NULL DEFAULT 0.0,
                reset_at TEXT NOT NULL
            )",
            [],
        )?;

        let now = Utc::now();
        conn.execute(
            "INSERT OR IGNORE INTO spending (id, amount, reset_at) VALUES ('daily', 0.0, ?1)",
            params![next_daily_reset(&now).to_rfc3339()],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO spending (id, amount, reset_at) VALUES ('monthly', 0.0, ?1)",
            params![next_monthly_reset(&now).to_rfc3339()],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            caps: Mutex::new(caps),
            warned: Mutex::new(WarnFlags::default()),
        })
    }

    pub fn caps(&self) -> SpendingCaps {
        *self.caps.lock().expect("spending caps lock")
    }

    pub fn set_caps(&self, caps: SpendingCaps) {
        *self.caps.lock().expect("spending caps lock") = caps;
    }

    /// Pre-flight admission check. Applies any expired-window reset first;
    /// amounts are untouched on rejection. Store read errors fail open.
    pub fn check(&self, estimated_cost: f64, now: DateTime<Utc>) -> Result<(), GatewayError> {
        let caps = self.caps();
        let (daily, monthly) = {
            let conn = self.conn.lock().expect("spending ledger lock");
            let _ = self.maybe_reset(&conn, &now);
            read_amounts(&conn).unwrap_or((0.0, 0.0))
        };

        if daily + estimated_cost > caps.daily_cap {
            return Err(GatewayError::spending_cap(
                "daily",
                daily,
                caps.daily_cap,
                format!(
                    "Daily spending cap of ${:.2} reached (${:.2} used)",
                    caps.daily_cap, daily
                ),
            ));
        }
        if monthly + estimated_cost > caps.monthly_cap {
            return Err(GatewayError::spending_cap(
                "monthly",
                monthly,
                caps.monthly_cap,
                format!(
                    "Monthly spending cap of ${:.2} reached (${:.2} used)",
                    caps.monthly_cap, monthly
                ),
            ));
        }
        Ok(())
    }

    /// Add actual cost to both windows. A window whose reset time has
    /// passed restarts at exactly `cost` instead of accumulating onto the
    /// stale amount.
    pub fn record(&self, cost: f64, now: DateTime<Utc>) -> SqlResult<Vec<SpendingWarning>> {
        let caps = self.caps();
        let conn = self.conn.lock().expect("spending ledger lock");

        let daily = bump_window(
            &conn,
            "daily",
            cost,
            &now,
            next_daily_reset(&now).to_rfc3339(),
        )?;
        let monthly = bump_window(
            &conn,
            "monthly",
            cost,
            &now,
            next_monthly_reset(&now).to_rfc3339(),
        )?;
        drop(conn);

        let mut warnings = Vec::new();
        let mut warned = self.warned.lock().expect("spending warn lock");
        if daily.reset {
            warned.daily = false;
        }
        if monthly.reset {
            warned.monthly = false;
        }
        let warn_fraction = f64::from(caps.warn_at_percent) / 100.0;
        if !warned.daily && caps.daily_cap > 0.0 && daily.amount >= caps.daily_cap * warn_fraction {
            warned.daily = true;
            warnings.push(SpendingWarning {
                cap_type: "daily",
                used: daily.amount,
                cap: caps.daily_cap,
                percent: daily.amount / caps.daily_cap * 100.0,
            });
        }
        if !warned.monthly
            && caps.monthly_cap > 0.0
            && monthly.amount >= caps.monthly_cap * warn_fraction
        {
            warned.monthly = true;
            warnings.push(SpendingWarning {
                cap_type: "monthly",
                used: monthly.amount,
                cap: caps.monthly_cap,
                percent: monthly.amount / caps.monthly_cap * 100.0,
            });
        }

        Ok(warnings)
    }

    pub fn status(&self, now: DateTime<Utc>) -> SpendingStatus {
        let caps = self.caps();
        let (daily, monthly) = {
            let conn = self.conn.lock().expect("spending ledger lock");
            let _ = self.maybe_reset(&conn, &now);
            read_amounts(&conn).unwrap_or((0.0, 0.0))
        };

        let daily_percent = percent_of(daily, caps.daily_cap);
        let monthly_percent = percent_of(monthly, caps.monthly_cap);
        let warn = f64::from(caps.warn_at_percent);

        SpendingStatus {
            daily_used: daily,
            daily_cap: caps.daily_cap,
            daily_percent,
            daily_resets_at: next_daily_reset(&now),
            monthly_used: monthly,
            monthly_cap: caps.monthly_cap,
            monthly_percent,
            monthly_resets_at: next_monthly_reset(&now),
            at_warning: daily_percent >= warn || monthly_percent >= warn,
        }
    }

    fn maybe_reset(&self, conn: &Connection, now: &DateTime<Utc>) -> SqlResult<()> {
        let mut rolled_daily = false;
        let mut rolled_monthly = false;

        let daily_reset: String =
            conn.query_row("SELECT reset_at FROM spending WHERE id = 'daily'", [], |r| {
                r.get(0)
            })?;
        if window_expired(&daily_reset, now) {
            conn.execute(
                "UPDATE spending SET amount = 0.0, reset_at = ?1 WHERE id = 'daily'",
                params![next_daily_reset(now).to_rfc3339()],
            )?;
            rolled_daily = true;
        }

        let monthly_reset: String = conn.query_row(
            "SELECT reset_at FROM spending WHERE id = 'monthly'",
            [],
            |r| r.get(0),
        )?;
        if window_expired(&monthly_reset, now) {
            conn.execute(
                "UPDATE spending SET amount = 0.0, reset_at = ?1 WHERE id = 'monthly'",
                params![next_monthly_reset(now).to_rfc3339()],
            )?;
            rolled_monthly = true;
        }

        if rolled_daily || rolled_monthly {
            let mut warned = self.warned.lock().expect("spending warn lock");
            if rolled_daily {
                warned.daily = false;
            }
            if rolled_monthly {
                warned.monthly = false;
            }
        }
        Ok(())
    }
}

struct WindowBump {
    amount: f64,
    reset: bool,
}

fn bump_window(
    conn: &Connection,
    id: &str,
    cost: f64,
    now: &DateTime<Utc>,
    next_reset: String,
) -> SqlResult<WindowBump> {
    let reset_at: String = conn.query_row(
        "SELECT reset_at FROM spending WHERE id = ?1",
        params![id],
        |r| r.get(0),
    )?;

    if window_expired(&reset_at, now) {
        conn.execute(
            "UPDATE spending SET amount = ?1, reset_at = ?2 WHERE id = ?3",
            params![cost, next_reset, id],
        )?;
        return Ok(WindowBump {
            amount: cost,
            reset: true,
        });
    }

    conn.execute(
        "UPDATE spending SET amount = amount + ?1 WHERE id = ?2",
        params![cost, id],
    )?;
    let amount: f64 = conn.query_row(
        "SELECT amount FROM spending WHERE id = ?1",
        params![id],
        |r| r.get(0),
    )?;
    Ok(WindowBump {
        amount,
        reset: false,
    })
}

fn read_amounts(conn: &Connection) -> SqlResult<(f64, f64)> {
    let daily: f64 =
        conn.query_row("SELECT amount FROM spending WHERE id = 'daily'", [], |r| {
            r.get(0)
        })?;
    let monthly: f64 =
        conn.query_row("SELECT amount FROM spending WHERE id = 'monthly'", [], |r| {
            r.get(0)
        })?;
    Ok((daily, monthly))
}

fn window_expired(reset_at: &str, now: &DateTime<Utc>) -> bool {
    DateTime::parse_from_rfc3339(reset_at)
        .map(|t| *now >= t.with_timezone(&Utc))
        .unwrap_or(false)
}

fn percent_of(amount: f64, cap: f64) -> f64 {
    if cap <= 0.0 {
        return 0.0;
    }
    (amount / cap * 100.0).min(100.0)
}

/// Next midnight UTC.
pub fn next_daily_reset(from: &DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(from.year(), from.month(), from.day(), 0, 0, 0)
        .unwrap()
        + chrono::Duration::days(1)
}

/// First of next month, 00:00 UTC.
pub fn next_monthly_reset(from: &DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if from.month() == 12 {
        (from.year() + 1, 1)
    } else {
        (from.year(), from.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).unwrap()
}
