//! Member store
//!
//! SQLite persistence for members, plans, the append-only sales ledger,
//! payment transactions and withdrawals. A single connection behind a tokio
//! mutex: every multi-row mutation runs as one rusqlite transaction while the
//! lock is held, so concurrent engine calls serialize at the store.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::info;

use crate::errors::{EngineError, EngineResult};
use crate::models::{
    CommissionType, LedgerEntry, Member, PaymentStatus, PaymentTransaction, Plan, ProfileStatus,
    Side, Withdrawal, WithdrawalStatus,
};

const MEMBER_COLUMNS: &str = "member_id, introducer_id, referral_type, first_name, last_name, \
     email, side_a_child_id, side_b_child_id, side_a_points, side_b_points, profile_status, \
     plan_id, current_balance, total_earnings, total_withdrawals, direct_sales, \
     binary_commission, cash_back, created_at, activated_at";

#[derive(Clone)]
pub struct MemberStore {
    conn: Arc<Mutex<Connection>>,
}

impl MemberStore {
    /// Open (or create) the database and initialize the schema.
    pub fn open(db_path: &str) -> EngineResult<Self> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();

        Self::init_schema(&conn)?;
        info!(db_path, "member store ready");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> EngineResult<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS members (
                member_id INTEGER PRIMARY KEY,
                introducer_id INTEGER NOT NULL,
                referral_type TEXT NOT NULL,
                first_name TEXT NOT NULL,
                last_name TEXT NOT NULL,
                email TEXT NOT NULL,
                side_a_child_id INTEGER,
                side_b_child_id INTEGER,
                side_a_points REAL NOT NULL DEFAULT 0,
                side_b_points REAL NOT NULL DEFAULT 0,
                profile_status TEXT NOT NULL DEFAULT 'PendingVerification',
                plan_id INTEGER,
                current_balance REAL NOT NULL DEFAULT 0,
                total_earnings REAL NOT NULL DEFAULT 0,
                total_withdrawals REAL NOT NULL DEFAULT 0,
                direct_sales REAL NOT NULL DEFAULT 0,
                binary_commission REAL NOT NULL DEFAULT 0,
                cash_back REAL NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                activated_at TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_members_side_a_child ON members(side_a_child_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_members_side_b_child ON members(side_b_child_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_members_introducer ON members(introducer_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS plans (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                product_price REAL NOT NULL,
                referral_points REAL NOT NULL
            )",
            [],
        )?;

        // Append-only audit trail. No UPDATE/DELETE path exists for it.
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sales_summary (
                id TEXT PRIMARY KEY,
                commission_type TEXT NOT NULL,
                member_id INTEGER NOT NULL,
                amount REAL NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sales_summary_member ON sales_summary(member_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                reference TEXT UNIQUE NOT NULL,
                member_id INTEGER NOT NULL,
                plan_id INTEGER NOT NULL,
                amount REAL NOT NULL,
                status TEXT NOT NULL DEFAULT 'Pending',
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS withdrawals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                member_id INTEGER NOT NULL,
                amount REAL NOT NULL,
                wallet_address TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'Pending',
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    /// Seed the plan catalog if empty. Plans are otherwise read-only here.
    pub async fn seed_plans(&self) -> EngineResult<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO plans (id, name, product_price, referral_points) VALUES
                (1, 'Starter', 120.0, 1.0),
                (2, 'Advanced', 450.0, 4.0),
                (3, 'Professional', 1200.0, 12.0)",
            [],
        )?;
        Ok(())
    }

    /// Exclusive access to the connection for transaction-scoped work.
    pub(crate) async fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    // ---- async read API -------------------------------------------------

    pub async fn get_member(&self, member_id: i64) -> EngineResult<Option<Member>> {
        let conn = self.lock().await;
        Self::member_by_id(&conn, member_id)
    }

    pub async fn get_plan(&self, plan_id: i64) -> EngineResult<Option<Plan>> {
        let conn = self.lock().await;
        Self::plan_by_id(&conn, plan_id)
    }

    pub async fn get_transaction(&self, reference: &str) -> EngineResult<Option<PaymentTransaction>> {
        let conn = self.lock().await;
        Self::transaction_by_reference(&conn, reference)
    }

    pub async fn get_withdrawal(&self, id: i64) -> EngineResult<Option<Withdrawal>> {
        let conn = self.lock().await;
        Self::withdrawal_by_id(&conn, id)
    }

    /// All member ids, ascending.
    pub async fn list_member_ids(&self) -> EngineResult<Vec<i64>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached("SELECT member_id FROM members ORDER BY member_id ASC")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Ledger rows for one member, newest first.
    pub async fn list_ledger(&self, member_id: i64, limit: usize) -> EngineResult<Vec<LedgerEntry>> {
        let limit = limit.clamp(1, 1000) as i64;
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, commission_type, member_id, amount, created_at
             FROM sales_summary WHERE member_id = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![member_id, limit], map_ledger_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ---- transaction-scoped helpers ------------------------------------
    //
    // These take a plain `&Connection` so the engine can compose them inside
    // a single rusqlite transaction (Transaction derefs to Connection).

    pub(crate) fn member_by_id(conn: &Connection, member_id: i64) -> EngineResult<Option<Member>> {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {MEMBER_COLUMNS} FROM members WHERE member_id = ?1"
        ))?;
        let member = stmt
            .query_row(params![member_id], map_member_row)
            .optional()?;
        Ok(member)
    }

    pub(crate) fn plan_by_id(conn: &Connection, plan_id: i64) -> EngineResult<Option<Plan>> {
        let mut stmt = conn.prepare_cached(
            "SELECT id, name, product_price, referral_points FROM plans WHERE id = ?1",
        )?;
        let plan = stmt
            .query_row(params![plan_id], |row| {
                Ok(Plan {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    product_price: row.get(2)?,
                    referral_points: row.get(3)?,
                })
            })
            .optional()?;
        Ok(plan)
    }

    /// Occupant of one child slot, if any.
    pub(crate) fn member_by_slot(
        conn: &Connection,
        parent_id: i64,
        side: Side,
    ) -> EngineResult<Option<Member>> {
        let column = slot_column(side);
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {MEMBER_COLUMNS} FROM members
             WHERE member_id = (SELECT {column} FROM members WHERE member_id = ?1)"
        ))?;
        let member = stmt
            .query_row(params![parent_id], map_member_row)
            .optional()?;
        Ok(member)
    }

    /// The tree parent of `child_id` and the side the child occupies there.
    /// `None` for the root (no slot points at it).
    pub(crate) fn slot_parent(
        conn: &Connection,
        child_id: i64,
    ) -> EngineResult<Option<(Member, Side)>> {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {MEMBER_COLUMNS} FROM members
             WHERE side_a_child_id = ?1 OR side_b_child_id = ?1"
        ))?;
        let parent = stmt
            .query_row(params![child_id], map_member_row)
            .optional()?;

        match parent {
            Some(parent) => {
                let side = if parent.side_a_child_id == Some(child_id) {
                    Side::A
                } else {
                    Side::B
                };
                Ok(Some((parent, side)))
            }
            None => Ok(None),
        }
    }

    /// Next member id: MAX + 1, seeded when the table is empty.
    pub(crate) fn next_member_id(conn: &Connection, seed: i64) -> EngineResult<i64> {
        let max: Option<i64> =
            conn.query_row("SELECT MAX(member_id) FROM members", [], |row| row.get(0))?;
        Ok(max.map(|m| m + 1).unwrap_or(seed))
    }

    pub(crate) fn insert_member(conn: &Connection, member: &Member) -> EngineResult<()> {
        conn.execute(
            "INSERT INTO members (member_id, introducer_id, referral_type, first_name, last_name,
                email, profile_status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                member.member_id,
                member.introducer_id,
                member.referral_type.as_str(),
                member.first_name,
                member.last_name,
                member.email,
                member.profile_status.as_str(),
                member.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Link a child into a parent slot. The `IS NULL` guard makes the
    /// read-empty-then-write atomic: zero affected rows means the slot was
    /// taken between resolution and linking.
    pub(crate) fn link_child(
        conn: &Connection,
        parent_id: i64,
        side: Side,
        child_id: i64,
    ) -> EngineResult<()> {
        let column = slot_column(side);
        let affected = conn.execute(
            &format!(
                "UPDATE members SET {column} = ?1 WHERE member_id = ?2 AND {column} IS NULL"
            ),
            params![child_id, parent_id],
        )?;
        if affected == 0 {
            return Err(EngineError::InvariantViolation(format!(
                "slot {} of member {parent_id} already occupied while linking {child_id}",
                side.as_str()
            )));
        }
        Ok(())
    }

    pub(crate) fn add_side_points(
        conn: &Connection,
        member_id: i64,
        side: Side,
        points: f64,
    ) -> EngineResult<()> {
        let column = match side {
            Side::A => "side_a_points",
            Side::B => "side_b_points",
        };
        conn.execute(
            &format!("UPDATE members SET {column} = {column} + ?1 WHERE member_id = ?2"),
            params![points, member_id],
        )?;
        Ok(())
    }

    /// Consume `matched` points from both sides and credit the binary
    /// commission in one statement.
    pub(crate) fn apply_binary_match(
        conn: &Connection,
        member_id: i64,
        matched: f64,
        bonus: f64,
    ) -> EngineResult<()> {
        conn.execute(
            "UPDATE members SET
                side_a_points = side_a_points - ?1,
                side_b_points = side_b_points - ?1,
                binary_commission = binary_commission + ?2,
                current_balance = current_balance + ?2,
                total_earnings = total_earnings + ?2
             WHERE member_id = ?3",
            params![matched, bonus, member_id],
        )?;
        Ok(())
    }

    /// One-shot cash-back credit. The `cash_back = 0` guard is the
    /// idempotency check; zero affected rows means it was already awarded.
    pub(crate) fn apply_cash_back(
        conn: &Connection,
        member_id: i64,
        bonus: f64,
    ) -> EngineResult<bool> {
        let affected = conn.execute(
            "UPDATE members SET
                cash_back = ?1,
                current_balance = current_balance + ?1,
                total_earnings = total_earnings + ?1
             WHERE member_id = ?2 AND cash_back = 0",
            params![bonus, member_id],
        )?;
        Ok(affected > 0)
    }

    pub(crate) fn apply_direct_commission(
        conn: &Connection,
        member_id: i64,
        amount: f64,
    ) -> EngineResult<()> {
        conn.execute(
            "UPDATE members SET
                direct_sales = direct_sales + ?1,
                current_balance = current_balance + ?1,
                total_earnings = total_earnings + ?1
             WHERE member_id = ?2",
            params![amount, member_id],
        )?;
        Ok(())
    }

    pub(crate) fn set_activated(
        conn: &Connection,
        member_id: i64,
        plan_id: i64,
        at: DateTime<Utc>,
    ) -> EngineResult<()> {
        conn.execute(
            "UPDATE members SET profile_status = 'Activated', plan_id = ?1, activated_at = ?2
             WHERE member_id = ?3",
            params![plan_id, at.to_rfc3339(), member_id],
        )?;
        Ok(())
    }

    pub(crate) fn set_status(
        conn: &Connection,
        member_id: i64,
        status: ProfileStatus,
    ) -> EngineResult<()> {
        conn.execute(
            "UPDATE members SET profile_status = ?1 WHERE member_id = ?2",
            params![status.as_str(), member_id],
        )?;
        Ok(())
    }

    pub(crate) fn insert_ledger(conn: &Connection, entry: &LedgerEntry) -> EngineResult<()> {
        conn.execute(
            "INSERT INTO sales_summary (id, commission_type, member_id, amount, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.id,
                entry.commission_type.as_str(),
                entry.member_id,
                entry.amount,
                entry.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub(crate) fn insert_transaction(
        conn: &Connection,
        reference: &str,
        member_id: i64,
        plan_id: i64,
        amount: f64,
        at: DateTime<Utc>,
    ) -> EngineResult<i64> {
        conn.execute(
            "INSERT INTO transactions (reference, member_id, plan_id, amount, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'Pending', ?5)",
            params![reference, member_id, plan_id, amount, at.to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub(crate) fn transaction_by_reference(
        conn: &Connection,
        reference: &str,
    ) -> EngineResult<Option<PaymentTransaction>> {
        let mut stmt = conn.prepare_cached(
            "SELECT id, reference, member_id, plan_id, amount, status, created_at
             FROM transactions WHERE reference = ?1",
        )?;
        let tx = stmt
            .query_row(params![reference], map_transaction_row)
            .optional()?;
        Ok(tx)
    }

    /// Settle a Pending payment transaction. Zero affected rows means the
    /// reference was already settled (or never existed).
    pub(crate) fn settle_transaction(
        conn: &Connection,
        reference: &str,
        status: PaymentStatus,
    ) -> EngineResult<bool> {
        let affected = conn.execute(
            "UPDATE transactions SET status = ?1 WHERE reference = ?2 AND status = 'Pending'",
            params![status.as_str(), reference],
        )?;
        Ok(affected > 0)
    }

    pub(crate) fn insert_withdrawal(
        conn: &Connection,
        member_id: i64,
        amount: f64,
        wallet_address: &str,
        at: DateTime<Utc>,
    ) -> EngineResult<i64> {
        conn.execute(
            "INSERT INTO withdrawals (member_id, amount, wallet_address, status, created_at)
             VALUES (?1, ?2, ?3, 'Pending', ?4)",
            params![member_id, amount, wallet_address, at.to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub(crate) fn withdrawal_by_id(conn: &Connection, id: i64) -> EngineResult<Option<Withdrawal>> {
        let mut stmt = conn.prepare_cached(
            "SELECT id, member_id, amount, wallet_address, status, created_at
             FROM withdrawals WHERE id = ?1",
        )?;
        let wd = stmt.query_row(params![id], map_withdrawal_row).optional()?;
        Ok(wd)
    }

    pub(crate) fn settle_withdrawal(
        conn: &Connection,
        id: i64,
        status: WithdrawalStatus,
    ) -> EngineResult<bool> {
        let affected = conn.execute(
            "UPDATE withdrawals SET status = ?1 WHERE id = ?2 AND status = 'Pending'",
            params![status.as_str(), id],
        )?;
        Ok(affected > 0)
    }

    pub(crate) fn apply_withdrawal_debit(
        conn: &Connection,
        member_id: i64,
        amount: f64,
    ) -> EngineResult<()> {
        conn.execute(
            "UPDATE members SET
                current_balance = current_balance - ?1,
                total_withdrawals = total_withdrawals + ?1
             WHERE member_id = ?2",
            params![amount, member_id],
        )?;
        Ok(())
    }

    pub(crate) fn apply_withdrawal_refund(
        conn: &Connection,
        member_id: i64,
        amount: f64,
    ) -> EngineResult<()> {
        conn.execute(
            "UPDATE members SET
                current_balance = current_balance + ?1,
                total_withdrawals = total_withdrawals - ?1
             WHERE member_id = ?2",
            params![amount, member_id],
        )?;
        Ok(())
    }
}

fn slot_column(side: Side) -> &'static str {
    match side {
        Side::A => "side_a_child_id",
        Side::B => "side_b_child_id",
    }
}

fn parse_timestamp(idx: usize, raw: String) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn bad_enum(idx: usize, what: &str, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unrecognized {what}: {raw}").into(),
    )
}

fn map_member_row(row: &Row<'_>) -> Result<Member, rusqlite::Error> {
    let referral_type: String = row.get(2)?;
    let profile_status: String = row.get(10)?;
    let activated_at: Option<String> = row.get(19)?;

    Ok(Member {
        member_id: row.get(0)?,
        introducer_id: row.get(1)?,
        referral_type: Side::from_str(&referral_type)
            .ok_or_else(|| bad_enum(2, "referral_type", &referral_type))?,
        first_name: row.get(3)?,
        last_name: row.get(4)?,
        email: row.get(5)?,
        side_a_child_id: row.get(6)?,
        side_b_child_id: row.get(7)?,
        side_a_points: row.get(8)?,
        side_b_points: row.get(9)?,
        profile_status: ProfileStatus::from_str(&profile_status)
            .ok_or_else(|| bad_enum(10, "profile_status", &profile_status))?,
        plan_id: row.get(11)?,
        current_balance: row.get(12)?,
        total_earnings: row.get(13)?,
        total_withdrawals: row.get(14)?,
        direct_sales: row.get(15)?,
        binary_commission: row.get(16)?,
        cash_back: row.get(17)?,
        created_at: parse_timestamp(18, row.get(18)?)?,
        activated_at: activated_at.map(|s| parse_timestamp(19, s)).transpose()?,
    })
}

fn map_ledger_row(row: &Row<'_>) -> Result<LedgerEntry, rusqlite::Error> {
    let commission_type: String = row.get(1)?;
    Ok(LedgerEntry {
        id: row.get(0)?,
        commission_type: CommissionType::from_str(&commission_type)
            .ok_or_else(|| bad_enum(1, "commission_type", &commission_type))?,
        member_id: row.get(2)?,
        amount: row.get(3)?,
        created_at: parse_timestamp(4, row.get(4)?)?,
    })
}

fn map_transaction_row(row: &Row<'_>) -> Result<PaymentTransaction, rusqlite::Error> {
    let status: String = row.get(5)?;
    Ok(PaymentTransaction {
        id: row.get(0)?,
        reference: row.get(1)?,
        member_id: row.get(2)?,
        plan_id: row.get(3)?,
        amount: row.get(4)?,
        status: PaymentStatus::from_str(&status).ok_or_else(|| bad_enum(5, "status", &status))?,
        created_at: parse_timestamp(6, row.get(6)?)?,
    })
}

fn map_withdrawal_row(row: &Row<'_>) -> Result<Withdrawal, rusqlite::Error> {
    let status: String = row.get(4)?;
    Ok(Withdrawal {
        id: row.get(0)?,
        member_id: row.get(1)?,
        amount: row.get(2)?,
        wallet_address: row.get(3)?,
        status: WithdrawalStatus::from_str(&status)
            .ok_or_else(|| bad_enum(4, "status", &status))?,
        created_at: parse_timestamp(5, row.get(5)?)?,
    })
}
