//! Credit ledger: persistent accounts, atomic balance mutations, and the
//! unit-of-work scope that couples balance changes to a job-state write.
//!
//! Balances are integer micro-credits. Every mutation appends a row to
//! `ledger_entries` in the same transaction, so the history can be audited
//! per job id.

use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use sqlx::{Row, Sqlite, SqliteConnection, Transaction};
use uuid::Uuid;

use crate::error::{GridError, Result};

/// A credit amount with six fractional digits of precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Credits(i64);

const MICRO: f64 = 1_000_000.0;

impl Credits {
    pub const ZERO: Credits = Credits(0);

    pub fn from_f64(value: f64) -> Self {
        Credits((value * MICRO).round() as i64)
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / MICRO
    }

    pub fn micro(self) -> i64 {
        self.0
    }

    pub fn from_micro(micro: i64) -> Self {
        Credits(micro)
    }
}

impl std::fmt::Display for Credits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.6}", self.as_f64())
    }
}

/// Why a ledger entry exists. `JobDebit`/`JobReward` carry the job id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Grant,
    JobDebit,
    JobReward,
    Refund,
    TransferOut,
    TransferIn,
}

impl EntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryKind::Grant => "grant",
            EntryKind::JobDebit => "job_debit",
            EntryKind::JobReward => "job_reward",
            EntryKind::Refund => "refund",
            EntryKind::TransferOut => "transfer_out",
            EntryKind::TransferIn => "transfer_in",
        }
    }
}

/// One row of ledger history.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub account_id: String,
    pub job_id: Option<Uuid>,
    pub amount: Credits,
    pub kind: String,
}

#[derive(Clone)]
pub struct Ledger {
    pool: SqlitePool,
    initial_credits: Credits,
}

impl Ledger {
    pub fn new(pool: SqlitePool, initial_credits: f64) -> Self {
        Self {
            pool,
            initial_credits: Credits::from_f64(initial_credits),
        }
    }

    /// Create the account with the configured starting balance if it does not
    /// exist. Returns the current balance either way.
    pub async fn ensure_account(&self, id: &str) -> Result<Credits> {
        let mut tx = self.pool.begin().await?;
        let balance = ensure_account_in(&mut tx, id, self.initial_credits).await?;
        tx.commit().await?;
        Ok(balance)
    }

    /// Current balance, or `None` for an unknown account.
    pub async fn balance(&self, id: &str) -> Result<Option<Credits>> {
        let row = sqlx::query("SELECT balance_micro FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| Credits::from_micro(r.get::<i64, _>(0))))
    }

    /// Debit `amount` if the balance covers it. Returns false (state
    /// unchanged) when it would go negative.
    pub async fn debit(&self, id: &str, amount: Credits, job_id: Option<Uuid>) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let ok = debit_in(&mut tx, id, amount, job_id, EntryKind::JobDebit).await?;
        tx.commit().await?;
        Ok(ok)
    }

    pub async fn credit(
        &self,
        id: &str,
        amount: Credits,
        job_id: Option<Uuid>,
        kind: EntryKind,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        credit_in(&mut tx, id, amount, job_id, kind).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Move `amount` between accounts atomically. Returns false and leaves
    /// both balances unchanged if `from` cannot cover it.
    pub async fn transfer(&self, from: &str, to: &str, amount: Credits) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        if !debit_in(&mut tx, from, amount, None, EntryKind::TransferOut).await? {
            tx.rollback().await?;
            return Ok(false);
        }
        credit_in(&mut tx, to, amount, None, EntryKind::TransferIn).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Verify a presented secret against the stored hash. Unknown accounts
    /// and accounts without an installed authenticator verify false.
    pub async fn verify_auth(&self, id: &str, secret: &str) -> Result<bool> {
        let row = sqlx::query("SELECT auth_hash FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(false) };
        let Some(hash) = row.get::<Option<String>, _>(0) else {
            return Ok(false);
        };
        let parsed = PasswordHash::new(&hash)
            .map_err(|e| GridError::Internal(format!("corrupt auth hash: {e}")))?;
        Ok(Argon2::default()
            .verify_password(secret.as_bytes(), &parsed)
            .is_ok())
    }

    /// Install the secret's salted hash if the account has none yet.
    /// Returns true if the hash was installed by this call.
    pub async fn set_auth_on_first_use(&self, id: &str, secret: &str) -> Result<bool> {
        let hash = hash_secret(secret)?;
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE accounts SET auth_hash = ?, updated_at = ? WHERE id = ? AND auth_hash IS NULL",
        )
        .bind(&hash)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// First contact installs the secret; later contacts must match it.
    pub async fn authenticate(&self, id: &str, secret: &str) -> Result<()> {
        self.ensure_account(id).await?;
        if self.set_auth_on_first_use(id, secret).await? {
            return Ok(());
        }
        if self.verify_auth(id, secret).await? {
            Ok(())
        } else {
            Err(GridError::Unauthenticated(id.to_string()))
        }
    }

    /// Ledger history for one job, oldest first.
    pub async fn entries_for_job(&self, job_id: Uuid) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query(
            "SELECT account_id, job_id, amount_micro, kind FROM ledger_entries \
             WHERE job_id = ? ORDER BY seq",
        )
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(entry_from_row).collect()
    }

    /// Open a unit-of-work scope. Balance mutations and at most one job-row
    /// mutation commit together or roll back together; this is the only
    /// place such compound updates are permitted.
    pub async fn unit_of_work(&self) -> Result<UnitOfWork> {
        Ok(UnitOfWork {
            tx: self.pool.begin().await?,
            initial_credits: self.initial_credits,
        })
    }
}

/// An open all-or-nothing scope over ledger rows and one job row.
/// Dropping it without `commit` rolls everything back.
pub struct UnitOfWork {
    tx: Transaction<'static, Sqlite>,
    initial_credits: Credits,
}

impl UnitOfWork {
    pub async fn ensure_account(&mut self, id: &str) -> Result<Credits> {
        ensure_account_in(&mut self.tx, id, self.initial_credits).await
    }

    pub async fn debit(
        &mut self,
        id: &str,
        amount: Credits,
        job_id: Option<Uuid>,
    ) -> Result<bool> {
        debit_in(&mut self.tx, id, amount, job_id, EntryKind::JobDebit).await
    }

    pub async fn credit(
        &mut self,
        id: &str,
        amount: Credits,
        job_id: Option<Uuid>,
        kind: EntryKind,
    ) -> Result<()> {
        credit_in(&mut self.tx, id, amount, job_id, kind).await
    }

    /// Connection handle for the single permitted job-row mutation.
    pub fn job_conn(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

fn hash_secret(secret: &str) -> Result<String> {
    let salt_bytes: [u8; 16] = rand::random();
    let salt = SaltString::encode_b64(&salt_bytes)
        .map_err(|e| GridError::Internal(format!("salt encoding: {e}")))?;
    Ok(Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map_err(|e| GridError::Internal(format!("hashing secret: {e}")))?
        .to_string())
}

async fn ensure_account_in(
    conn: &mut SqliteConnection,
    id: &str,
    initial: Credits,
) -> Result<Credits> {
    let now = Utc::now();
    let inserted = sqlx::query(
        "INSERT INTO accounts (id, balance_micro, auth_hash, updated_at) \
         VALUES (?, ?, NULL, ?) ON CONFLICT(id) DO NOTHING",
    )
    .bind(id)
    .bind(initial.micro())
    .bind(now)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if inserted > 0 && initial.micro() > 0 {
        append_entry(conn, id, None, initial, EntryKind::Grant).await?;
        tracing::info!(account_id = id, balance = %initial, "Account created");
    }

    let row = sqlx::query("SELECT balance_micro FROM accounts WHERE id = ?")
        .bind(id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(Credits::from_micro(row.get::<i64, _>(0)))
}

async fn debit_in(
    conn: &mut SqliteConnection,
    id: &str,
    amount: Credits,
    job_id: Option<Uuid>,
    kind: EntryKind,
) -> Result<bool> {
    if amount <= Credits::ZERO {
        return Ok(true);
    }
    let now = Utc::now();
    let result = sqlx::query(
        "UPDATE accounts SET balance_micro = balance_micro - ?, updated_at = ? \
         WHERE id = ? AND balance_micro >= ?",
    )
    .bind(amount.micro())
    .bind(now)
    .bind(id)
    .bind(amount.micro())
    .execute(&mut *conn)
    .await?;
    if result.rows_affected() == 0 {
        return Ok(false);
    }
    append_entry(conn, id, job_id, Credits::from_micro(-amount.micro()), kind).await?;
    Ok(true)
}

async fn credit_in(
    conn: &mut SqliteConnection,
    id: &str,
    amount: Credits,
    job_id: Option<Uuid>,
    kind: EntryKind,
) -> Result<()> {
    if amount <= Credits::ZERO {
        return Ok(());
    }
    // Accounts created by a credit start from zero, not the signup grant.
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO accounts (id, balance_micro, auth_hash, updated_at) \
         VALUES (?, 0, NULL, ?) ON CONFLICT(id) DO NOTHING",
    )
    .bind(id)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    sqlx::query("UPDATE accounts SET balance_micro = balance_micro + ?, updated_at = ? WHERE id = ?")
        .bind(amount.micro())
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    append_entry(conn, id, job_id, amount, kind).await
}

async fn append_entry(
    conn: &mut SqliteConnection,
    account_id: &str,
    job_id: Option<Uuid>,
    amount: Credits,
    kind: EntryKind,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO ledger_entries (account_id, job_id, amount_micro, kind, created_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(account_id)
    .bind(job_id.map(|id| id.to_string()))
    .bind(amount.micro())
    .bind(kind.as_str())
    .bind(Utc::now())
    .execute(conn)
    .await?;
    Ok(())
}

fn entry_from_row(row: sqlx::sqlite::SqliteRow) -> Result<LedgerEntry> {
    let job_id = row
        .get::<Option<String>, _>("job_id")
        .map(|s| Uuid::parse_str(&s))
        .transpose()
        .map_err(|e| GridError::Internal(format!("corrupt job id in ledger: {e}")))?;
    Ok(LedgerEntry {
        account_id: row.get("account_id"),
        job_id,
        amount: Credits::from_micro(row.get::<i64, _>("amount_micro")),
        kind: row.get("kind"),
    })
}
