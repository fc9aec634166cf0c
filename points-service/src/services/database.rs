//! PostgreSQL implementation of [`Store`].
//!
//! Code consumption and refresh rotation are compare-and-delete /
//! compare-and-set statements inside a transaction; balance mutations lock the
//! member row with `SELECT ... FOR UPDATE` for the whole read-modify-write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

use super::metrics::DB_QUERY_DURATION;
use super::store::{Settlement, Store};
use super::ServiceError;
use crate::models::{
    AccessToken, AuthorizationCode, Direction, EntryKind, GatedDebit, GrantKind, LedgerEntry,
    LedgerTotals, Member, PartnerClient, RedemptionStatus, RefreshToken, ScopeSet, TokenPair,
    METHOD_CREDIT, METHOD_OTP_REDEEM, METHOD_REDEEM,
};

const ENTRY_COLUMNS: &str = "entry_id, member_id, client_id, direction, amount, method, reason, \
     description, status, otp_hash, otp_expiry_utc, created_utc, completed_utc";

/// Map a driver error, surfacing serialization failures and deadlocks as
/// retryable contention.
fn db_error(e: sqlx::Error) -> ServiceError {
    if let sqlx::Error::Database(ref db_err) = e {
        if matches!(db_err.code().as_deref(), Some("40001") | Some("40P01")) {
            return ServiceError::Contention;
        }
    }
    ServiceError::Database(e)
}

fn corrupt(what: &str, detail: impl std::fmt::Display) -> ServiceError {
    ServiceError::Internal(anyhow::anyhow!("Corrupt {} row: {}", what, detail))
}

fn parse_scopes(what: &str, values: &[String]) -> Result<ScopeSet, ServiceError> {
    ScopeSet::from_strings(values).map_err(|e| corrupt(what, e))
}

#[derive(FromRow)]
struct ClientRow {
    client_id: String,
    client_secret_hash: String,
    display_name: String,
    redirect_uris: Vec<String>,
    allowed_scopes: Vec<String>,
    grant_kinds: Vec<String>,
    active: bool,
    created_utc: DateTime<Utc>,
}

impl TryFrom<ClientRow> for PartnerClient {
    type Error = ServiceError;

    fn try_from(row: ClientRow) -> Result<Self, Self::Error> {
        let grant_kinds = row
            .grant_kinds
            .iter()
            .map(|g| g.parse::<GrantKind>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| corrupt("partner_clients", e))?;
        Ok(PartnerClient {
            allowed_scopes: parse_scopes("partner_clients", &row.allowed_scopes)?,
            client_id: row.client_id,
            client_secret_hash: row.client_secret_hash,
            display_name: row.display_name,
            redirect_uris: row.redirect_uris,
            grant_kinds,
            active: row.active,
            created_utc: row.created_utc,
        })
    }
}

#[derive(FromRow)]
struct CodeRow {
    code_hash: String,
    member_id: Uuid,
    client_id: String,
    redirect_uri: String,
    scopes: Vec<String>,
    expiry_utc: DateTime<Utc>,
    created_utc: DateTime<Utc>,
}

impl TryFrom<CodeRow> for AuthorizationCode {
    type Error = ServiceError;

    fn try_from(row: CodeRow) -> Result<Self, Self::Error> {
        Ok(AuthorizationCode {
            scopes: parse_scopes("authorization_codes", &row.scopes)?,
            code_hash: row.code_hash,
            member_id: row.member_id,
            client_id: row.client_id,
            redirect_uri: row.redirect_uri,
            expiry_utc: row.expiry_utc,
            created_utc: row.created_utc,
        })
    }
}

#[derive(FromRow)]
struct AccessTokenRow {
    token_hash: String,
    member_id: Uuid,
    client_id: String,
    scopes: Vec<String>,
    expiry_utc: Option<DateTime<Utc>>,
    revoked_utc: Option<DateTime<Utc>>,
    created_utc: DateTime<Utc>,
}

impl TryFrom<AccessTokenRow> for AccessToken {
    type Error = ServiceError;

    fn try_from(row: AccessTokenRow) -> Result<Self, Self::Error> {
        Ok(AccessToken {
            scopes: parse_scopes("access_tokens", &row.scopes)?,
            token_hash: row.token_hash,
            member_id: row.member_id,
            client_id: row.client_id,
            expiry_utc: row.expiry_utc,
            revoked_utc: row.revoked_utc,
            created_utc: row.created_utc,
        })
    }
}

#[derive(FromRow)]
struct RefreshTokenRow {
    token_hash: String,
    member_id: Uuid,
    client_id: String,
    scopes: Vec<String>,
    expiry_utc: DateTime<Utc>,
    revoked_utc: Option<DateTime<Utc>>,
    created_utc: DateTime<Utc>,
}

impl TryFrom<RefreshTokenRow> for RefreshToken {
    type Error = ServiceError;

    fn try_from(row: RefreshTokenRow) -> Result<Self, Self::Error> {
        Ok(RefreshToken {
            scopes: parse_scopes("refresh_tokens", &row.scopes)?,
            token_hash: row.token_hash,
            member_id: row.member_id,
            client_id: row.client_id,
            expiry_utc: row.expiry_utc,
            revoked_utc: row.revoked_utc,
            created_utc: row.created_utc,
        })
    }
}

#[derive(FromRow)]
struct EntryRow {
    entry_id: Uuid,
    member_id: Uuid,
    client_id: String,
    direction: String,
    amount: Decimal,
    method: String,
    reason: Option<String>,
    description: Option<String>,
    status: Option<String>,
    otp_hash: Option<String>,
    otp_expiry_utc: Option<DateTime<Utc>>,
    created_utc: DateTime<Utc>,
    completed_utc: Option<DateTime<Utc>>,
}

impl TryFrom<EntryRow> for LedgerEntry {
    type Error = ServiceError;

    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        let kind = match row.method.as_str() {
            METHOD_CREDIT => EntryKind::Credit { reason: row.reason },
            METHOD_REDEEM => EntryKind::InstantDebit,
            METHOD_OTP_REDEEM => {
                let (Some(status), Some(otp_hash), Some(otp_expiry_utc)) =
                    (row.status, row.otp_hash, row.otp_expiry_utc)
                else {
                    return Err(corrupt("ledger_entries", "gated debit without OTP state"));
                };
                EntryKind::GatedDebit(GatedDebit {
                    status: status
                        .parse::<RedemptionStatus>()
                        .map_err(|e| corrupt("ledger_entries", e))?,
                    otp_hash,
                    otp_expiry_utc,
                })
            }
            other => return Err(corrupt("ledger_entries", format!("method {}", other))),
        };
        let entry = LedgerEntry {
            entry_id: row.entry_id,
            member_id: row.member_id,
            client_id: row.client_id,
            amount: row.amount,
            kind,
            description: row.description,
            created_utc: row.created_utc,
            completed_utc: row.completed_utc,
        };
        if entry.direction().as_str() != row.direction {
            return Err(corrupt("ledger_entries", "direction does not match method"));
        }
        Ok(entry)
    }
}

async fn insert_entry(conn: &mut PgConnection, entry: &LedgerEntry) -> Result<(), ServiceError> {
    let gated = entry.gated();
    sqlx::query(
        r#"
        INSERT INTO ledger_entries (entry_id, member_id, client_id, direction, amount, method,
            reason, description, status, otp_hash, otp_expiry_utc, created_utc, completed_utc)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(entry.entry_id)
    .bind(entry.member_id)
    .bind(&entry.client_id)
    .bind(entry.direction().as_str())
    .bind(entry.amount)
    .bind(entry.method())
    .bind(entry.reason())
    .bind(&entry.description)
    .bind(entry.status().map(|s| s.as_str()))
    .bind(gated.map(|g| g.otp_hash.as_str()))
    .bind(gated.map(|g| g.otp_expiry_utc))
    .bind(entry.created_utc)
    .bind(entry.completed_utc)
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;
    Ok(())
}

async fn insert_pair(conn: &mut PgConnection, pair: &TokenPair) -> Result<(), ServiceError> {
    let access = &pair.access;
    sqlx::query(
        r#"
        INSERT INTO access_tokens (token_hash, member_id, client_id, scopes, expiry_utc, revoked_utc, created_utc)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(&access.token_hash)
    .bind(access.member_id)
    .bind(&access.client_id)
    .bind(access.scopes.to_strings())
    .bind(access.expiry_utc)
    .bind(access.revoked_utc)
    .bind(access.created_utc)
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;

    let refresh = &pair.refresh;
    sqlx::query(
        r#"
        INSERT INTO refresh_tokens (token_hash, member_id, client_id, scopes, expiry_utc, revoked_utc, created_utc)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(&refresh.token_hash)
    .bind(refresh.member_id)
    .bind(&refresh.client_id)
    .bind(refresh.scopes.to_strings())
    .bind(refresh.expiry_utc)
    .bind(refresh.revoked_utc)
    .bind(refresh.created_utc)
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;
    Ok(())
}

async fn lock_member(conn: &mut PgConnection, member_id: Uuid) -> Result<Member, ServiceError> {
    sqlx::query_as::<_, Member>("SELECT * FROM members WHERE member_id = $1 FOR UPDATE")
        .bind(member_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error)?
        .ok_or(ServiceError::NotFound("Member"))
}

async fn set_balance(
    conn: &mut PgConnection,
    member_id: Uuid,
    balance: Decimal,
) -> Result<(), ServiceError> {
    sqlx::query("UPDATE members SET points_balance = $2 WHERE member_id = $1")
        .bind(member_id)
        .bind(balance)
        .execute(&mut *conn)
        .await
        .map_err(db_error)?;
    Ok(())
}

async fn set_entry_status(
    conn: &mut PgConnection,
    entry_id: Uuid,
    status: RedemptionStatus,
    now: DateTime<Utc>,
) -> Result<u64, ServiceError> {
    let result = sqlx::query(
        r#"
        UPDATE ledger_entries SET status = $2, completed_utc = $3
        WHERE entry_id = $1 AND status = 'pending'
        "#,
    )
    .bind(entry_id)
    .bind(status.as_str())
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;
    Ok(result.rows_affected())
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "points-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, ServiceError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), ServiceError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl Store for Database {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), ServiceError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Members
    // -------------------------------------------------------------------------

    #[instrument(skip(self, member), fields(member_id = %member.member_id))]
    async fn insert_member(&self, member: &Member) -> Result<(), ServiceError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_member"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO members (member_id, email, display_name, password_hash, points_balance, active, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(member.member_id)
        .bind(&member.email)
        .bind(&member.display_name)
        .bind(&member.password_hash)
        .bind(member.points_balance)
        .bind(member.active)
        .bind(member.created_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                ServiceError::AlreadyExists("Member")
            }
            other => db_error(other),
        })?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_member(&self, member_id: Uuid) -> Result<Option<Member>, ServiceError> {
        sqlx::query_as::<_, Member>("SELECT * FROM members WHERE member_id = $1")
            .bind(member_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)
    }

    #[instrument(skip(self, email))]
    async fn find_member_by_email(&self, email: &str) -> Result<Option<Member>, ServiceError> {
        sqlx::query_as::<_, Member>("SELECT * FROM members WHERE email = $1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)
    }

    // -------------------------------------------------------------------------
    // Partner clients
    // -------------------------------------------------------------------------

    #[instrument(skip(self, client), fields(client_id = %client.client_id))]
    async fn insert_client(&self, client: &PartnerClient) -> Result<(), ServiceError> {
        let grant_kinds: Vec<String> = client.grant_kinds.iter().map(|g| g.to_string()).collect();
        sqlx::query(
            r#"
            INSERT INTO partner_clients (client_id, client_secret_hash, display_name, redirect_uris,
                allowed_scopes, grant_kinds, active, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&client.client_id)
        .bind(&client.client_secret_hash)
        .bind(&client.display_name)
        .bind(&client.redirect_uris)
        .bind(client.allowed_scopes.to_strings())
        .bind(grant_kinds)
        .bind(client.active)
        .bind(client.created_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                ServiceError::AlreadyExists("Client")
            }
            other => db_error(other),
        })?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_client(&self, client_id: &str) -> Result<Option<PartnerClient>, ServiceError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_client"])
            .start_timer();

        let row = sqlx::query_as::<_, ClientRow>(
            r#"
            SELECT client_id, client_secret_hash, display_name, redirect_uris, allowed_scopes,
                   grant_kinds, active, created_utc
            FROM partner_clients WHERE client_id = $1
            "#,
        )
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        timer.observe_duration();
        row.map(PartnerClient::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn set_member_active(&self, member_id: Uuid, active: bool) -> Result<bool, ServiceError> {
        let result = sqlx::query("UPDATE members SET active = $2 WHERE member_id = $1")
            .bind(member_id)
            .bind(active)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn set_client_active(&self, client_id: &str, active: bool) -> Result<bool, ServiceError> {
        let result = sqlx::query("UPDATE partner_clients SET active = $2 WHERE client_id = $1")
            .bind(client_id)
            .bind(active)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(result.rows_affected() > 0)
    }

    // -------------------------------------------------------------------------
    // Authorization codes
    // -------------------------------------------------------------------------

    #[instrument(skip(self, code), fields(member_id = %code.member_id, client_id = %code.client_id))]
    async fn insert_authorization_code(
        &self,
        code: &AuthorizationCode,
    ) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO authorization_codes (code_hash, member_id, client_id, redirect_uri, scopes, expiry_utc, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&code.code_hash)
        .bind(code.member_id)
        .bind(&code.client_id)
        .bind(&code.redirect_uri)
        .bind(code.scopes.to_strings())
        .bind(code.expiry_utc)
        .bind(code.created_utc)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn find_authorization_code(
        &self,
        code_hash: &str,
    ) -> Result<Option<AuthorizationCode>, ServiceError> {
        sqlx::query_as::<_, CodeRow>(
            r#"
            SELECT code_hash, member_id, client_id, redirect_uri, scopes, expiry_utc, created_utc
            FROM authorization_codes WHERE code_hash = $1
            "#,
        )
        .bind(code_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .map(AuthorizationCode::try_from)
        .transpose()
    }

    #[instrument(skip_all, fields(member_id = %pair.access.member_id, client_id = %pair.access.client_id))]
    async fn consume_authorization_code(
        &self,
        code_hash: &str,
        pair: &TokenPair,
    ) -> Result<bool, ServiceError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["consume_authorization_code"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(db_error)?;

        // Concurrent deletes of one row serialize; the loser sees zero rows.
        let deleted = sqlx::query("DELETE FROM authorization_codes WHERE code_hash = $1")
            .bind(code_hash)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?
            .rows_affected();

        if deleted == 0 {
            tx.rollback().await.ok();
            timer.observe_duration();
            return Ok(false);
        }

        insert_pair(&mut tx, pair).await?;
        tx.commit().await.map_err(db_error)?;

        timer.observe_duration();
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // Tokens
    // -------------------------------------------------------------------------

    #[instrument(skip_all)]
    async fn find_access_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<AccessToken>, ServiceError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_access_token"])
            .start_timer();

        let row = sqlx::query_as::<_, AccessTokenRow>(
            r#"
            SELECT token_hash, member_id, client_id, scopes, expiry_utc, revoked_utc, created_utc
            FROM access_tokens WHERE token_hash = $1
            "#,
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        timer.observe_duration();
        row.map(AccessToken::try_from).transpose()
    }

    #[instrument(skip_all)]
    async fn find_refresh_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshToken>, ServiceError> {
        sqlx::query_as::<_, RefreshTokenRow>(
            r#"
            SELECT token_hash, member_id, client_id, scopes, expiry_utc, revoked_utc, created_utc
            FROM refresh_tokens WHERE token_hash = $1
            "#,
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .map(RefreshToken::try_from)
        .transpose()
    }

    #[instrument(skip_all, fields(member_id = %pair.access.member_id, client_id = %pair.access.client_id))]
    async fn rotate_refresh_token(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
        pair: &TokenPair,
    ) -> Result<bool, ServiceError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["rotate_refresh_token"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let revoked = sqlx::query(
            r#"
            UPDATE refresh_tokens SET revoked_utc = $2
            WHERE token_hash = $1 AND revoked_utc IS NULL
            "#,
        )
        .bind(token_hash)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?
        .rows_affected();

        if revoked == 0 {
            tx.rollback().await.ok();
            timer.observe_duration();
            return Ok(false);
        }

        insert_pair(&mut tx, pair).await?;
        tx.commit().await.map_err(db_error)?;

        timer.observe_duration();
        Ok(true)
    }

    #[instrument(skip(self, token_hash))]
    async fn revoke_token(
        &self,
        token_hash: &str,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let mut revoked = 0;
        for table in ["access_tokens", "refresh_tokens"] {
            revoked += sqlx::query(&format!(
                "UPDATE {} SET revoked_utc = $3 \
                 WHERE token_hash = $1 AND client_id = $2 AND revoked_utc IS NULL",
                table
            ))
            .bind(token_hash)
            .bind(client_id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?
            .rows_affected();
        }
        tx.commit().await.map_err(db_error)?;
        Ok(revoked > 0)
    }

    // -------------------------------------------------------------------------
    // Ledger
    // -------------------------------------------------------------------------

    #[instrument(skip(self, entry), fields(member_id = %entry.member_id, client_id = %entry.client_id, method = entry.method()))]
    async fn apply_instant(&self, entry: &LedgerEntry) -> Result<Decimal, ServiceError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["apply_instant"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let member = lock_member(&mut tx, entry.member_id).await?;
        if !member.active {
            return Err(ServiceError::Forbidden("member account is inactive"));
        }
        let new_balance = member
            .balance_after(entry.direction(), entry.amount)
            .ok_or(ServiceError::InsufficientBalance {
                available: member.points_balance,
                requested: entry.amount,
            })?;

        set_balance(&mut tx, member.member_id, new_balance).await?;
        insert_entry(&mut tx, entry).await?;
        tx.commit().await.map_err(db_error)?;

        timer.observe_duration();

        info!(
            entry_id = %entry.entry_id,
            direction = %entry.direction(),
            amount = %entry.amount,
            "Ledger entry applied"
        );

        Ok(new_balance)
    }

    #[instrument(skip(self, entry), fields(member_id = %entry.member_id, client_id = %entry.client_id))]
    async fn insert_pending_debit(&self, entry: &LedgerEntry) -> Result<(), ServiceError> {
        let mut conn = self.pool.acquire().await.map_err(db_error)?;
        insert_entry(&mut conn, entry).await
    }

    #[instrument(skip(self))]
    async fn find_entry(&self, entry_id: Uuid) -> Result<Option<LedgerEntry>, ServiceError> {
        sqlx::query_as::<_, EntryRow>(&format!(
            "SELECT {} FROM ledger_entries WHERE entry_id = $1",
            ENTRY_COLUMNS
        ))
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .map(LedgerEntry::try_from)
        .transpose()
    }

    #[instrument(skip(self))]
    async fn settle_gated_debit(
        &self,
        entry_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Settlement, ServiceError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["settle_gated_debit"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(db_error)?;

        // Entry first, then member; no other path locks in the opposite order.
        let row = sqlx::query_as::<_, EntryRow>(&format!(
            "SELECT {} FROM ledger_entries WHERE entry_id = $1 FOR UPDATE",
            ENTRY_COLUMNS
        ))
        .bind(entry_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?;

        let Some(mut entry) = row.map(LedgerEntry::try_from).transpose()? else {
            return Ok(Settlement::NotFound);
        };

        let outcome = match entry.status() {
            None => Settlement::NotFound,
            Some(status) if !status.is_pending() => Settlement::NotPending(status),
            Some(_) if entry.otp_expired(now) => {
                set_entry_status(&mut tx, entry_id, RedemptionStatus::Expired, now).await?;
                Settlement::Expired
            }
            Some(_) => {
                let member = lock_member(&mut tx, entry.member_id).await?;
                if !member.active {
                    // dropping the transaction rolls back and releases both locks
                    return Err(ServiceError::Forbidden("member account is inactive"));
                }
                match member.balance_after(Direction::Debit, entry.amount) {
                    Some(new_balance) => {
                        set_balance(&mut tx, member.member_id, new_balance).await?;
                        set_entry_status(&mut tx, entry_id, RedemptionStatus::Approved, now)
                            .await?;
                        entry.close(RedemptionStatus::Approved, now);
                        Settlement::Approved { entry, new_balance }
                    }
                    None => {
                        set_entry_status(&mut tx, entry_id, RedemptionStatus::Rejected, now)
                            .await?;
                        Settlement::InsufficientBalance {
                            available: member.points_balance,
                        }
                    }
                }
            }
        };

        tx.commit().await.map_err(db_error)?;
        timer.observe_duration();
        Ok(outcome)
    }

    #[instrument(skip(self))]
    async fn close_pending(
        &self,
        entry_id: Uuid,
        status: RedemptionStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        let mut conn = self.pool.acquire().await.map_err(db_error)?;
        Ok(set_entry_status(&mut conn, entry_id, status, now).await? > 0)
    }

    #[instrument(skip(self))]
    async fn expire_pending(&self, now: DateTime<Utc>) -> Result<u64, ServiceError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["expire_pending"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE ledger_entries SET status = 'expired', completed_utc = $1
            WHERE status = 'pending' AND otp_expiry_utc <= $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        timer.observe_duration();
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn list_entries(
        &self,
        member_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<LedgerEntry>, ServiceError> {
        sqlx::query_as::<_, EntryRow>(&format!(
            "SELECT {} FROM ledger_entries WHERE member_id = $1 \
             ORDER BY created_utc DESC, entry_id DESC LIMIT $2 OFFSET $3",
            ENTRY_COLUMNS
        ))
        .bind(member_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?
        .into_iter()
        .map(LedgerEntry::try_from)
        .collect()
    }

    #[instrument(skip(self))]
    async fn list_pending(&self, member_id: Uuid) -> Result<Vec<LedgerEntry>, ServiceError> {
        sqlx::query_as::<_, EntryRow>(&format!(
            "SELECT {} FROM ledger_entries WHERE member_id = $1 AND status = 'pending' \
             ORDER BY created_utc DESC",
            ENTRY_COLUMNS
        ))
        .bind(member_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?
        .into_iter()
        .map(LedgerEntry::try_from)
        .collect()
    }

    #[instrument(skip(self))]
    async fn ledger_totals(&self, member_id: Uuid) -> Result<LedgerTotals, ServiceError> {
        let (credits, debits) = sqlx::query_as::<_, (Decimal, Decimal)>(
            r#"
            SELECT
                COALESCE(SUM(amount) FILTER (WHERE direction = 'credit'), 0),
                COALESCE(SUM(amount) FILTER (WHERE direction = 'debit'), 0)
            FROM ledger_entries
            WHERE member_id = $1 AND (status IS NULL OR status = 'approved')
            "#,
        )
        .bind(member_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(LedgerTotals { credits, debits })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::error::{DatabaseError, ErrorKind};
    use std::borrow::Cow;
    use std::error::Error as StdError;

    #[derive(Debug)]
    struct PgFailure(&'static str);

    impl std::fmt::Display for PgFailure {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "SQLSTATE {}", self.0)
        }
    }

    impl StdError for PgFailure {}

    impl DatabaseError for PgFailure {
        fn message(&self) -> &str {
            "simulated failure"
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            Some(Cow::Borrowed(self.0))
        }

        fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> ErrorKind {
            ErrorKind::Other
        }
    }

    fn failure(code: &'static str) -> sqlx::Error {
        sqlx::Error::Database(Box::new(PgFailure(code)))
    }

    #[test]
    fn serialization_failure_and_deadlock_are_contention() {
        assert!(matches!(db_error(failure("40001")), ServiceError::Contention));
        assert!(matches!(db_error(failure("40P01")), ServiceError::Contention));
    }

    #[test]
    fn other_failures_stay_database_errors() {
        assert!(matches!(db_error(failure("23505")), ServiceError::Database(_)));
        assert!(matches!(db_error(sqlx::Error::RowNotFound), ServiceError::Database(_)));
    }
}
