//! Postgres-backed ticket repository.
//!
//! Each operation is one sqlx transaction. Rows are locked with
//! `SELECT ... FOR UPDATE` at the start, always in the order
//! user -> ticket -> tier(s); upgrade locks both tiers in a single statement
//! ordered by id. The domain decision is then made on the locked copies and the
//! changed rows are written back before commit.
//!
//! Dropping an operation future mid-transaction (per-message timeout) drops the
//! `Transaction`, which rolls it back.
//!
//! ## Error Mapping
//!
//! | Failure | RepositoryError |
//! |---------|-----------------|
//! | Business rule rejected the change | `Rule` (transaction rolled back on drop) |
//! | Any sqlx error (connectivity, `40001`, `40P01`, pool closed) | `Database` |
//! | Unknown `status` value in a row | `Database` (`ColumnDecode`) |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgConnection, PgPool, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use conreg_core::{TicketId, TierId, UserId};
use conreg_tickets::{
    Badge, Change, TicketError, TicketLookup, TicketStatus, TicketTier, User, UserTicket,
    check_purchaser,
};

use super::{RepositoryError, RepositoryResult, TicketRepository};

const USER_COLUMNS: &str =
    "id, is_blacklisted, blacklisted_at, blacklist_reason, denial_count, is_deleted";

const TIER_COLUMNS: &str = "id, code, stock, price, is_active, is_deleted";

const TICKET_COLUMNS: &str = "id, user_id, tier_id, sequence_number, reference_code, status, \
     con_badge_name, badge_image, is_fursuiter, is_fursuit_staff, denial_reason, \
     approved_at, approved_by, denied_at, denied_by, previous_tier_id, \
     previous_reference_code, is_deleted, created_at, updated_at";

/// Postgres ticket repository over a shared connection pool.
#[derive(Debug, Clone)]
pub struct PostgresTicketRepository {
    pool: PgPool,
}

impl PostgresTicketRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TicketRepository for PostgresTicketRepository {
    #[instrument(skip(self), fields(user_id = %user_id, tier_id = %tier_id), err)]
    async fn purchase(&self, user_id: UserId, tier_id: TierId) -> RepositoryResult<Change<UserTicket>> {
        let mut tx = self.pool.begin().await.map_err(RepositoryError::database("begin"))?;

        let user = lock_user(&mut tx, user_id)
            .await?
            .ok_or(TicketError::UserNotFound(user_id))?;
        let existing = lock_active_ticket(&mut tx, user_id)
            .await?
            .filter(|t| t.status != TicketStatus::Denied);
        if let Some(ticket) = check_purchaser(&user, existing, tier_id)? {
            debug!(ticket_id = %ticket.id, "purchase already applied");
            return Ok(Change::Unchanged(ticket));
        }

        let mut tier = lock_tier(&mut tx, tier_id)
            .await?
            .ok_or(TicketError::TicketTierNotFound(tier_id))?;
        tier.take_one()?;
        let sequence = next_sequence(&mut tx, tier_id).await?;
        let ticket = UserTicket::issue(user_id, &tier, sequence, Utc::now());

        save_tier_stock(&mut tx, &tier).await?;
        insert_ticket(&mut tx, &ticket).await?;
        tx.commit().await.map_err(RepositoryError::database("commit"))?;
        Ok(Change::Applied(ticket))
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn confirm_payment(&self, user_id: UserId) -> RepositoryResult<Change<UserTicket>> {
        let mut tx = self.pool.begin().await.map_err(RepositoryError::database("begin"))?;
        lock_user(&mut tx, user_id).await?;

        let ticket = require_active_ticket(&mut tx, user_id).await?;
        let change = ticket.confirm_payment(Utc::now())?;
        if change.is_applied() {
            save_ticket(&mut tx, change.value()).await?;
            tx.commit().await.map_err(RepositoryError::database("commit"))?;
        }
        Ok(change)
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn cancel(&self, user_id: UserId) -> RepositoryResult<Change<Option<UserTicket>>> {
        let mut tx = self.pool.begin().await.map_err(RepositoryError::database("begin"))?;
        lock_user(&mut tx, user_id).await?;

        let Some(ticket) = lock_active_ticket(&mut tx, user_id).await? else {
            return Ok(Change::Unchanged(None));
        };
        ticket.ensure_cancellable()?;

        let mut tier = lock_tier(&mut tx, ticket.tier_id)
            .await?
            .ok_or(TicketError::TicketTierNotFound(ticket.tier_id))?;
        tier.restock_one();
        save_tier_stock(&mut tx, &tier).await?;

        sqlx::query("DELETE FROM user_tickets WHERE id = $1")
            .bind(Uuid::from(ticket.id))
            .execute(&mut *tx)
            .await
            .map_err(RepositoryError::database("delete_ticket"))?;

        tx.commit().await.map_err(RepositoryError::database("commit"))?;
        Ok(Change::Applied(Some(ticket)))
    }

    #[instrument(skip(self, badge), fields(user_id = %user_id), err)]
    async fn update_badge(&self, user_id: UserId, badge: Badge) -> RepositoryResult<Change<UserTicket>> {
        let mut tx = self.pool.begin().await.map_err(RepositoryError::database("begin"))?;
        lock_user(&mut tx, user_id).await?;

        let ticket = require_active_ticket(&mut tx, user_id).await?;
        let change = ticket.update_badge(badge, Utc::now())?;
        if change.is_applied() {
            save_ticket(&mut tx, change.value()).await?;
            tx.commit().await.map_err(RepositoryError::database("commit"))?;
        }
        Ok(change)
    }

    #[instrument(skip(self), fields(ticket_id = %ticket_id, staff_id = %staff_id), err)]
    async fn approve(&self, ticket_id: TicketId, staff_id: UserId) -> RepositoryResult<Change<UserTicket>> {
        let mut tx = self.pool.begin().await.map_err(RepositoryError::database("begin"))?;

        let ticket = lock_ticket(&mut tx, ticket_id)
            .await?
            .ok_or(TicketError::TicketNotFound(TicketLookup::ById(ticket_id)))?;
        let change = ticket.approve(staff_id, Utc::now())?;
        if change.is_applied() {
            save_ticket(&mut tx, change.value()).await?;
            tx.commit().await.map_err(RepositoryError::database("commit"))?;
        }
        Ok(change)
    }

    #[instrument(skip(self, reason), fields(ticket_id = %ticket_id, staff_id = %staff_id), err)]
    async fn deny(
        &self,
        ticket_id: TicketId,
        staff_id: UserId,
        reason: &str,
    ) -> RepositoryResult<Change<UserTicket>> {
        let mut tx = self.pool.begin().await.map_err(RepositoryError::database("begin"))?;

        // The owner never changes, so reading it unlocked first keeps the
        // user -> ticket lock order.
        let owner_id: Option<Uuid> =
            sqlx::query_scalar("SELECT user_id FROM user_tickets WHERE id = $1 AND is_deleted = false")
                .bind(Uuid::from(ticket_id))
                .fetch_optional(&mut *tx)
                .await
                .map_err(RepositoryError::database("load_ticket_owner"))?;
        let owner_id = UserId::from(owner_id.ok_or(TicketError::TicketNotFound(TicketLookup::ById(ticket_id)))?);
        let owner = lock_user(&mut tx, owner_id).await?;

        let ticket = lock_ticket(&mut tx, ticket_id)
            .await?
            .ok_or(TicketError::TicketNotFound(TicketLookup::ById(ticket_id)))?;
        let now = Utc::now();
        let change = ticket.deny(staff_id, reason, now)?;
        if !change.is_applied() {
            return Ok(change);
        }

        let mut owner = owner
            .filter(|u| !u.is_deleted)
            .ok_or(TicketError::UserNotFound(owner_id))?;
        let mut tier = lock_tier(&mut tx, change.value().tier_id)
            .await?
            .ok_or(TicketError::TicketTierNotFound(change.value().tier_id))?;

        tier.restock_one();
        if owner.record_denial(now) {
            debug!(user_id = %owner.id, "denial threshold reached, user blacklisted");
        }

        save_ticket(&mut tx, change.value()).await?;
        save_tier_stock(&mut tx, &tier).await?;
        save_user_blacklist(&mut tx, &owner).await?;
        tx.commit().await.map_err(RepositoryError::database("commit"))?;
        Ok(change)
    }

    #[instrument(skip(self), fields(user_id = %user_id, tier_id = %tier_id), err)]
    async fn upgrade(&self, user_id: UserId, tier_id: TierId) -> RepositoryResult<Change<UserTicket>> {
        let mut tx = self.pool.begin().await.map_err(RepositoryError::database("begin"))?;
        lock_user(&mut tx, user_id).await?;

        let ticket = require_active_ticket(&mut tx, user_id).await?;
        if ticket.tier_id == tier_id {
            return Ok(Change::Unchanged(ticket));
        }
        ticket.ensure_upgradable()?;

        let (mut current, mut target) = lock_tier_pair(&mut tx, ticket.tier_id, tier_id).await?;
        let sequence = next_sequence(&mut tx, tier_id).await?;
        let change = ticket.upgrade(&mut current, &mut target, sequence, Utc::now())?;
        if change.is_applied() {
            save_tier_stock(&mut tx, &current).await?;
            save_tier_stock(&mut tx, &target).await?;
            save_ticket(&mut tx, change.value()).await?;
            tx.commit().await.map_err(RepositoryError::database("commit"))?;
        }
        Ok(change)
    }

    #[instrument(skip(self, reason), fields(user_id = %user_id), err)]
    async fn blacklist(&self, user_id: UserId, reason: Option<&str>) -> RepositoryResult<()> {
        let mut tx = self.pool.begin().await.map_err(RepositoryError::database("begin"))?;
        let mut user = lock_live_user(&mut tx, user_id).await?;
        user.blacklist(reason.map(str::to_string), Utc::now());
        save_user_blacklist(&mut tx, &user).await?;
        tx.commit().await.map_err(RepositoryError::database("commit"))?;
        Ok(())
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn unblacklist(&self, user_id: UserId) -> RepositoryResult<()> {
        let mut tx = self.pool.begin().await.map_err(RepositoryError::database("begin"))?;
        let mut user = lock_live_user(&mut tx, user_id).await?;
        user.unblacklist();
        save_user_blacklist(&mut tx, &user).await?;
        tx.commit().await.map_err(RepositoryError::database("commit"))?;
        Ok(())
    }
}

async fn lock_live_user(conn: &mut PgConnection, user_id: UserId) -> RepositoryResult<User> {
    let user = lock_user(conn, user_id)
        .await?
        .filter(|u| !u.is_deleted)
        .ok_or(TicketError::UserNotFound(user_id))?;
    Ok(user)
}

async fn lock_user(conn: &mut PgConnection, user_id: UserId) -> RepositoryResult<Option<User>> {
    let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1 FOR UPDATE"))
        .bind(Uuid::from(user_id))
        .fetch_optional(&mut *conn)
        .await
        .map_err(RepositoryError::database("lock_user"))?;
    row.map(|r| UserRow::from_row(&r).map(Into::into))
        .transpose()
        .map_err(RepositoryError::database("decode_user"))
}

/// The user's non-deleted ticket, non-denied first, newest first.
async fn lock_active_ticket(conn: &mut PgConnection, user_id: UserId) -> RepositoryResult<Option<UserTicket>> {
    let row = sqlx::query(&format!(
        "SELECT {TICKET_COLUMNS} FROM user_tickets \
         WHERE user_id = $1 AND is_deleted = false \
         ORDER BY (status = 'denied') ASC, created_at DESC, id DESC \
         LIMIT 1 FOR UPDATE"
    ))
    .bind(Uuid::from(user_id))
    .fetch_optional(&mut *conn)
    .await
    .map_err(RepositoryError::database("lock_active_ticket"))?;
    row.map(|r| decode_ticket(&r)).transpose()
}

async fn require_active_ticket(conn: &mut PgConnection, user_id: UserId) -> RepositoryResult<UserTicket> {
    lock_active_ticket(conn, user_id)
        .await?
        .ok_or_else(|| TicketError::TicketNotFound(TicketLookup::ByUser(user_id)).into())
}

async fn lock_ticket(conn: &mut PgConnection, ticket_id: TicketId) -> RepositoryResult<Option<UserTicket>> {
    let row = sqlx::query(&format!(
        "SELECT {TICKET_COLUMNS} FROM user_tickets WHERE id = $1 AND is_deleted = false FOR UPDATE"
    ))
    .bind(Uuid::from(ticket_id))
    .fetch_optional(&mut *conn)
    .await
    .map_err(RepositoryError::database("lock_ticket"))?;
    row.map(|r| decode_ticket(&r)).transpose()
}

async fn lock_tier(conn: &mut PgConnection, tier_id: TierId) -> RepositoryResult<Option<TicketTier>> {
    let row = sqlx::query(&format!("SELECT {TIER_COLUMNS} FROM ticket_tiers WHERE id = $1 FOR UPDATE"))
        .bind(Uuid::from(tier_id))
        .fetch_optional(&mut *conn)
        .await
        .map_err(RepositoryError::database("lock_tier"))?;
    row.map(|r| TierRow::from_row(&r).map(Into::into))
        .transpose()
        .map_err(RepositoryError::database("decode_tier"))
}

/// Lock two distinct tiers in id order; returns `(current, target)`.
async fn lock_tier_pair(
    conn: &mut PgConnection,
    current_id: TierId,
    target_id: TierId,
) -> RepositoryResult<(TicketTier, TicketTier)> {
    let rows = sqlx::query(&format!(
        "SELECT {TIER_COLUMNS} FROM ticket_tiers WHERE id = ANY($1) ORDER BY id FOR UPDATE"
    ))
    .bind(vec![Uuid::from(current_id), Uuid::from(target_id)])
    .fetch_all(&mut *conn)
    .await
    .map_err(RepositoryError::database("lock_tiers"))?;

    let mut current = None;
    let mut target = None;
    for row in rows {
        let tier: TicketTier = TierRow::from_row(&row)
            .map_err(RepositoryError::database("decode_tier"))?
            .into();
        if tier.id == current_id {
            current = Some(tier);
        } else if tier.id == target_id {
            target = Some(tier);
        }
    }

    let current = current.ok_or(TicketError::TicketTierNotFound(current_id))?;
    let target = target.ok_or(TicketError::TicketTierNotFound(target_id))?;
    Ok((current, target))
}

/// Next per-tier sequence number. Only call with the tier row locked.
async fn next_sequence(conn: &mut PgConnection, tier_id: TierId) -> RepositoryResult<i32> {
    sqlx::query_scalar("SELECT COALESCE(MAX(sequence_number), 0) + 1 FROM user_tickets WHERE tier_id = $1")
        .bind(Uuid::from(tier_id))
        .fetch_one(&mut *conn)
        .await
        .map_err(RepositoryError::database("next_sequence"))
}

async fn save_tier_stock(conn: &mut PgConnection, tier: &TicketTier) -> RepositoryResult<()> {
    sqlx::query("UPDATE ticket_tiers SET stock = $2 WHERE id = $1")
        .bind(Uuid::from(tier.id))
        .bind(tier.stock)
        .execute(&mut *conn)
        .await
        .map_err(RepositoryError::database("update_tier_stock"))?;
    Ok(())
}

async fn save_user_blacklist(conn: &mut PgConnection, user: &User) -> RepositoryResult<()> {
    sqlx::query(
        r#"
        UPDATE users
        SET denial_count = $2, is_blacklisted = $3, blacklisted_at = $4, blacklist_reason = $5
        WHERE id = $1
        "#,
    )
    .bind(Uuid::from(user.id))
    .bind(user.denial_count)
    .bind(user.is_blacklisted)
    .bind(user.blacklisted_at)
    .bind(user.blacklist_reason.as_deref())
    .execute(&mut *conn)
    .await
    .map_err(RepositoryError::database("update_user"))?;
    Ok(())
}

async fn insert_ticket(conn: &mut PgConnection, t: &UserTicket) -> RepositoryResult<()> {
    sqlx::query(&format!(
        "INSERT INTO user_tickets ({TICKET_COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)"
    ))
    .bind(Uuid::from(t.id))
    .bind(Uuid::from(t.user_id))
    .bind(Uuid::from(t.tier_id))
    .bind(t.sequence_number)
    .bind(&t.reference_code)
    .bind(t.status.as_str())
    .bind(t.badge.con_badge_name.as_deref())
    .bind(t.badge.badge_image.as_deref())
    .bind(t.badge.is_fursuiter)
    .bind(t.badge.is_fursuit_staff)
    .bind(t.denial_reason.as_deref())
    .bind(t.approved_at)
    .bind(t.approved_by.map(Uuid::from))
    .bind(t.denied_at)
    .bind(t.denied_by.map(Uuid::from))
    .bind(t.previous_tier_id.map(Uuid::from))
    .bind(t.previous_reference_code.as_deref())
    .bind(t.is_deleted)
    .bind(t.created_at)
    .bind(t.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(RepositoryError::database("insert_ticket"))?;
    Ok(())
}

async fn save_ticket(conn: &mut PgConnection, t: &UserTicket) -> RepositoryResult<()> {
    sqlx::query(
        r#"
        UPDATE user_tickets
        SET tier_id = $2,
            sequence_number = $3,
            reference_code = $4,
            status = $5,
            con_badge_name = $6,
            badge_image = $7,
            is_fursuiter = $8,
            is_fursuit_staff = $9,
            denial_reason = $10,
            approved_at = $11,
            approved_by = $12,
            denied_at = $13,
            denied_by = $14,
            previous_tier_id = $15,
            previous_reference_code = $16,
            updated_at = $17
        WHERE id = $1
        "#,
    )
    .bind(Uuid::from(t.id))
    .bind(Uuid::from(t.tier_id))
    .bind(t.sequence_number)
    .bind(&t.reference_code)
    .bind(t.status.as_str())
    .bind(t.badge.con_badge_name.as_deref())
    .bind(t.badge.badge_image.as_deref())
    .bind(t.badge.is_fursuiter)
    .bind(t.badge.is_fursuit_staff)
    .bind(t.denial_reason.as_deref())
    .bind(t.approved_at)
    .bind(t.approved_by.map(Uuid::from))
    .bind(t.denied_at)
    .bind(t.denied_by.map(Uuid::from))
    .bind(t.previous_tier_id.map(Uuid::from))
    .bind(t.previous_reference_code.as_deref())
    .bind(t.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(RepositoryError::database("update_ticket"))?;
    Ok(())
}

fn decode_ticket(row: &PgRow) -> RepositoryResult<UserTicket> {
    TicketRow::from_row(row)
        .and_then(UserTicket::try_from)
        .map_err(RepositoryError::database("decode_ticket"))
}

// SQLx row types

#[derive(Debug)]
struct UserRow {
    id: Uuid,
    is_blacklisted: bool,
    blacklisted_at: Option<DateTime<Utc>>,
    blacklist_reason: Option<String>,
    denial_count: i32,
    is_deleted: bool,
}

impl<'r> FromRow<'r, PgRow> for UserRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(UserRow {
            id: row.try_get("id")?,
            is_blacklisted: row.try_get("is_blacklisted")?,
            blacklisted_at: row.try_get("blacklisted_at")?,
            blacklist_reason: row.try_get("blacklist_reason")?,
            denial_count: row.try_get("denial_count")?,
            is_deleted: row.try_get("is_deleted")?,
        })
    }
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id.into(),
            is_blacklisted: row.is_blacklisted,
            blacklisted_at: row.blacklisted_at,
            blacklist_reason: row.blacklist_reason,
            denial_count: row.denial_count,
            is_deleted: row.is_deleted,
        }
    }
}

#[derive(Debug)]
struct TierRow {
    id: Uuid,
    code: String,
    stock: i32,
    price: i64,
    is_active: bool,
    is_deleted: bool,
}

impl<'r> FromRow<'r, PgRow> for TierRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(TierRow {
            id: row.try_get("id")?,
            code: row.try_get("code")?,
            stock: row.try_get("stock")?,
            price: row.try_get("price")?,
            is_active: row.try_get("is_active")?,
            is_deleted: row.try_get("is_deleted")?,
        })
    }
}

impl From<TierRow> for TicketTier {
    fn from(row: TierRow) -> Self {
        TicketTier {
            id: row.id.into(),
            code: row.code,
            stock: row.stock,
            price: row.price,
            is_active: row.is_active,
            is_deleted: row.is_deleted,
        }
    }
}

#[derive(Debug)]
struct TicketRow {
    id: Uuid,
    user_id: Uuid,
    tier_id: Uuid,
    sequence_number: i32,
    reference_code: String,
    status: String,
    con_badge_name: Option<String>,
    badge_image: Option<String>,
    is_fursuiter: bool,
    is_fursuit_staff: bool,
    denial_reason: Option<String>,
    approved_at: Option<DateTime<Utc>>,
    approved_by: Option<Uuid>,
    denied_at: Option<DateTime<Utc>>,
    denied_by: Option<Uuid>,
    previous_tier_id: Option<Uuid>,
    previous_reference_code: Option<String>,
    is_deleted: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for TicketRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(TicketRow {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            tier_id: row.try_get("tier_id")?,
            sequence_number: row.try_get("sequence_number")?,
            reference_code: row.try_get("reference_code")?,
            status: row.try_get("status")?,
            con_badge_name: row.try_get("con_badge_name")?,
            badge_image: row.try_get("badge_image")?,
            is_fursuiter: row.try_get("is_fursuiter")?,
            is_fursuit_staff: row.try_get("is_fursuit_staff")?,
            denial_reason: row.try_get("denial_reason")?,
            approved_at: row.try_get("approved_at")?,
            approved_by: row.try_get("approved_by")?,
            denied_at: row.try_get("denied_at")?,
            denied_by: row.try_get("denied_by")?,
            previous_tier_id: row.try_get("previous_tier_id")?,
            previous_reference_code: row.try_get("previous_reference_code")?,
            is_deleted: row.try_get("is_deleted")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<TicketRow> for UserTicket {
    type Error = sqlx::Error;

    fn try_from(row: TicketRow) -> Result<Self, Self::Error> {
        let status = row.status.parse::<TicketStatus>().map_err(|e| sqlx::Error::ColumnDecode {
            index: "status".to_string(),
            source: Box::new(e),
        })?;

        Ok(UserTicket {
            id: row.id.into(),
            user_id: row.user_id.into(),
            tier_id: row.tier_id.into(),
            sequence_number: row.sequence_number,
            reference_code: row.reference_code,
            status,
            badge: Badge {
                con_badge_name: row.con_badge_name,
                badge_image: row.badge_image,
                is_fursuiter: row.is_fursuiter,
                is_fursuit_staff: row.is_fursuit_staff,
            },
            denial_reason: row.denial_reason,
            approved_at: row.approved_at,
            approved_by: row.approved_by.map(Into::into),
            denied_at: row.denied_at,
            denied_by: row.denied_by.map(Into::into),
            previous_tier_id: row.previous_tier_id.map(Into::into),
            previous_reference_code: row.previous_reference_code,
            is_deleted: row.is_deleted,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
