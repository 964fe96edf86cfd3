use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::{Span, instrument};

use cabinet_booking::error::RepositoryError;
use cabinet_booking::patch::{BookingPatch, guard};
use cabinet_booking::repository::{
    BookingFilter, BookingRepository, RegressionMonitor, report_regressions,
};
use cabinet_booking::Booking;
use cabinet_core::{AggregateRoot, BookingId, LeadId};

use super::map_sqlx_error;

/// Booking repository over the `bookings` table.
///
/// The whole aggregate lives in the `state` column; the filter columns are
/// rewritten from it on every write. Single-row updates lock the row with
/// `SELECT ... FOR UPDATE` so the regression guard always compares against
/// the committed state. `amocrm_id` is unique, so each CRM lead maps to at
/// most one booking.
#[derive(Clone)]
pub struct PostgresBookingRepository {
    pool: Arc<PgPool>,
    monitor: Option<Arc<dyn RegressionMonitor>>,
}

impl PostgresBookingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            monitor: None,
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn RegressionMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, RepositoryError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    async fn commit(tx: Transaction<'static, Postgres>) -> Result<(), RepositoryError> {
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn insert_new(&self, patch: &BookingPatch) -> Result<Booking, RepositoryError> {
        let mut tx = self.begin().await?;
        let booking = insert_row(&mut tx, patch, false)
            .await?
            .ok_or_else(|| RepositoryError::conflict("booking insert skipped"))?;
        Self::commit(tx).await?;
        Ok(booking)
    }

    /// Creates the booking for `lead` or, when a row already holds the lead,
    /// applies the guarded `patch` to it. Both paths run in one transaction,
    /// so concurrent deliveries for the same lead end up on one row.
    async fn upsert_by_lead(
        &self,
        lead: LeadId,
        seeded: BookingPatch,
        patch: BookingPatch,
    ) -> Result<(Booking, bool), RepositoryError> {
        let mut tx = self.begin().await?;
        if let Some(created) = insert_row(&mut tx, &seeded, true).await? {
            Self::commit(tx).await?;
            return Ok((created, true));
        }

        let row = sqlx::query("SELECT state FROM bookings WHERE amocrm_id = $1 FOR UPDATE")
            .bind(lead.get())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_booking_by_lead", e))?;
        let mut stored = decode(&row)?;
        let outcome = guard(patch);
        report_regressions(self.monitor.as_ref(), &stored, &outcome).await;
        outcome.applied.apply_to(&mut stored);
        stored.bump_version();
        write_row(&mut tx, &stored).await?;
        Self::commit(tx).await?;
        Ok((stored, false))
    }
}

const INSERT_BOOKING: &str = r#"
    INSERT INTO bookings (
        id, version, amocrm_id, user_id, property_id, active, price_payed,
        should_be_deactivated_by_timer, expires, state, updated_at
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, now())
"#;

/// Inserts a row built from `patch`. A duplicate `amocrm_id` is a
/// `Conflict`, or `None` with `skip_taken_lead`.
async fn insert_row(
    tx: &mut Transaction<'static, Postgres>,
    patch: &BookingPatch,
    skip_taken_lead: bool,
) -> Result<Option<Booking>, RepositoryError> {
    let id: i64 = sqlx::query_scalar("SELECT nextval('bookings_id_seq')")
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("next_booking_id", e))?;

    let mut booking = Booking::new(BookingId::new(id), Utc::now());
    patch.apply_to(&mut booking);
    booking.bump_version();

    let sql = if skip_taken_lead {
        format!("{INSERT_BOOKING} ON CONFLICT (amocrm_id) DO NOTHING")
    } else {
        INSERT_BOOKING.to_string()
    };
    let inserted = sqlx::query(&sql)
        .bind(id)
        .bind(version_column(&booking))
        .bind(booking.amocrm_id.map(|v| v.get()))
        .bind(booking.user_id.map(|v| v.get()))
        .bind(booking.property_id.map(|v| v.get()))
        .bind(booking.active)
        .bind(booking.price_payed)
        .bind(booking.should_be_deactivated_by_timer)
        .bind(booking.expires)
        .bind(Json(&booking))
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_booking", e))?
        .rows_affected();

    Ok((inserted > 0).then_some(booking))
}

fn version_column(booking: &Booking) -> i64 {
    i64::try_from(booking.version()).unwrap_or(i64::MAX)
}

fn decode(row: &sqlx::postgres::PgRow) -> Result<Booking, RepositoryError> {
    let Json(booking): Json<Booking> = row
        .try_get("state")
        .map_err(|e| RepositoryError::backend(format!("failed to deserialize booking row: {e}")))?;
    Ok(booking)
}

async fn write_row(
    tx: &mut Transaction<'static, Postgres>,
    booking: &Booking,
) -> Result<(), RepositoryError> {
    sqlx::query(
        r#"
        UPDATE bookings SET
            version = $2,
            amocrm_id = $3,
            user_id = $4,
            property_id = $5,
            active = $6,
            price_payed = $7,
            should_be_deactivated_by_timer = $8,
            expires = $9,
            state = $10,
            updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(booking.id_typed().get())
    .bind(version_column(booking))
    .bind(booking.amocrm_id.map(|v| v.get()))
    .bind(booking.user_id.map(|v| v.get()))
    .bind(booking.property_id.map(|v| v.get()))
    .bind(booking.active)
    .bind(booking.price_payed)
    .bind(booking.should_be_deactivated_by_timer)
    .bind(booking.expires)
    .bind(Json(booking))
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("update_booking", e))?;
    Ok(())
}

/// Appends ` AND <criterion>` for every criterion set on `filter`.
fn push_criteria(qb: &mut QueryBuilder<'_, Postgres>, filter: &BookingFilter) {
    if let Some(ids) = &filter.ids {
        let ids: Vec<i64> = ids.iter().map(|id| id.get()).collect();
        qb.push(" AND id = ANY(").push_bind(ids).push(")");
    }
    if let Some(lead) = filter.amocrm_id {
        qb.push(" AND amocrm_id IS NOT DISTINCT FROM ")
            .push_bind(lead.get());
    }
    if let Some(user) = filter.user_id {
        qb.push(" AND user_id IS NOT DISTINCT FROM ")
            .push_bind(user.get());
    }
    if let Some(property) = filter.property_id {
        qb.push(" AND property_id IS NOT DISTINCT FROM ")
            .push_bind(property.get());
    }
    if let Some(active) = filter.active {
        qb.push(" AND active = ").push_bind(active);
    }
    if let Some(payed) = filter.price_payed {
        qb.push(" AND price_payed = ").push_bind(payed);
    }
    if let Some(timer) = filter.should_be_deactivated_by_timer {
        qb.push(" AND should_be_deactivated_by_timer = ")
            .push_bind(timer);
    }
    if let Some(at) = filter.expires_before {
        qb.push(" AND (expires IS NOT NULL AND expires <= ")
            .push_bind(at)
            .push(")");
    }
}

fn select<'a>(
    filter: &BookingFilter,
    exclude: Option<&BookingFilter>,
    suffix: &str,
) -> QueryBuilder<'a, Postgres> {
    let mut qb = QueryBuilder::new("SELECT state FROM bookings WHERE TRUE");
    push_criteria(&mut qb, filter);
    if let Some(exclude) = exclude {
        qb.push(" AND NOT (TRUE");
        push_criteria(&mut qb, exclude);
        qb.push(")");
    }
    qb.push(" ORDER BY id ASC");
    qb.push(suffix);
    qb
}

#[async_trait]
impl BookingRepository for PostgresBookingRepository {
    #[instrument(skip(self), fields(booking_id = %id), err)]
    async fn get(&self, id: BookingId) -> Result<Option<Booking>, RepositoryError> {
        let row = sqlx::query("SELECT state FROM bookings WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_booking", e))?;
        row.as_ref().map(decode).transpose()
    }

    #[instrument(skip(self), fields(lead_id = %lead), err)]
    async fn find_by_amocrm_id(&self, lead: LeadId) -> Result<Option<Booking>, RepositoryError> {
        let row = sqlx::query(
            "SELECT state FROM bookings WHERE amocrm_id = $1 ORDER BY id ASC LIMIT 1",
        )
        .bind(lead.get())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_amocrm_id", e))?;
        row.as_ref().map(decode).transpose()
    }

    #[instrument(skip(self, filter), fields(row_count = tracing::field::Empty), err)]
    async fn list(&self, filter: &BookingFilter) -> Result<Vec<Booking>, RepositoryError> {
        let mut query = select(filter, None, "");
        let rows = query
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_bookings", e))?;
        Span::current().record("row_count", rows.len());
        rows.iter().map(decode).collect()
    }

    #[instrument(skip(self, patch), err)]
    async fn create(&self, patch: BookingPatch) -> Result<Booking, RepositoryError> {
        self.insert_new(&patch).await
    }

    #[instrument(skip(self, booking, patch), fields(booking_id = %booking.id_typed()), err)]
    async fn update(
        &self,
        booking: &Booking,
        patch: BookingPatch,
    ) -> Result<Booking, RepositoryError> {
        let id = booking.id_typed();
        let outcome = guard(patch);

        let mut tx = self.begin().await?;
        let row = sqlx::query("SELECT state FROM bookings WHERE id = $1 FOR UPDATE")
            .bind(id.get())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_booking", e))?
            .ok_or_else(|| RepositoryError::not_found(format!("booking {id}")))?;
        let mut stored = decode(&row)?;

        report_regressions(self.monitor.as_ref(), &stored, &outcome).await;
        outcome.applied.apply_to(&mut stored);
        stored.bump_version();
        write_row(&mut tx, &stored).await?;
        Self::commit(tx).await?;
        Ok(stored)
    }

    #[instrument(skip(self, patch, filter, exclude), fields(written = tracing::field::Empty), err)]
    async fn bulk_update(
        &self,
        patch: BookingPatch,
        filter: &BookingFilter,
        exclude: Option<&BookingFilter>,
    ) -> Result<u64, RepositoryError> {
        let outcome = guard(patch);

        let mut tx = self.begin().await?;
        let mut query = select(filter, exclude, " FOR UPDATE");
        let rows = query
            .build()
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_bookings", e))?;

        let mut written = 0;
        for row in &rows {
            let mut booking = decode(row)?;
            outcome.applied.apply_to(&mut booking);
            booking.bump_version();
            write_row(&mut tx, &booking).await?;
            written += 1;
        }

        Self::commit(tx).await?;
        Span::current().record("written", written);
        Ok(written)
    }

    #[instrument(skip(self, filter, patch), err)]
    async fn update_or_create(
        &self,
        filter: &BookingFilter,
        patch: BookingPatch,
    ) -> Result<(Booking, bool), RepositoryError> {
        let mut seeded = filter.seed();
        seeded.extend(guard(patch.clone()).applied);
        if let Some(lead) = filter.amocrm_id {
            return self.upsert_by_lead(lead, seeded, patch).await;
        }

        let existing = self.list(filter).await?.into_iter().next();
        match existing {
            Some(booking) => Ok((self.update(&booking, patch).await?, false)),
            None => Ok((self.insert_new(&seeded).await?, true)),
        }
    }
}
