//! Postgres store
//!
//! Uniqueness of `order_id`, `charge_key`, `customer_id` and `customer_key`
//! is enforced by unique indexes.
//!
//! Subscription locks are session-level advisory locks taken on a connection
//! checked out for the lifetime of the guard, so the API and worker
//! processes serialize on the same subscription. Everything done under the
//! lock runs on that connection; a holder needs exactly one connection no
//! matter how many statements it issues.

use async_trait::async_trait;
use recurbill_shared::SubscriptionTier;
use sqlx::pool::PoolConnection;
use sqlx::{Connection, FromRow, PgConnection, PgPool, Postgres};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use super::{BillingStore, LockSession, SubscriptionLock};
use crate::error::{BillingError, BillingResult};
use crate::ledger::{ChargeKind, PaymentRecord, PaymentStats, PaymentStatus};
use crate::subscription::SubscriptionRecord;

const SUBSCRIPTION_COLUMNS: &str = r#"
    id, customer_id, customer_key, tier, is_active, start_date, end_date,
    next_billing_date, billing_suspended_at, charge_limit, price, billing_credential,
    created_at, updated_at
"#;

const PAYMENT_COLUMNS: &str = r#"
    id, order_id, charge_key, order_label, amount, method, status, kind, approved_at,
    failure_reason, canceled_amount, customer_id, subscription_id, created_at, updated_at
"#;

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    id: Uuid,
    customer_id: Uuid,
    customer_key: String,
    tier: String,
    is_active: bool,
    start_date: Option<OffsetDateTime>,
    end_date: Option<OffsetDateTime>,
    next_billing_date: Option<Date>,
    billing_suspended_at: Option<OffsetDateTime>,
    charge_limit: i32,
    price: i64,
    billing_credential: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for SubscriptionRecord {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        let tier = SubscriptionTier::parse(&row.tier).ok_or_else(|| {
            BillingError::Database(format!("unknown tier '{}' on subscription {}", row.tier, row.id))
        })?;
        Ok(SubscriptionRecord {
            id: row.id,
            customer_id: row.customer_id,
            customer_key: row.customer_key,
            tier,
            is_active: row.is_active,
            start_date: row.start_date,
            end_date: row.end_date,
            next_billing_date: row.next_billing_date,
            billing_suspended_at: row.billing_suspended_at,
            charge_limit: row.charge_limit,
            price: row.price,
            billing_credential: row.billing_credential,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct PaymentRow {
    id: Uuid,
    order_id: String,
    charge_key: Option<String>,
    order_label: String,
    amount: i64,
    method: Option<String>,
    status: String,
    kind: String,
    approved_at: Option<OffsetDateTime>,
    failure_reason: Option<String>,
    canceled_amount: i64,
    customer_id: Uuid,
    subscription_id: Uuid,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<PaymentRow> for PaymentRecord {
    type Error = BillingError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        let status = PaymentStatus::parse(&row.status).ok_or_else(|| {
            BillingError::Database(format!("unknown status '{}' on order {}", row.status, row.order_id))
        })?;
        let kind = ChargeKind::parse(&row.kind).ok_or_else(|| {
            BillingError::Database(format!("unknown kind '{}' on order {}", row.kind, row.order_id))
        })?;
        Ok(PaymentRecord {
            id: row.id,
            order_id: row.order_id,
            charge_key: row.charge_key,
            order_label: row.order_label,
            amount: row.amount,
            method: row.method,
            status,
            kind,
            approved_at: row.approved_at,
            failure_reason: row.failure_reason,
            canceled_amount: row.canceled_amount,
            customer_id: row.customer_id,
            subscription_id: row.subscription_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct StatsRow {
    total_count: i64,
    success_count: i64,
    total_revenue: i64,
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn acquire(&self) -> BillingResult<PoolConnection<Postgres>> {
        Ok(self.pool.acquire().await?)
    }
}

// Statement helpers shared by pooled calls and lock sessions. A
// `PoolConnection` or `Transaction` derefs to the connection they take.

async fn fetch_subscription(
    conn: &mut PgConnection,
    filter: &str,
    bind: SubscriptionKey<'_>,
) -> BillingResult<Option<SubscriptionRecord>> {
    let sql = format!("SELECT {} FROM subscriptions WHERE {}", SUBSCRIPTION_COLUMNS, filter);
    let query = sqlx::query_as::<_, SubscriptionRow>(&sql);
    let query = match bind {
        SubscriptionKey::Id(id) => query.bind(id),
        SubscriptionKey::Text(text) => query.bind(text),
    };
    query
        .fetch_optional(&mut *conn)
        .await?
        .map(SubscriptionRecord::try_from)
        .transpose()
}

async fn fetch_payment(
    conn: &mut PgConnection,
    filter: &str,
    value: &str,
) -> BillingResult<Option<PaymentRecord>> {
    let sql = format!("SELECT {} FROM payments WHERE {}", PAYMENT_COLUMNS, filter);
    sqlx::query_as::<_, PaymentRow>(&sql)
        .bind(value)
        .fetch_optional(&mut *conn)
        .await?
        .map(PaymentRecord::try_from)
        .transpose()
}

async fn fetch_unsettled_recurring(
    conn: &mut PgConnection,
    subscription_id: Uuid,
) -> BillingResult<Option<PaymentRecord>> {
    let sql = format!(
        r#"
        SELECT {} FROM payments
        WHERE subscription_id = $1
          AND kind = 'recurring'
          AND status IN ('REQUESTED', 'READY', 'IN_PROGRESS')
        ORDER BY created_at
        LIMIT 1
        "#,
        PAYMENT_COLUMNS
    );
    sqlx::query_as::<_, PaymentRow>(&sql)
        .bind(subscription_id)
        .fetch_optional(&mut *conn)
        .await?
        .map(PaymentRecord::try_from)
        .transpose()
}

async fn insert_payment_row(conn: &mut PgConnection, record: &PaymentRecord) -> BillingResult<bool> {
    let inserted: Option<(Uuid,)> = sqlx::query_as(
        r#"
        INSERT INTO payments (
            id, order_id, charge_key, order_label, amount, method, status, kind,
            approved_at, failure_reason, canceled_amount, customer_id, subscription_id,
            created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        ON CONFLICT (order_id) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(record.id)
    .bind(&record.order_id)
    .bind(&record.charge_key)
    .bind(&record.order_label)
    .bind(record.amount)
    .bind(&record.method)
    .bind(record.status.as_str())
    .bind(record.kind.as_str())
    .bind(record.approved_at)
    .bind(&record.failure_reason)
    .bind(record.canceled_amount)
    .bind(record.customer_id)
    .bind(record.subscription_id)
    .bind(record.created_at)
    .bind(record.updated_at)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(inserted.is_some())
}

async fn update_payment_row(conn: &mut PgConnection, record: &PaymentRecord) -> BillingResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE payments
        SET charge_key = $2,
            method = $3,
            status = $4,
            approved_at = $5,
            failure_reason = $6,
            canceled_amount = $7,
            updated_at = $8
        WHERE id = $1
        "#,
    )
    .bind(record.id)
    .bind(&record.charge_key)
    .bind(&record.method)
    .bind(record.status.as_str())
    .bind(record.approved_at)
    .bind(&record.failure_reason)
    .bind(record.canceled_amount)
    .bind(record.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(map_unique_violation)?;

    if result.rows_affected() == 0 {
        return Err(BillingError::NotFound(format!("payment {}", record.order_id)));
    }
    Ok(())
}

async fn update_subscription_row(
    conn: &mut PgConnection,
    record: &SubscriptionRecord,
) -> BillingResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE subscriptions
        SET tier = $2,
            is_active = $3,
            start_date = $4,
            end_date = $5,
            next_billing_date = $6,
            billing_suspended_at = $7,
            charge_limit = $8,
            price = $9,
            billing_credential = $10,
            updated_at = $11
        WHERE id = $1
        "#,
    )
    .bind(record.id)
    .bind(record.tier.as_str())
    .bind(record.is_active)
    .bind(record.start_date)
    .bind(record.end_date)
    .bind(record.next_billing_date)
    .bind(record.billing_suspended_at)
    .bind(record.charge_limit)
    .bind(record.price)
    .bind(&record.billing_credential)
    .bind(record.updated_at)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(BillingError::NotFound(format!("subscription {}", record.id)));
    }
    Ok(())
}

async fn write_charge_outcome(
    conn: &mut PgConnection,
    payment: &PaymentRecord,
    subscription: &SubscriptionRecord,
) -> BillingResult<()> {
    let mut tx = conn.begin().await?;
    update_payment_row(&mut tx, payment).await?;
    update_subscription_row(&mut tx, subscription).await?;
    tx.commit().await?;
    Ok(())
}

enum SubscriptionKey<'a> {
    Id(Uuid),
    Text(&'a str),
}

fn map_unique_violation(e: sqlx::Error) -> BillingError {
    if let Some(db) = e.as_database_error() {
        if db.is_unique_violation() {
            return BillingError::OrderConflict(format!(
                "unique constraint {} violated",
                db.constraint().unwrap_or("unknown")
            ));
        }
    }
    BillingError::from(e)
}

#[async_trait]
impl BillingStore for PgStore {
    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        let mut conn = self.acquire().await?;
        fetch_subscription(&mut conn, "id = $1", SubscriptionKey::Id(id)).await
    }

    async fn find_subscription_by_customer(
        &self,
        customer_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let mut conn = self.acquire().await?;
        fetch_subscription(&mut conn, "customer_id = $1", SubscriptionKey::Id(customer_id)).await
    }

    async fn find_subscription_by_customer_key(
        &self,
        customer_key: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let mut conn = self.acquire().await?;
        fetch_subscription(&mut conn, "customer_key = $1", SubscriptionKey::Text(customer_key)).await
    }

    async fn insert_subscription_if_absent(
        &self,
        record: &SubscriptionRecord,
    ) -> BillingResult<SubscriptionRecord> {
        let mut conn = self.acquire().await?;
        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, customer_id, customer_key, tier, is_active, start_date, end_date,
                next_billing_date, billing_suspended_at, charge_limit, price, billing_credential,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (customer_id) DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(record.customer_id)
        .bind(&record.customer_key)
        .bind(record.tier.as_str())
        .bind(record.is_active)
        .bind(record.start_date)
        .bind(record.end_date)
        .bind(record.next_billing_date)
        .bind(record.billing_suspended_at)
        .bind(record.charge_limit)
        .bind(record.price)
        .bind(&record.billing_credential)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut *conn)
        .await?;

        fetch_subscription(&mut conn, "customer_id = $1", SubscriptionKey::Id(record.customer_id))
            .await?
            .ok_or_else(|| BillingError::Database("subscription vanished after insert".into()))
    }

    async fn save_subscription(&self, record: &SubscriptionRecord) -> BillingResult<()> {
        let mut conn = self.acquire().await?;
        update_subscription_row(&mut conn, record).await
    }

    async fn list_subscriptions(&self) -> BillingResult<Vec<SubscriptionRecord>> {
        let sql = format!(
            "SELECT {} FROM subscriptions ORDER BY created_at",
            SUBSCRIPTION_COLUMNS
        );
        sqlx::query_as::<_, SubscriptionRow>(&sql)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(SubscriptionRecord::try_from)
            .collect()
    }

    async fn list_due_subscriptions(&self, today: Date) -> BillingResult<Vec<SubscriptionRecord>> {
        let sql = format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE is_active
              AND billing_credential IS NOT NULL
              AND billing_suspended_at IS NULL
              AND next_billing_date <= $1
            ORDER BY next_billing_date, created_at
            "#,
            SUBSCRIPTION_COLUMNS
        );
        sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(today)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(SubscriptionRecord::try_from)
            .collect()
    }

    async fn find_payment_by_order_id(&self, order_id: &str) -> BillingResult<Option<PaymentRecord>> {
        let mut conn = self.acquire().await?;
        fetch_payment(&mut conn, "order_id = $1", order_id).await
    }

    async fn find_payment_by_charge_key(
        &self,
        charge_key: &str,
    ) -> BillingResult<Option<PaymentRecord>> {
        let mut conn = self.acquire().await?;
        fetch_payment(&mut conn, "charge_key = $1", charge_key).await
    }

    async fn insert_payment(&self, record: &PaymentRecord) -> BillingResult<bool> {
        let mut conn = self.acquire().await?;
        insert_payment_row(&mut conn, record).await
    }

    async fn update_payment(&self, record: &PaymentRecord) -> BillingResult<()> {
        let mut conn = self.acquire().await?;
        update_payment_row(&mut conn, record).await
    }

    async fn list_payments(&self) -> BillingResult<Vec<PaymentRecord>> {
        let sql = format!(
            "SELECT {} FROM payments ORDER BY approved_at DESC NULLS LAST, created_at DESC",
            PAYMENT_COLUMNS
        );
        sqlx::query_as::<_, PaymentRow>(&sql)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(PaymentRecord::try_from)
            .collect()
    }

    async fn payment_stats(&self) -> BillingResult<PaymentStats> {
        // Approved charges count even after a refund; revenue is net of refunds
        let row: StatsRow = sqlx::query_as(
            r#"
            SELECT
                COUNT(*)::BIGINT AS total_count,
                COUNT(*) FILTER (
                    WHERE status IN ('DONE', 'PARTIAL_CANCELED', 'CANCELED')
                )::BIGINT AS success_count,
                COALESCE(SUM(amount - canceled_amount) FILTER (
                    WHERE status IN ('DONE', 'PARTIAL_CANCELED', 'CANCELED')
                ), 0)::BIGINT AS total_revenue
            FROM payments
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(PaymentStats {
            total_count: row.total_count,
            success_count: row.success_count,
            total_revenue: row.total_revenue,
        })
    }

    async fn record_charge_outcome(
        &self,
        payment: &PaymentRecord,
        subscription: &SubscriptionRecord,
    ) -> BillingResult<()> {
        let mut conn = self.acquire().await?;
        write_charge_outcome(&mut conn, payment, subscription).await
    }

    async fn lock_subscription(&self, subscription_id: Uuid) -> BillingResult<SubscriptionLock> {
        // The session owns the connection before the lock is requested, so a
        // caller dropped mid-wait still issues the unlock
        let mut session = PgLockSession {
            conn: Some(self.acquire().await?),
            key: subscription_id.to_string(),
        };
        let key = session.key.clone();
        sqlx::query("SELECT pg_advisory_lock(hashtextextended($1::text, 0))")
            .bind(&key)
            .execute(session.conn()?)
            .await?;
        Ok(SubscriptionLock::new(subscription_id, Box::new(session)))
    }
}

/// Connection holding a session-level advisory lock
struct PgLockSession {
    conn: Option<PoolConnection<Postgres>>,
    key: String,
}

impl PgLockSession {
    fn conn(&mut self) -> BillingResult<&mut PgConnection> {
        self.conn
            .as_deref_mut()
            .ok_or_else(|| BillingError::Database("subscription lock already released".into()))
    }
}

impl Drop for PgLockSession {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        let key = std::mem::take(&mut self.key);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let released = sqlx::query("SELECT pg_advisory_unlock(hashtextextended($1::text, 0))")
                        .bind(&key)
                        .execute(&mut *conn)
                        .await;
                    if let Err(e) = released {
                        // Closing the session is the only other way to free the lock
                        tracing::error!(lock_key = %key, error = %e, "Advisory unlock failed, closing connection");
                        drop(conn.detach());
                    }
                });
            }
            Err(_) => {
                tracing::warn!(lock_key = %key, "No runtime to release subscription lock, closing connection");
                drop(conn.detach());
            }
        }
    }
}

#[async_trait]
impl LockSession for PgLockSession {
    async fn get_subscription(&mut self, id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        fetch_subscription(self.conn()?, "id = $1", SubscriptionKey::Id(id)).await
    }

    async fn save_subscription(&mut self, record: &SubscriptionRecord) -> BillingResult<()> {
        update_subscription_row(self.conn()?, record).await
    }

    async fn find_payment_by_order_id(&mut self, order_id: &str) -> BillingResult<Option<PaymentRecord>> {
        fetch_payment(self.conn()?, "order_id = $1", order_id).await
    }

    async fn find_unsettled_recurring(&mut self, subscription_id: Uuid) -> BillingResult<Option<PaymentRecord>> {
        fetch_unsettled_recurring(self.conn()?, subscription_id).await
    }

    async fn insert_payment(&mut self, record: &PaymentRecord) -> BillingResult<bool> {
        insert_payment_row(self.conn()?, record).await
    }

    async fn update_payment(&mut self, record: &PaymentRecord) -> BillingResult<()> {
        update_payment_row(self.conn()?, record).await
    }

    async fn record_charge_outcome(
        &mut self,
        payment: &PaymentRecord,
        subscription: &SubscriptionRecord,
    ) -> BillingResult<()> {
        write_charge_outcome(self.conn()?, payment, subscription).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use time::macros::date;
    use time::UtcOffset;

    use crate::events::TracingEventSink;
    use crate::gateway::GatewayClient;
    use crate::orchestrator::BillingOrchestrator;
    use crate::plan::PlanCatalog;
    use crate::scheduler::RecurringChargeScheduler;
    use crate::testing::{fast_policy, ScriptedGateway};

    // Run against a disposable database:
    // DATABASE_URL=postgres://... cargo test -p recurbill-billing -- --ignored
    async fn store_with_pool(max_connections: u32) -> Arc<PgStore> {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = recurbill_shared::create_pool(&url, max_connections).await.unwrap();
        recurbill_shared::run_migrations(&pool).await.unwrap();
        Arc::new(PgStore::new(pool))
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_each_in_flight_charge_needs_one_connection() {
        let concurrency = 4;
        // One connection per in-flight charge plus one for the due listing
        let store = store_with_pool(concurrency as u32 + 1).await;

        let catalog = PlanCatalog::default();
        let now = OffsetDateTime::now_utc();
        // No other data is due this far back
        let cycle = date!(2000 - 01 - 01);
        for _ in 0..concurrency * 3 {
            let mut sub = SubscriptionRecord::new_base(Uuid::new_v4(), &catalog, now);
            let credential = format!("bk_{}", sub.customer_key);
            sub.activate_premium(credential, &catalog, now, UtcOffset::UTC);
            sub.next_billing_date = Some(cycle);
            store.insert_subscription_if_absent(&sub).await.unwrap();
        }

        let orchestrator = Arc::new(BillingOrchestrator::new(
            store.clone(),
            GatewayClient::new(Arc::new(ScriptedGateway::approving()), fast_policy()),
            catalog,
            UtcOffset::UTC,
            Arc::new(TracingEventSink),
        ));
        let summary = RecurringChargeScheduler::new(orchestrator, concurrency)
            .run_for_date(cycle)
            .await
            .unwrap();

        assert!(summary.due >= concurrency * 3);
        assert_eq!(summary.errors, 0);
        assert_eq!(summary.charged, summary.due);
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_dropped_lock_is_released() {
        let store = store_with_pool(2).await;
        let id = Uuid::new_v4();

        let held = store.lock_subscription(id).await.unwrap();
        let contender = {
            let store = store.clone();
            tokio::spawn(async move { store.lock_subscription(id).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!contender.is_finished());

        drop(held);
        tokio::time::timeout(Duration::from_secs(2), contender)
            .await
            .expect("lock was not released")
            .unwrap()
            .unwrap();
    }
}
