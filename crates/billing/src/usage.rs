//! Usage metering
//!
//! Usage is never stored; it is counted from the activity tables for the
//! current calendar month (UTC) each time it is asked for.

use std::sync::Arc;

use billsync_shared::TenantId;
use serde::Serialize;
use time::{Duration, OffsetDateTime, UtcOffset};

use crate::error::BillingResult;
use crate::models::ActivityKind;
use crate::store::BillingStore;

/// Per-tenant counts since the start of the current month
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UsageStats {
    pub chats_this_month: i64,
    pub uploads_this_month: i64,
    pub forecasts_this_month: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub period_start: OffsetDateTime,
}

/// Midnight UTC on the first day of the month containing `now`
pub fn month_start(now: OffsetDateTime) -> OffsetDateTime {
    let today = now.to_offset(UtcOffset::UTC).date();
    let first = today - Duration::days(i64::from(today.day()) - 1);
    first.midnight().assume_utc()
}

#[derive(Clone)]
pub struct UsageMeter {
    store: Arc<dyn BillingStore>,
}

impl UsageMeter {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    pub async fn count(&self, tenant_id: TenantId, kind: ActivityKind) -> BillingResult<i64> {
        self.count_at(tenant_id, kind, OffsetDateTime::now_utc())
            .await
    }

    pub async fn count_at(
        &self,
        tenant_id: TenantId,
        kind: ActivityKind,
        now: OffsetDateTime,
    ) -> BillingResult<i64> {
        self.store
            .count_activity(tenant_id, kind, month_start(now))
            .await
    }

    pub async fn stats(&self, tenant_id: TenantId) -> BillingResult<UsageStats> {
        self.stats_at(tenant_id, OffsetDateTime::now_utc()).await
    }

    pub async fn stats_at(
        &self,
        tenant_id: TenantId,
        now: OffsetDateTime,
    ) -> BillingResult<UsageStats> {
        let since = month_start(now);
        let (chats, uploads, forecasts) = tokio::try_join!(
            self.store
                .count_activity(tenant_id, ActivityKind::UserMessage, since),
            self.store
                .count_activity(tenant_id, ActivityKind::FileUpload, since),
            self.store.count_activity(tenant_id, ActivityKind::Forecast, since),
        )?;

        Ok(UsageStats {
            chats_this_month: chats,
            uploads_this_month: uploads,
            forecasts_this_month: forecasts,
            period_start: since,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BillingError;
    use crate::store::{Fault, InMemoryBillingStore};
    use time::macros::datetime;

    #[test]
    fn month_start_is_first_midnight_utc() {
        assert_eq!(
            month_start(datetime!(2025-03-17 13:45:10 UTC)),
            datetime!(2025-03-01 00:00:00 UTC)
        );
        assert_eq!(
            month_start(datetime!(2025-01-01 00:00:00 UTC)),
            datetime!(2025-01-01 00:00:00 UTC)
        );
        // 2025-03-01 03:00 in UTC+7 is still February in UTC
        assert_eq!(
            month_start(datetime!(2025-03-01 03:00:00 +7)),
            datetime!(2025-02-01 00:00:00 UTC)
        );
    }

    #[tokio::test]
    async fn counts_only_the_current_month() {
        let store = Arc::new(InMemoryBillingStore::new());
        let tenant = store.add_tenant("Acme", "owner@acme.test");
        let other = store.add_tenant("Other", "owner@other.test");
        let now = datetime!(2025-03-17 12:00:00 UTC);

        let message = ActivityKind::UserMessage;
        store.record_activity(tenant, message, datetime!(2025-03-01 00:00:00 UTC));
        store.record_activity(tenant, message, datetime!(2025-03-10 09:00:00 UTC));
        store.record_activity(tenant, message, datetime!(2025-02-28 23:59:59 UTC));
        store.record_activity(tenant, ActivityKind::FileUpload, datetime!(2025-03-02 00:00:00 UTC));
        store.record_activity(other, ActivityKind::UserMessage, datetime!(2025-03-05 00:00:00 UTC));

        let stats = UsageMeter::new(store.clone()).stats_at(tenant, now).await.unwrap();
        assert_eq!(stats.chats_this_month, 2);
        assert_eq!(stats.uploads_this_month, 1);
        assert_eq!(stats.forecasts_this_month, 0);
        assert_eq!(stats.period_start, datetime!(2025-03-01 00:00:00 UTC));
    }

    #[tokio::test]
    async fn query_failures_propagate() {
        let store = Arc::new(InMemoryBillingStore::new());
        let tenant = store.add_tenant("Acme", "owner@acme.test");
        store.set_fault(Fault::UsageQueries, true);

        let err = UsageMeter::new(store.clone()).stats(tenant).await.unwrap_err();
        assert!(matches!(err, BillingError::Storage(_)));
    }
}
