//! Suppresses repeated processing of the same resource within a time
//! window, remembering the last processing time in a parameter store.
//!
//! The read and the write are not atomic. Two invocations racing on
//! the same key may both pass; the cost is a repeated, idempotent
//! package push.

use crate::storage::strip_scheme;
use crate::store::ParameterStore;
use anyhow::Result;
use chrono::Utc;
use tracing::{info, instrument, warn};

/// Check whether `uri` may be processed now, recording the current
/// time when it may.
pub async fn check_time(store: &dyn ParameterStore, uri: &str, timeout: u64) -> Result<bool> {
    check_time_at(store, uri, timeout, Utc::now().timestamp()).await
}

/// Same as [`check_time`], at a given Unix time in seconds.
#[instrument(skip(store))]
pub async fn check_time_at(
    store: &dyn ParameterStore,
    uri: &str,
    timeout: u64,
    now: i64,
) -> Result<bool> {
    let key = strip_scheme(uri);
    if let Some(prior) = store.get(key).await? {
        match prior.trim().parse::<i64>() {
            Ok(prior) => {
                let delta = now - prior;
                if delta < timeout as i64 {
                    info!("Too soon: {} < {}", delta, timeout);
                    return Ok(false);
                }
            }
            Err(_) => warn!("Ignoring unreadable timestamp {:?} for {:?}", prior, key),
        }
    }
    store.put(key, &now.to_string()).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryParameterStore, MockParameterStore};
    use mockall::predicate::eq;

    #[tokio::test]
    async fn second_call_within_window_is_suppressed() {
        let store = MemoryParameterStore::new();
        let uri = "s3://bucket/omics-quilt/3395667";
        assert!(check_time_at(&store, uri, 10, 1_000).await.unwrap());
        assert!(!check_time_at(&store, uri, 10, 1_000).await.unwrap());
        assert!(!check_time_at(&store, uri, 10, 1_009).await.unwrap());
        assert!(check_time_at(&store, uri, 10, 1_010).await.unwrap());
        assert_eq!(
            store.get("bucket/omics-quilt/3395667").await.unwrap().as_deref(),
            Some("1010")
        );
    }

    #[tokio::test]
    async fn suppression_does_not_touch_the_store() {
        let mut store = MockParameterStore::new();
        store
            .expect_get()
            .with(eq("bucket/key"))
            .times(1)
            .returning(|_| Ok(Some(String::from("995"))));
        store.expect_put().times(0);
        assert!(!check_time_at(&store, "s3://bucket/key", 10, 1_000).await.unwrap());
    }

    #[tokio::test]
    async fn first_sighting_records_the_time() {
        let mut store = MockParameterStore::new();
        store.expect_get().times(1).returning(|_| Ok(None));
        store
            .expect_put()
            .with(eq("bucket/key"), eq("1000"))
            .times(1)
            .returning(|_, _| Ok(()));
        assert!(check_time_at(&store, "s3://bucket/key", 10, 1_000).await.unwrap());
    }

    #[tokio::test]
    async fn unreadable_timestamps_are_overwritten() {
        let store = MemoryParameterStore::new();
        store.put("bucket/key", "yesterday").await.unwrap();
        assert!(check_time_at(&store, "bucket/key", 10, 1_000).await.unwrap());
    }
}
