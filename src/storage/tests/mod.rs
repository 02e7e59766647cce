// src/storage/tests/mod.rs


// Contract checks that every BucketStore must pass
pub(crate) mod common {
    use std::time::Duration;

    use crate::admission::script::BUCKET_SCRIPT;
    use crate::admission::{CREATED_AT_FIELD, TOKENS_FIELD};
    use crate::error::Result;
    use crate::storage::{BucketStore, StoreTransaction as _};

    // Plain hash reads and writes
    pub async fn test_hash_operations<S: BucketStore>(store: &S, prefix: &str) -> Result<()> {
        let key = format!("{}:hash", prefix);

        assert_eq!(store.exists(&key).await?, 0);
        assert_eq!(store.get_hash_field(&key, TOKENS_FIELD).await?, None);

        store
            .set_hash_fields(
                &key,
                &[(TOKENS_FIELD, "5".to_string()), (CREATED_AT_FIELD, "1".to_string())],
            )
            .await?;
        assert_eq!(store.exists(&key).await?, 1);
        assert_eq!(store.get_hash_field(&key, TOKENS_FIELD).await?, Some(5));
        assert_eq!(store.get_hash_field(&key, "missing").await?, None);

        assert_eq!(store.increment_hash_field(&key, TOKENS_FIELD, -2).await?, 3);
        assert_eq!(store.increment_hash_field(&key, TOKENS_FIELD, 4).await?, 7);

        // HINCRBY on an absent key starts from zero
        let fresh = format!("{}:fresh", prefix);
        assert_eq!(store.increment_hash_field(&fresh, TOKENS_FIELD, -1).await?, -1);

        // NX only arms a key that has no TTL yet
        assert!(store.expire_if_persistent(&key, Duration::from_secs(60)).await?);
        assert!(!store.expire_if_persistent(&key, Duration::from_secs(30)).await?);
        assert!(store.expire(&fresh, Duration::from_secs(60)).await?);
        assert!(!store.expire(&format!("{}:nothing", prefix), Duration::from_secs(60)).await?);
        assert!(!store
            .expire_if_persistent(&format!("{}:nothing", prefix), Duration::from_secs(60))
            .await?);

        Ok(())
    }

    // A transaction applies every queued write
    pub async fn test_transaction<S: BucketStore>(store: &S, prefix: &str) -> Result<()> {
        let key = format!("{}:tx", prefix);

        let mut transaction = store.transaction();
        transaction
            .set_hash_fields(
                &key,
                &[(TOKENS_FIELD, "9".to_string()), (CREATED_AT_FIELD, "42".to_string())],
            )
            .increment_hash_field(&key, TOKENS_FIELD, -4)
            .expire(&key, Duration::from_secs(60));
        store.run_transaction(transaction).await?;

        assert_eq!(store.exists(&key).await?, 1);
        assert_eq!(store.get_hash_field(&key, TOKENS_FIELD).await?, Some(5));
        assert_eq!(store.get_hash_field(&key, CREATED_AT_FIELD).await?, Some(42));

        Ok(())
    }

    // The bucket script: create, consume, then deny once drained
    pub async fn test_bucket_script<S: BucketStore>(store: &S, prefix: &str) -> Result<()> {
        let key = format!("{}:script", prefix);
        let script = store.load_script(BUCKET_SCRIPT).await?;

        // max 3, 60s window, cost 1
        let args = [3, 60, 1_700_000_000_000_000, 1];
        assert_eq!(store.run_script(&script, &[&key], &args).await?, 1);
        assert_eq!(store.get_hash_field(&key, TOKENS_FIELD).await?, Some(2));
        assert_eq!(
            store.get_hash_field(&key, CREATED_AT_FIELD).await?,
            Some(1_700_000_000_000_000)
        );

        assert_eq!(store.run_script(&script, &[&key], &args).await?, 1);
        assert_eq!(store.run_script(&script, &[&key], &args).await?, 1);
        assert_eq!(store.get_hash_field(&key, TOKENS_FIELD).await?, Some(0));

        // Drained: denied, nothing written
        assert_eq!(store.run_script(&script, &[&key], &args).await?, 0);
        assert_eq!(store.get_hash_field(&key, TOKENS_FIELD).await?, Some(0));

        // Oversized first request creates nothing
        let oversized = format!("{}:oversized", prefix);
        assert_eq!(store.run_script(&script, &[&oversized], &[3, 60, 0, 4]).await?, 0);
        assert_eq!(store.exists(&oversized).await?, 0);

        Ok(())
    }
}
