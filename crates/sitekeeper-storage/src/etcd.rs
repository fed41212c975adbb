//! [`KvStore`] backed by a real etcd cluster, via the `etcd-client` crate.
//!
//! This is the backend a multi-node controller deployment runs on: leases
//! give nodes and leadership a server-enforced TTL, watches let the state
//! store push changes to followers without polling, and `txn` gives us the
//! compare-and-set primitives the document write path and lock/leadership
//! acquisition both depend on.

use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, GetOptions, LeaseGrantOptions, Txn, TxnOp, WatchOptions};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::StorageError;
use crate::kv::{KvEvent, KvStore, LeaseId, VersionedValue};

/// An etcd-backed [`KvStore`].
pub struct EtcdKvStore {
    client: Client,
}

impl EtcdKvStore {
    /// Connect to one or more etcd endpoints.
    pub async fn connect(endpoints: &[String]) -> Result<Self, StorageError> {
        let client = Client::connect(endpoints, None)
            .await
            .map_err(|e| StorageError::Unavailable {
                reason: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

fn map_err(e: etcd_client::Error) -> StorageError {
    StorageError::Unavailable {
        reason: e.to_string(),
    }
}

#[async_trait]
impl KvStore for EtcdKvStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>, StorageError> {
        let mut client = self.client.kv_client();
        let resp = client.get(key, None).await.map_err(map_err)?;
        Ok(resp.kvs().first().map(|kv| VersionedValue {
            value: kv.value().to_vec(),
            revision: kv.mod_revision(),
        }))
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, VersionedValue)>, StorageError> {
        let mut client = self.client.kv_client();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(map_err)?;
        resp.kvs()
            .iter()
            .map(|kv| {
                let key = String::from_utf8(kv.key().to_vec()).map_err(|e| {
                    StorageError::Serialization {
                        reason: e.to_string(),
                    }
                })?;
                Ok((
                    key,
                    VersionedValue {
                        value: kv.value().to_vec(),
                        revision: kv.mod_revision(),
                    },
                ))
            })
            .collect()
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<i64, StorageError> {
        let mut client = self.client.kv_client();
        let resp = client.put(key, value, None).await.map_err(map_err)?;
        Ok(resp
            .header()
            .map_or(0, etcd_client::ResponseHeader::revision))
    }

    async fn put_if_absent(&self, key: &str, value: &[u8]) -> Result<i64, StorageError> {
        let mut client = self.client.kv_client();
        let txn = Txn::new()
            .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(key, value, None)]);
        let resp = client.txn(txn).await.map_err(map_err)?;
        if !resp.succeeded() {
            return Err(StorageError::AlreadyExists {
                key: key.to_owned(),
            });
        }
        Ok(resp
            .header()
            .map_or(0, etcd_client::ResponseHeader::revision))
    }

    async fn put_cas(
        &self,
        key: &str,
        value: &[u8],
        expected_revision: i64,
    ) -> Result<i64, StorageError> {
        let mut client = self.client.kv_client();
        let txn = Txn::new()
            .when(vec![Compare::mod_revision(
                key,
                CompareOp::Equal,
                expected_revision,
            )])
            .and_then(vec![TxnOp::put(key, value, None)]);
        let resp = client.txn(txn).await.map_err(map_err)?;
        if !resp.succeeded() {
            let current = self.get(key).await?.map_or(0, |v| v.revision);
            return Err(StorageError::CasConflict {
                key: key.to_owned(),
                expected: expected_revision,
                actual: current,
            });
        }
        Ok(resp
            .header()
            .map_or(0, etcd_client::ResponseHeader::revision))
    }

    async fn put_if_absent_with_lease(
        &self,
        key: &str,
        value: &[u8],
        lease_id: LeaseId,
    ) -> Result<i64, StorageError> {
        let mut client = self.client.kv_client();
        let opts = etcd_client::PutOptions::new().with_lease(lease_id);
        let txn = Txn::new()
            .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(key, value, Some(opts))]);
        let resp = client.txn(txn).await.map_err(map_err)?;
        if !resp.succeeded() {
            return Err(StorageError::AlreadyExists {
                key: key.to_owned(),
            });
        }
        Ok(resp
            .header()
            .map_or(0, etcd_client::ResponseHeader::revision))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut client = self.client.kv_client();
        client.delete(key, None).await.map_err(map_err)?;
        Ok(())
    }

    async fn lease_grant(&self, ttl_secs: i64) -> Result<LeaseId, StorageError> {
        let mut client = self.client.lease_client();
        let resp = client
            .grant(ttl_secs.max(1), Some(LeaseGrantOptions::new()))
            .await
            .map_err(map_err)?;
        Ok(resp.id())
    }

    async fn lease_keep_alive(&self, lease_id: LeaseId) -> Result<(), StorageError> {
        let mut client = self.client.lease_client();
        let (mut keeper, mut stream) = client.keep_alive(lease_id).await.map_err(map_err)?;
        keeper.keep_alive().await.map_err(map_err)?;
        stream
            .message()
            .await
            .map_err(map_err)?
            .ok_or(StorageError::LeaseNotFound { lease_id })?;
        Ok(())
    }

    async fn lease_revoke(&self, lease_id: LeaseId) -> Result<(), StorageError> {
        let mut client = self.client.lease_client();
        client.revoke(lease_id).await.map_err(map_err)?;
        Ok(())
    }

    async fn put_with_lease(
        &self,
        key: &str,
        value: &[u8],
        lease_id: LeaseId,
    ) -> Result<i64, StorageError> {
        let mut client = self.client.kv_client();
        let opts = etcd_client::PutOptions::new().with_lease(lease_id);
        let resp = client
            .put(key, value, Some(opts))
            .await
            .map_err(map_err)?;
        Ok(resp
            .header()
            .map_or(0, etcd_client::ResponseHeader::revision))
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: i64,
    ) -> Result<ReceiverStream<KvEvent>, StorageError> {
        let mut client = self.client.watch_client();
        let mut options = WatchOptions::new().with_prefix();
        if start_revision > 0 {
            options = options.with_start_revision(start_revision);
        }
        let (_watcher, mut stream) = client
            .watch(prefix, Some(options))
            .await
            .map_err(map_err)?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            while let Ok(Some(resp)) = stream.message().await {
                for event in resp.events() {
                    let Some(kv) = event.kv() else { continue };
                    let Ok(key) = String::from_utf8(kv.key().to_vec()) else {
                        continue;
                    };
                    let mapped = match event.event_type() {
                        etcd_client::EventType::Put => KvEvent::Put {
                            key,
                            value: kv.value().to_vec(),
                            revision: kv.mod_revision(),
                        },
                        etcd_client::EventType::Delete => KvEvent::Delete {
                            key,
                            revision: kv.mod_revision(),
                        },
                    };
                    if tx.send(mapped).await.is_err() {
                        return;
                    }
                }
            }
        });
        Ok(ReceiverStream::new(rx))
    }

    async fn healthy(&self) -> bool {
        let mut client = self.client.kv_client();
        client.get("health-check-sentinel", None).await.is_ok()
    }
}
