//! Durability: state must survive a full engine restart.

use std::sync::Arc;

use bytes::Bytes;

use durable_streams_server::storage::StorageBackend;
use durable_streams_server::{
    ProducerClaims, ReadFrom, Registry, ServerConfig, StreamConfigReq,
};

fn registry(backend: Arc<dyn StorageBackend>) -> Registry {
    Registry::new(backend, Arc::new(ServerConfig::default()))
}

fn octet_config() -> StreamConfigReq {
    StreamConfigReq::default()
}

#[cfg(feature = "fjall")]
#[tokio::test]
async fn fjall_backed_stream_survives_restart() {
    use durable_streams_server::storage::FjallBackend;

    let dir = tempfile::tempdir().unwrap();

    let head = {
        let backend: Arc<dyn StorageBackend> =
            Arc::new(FjallBackend::open(dir.path()).unwrap());
        let reg = registry(backend);
        let (log, created) = reg.create("/durable", octet_config()).unwrap();
        assert!(created);
        log.append(vec![Bytes::from("one")], None, None).await.unwrap();
        log.append(vec![Bytes::from("two")], None, None).await.unwrap();
        log.head_token()
        // Keyspace drops here, releasing the directory lock.
    };

    let backend: Arc<dyn StorageBackend> = Arc::new(FjallBackend::open(dir.path()).unwrap());
    let reg = registry(backend);
    let log = reg.lookup("/durable").unwrap().expect("stream survived");
    assert_eq!(log.count(), 2);
    assert_eq!(log.head_token(), head);

    let page = log.read_range(&ReadFrom::Start, 10, 1 << 20).unwrap();
    let payloads: Vec<&[u8]> = page.messages.iter().map(|(_, d)| d.as_ref()).collect();
    assert_eq!(payloads, vec![b"one".as_ref(), b"two".as_ref()]);
}

#[cfg(feature = "fjall")]
#[tokio::test]
async fn fjall_backed_fence_survives_restart() {
    use durable_streams_server::storage::FjallBackend;

    let dir = tempfile::tempdir().unwrap();
    let claims = ProducerClaims {
        id: "p".to_string(),
        epoch: 1,
        seq: 0,
    };
    let body = Bytes::from("payload");

    let first_offset = {
        let backend: Arc<dyn StorageBackend> =
            Arc::new(FjallBackend::open(dir.path()).unwrap());
        let reg = registry(backend);
        let (log, _) = reg.create("/fenced", octet_config()).unwrap();
        let hash = log.hash_payload(&body);
        log.append(vec![body.clone()], Some((claims.clone(), hash)), None)
            .await
            .unwrap()
            .last_offset
    };

    let backend: Arc<dyn StorageBackend> = Arc::new(FjallBackend::open(dir.path()).unwrap());
    let reg = registry(backend);
    let log = reg.lookup("/fenced").unwrap().unwrap();

    // Identical replay after restart still deduplicates.
    let hash = log.hash_payload(&body);
    let replay = log
        .append(vec![body.clone()], Some((claims.clone(), hash)), None)
        .await
        .unwrap();
    assert!(replay.duplicate);
    assert_eq!(replay.last_offset, first_offset);

    // And a zombie epoch is still fenced.
    let stale = ProducerClaims {
        id: "p".to_string(),
        epoch: 0,
        seq: 5,
    };
    let err = log
        .append(vec![body.clone()], Some((stale, hash)), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        durable_streams_server::EngineError::StaleEpoch { current_epoch: 1 }
    ));
}

#[cfg(feature = "fjall")]
#[tokio::test]
async fn fjall_backed_delete_is_total_across_restart() {
    use durable_streams_server::storage::FjallBackend;

    let dir = tempfile::tempdir().unwrap();

    {
        let backend: Arc<dyn StorageBackend> =
            Arc::new(FjallBackend::open(dir.path()).unwrap());
        let reg = registry(backend);
        let (log, _) = reg.create("/gone", octet_config()).unwrap();
        log.append(vec![Bytes::from("secret")], None, None)
            .await
            .unwrap();
        assert!(reg.delete("/gone").unwrap());
    }

    let backend: Arc<dyn StorageBackend> = Arc::new(FjallBackend::open(dir.path()).unwrap());
    let reg = registry(backend);
    assert!(reg.lookup("/gone").unwrap().is_none());

    // A new incarnation starts from scratch.
    let (log, created) = reg.create("/gone", octet_config()).unwrap();
    assert!(created);
    assert_eq!(log.count(), 0);
    let page = log.read_range(&ReadFrom::Start, 10, 1 << 20).unwrap();
    assert!(page.messages.is_empty());
}

#[tokio::test]
async fn byte_exact_replay_across_registry_instances() {
    use durable_streams_server::storage::MemoryBackend;

    let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let payload = Bytes::from_static(&[0x00, 0x01, 0xFE, 0xFF, 0xE2, 0x80, 0xA9]);

    {
        let reg = registry(backend.clone());
        let (log, _) = reg.create("/bytes", octet_config()).unwrap();
        log.append(vec![payload.clone()], None, None).await.unwrap();
    }

    let reg = registry(backend);
    let log = reg.lookup("/bytes").unwrap().unwrap();
    let page = log.read_range(&ReadFrom::Start, 10, 1 << 20).unwrap();
    assert_eq!(page.messages[0].1, payload);
}
