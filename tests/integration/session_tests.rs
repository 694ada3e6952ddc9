//! Session bootstrap tests against a live cluster.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use policy_controller_e2e::error::Result;
use policy_controller_e2e::session::{
    CredentialPayload, SessionSlot, load_ambient_credentials, rendezvous, synchronized_setup,
    synchronized_teardown,
};

use crate::{SharedTestCluster, init_tracing};

/// Every worker connects with the payload read once by the designated one.
#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires Kubernetes cluster"]
async fn test_workers_share_one_credential_read() {
    init_tracing();
    let cluster = SharedTestCluster::get().await;
    let reads = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = rendezvous::<CredentialPayload>(4)
        .into_iter()
        .map(|mut participant| {
            let reads = Arc::clone(&reads);
            tokio::spawn(async move {
                let slot = SessionSlot::new();
                let load = || async move {
                    reads.fetch_add(1, Ordering::SeqCst);
                    load_ambient_credentials().await
                };
                let setup: Result<()> = synchronized_setup(&mut participant, &slot, load, true).await;
                setup.unwrap();
                let session = slot.get().await.unwrap();
                let payload = session.payload().to_vec();
                let url = session.cluster_url().to_string();
                drop(session);

                synchronized_teardown(participant, &slot).await;
                assert!(!slot.is_active().await);
                (payload, url)
            })
        })
        .collect();

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }

    assert_eq!(reads.load(Ordering::SeqCst), 1);
    let expected = cluster.payload();
    for (payload, url) in &results {
        assert_eq!(payload.as_slice(), &*expected);
        assert_eq!(url, &results[0].1);
    }
}
