//! Two services sharing one backend behave as two replicas of the same
//! ensemble: whatever one publishes with `flush()`, the other observes after
//! a bounded convergence interval, with equal backend-assigned versions.

use std::sync::Arc;
use std::time::Duration;

use prefsync::Error;
use prefsync::MemoryBackend;
use prefsync::PreferenceService;
use prefsync::Settings;
use prefsync::TreeError;

fn two_replicas() -> (PreferenceService, PreferenceService) {
    let backend = Arc::new(MemoryBackend::new());
    let a = PreferenceService::new(backend.clone(), Settings::default());
    let b = PreferenceService::new(backend, Settings::default());
    (a, b)
}

async fn with_deadline<F: std::future::Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .expect("test exceeded its deadline")
}

#[tokio::test]
async fn properties_converge_with_equal_versions() {
    with_deadline(async {
        let (a, b) = two_replicas();
        let writer = a.scope_root("settings").unwrap();
        let mirror = b.scope_root("settings").unwrap();

        writer.put("theme", "dark").await.unwrap();
        writer.put("lang", "en").await.unwrap();
        writer.flush().await.unwrap();

        let converged = mirror
            .await_convergence(|state| {
                state.property("theme") == Some("dark") && state.property("lang") == Some("en")
            })
            .await
            .unwrap();
        assert!(converged);
        assert_eq!(
            writer.properties_version().await.unwrap(),
            mirror.properties_version().await.unwrap()
        );

        // A second publish converges the same way, at a higher version.
        writer.put("theme", "light").await.unwrap();
        writer.flush().await.unwrap();
        let converged = mirror
            .await_convergence(|state| state.property("theme") == Some("light"))
            .await
            .unwrap();
        assert!(converged);
        assert_eq!(mirror.get("lang").await.unwrap(), Some("en".to_string()));
        assert_eq!(
            writer.properties_version().await.unwrap(),
            mirror.properties_version().await.unwrap()
        );
    })
    .await
}

#[tokio::test]
async fn child_membership_converges() {
    with_deadline(async {
        let (a, b) = two_replicas();
        let writer = a.scope_root("cluster").unwrap();
        let mirror = b.scope_root("cluster").unwrap();

        let member = writer.node("members/node-1").await.unwrap();
        member.put("addr", "10.0.0.1:9000").await.unwrap();
        writer.flush().await.unwrap();

        let converged = mirror
            .await_convergence(|state| state.child_names().contains("members"))
            .await
            .unwrap();
        assert!(converged);

        let members = mirror.node("members").await.unwrap();
        let converged = members
            .await_convergence(|state| state.child_names().contains("node-1"))
            .await
            .unwrap();
        assert!(converged);
        assert_eq!(
            mirror
                .node("members/node-1")
                .await
                .unwrap()
                .get("addr")
                .await
                .unwrap(),
            Some("10.0.0.1:9000".to_string())
        );
    })
    .await
}

#[tokio::test]
async fn removal_converges_and_stays_inert() {
    with_deadline(async {
        let (a, b) = two_replicas();
        let writer = a.scope_root("jobs").unwrap();
        let mirror = b.scope_root("jobs").unwrap();

        let job_w = writer.node("job-7").await.unwrap();
        writer.flush().await.unwrap();

        let converged = mirror
            .await_convergence(|state| state.child_names().contains("job-7"))
            .await
            .unwrap();
        assert!(converged);
        let job_m = mirror.node("job-7").await.unwrap();

        job_w.remove_node().await.unwrap();
        writer.flush().await.unwrap();

        let converged = mirror
            .await_convergence(|state| !state.child_names().contains("job-7"))
            .await
            .unwrap();
        assert!(converged);
        assert!(!mirror.node_exists("job-7").await.unwrap());
        assert!(job_m.is_removed());
        assert!(matches!(
            job_m.put("k", "v").await,
            Err(Error::Tree(TreeError::AlreadyRemoved { .. }))
        ));
    })
    .await
}

#[tokio::test]
async fn concurrent_writers_settle_on_the_last_flush() {
    with_deadline(async {
        let (a, b) = two_replicas();
        let first = a.scope_root("prefs").unwrap();
        let second = b.scope_root("prefs").unwrap();

        // Both replicas activate, then write the same key independently.
        assert_eq!(first.get("k").await.unwrap(), None);
        assert_eq!(second.get("k").await.unwrap(), None);
        first.put("k", "from-first").await.unwrap();
        second.put("k", "from-second").await.unwrap();

        first.flush().await.unwrap();
        second.flush().await.unwrap();

        // The property map is one atomic blob: the later flush wins whole.
        for root in [&first, &second] {
            let converged = root
                .await_convergence(|state| state.property("k") == Some("from-second"))
                .await
                .unwrap();
            assert!(converged);
        }
        assert_eq!(
            first.properties_version().await.unwrap(),
            second.properties_version().await.unwrap()
        );
    })
    .await
}
