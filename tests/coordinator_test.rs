mod common;

use common::{drain, open_coordinator, open_coordinator_with, phases, v, wait_until};
use livebundle_lib::engine::error::UpdateError;
use livebundle_lib::engine::updater::{
    BundleFlavor, BundleSelector, CheckOutcome, EventEmitter, EventKind, UpdateEvent, UpdatePhase,
};
use std::sync::Arc;

#[tokio::test]
async fn test_install_then_upgrade() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let coordinator = open_coordinator(dir.path());
    let mut events = coordinator.events().subscribe();
    assert!(coordinator.active_version().is_none());

    coordinator.source().publish("1.0.0", b"console.log('v1')");
    let outcome = coordinator.check_for_update().await?;
    assert_eq!(outcome, CheckOutcome::Updated { version: v("1.0.0") });

    let emitted = drain(&mut events);
    assert_eq!(
        phases(&emitted),
        vec![
            UpdatePhase::Checking,
            UpdatePhase::Downloading,
            UpdatePhase::Verifying,
            UpdatePhase::Activating,
            UpdatePhase::Idle,
        ]
    );
    assert!(emitted.contains(&UpdateEvent::CheckStarted));
    assert!(emitted.contains(&UpdateEvent::Ready { version: v("1.0.0") }));
    assert!(emitted
        .iter()
        .any(|e| matches!(e, UpdateEvent::DownloadProgress { downloaded: 17, total: Some(17) })));

    coordinator.source().publish("1.1.0", b"console.log('v2')");
    let outcome = coordinator.check_for_update().await?;
    assert_eq!(outcome, CheckOutcome::Updated { version: v("1.1.0") });

    let pointer = coordinator.pointer();
    assert_eq!(pointer.active, Some(v("1.1.0")));
    assert_eq!(pointer.previous, Some(v("1.0.0")));
    assert!(pointer.last_check.is_some());

    let entry = coordinator.active_entry().expect("active entry");
    assert!(entry.verified);
    assert_eq!(std::fs::read(entry.bundle_path())?, b"console.log('v2')");
    assert_eq!(coordinator.phase(), UpdatePhase::Idle);
    Ok(())
}

#[tokio::test]
async fn test_no_update_when_same_version() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let coordinator = open_coordinator(dir.path());
    coordinator.source().publish("1.0.0", b"v1");
    coordinator.check_for_update().await?;

    let mut events = coordinator.events().subscribe();
    let outcome = coordinator.check_for_update().await?;
    assert_eq!(outcome, CheckOutcome::NoUpdate);
    assert_eq!(coordinator.source().downloads(), 1);

    let emitted = drain(&mut events);
    assert!(emitted.contains(&UpdateEvent::NoUpdate { current: Some(v("1.0.0")) }));
    assert_eq!(phases(&emitted), vec![UpdatePhase::Checking, UpdatePhase::Idle]);
    Ok(())
}

#[tokio::test]
async fn test_older_remote_is_not_an_update() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let coordinator = open_coordinator(dir.path());
    coordinator.source().publish("2.0.0", b"v2");
    coordinator.check_for_update().await?;

    coordinator.source().publish("1.9.9", b"old");
    assert_eq!(coordinator.check_for_update().await?, CheckOutcome::NoUpdate);
    assert_eq!(coordinator.active_version(), Some(v("2.0.0")));
    Ok(())
}

#[tokio::test]
async fn test_checksum_mismatch_leaves_pointer_untouched() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let coordinator = open_coordinator(dir.path());
    coordinator.source().publish("1.0.0", b"v1");
    coordinator.check_for_update().await?;
    let before = coordinator.pointer();

    let mut events = coordinator.events().subscribe();
    coordinator
        .source()
        .publish_corrupt("2.0.0", b"the real bundle", b"tampered bundle");
    let result = coordinator.check_for_update().await;
    assert!(matches!(result, Err(UpdateError::ChecksumMismatch { .. })));

    let emitted = drain(&mut events);
    assert!(emitted
        .iter()
        .any(|e| matches!(e, UpdateEvent::Failed { code, .. } if code == "ChecksumMismatch")));
    assert_eq!(
        phases(&emitted),
        vec![
            UpdatePhase::Checking,
            UpdatePhase::Downloading,
            UpdatePhase::Failed,
            UpdatePhase::Idle,
        ]
    );

    assert_eq!(coordinator.pointer().active, before.active);
    assert_eq!(coordinator.pointer().previous, before.previous);
    assert!(coordinator.cache().get(&v("2.0.0")).is_none());
    assert_eq!(coordinator.phase(), UpdatePhase::Idle);
    Ok(())
}

#[tokio::test]
async fn test_metadata_failure_is_reported() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let coordinator = open_coordinator(dir.path());

    // nothing published yet
    let result = coordinator.check_for_update().await;
    assert!(matches!(result, Err(UpdateError::NotFound(_))));
    assert!(matches!(
        coordinator.events().latest(EventKind::Failed),
        Some(UpdateEvent::Failed { code, .. }) if code == "NotFound"
    ));
    assert_eq!(coordinator.phase(), UpdatePhase::Idle);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_check_is_busy() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let coordinator = open_coordinator(dir.path());
    coordinator.source().publish("1.0.0", b"v1");
    coordinator.source().hold_downloads();

    let first = coordinator.spawn_check();
    assert_ne!(coordinator.phase(), UpdatePhase::Idle);

    let second = coordinator.check_for_update().await?;
    assert_eq!(second, CheckOutcome::Busy);
    assert_eq!(coordinator.events().latest(EventKind::Busy), Some(UpdateEvent::Busy));
    assert!(matches!(coordinator.activate(&v("1.0.0")), Err(UpdateError::Busy)));

    coordinator.source().release_downloads();
    let first = first.await??;
    assert_eq!(first, CheckOutcome::Updated { version: v("1.0.0") });
    assert_eq!(coordinator.source().downloads(), 1);
    Ok(())
}

#[tokio::test]
async fn test_cancel_returns_to_idle() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let coordinator = open_coordinator(dir.path());
    let mut events = coordinator.events().subscribe();
    coordinator.source().publish("1.0.0", b"v1");
    coordinator.source().hold_downloads();

    let cycle = coordinator.spawn_check();
    wait_until(|| coordinator.phase() == UpdatePhase::Downloading).await;
    assert!(coordinator.cancel());

    let result = cycle.await?;
    assert!(matches!(result, Err(UpdateError::Cancelled)));
    assert_eq!(coordinator.phase(), UpdatePhase::Idle);
    assert!(coordinator.active_version().is_none());
    assert!(coordinator.cache().get(&v("1.0.0")).is_none());
    assert!(drain(&mut events).contains(&UpdateEvent::Cancelled));

    // nothing left to cancel
    assert!(!coordinator.cancel());

    // and the next cycle runs normally
    coordinator.source().release_downloads();
    let outcome = coordinator.check_for_update().await?;
    assert_eq!(outcome, CheckOutcome::Updated { version: v("1.0.0") });
    Ok(())
}

#[tokio::test]
async fn test_eviction_keeps_current_and_previous() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let coordinator = open_coordinator(dir.path());

    for (version, body) in [("1", "one"), ("2", "two"), ("3", "three")] {
        coordinator.source().publish(version, body.as_bytes());
        coordinator.check_for_update().await?;
    }

    let cached: Vec<_> = coordinator
        .cache()
        .list()?
        .into_iter()
        .map(|e| e.version_id)
        .collect();
    assert_eq!(cached.len(), 2);
    assert!(cached.contains(&v("3")));
    assert!(cached.contains(&v("2")));
    assert!(!coordinator.cache().version_path(&v("1")).exists());
    Ok(())
}

#[tokio::test]
async fn test_cached_version_skips_download() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let coordinator = open_coordinator(dir.path());
    coordinator.source().publish("1", b"one");
    coordinator.check_for_update().await?;
    coordinator.source().publish("2", b"two");
    coordinator.check_for_update().await?;

    coordinator.rollback()?;
    assert_eq!(coordinator.active_version(), Some(v("1")));

    let mut events = coordinator.events().subscribe();
    let outcome = coordinator.check_for_update().await?;
    assert_eq!(outcome, CheckOutcome::Updated { version: v("2") });
    assert_eq!(coordinator.source().downloads(), 2);
    assert_eq!(
        phases(&drain(&mut events)),
        vec![
            UpdatePhase::Checking,
            UpdatePhase::Verifying,
            UpdatePhase::Activating,
            UpdatePhase::Idle,
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_activate_missing_version_fails() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let coordinator = open_coordinator(dir.path());
    coordinator.source().publish("1", b"one");
    coordinator.check_for_update().await?;

    let result = coordinator.activate(&v("9"));
    assert!(matches!(result, Err(UpdateError::Activation { .. })));
    assert!(matches!(
        coordinator.events().latest(EventKind::Failed),
        Some(UpdateEvent::Failed { code, .. }) if code == "ActivationError"
    ));
    assert_eq!(coordinator.active_version(), Some(v("1")));
    Ok(())
}

#[tokio::test]
async fn test_rollback_and_reset() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let coordinator = open_coordinator(dir.path());

    assert!(matches!(coordinator.rollback(), Err(UpdateError::Activation { .. })));

    coordinator.source().publish("1", b"one");
    coordinator.check_for_update().await?;
    coordinator.source().publish("2", b"two");
    coordinator.check_for_update().await?;

    assert_eq!(coordinator.rollback()?, v("1"));
    assert_eq!(coordinator.active_version(), Some(v("1")));
    assert!(matches!(
        coordinator.events().latest(EventKind::RolledBack),
        Some(UpdateEvent::RolledBack { version: Some(version), .. }) if version == v("1")
    ));

    coordinator.reset()?;
    assert!(coordinator.active_version().is_none());
    assert!(coordinator.active_entry().is_none());
    assert_eq!(coordinator.pointer().previous, Some(v("1")));

    // pointer survives a restart
    drop(coordinator);
    let reopened = open_coordinator(dir.path());
    assert!(reopened.active_version().is_none());
    assert_eq!(reopened.pointer().previous, Some(v("1")));
    Ok(())
}

#[tokio::test]
async fn test_unconfirmed_launches_roll_back_on_open() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let coordinator = open_coordinator(dir.path());
    coordinator.source().publish("1", b"one");
    coordinator.check_for_update().await?;
    coordinator.source().publish("2", b"two");
    coordinator.check_for_update().await?;

    // a confirmed launch resets the count
    coordinator.record_launch()?;
    coordinator.confirm_launch()?;
    assert_eq!(coordinator.pointer().launch_attempts, 0);

    for expected in 1..=3 {
        assert_eq!(coordinator.record_launch()?, expected);
    }
    drop(coordinator);

    let events = Arc::new(EventEmitter::new());
    let reopened = open_coordinator_with(dir.path(), Arc::clone(&events));
    assert_eq!(reopened.active_version(), Some(v("1")));
    assert!(reopened.pointer().previous.is_none());
    assert_eq!(reopened.pointer().launch_attempts, 0);
    assert!(matches!(
        events.latest(EventKind::RolledBack),
        Some(UpdateEvent::RolledBack { version: Some(version), .. }) if version == v("1")
    ));
    Ok(())
}

#[tokio::test]
async fn test_missing_active_entry_falls_back_on_open() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let coordinator = open_coordinator(dir.path());
    coordinator.source().publish("1", b"one");
    coordinator.check_for_update().await?;
    coordinator.source().publish("2", b"two");
    coordinator.check_for_update().await?;
    drop(coordinator);

    std::fs::remove_dir_all(dir.path().join("versions").join("2"))?;

    let reopened = open_coordinator(dir.path());
    assert_eq!(reopened.active_version(), Some(v("1")));
    assert!(reopened.active_entry().is_some());
    Ok(())
}

#[tokio::test]
async fn test_corrupt_cached_bundle_is_downloaded_again() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let coordinator = open_coordinator(dir.path());
    coordinator.source().publish("1", b"one");
    coordinator.check_for_update().await?;
    coordinator.source().publish("2", b"two");
    coordinator.check_for_update().await?;
    coordinator.rollback()?;

    // bit rot in the cached copy of 2
    let artifact = coordinator.cache().get(&v("2")).expect("cached").artifact_path();
    std::fs::write(&artifact, b"tw0")?;

    let mut events = coordinator.events().subscribe();
    let outcome = coordinator.check_for_update().await?;
    assert_eq!(outcome, CheckOutcome::Updated { version: v("2") });
    assert_eq!(coordinator.source().downloads(), 3);
    assert_eq!(
        phases(&drain(&mut events)),
        vec![
            UpdatePhase::Checking,
            UpdatePhase::Verifying,
            UpdatePhase::Downloading,
            UpdatePhase::Verifying,
            UpdatePhase::Activating,
            UpdatePhase::Idle,
        ]
    );

    let entry = coordinator.active_entry().expect("active entry");
    coordinator.cache().verify_integrity(&entry)?;
    assert_eq!(std::fs::read(entry.bundle_path())?, b"two");

    // and the next check is a plain no-update
    assert_eq!(coordinator.check_for_update().await?, CheckOutcome::NoUpdate);
    assert_eq!(coordinator.source().downloads(), 3);
    Ok(())
}

#[tokio::test]
async fn test_bundle_abandoned_by_launch_guard_is_not_reinstalled() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let coordinator = open_coordinator(dir.path());
    coordinator.source().publish("1", b"one");
    coordinator.check_for_update().await?;
    coordinator.source().publish("2", b"two");
    coordinator.check_for_update().await?;
    for _ in 0..3 {
        coordinator.record_launch()?;
    }
    drop(coordinator);

    let reopened = open_coordinator(dir.path());
    assert_eq!(reopened.active_version(), Some(v("1")));
    assert_eq!(reopened.pointer().failed, vec![v("2")]);
    assert!(reopened.cache().get(&v("2")).is_none());

    // storage still advertises 2
    let mut events = reopened.events().subscribe();
    assert_eq!(reopened.check_for_update().await?, CheckOutcome::NoUpdate);
    assert_eq!(reopened.active_version(), Some(v("1")));
    assert!(drain(&mut events).contains(&UpdateEvent::NoUpdate { current: Some(v("1")) }));

    // the mark survives restarts
    drop(reopened);
    let reopened = open_coordinator(dir.path());
    assert_eq!(reopened.check_for_update().await?, CheckOutcome::NoUpdate);

    // a fixed release goes through
    reopened.source().publish("3", b"three");
    assert_eq!(
        reopened.check_for_update().await?,
        CheckOutcome::Updated { version: v("3") }
    );
    Ok(())
}

#[tokio::test]
async fn test_install_other_package_bundle() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let coordinator = open_coordinator(dir.path());
    coordinator.source().publish("5", b"five");
    coordinator.check_for_update().await?;
    coordinator
        .source()
        .publish_package("feature-x", &[("fx-prod", false, &b"feature build"[..])]);

    // an explicit pick installs even though its id is not a newer version
    let outcome = coordinator
        .install("feature-x", BundleSelector::Flavor(BundleFlavor::Prod))
        .await?;
    assert_eq!(outcome, CheckOutcome::Updated { version: v("fx-prod") });
    let pointer = coordinator.pointer();
    assert_eq!(pointer.active, Some(v("fx-prod")));
    assert_eq!(pointer.previous, Some(v("5")));

    let missing = coordinator.install("feature-x", BundleSelector::Id("nope".into())).await;
    assert!(matches!(missing, Err(UpdateError::NotFound(_))));
    assert_eq!(coordinator.phase(), UpdatePhase::Idle);
    Ok(())
}

#[tokio::test]
async fn test_install_during_cycle_is_busy() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let coordinator = open_coordinator(dir.path());
    coordinator.source().publish("1", b"one");
    coordinator
        .source()
        .publish_package("feature-x", &[("fx", true, &b"feature build"[..])]);
    coordinator.source().hold_downloads();

    let running = coordinator.spawn_check();
    let outcome = coordinator
        .install("feature-x", BundleSelector::Id("fx".into()))
        .await?;
    assert_eq!(outcome, CheckOutcome::Busy);

    coordinator.source().release_downloads();
    running.await??;
    assert_eq!(coordinator.active_version(), Some(v("1")));
    Ok(())
}

#[tokio::test]
async fn test_corrupt_install_leaves_pointer_untouched() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let coordinator = open_coordinator(dir.path());
    coordinator.source().publish("1", b"one");
    coordinator.check_for_update().await?;
    coordinator
        .source()
        .publish_package("feature-x", &[("fx", false, &b"feature build"[..])]);

    // the served bytes no longer match the advertised checksum
    coordinator
        .source()
        .publish_package_artifact("fx", b"something else");
    let result = coordinator.install("feature-x", BundleSelector::Id("fx".into())).await;
    assert!(matches!(result, Err(UpdateError::ChecksumMismatch { .. })));
    assert_eq!(coordinator.active_version(), Some(v("1")));
    assert!(coordinator.cache().get(&v("fx")).is_none());
    Ok(())
}
