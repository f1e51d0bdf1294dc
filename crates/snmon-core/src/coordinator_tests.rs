use std::future::pending;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::coordinator::{PollConflict, PollCoordinator, PollKind, PollLease, PollStatus};
use crate::store::StoreError;

/// Lease table shared by every coordinator built over it.
#[derive(Debug, Default)]
struct SharedLease {
    holder: Mutex<Option<PollKind>>,
}

impl PollLease for SharedLease {
    fn acquire(&self, kind: PollKind) -> Result<Option<PollKind>, StoreError> {
        let mut holder = self.holder.lock().expect("lease lock");
        if let Some(running) = *holder {
            return Ok(Some(running));
        }
        *holder = Some(kind);
        Ok(None)
    }

    fn release(&self) -> Result<(), StoreError> {
        *self.holder.lock().expect("lease lock") = None;
        Ok(())
    }

    fn holder(&self) -> Result<Option<PollKind>, StoreError> {
        Ok(*self.holder.lock().expect("lease lock"))
    }
}

#[tokio::test]
async fn idle_coordinator_reports_not_running() {
    // Arrange
    let coordinator = PollCoordinator::new();

    // Act
    let status = coordinator.status().await;

    // Assert
    assert_eq!(
        status,
        PollStatus {
            running: false,
            kind: None
        }
    );
}

#[tokio::test]
async fn manual_poll_is_rejected_while_automatic_cycle_runs() {
    // Arrange
    let coordinator = PollCoordinator::new();
    let (release, wait) = oneshot::channel::<()>();
    let (started_tx, started) = oneshot::channel::<()>();
    let background = coordinator.clone();
    let cycle = tokio::spawn(async move {
        background
            .automatic(async move {
                let _ = started_tx.send(());
                let _ = wait.await;
                7
            })
            .await
    });
    started.await.expect("automatic cycle started");

    // Act
    let conflict = coordinator.manual(async { 1 }).await;
    let status = coordinator.status().await;
    release.send(()).expect("release cycle");
    let finished = cycle.await.expect("join");

    // Assert
    assert_eq!(
        conflict,
        Err(PollConflict {
            running: PollKind::Automatic
        })
    );
    assert_eq!(status.kind, Some(PollKind::Automatic));
    assert_eq!(finished, Some(7));
    assert!(!coordinator.status().await.running);
}

#[tokio::test]
async fn automatic_cycle_is_skipped_while_manual_poll_runs() {
    // Arrange
    let coordinator = PollCoordinator::new();
    assert!(coordinator.try_start(PollKind::Manual).await);

    // Act
    let skipped = coordinator.automatic(async { "ran" }).await;
    coordinator.end().await;
    let ran = coordinator.automatic(async { "ran" }).await;

    // Assert
    assert_eq!(skipped, None);
    assert_eq!(ran, Some("ran"));
}

#[tokio::test]
async fn conflict_message_names_the_running_kind() {
    // Arrange
    let conflict = PollConflict {
        running: PollKind::Manual,
    };

    // Act
    let message = conflict.to_string();

    // Assert
    assert_eq!(message, "a manual poll is already in progress");
}

#[tokio::test]
async fn cancelled_manual_poll_frees_the_slot() {
    // Arrange
    let coordinator = PollCoordinator::new();

    // Act
    let timed_out = timeout(Duration::from_millis(10), coordinator.manual(pending::<()>())).await;

    // Assert
    assert!(timed_out.is_err());
    assert!(!coordinator.status().await.running);
    assert_eq!(coordinator.automatic(async { 3 }).await, Some(3));
}

#[tokio::test]
async fn panicking_cycle_frees_the_slot() {
    // Arrange
    let coordinator = PollCoordinator::new();
    let background = coordinator.clone();

    // Act
    let joined = tokio::spawn(async move {
        background
            .automatic(async {
                panic!("cycle blew up");
            })
            .await
    })
    .await;

    // Assert
    assert!(joined.is_err());
    assert!(!coordinator.status().await.running);
    assert_eq!(coordinator.manual(async { 4 }).await, Ok(4));
}

#[tokio::test]
async fn cycle_held_by_another_process_blocks_both_kinds() {
    // Arrange
    let lease = Arc::new(SharedLease::default());
    let daemon = PollCoordinator::with_lease(lease.clone());
    let operator = PollCoordinator::with_lease(lease.clone());
    let (release, wait) = oneshot::channel::<()>();
    let (started_tx, started) = oneshot::channel::<()>();
    let background = daemon.clone();
    let cycle = tokio::spawn(async move {
        background
            .automatic(async move {
                let _ = started_tx.send(());
                let _ = wait.await;
            })
            .await
    });
    started.await.expect("automatic cycle started");

    // Act
    let conflict = operator.manual(async { 1 }).await;
    let status = operator.status().await;
    release.send(()).expect("release cycle");
    cycle.await.expect("join");

    // Assert
    assert_eq!(
        conflict,
        Err(PollConflict {
            running: PollKind::Automatic
        })
    );
    assert_eq!(status.kind, Some(PollKind::Automatic));
    assert_eq!(lease.holder().expect("holder"), None);
    assert_eq!(operator.manual(async { 2 }).await, Ok(2));
}
