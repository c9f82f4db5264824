use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;

use crate::fixtures;
use crate::model::{Message, MessageStatus};
use crate::participant::{NoopTaskFactory, Participant, Task, TaskFactory, TaskOutcome, TaskRegistry};

const INSTANCE: &str = "localhost_12918";
const TIMEOUT: Duration = Duration::from_secs(3);

/// A factory which counts task invocations, for asserting what the executor ran.
#[derive(Default)]
struct CountingFactory {
    runs: Arc<AtomicUsize>,
}

struct CountingTask {
    runs: Arc<AtomicUsize>,
    outcome: TaskOutcome,
}

impl TaskFactory for CountingFactory {
    fn create(&self, _message: &Message) -> Arc<dyn Task> {
        Arc::new(CountingTask {
            runs: self.runs.clone(),
            outcome: TaskOutcome::Completed,
        })
    }
}

impl Task for CountingTask {
    fn run(&self) -> TaskOutcome {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.outcome.clone()
    }

    fn cancel(&self) {}
}

struct FailingFactory;

struct FailingTask;

impl TaskFactory for FailingFactory {
    fn create(&self, _message: &Message) -> Arc<dyn Task> {
        Arc::new(FailingTask)
    }
}

impl Task for FailingTask {
    fn run(&self) -> TaskOutcome {
        TaskOutcome::Failed("disk full".to_string())
    }

    fn cancel(&self) {}
}

/// A factory whose tasks block until canceled, for exercising in-flight cancellation.
#[derive(Default)]
struct BlockingFactory {
    started: Arc<AtomicBool>,
    canceled: Arc<AtomicBool>,
}

struct BlockingTask {
    started: Arc<AtomicBool>,
    canceled: Arc<AtomicBool>,
}

impl TaskFactory for BlockingFactory {
    fn create(&self, _message: &Message) -> Arc<dyn Task> {
        Arc::new(BlockingTask {
            started: self.started.clone(),
            canceled: self.canceled.clone(),
        })
    }
}

impl Task for BlockingTask {
    fn run(&self) -> TaskOutcome {
        self.started.store(true, Ordering::SeqCst);
        while !self.canceled.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }
        TaskOutcome::Canceled
    }

    fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }
}

async fn wait_for_registration(data: &crate::metadata::ClusterData) -> Result<()> {
    let live = data.clone();
    fixtures::wait_until(TIMEOUT, move || {
        let live = live.clone();
        async move { Ok(!live.live_instances().await?.is_empty()) }
    })
    .await
}

#[tokio::test]
async fn legal_transition_is_applied_and_message_retired() -> Result<()> {
    let data = fixtures::seeded_cluster().await?;
    let (shutdown_tx, _) = broadcast::channel(1);
    let tasks = TaskRegistry::new();
    tasks.register("MasterSlave", Arc::new(NoopTaskFactory));
    let handle = Participant::new(data.clone(), INSTANCE, tasks, shutdown_tx.clone()).spawn();

    wait_for_registration(&data).await?;

    data.send_message(&Message::new("TestDB", "TestDB_0", INSTANCE, "OFFLINE", "SLAVE", "MasterSlave")).await?;

    let check = data.clone();
    fixtures::wait_until(TIMEOUT, move || {
        let check = check.clone();
        async move {
            let state = check
                .current_state(INSTANCE, "TestDB")
                .await?
                .and_then(|current| current.partitions.get("TestDB_0").cloned());
            Ok(state.as_deref() == Some("SLAVE"))
        }
    })
    .await?;
    assert!(data.messages_for(INSTANCE).await?.is_empty(), "completed message should be retired from the queue");

    let _ = shutdown_tx.send(());
    handle.await??;
    Ok(())
}

#[tokio::test]
async fn illegal_message_is_rejected_without_invoking_the_task() -> Result<()> {
    let data = fixtures::seeded_cluster().await?;
    let (shutdown_tx, _) = broadcast::channel(1);
    let runs = Arc::new(AtomicUsize::new(0));
    let tasks = TaskRegistry::new();
    tasks.register("MasterSlave", Arc::new(CountingFactory { runs: runs.clone() }));
    let handle = Participant::new(data.clone(), INSTANCE, tasks, shutdown_tx.clone()).spawn();

    wait_for_registration(&data).await?;

    // Recorded current state is OFFLINE (nothing recorded yet), so MASTER>SLAVE is stale nonsense.
    let message = Message::new("TestDB", "TestDB_0", INSTANCE, "MASTER", "SLAVE", "MasterSlave");
    data.send_message(&message).await?;

    let check = data.clone();
    let id = message.id.clone();
    fixtures::wait_until(TIMEOUT, move || {
        let check = check.clone();
        let id = id.clone();
        async move {
            let status = check.messages_for(INSTANCE).await?.into_iter().find(|found| found.id == id).map(|found| found.status);
            Ok(status == Some(MessageStatus::Error))
        }
    })
    .await?;
    assert!(data.current_state(INSTANCE, "TestDB").await?.is_none(), "rejected message must leave current state untouched");
    assert_eq!(runs.load(Ordering::SeqCst), 0, "no task may run for a rejected message");

    let _ = shutdown_tx.send(());
    handle.await??;
    Ok(())
}

#[tokio::test]
async fn stale_message_is_discarded_silently() -> Result<()> {
    let data = fixtures::seeded_cluster().await?;
    let (shutdown_tx, _) = broadcast::channel(1);
    let runs = Arc::new(AtomicUsize::new(0));
    let tasks = TaskRegistry::new();
    tasks.register("MasterSlave", Arc::new(CountingFactory { runs: runs.clone() }));
    let handle = Participant::new(data.clone(), INSTANCE, tasks, shutdown_tx.clone()).spawn();

    wait_for_registration(&data).await?;

    data.send_message(&Message::new("TestDB", "TestDB_0", INSTANCE, "OFFLINE", "SLAVE", "MasterSlave")).await?;
    let check = data.clone();
    fixtures::wait_until(TIMEOUT, move || {
        let check = check.clone();
        async move {
            let state = check
                .current_state(INSTANCE, "TestDB")
                .await?
                .and_then(|current| current.partitions.get("TestDB_0").cloned());
            Ok(state.as_deref() == Some("SLAVE"))
        }
    })
    .await?;

    // The target is already at SLAVE; a second message to the same state is stale.
    data.send_message(&Message::new("TestDB", "TestDB_0", INSTANCE, "OFFLINE", "SLAVE", "MasterSlave")).await?;
    let check = data.clone();
    fixtures::wait_until(TIMEOUT, move || {
        let check = check.clone();
        async move { Ok(check.messages_for(INSTANCE).await?.is_empty()) }
    })
    .await?;

    let state = data
        .current_state(INSTANCE, "TestDB")
        .await?
        .and_then(|current| current.partitions.get("TestDB_0").cloned());
    assert_eq!(state.as_deref(), Some("SLAVE"), "stale discard must not disturb current state");
    assert_eq!(runs.load(Ordering::SeqCst), 1, "the stale message must not invoke a task");

    let _ = shutdown_tx.send(());
    handle.await??;
    Ok(())
}

#[tokio::test]
async fn failed_task_marks_message_errored_and_leaves_state() -> Result<()> {
    let data = fixtures::seeded_cluster().await?;
    let (shutdown_tx, _) = broadcast::channel(1);
    let tasks = TaskRegistry::new();
    tasks.register("MasterSlave", Arc::new(FailingFactory));
    let handle = Participant::new(data.clone(), INSTANCE, tasks, shutdown_tx.clone()).spawn();

    wait_for_registration(&data).await?;

    let message = Message::new("TestDB", "TestDB_0", INSTANCE, "OFFLINE", "SLAVE", "MasterSlave");
    data.send_message(&message).await?;

    let check = data.clone();
    let id = message.id.clone();
    fixtures::wait_until(TIMEOUT, move || {
        let check = check.clone();
        let id = id.clone();
        async move {
            let status = check.messages_for(INSTANCE).await?.into_iter().find(|found| found.id == id).map(|found| found.status);
            Ok(status == Some(MessageStatus::Error))
        }
    })
    .await?;
    let state = data
        .current_state(INSTANCE, "TestDB")
        .await?
        .and_then(|current| current.partitions.get("TestDB_0").cloned());
    assert!(state.is_none(), "a failed transition must not advance current state, got {:?}", state);

    let _ = shutdown_tx.send(());
    handle.await??;
    Ok(())
}

#[tokio::test]
async fn removing_an_inflight_message_cancels_its_task() -> Result<()> {
    let data = fixtures::seeded_cluster().await?;
    let (shutdown_tx, _) = broadcast::channel(1);
    let factory = BlockingFactory::default();
    let started = factory.started.clone();
    let canceled = factory.canceled.clone();
    let tasks = TaskRegistry::new();
    tasks.register("MasterSlave", Arc::new(factory));
    let handle = Participant::new(data.clone(), INSTANCE, tasks, shutdown_tx.clone()).spawn();

    wait_for_registration(&data).await?;

    let message = Message::new("TestDB", "TestDB_0", INSTANCE, "OFFLINE", "SLAVE", "MasterSlave");
    data.send_message(&message).await?;
    let running = started.clone();
    fixtures::wait_until(TIMEOUT, move || {
        let running = running.clone();
        async move { Ok(running.load(Ordering::SeqCst)) }
    })
    .await?;

    data.remove_message(INSTANCE, &message.id).await?;

    let stopped = canceled.clone();
    fixtures::wait_until(TIMEOUT, move || {
        let stopped = stopped.clone();
        async move { Ok(stopped.load(Ordering::SeqCst)) }
    })
    .await?;

    let _ = shutdown_tx.send(());
    handle.await??;
    assert!(data.current_state(INSTANCE, "TestDB").await?.is_none(), "a canceled transition must not commit current state");
    assert!(data.messages_for(INSTANCE).await?.is_empty(), "no message may linger after removal");
    Ok(())
}

#[tokio::test]
async fn pending_messages_apply_in_creation_order_within_one_second() -> Result<()> {
    let data = fixtures::seeded_cluster().await?;
    let (shutdown_tx, _) = broadcast::channel(1);
    let tasks = TaskRegistry::new();
    tasks.register("MasterSlave", Arc::new(NoopTaskFactory));

    // Two chained hops created within the same wall-clock second, enqueued before
    // the executor starts; applying them out of order would reject the second hop.
    let first = Message::new("TestDB", "TestDB_0", INSTANCE, "OFFLINE", "SLAVE", "MasterSlave");
    let mut second = Message::new("TestDB", "TestDB_0", INSTANCE, "SLAVE", "MASTER", "MasterSlave");
    second.created_at = first.created_at;
    data.send_message(&first).await?;
    data.send_message(&second).await?;

    let handle = Participant::new(data.clone(), INSTANCE, tasks, shutdown_tx.clone()).spawn();

    let check = data.clone();
    fixtures::wait_until(TIMEOUT, move || {
        let check = check.clone();
        async move {
            let state = check
                .current_state(INSTANCE, "TestDB")
                .await?
                .and_then(|current| current.partitions.get("TestDB_0").cloned());
            Ok(state.as_deref() == Some("MASTER") && check.messages_for(INSTANCE).await?.is_empty())
        }
    })
    .await?;

    let _ = shutdown_tx.send(());
    handle.await??;
    Ok(())
}

#[tokio::test]
async fn session_expiry_triggers_re_registration() -> Result<()> {
    let data = fixtures::seeded_cluster().await?;
    let (shutdown_tx, _) = broadcast::channel(1);
    let tasks = TaskRegistry::new();
    tasks.register("MasterSlave", Arc::new(NoopTaskFactory));
    let handle = Participant::new(data.clone(), INSTANCE, tasks, shutdown_tx.clone()).spawn();

    wait_for_registration(&data).await?;
    let first_session = data.live_instances().await?[0].session_id.clone();

    data.store().expire_session(first_session.parse()?)?;

    let check = data.clone();
    let prior = first_session.clone();
    fixtures::wait_until(TIMEOUT, move || {
        let check = check.clone();
        let prior = prior.clone();
        async move { Ok(check.live_instances().await?.first().map(|found| found.session_id != prior).unwrap_or(false)) }
    })
    .await?;

    let _ = shutdown_tx.send(());
    handle.await??;
    Ok(())
}
