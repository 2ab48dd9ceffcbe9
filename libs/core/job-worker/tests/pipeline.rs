//! End-to-end tests of the fetch, process and acknowledge pipeline against
//! the in-memory store.

use job_worker::{
    Config, JobError, JobStore, Manager, MemoryStore, Message, Middlewares, Options, Producer,
    RetryJobs, job_fn,
};
use serde_json::{Value, json};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

fn config(store: &MemoryStore, namespace: &str) -> Config {
    Config::with_store(
        Options::new("1")
            .with_namespace(namespace)
            .with_poll_interval_secs(1),
        Arc::new(store.clone()),
    )
    .unwrap()
}

fn start(manager: &Manager) -> JoinHandle<()> {
    let manager = manager.clone();
    tokio::spawn(async move { manager.run().await })
}

async fn shutdown(manager: &Manager, task: JoinHandle<()>) {
    manager.stop().await;
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("manager did not stop")
        .unwrap();
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Handler that records the jid and args of every job it runs
fn recorder() -> (Arc<Mutex<Vec<(String, Vec<Value>)>>>, job_worker::Handler) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = Arc::new(job_fn({
        let seen = seen.clone();
        move |message: Message| {
            seen.lock()
                .unwrap()
                .push((message.jid().to_string(), message.args().to_vec()));
            async { Ok::<(), JobError>(()) }
        }
    }));
    (seen, handler)
}

#[tokio::test]
async fn test_processes_and_acknowledges_raw_job() {
    let store = MemoryStore::new();
    let manager = Manager::with_config(config(&store, ""));
    let (seen, handler) = recorder();
    manager.add_worker("myqueue", 1, handler, None).await.unwrap();

    store
        .lpush("queue:myqueue", r#"{"jid":"1","args":["a","b"]}"#)
        .await
        .unwrap();
    let task = start(&manager);

    eventually("the job to run", || async { !seen.lock().unwrap().is_empty() }).await;
    eventually("the acknowledgement", || async {
        store.llen("queue:myqueue:1:inprogress").await.unwrap() == 0
    })
    .await;

    assert_eq!(
        seen.lock().unwrap().clone(),
        vec![("1".to_string(), vec![json!("a"), json!("b")])]
    );
    assert_eq!(store.llen("queue:myqueue").await.unwrap(), 0);
    assert_eq!(store.counter("stat:processed").await, 1);

    shutdown(&manager, task).await;
}

#[tokio::test]
async fn test_namespaced_keys() {
    let store = MemoryStore::new();
    let manager = Manager::with_config(config(&store, "prod"));
    let (seen, handler) = recorder();
    manager.add_worker("myqueue", 2, handler, None).await.unwrap();

    manager
        .producer()
        .enqueue("myqueue", vec![json!(1)])
        .await
        .unwrap();
    assert_eq!(store.llen("prod:queue:myqueue").await.unwrap(), 1);

    let task = start(&manager);
    eventually("the job to run", || async { seen.lock().unwrap().len() == 1 }).await;
    eventually("the acknowledgement", || async {
        store.llen("prod:queue:myqueue:1:inprogress").await.unwrap() == 0
    })
    .await;

    shutdown(&manager, task).await;
}

#[tokio::test]
async fn test_replays_leftovers_from_previous_run_first() {
    let store = MemoryStore::new();
    // A crashed run of process "1" claimed "old-1" then "old-2"
    store
        .lpush("queue:work:1:inprogress", r#"{"jid":"old-1","args":[]}"#)
        .await
        .unwrap();
    store
        .lpush("queue:work:1:inprogress", r#"{"jid":"old-2","args":[]}"#)
        .await
        .unwrap();
    store
        .lpush("queue:work", r#"{"jid":"new","args":[]}"#)
        .await
        .unwrap();

    let manager = Manager::with_config(config(&store, ""));
    let (seen, handler) = recorder();
    manager.add_worker("work", 1, handler, None).await.unwrap();
    let task = start(&manager);

    eventually("all jobs to run", || async { seen.lock().unwrap().len() == 3 }).await;
    eventually("the acknowledgements", || async {
        store.llen("queue:work:1:inprogress").await.unwrap() == 0
    })
    .await;

    let order: Vec<String> = seen.lock().unwrap().iter().map(|(jid, _)| jid.clone()).collect();
    assert_eq!(order, ["old-1", "old-2", "new"]);

    shutdown(&manager, task).await;
}

#[tokio::test]
async fn test_other_process_leftovers_are_not_replayed() {
    let store = MemoryStore::new();
    store
        .lpush("queue:work:2:inprogress", r#"{"jid":"theirs","args":[]}"#)
        .await
        .unwrap();

    let manager = Manager::with_config(config(&store, ""));
    let (seen, handler) = recorder();
    manager.add_worker("work", 1, handler, None).await.unwrap();
    let task = start(&manager);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(store.llen("queue:work:2:inprogress").await.unwrap(), 1);

    shutdown(&manager, task).await;
}

#[tokio::test]
async fn test_scheduled_job_runs_when_due() {
    let store = MemoryStore::new();
    let manager = Manager::with_config(config(&store, ""));
    let (seen, handler) = recorder();
    manager.add_worker("later", 1, handler, None).await.unwrap();

    let producer = Producer::new(manager.config().clone());
    let jid = producer
        .enqueue_in("later", Duration::from_millis(500), vec![json!("x")])
        .await
        .unwrap();
    assert_eq!(producer.scheduled_length().await.unwrap(), 1);

    let task = start(&manager);
    eventually("the scheduled job to run", || async {
        !seen.lock().unwrap().is_empty()
    })
    .await;

    assert_eq!(seen.lock().unwrap()[0].0, jid);
    assert_eq!(producer.scheduled_length().await.unwrap(), 0);

    shutdown(&manager, task).await;
}

#[tokio::test]
async fn test_panicking_job_without_retry_is_acknowledged() {
    let store = MemoryStore::new();
    let manager = Manager::with_config(config(&store, ""));
    manager
        .add_worker(
            "boom",
            1,
            Arc::new(job_fn(|message: Message| async move {
                if message.jid() == "1" {
                    panic!("boom");
                }
                Ok::<(), JobError>(())
            })),
            None,
        )
        .await
        .unwrap();

    store
        .lpush("queue:boom", r#"{"jid":"1","args":[]}"#)
        .await
        .unwrap();
    let task = start(&manager);

    eventually("the failure to be counted", || async {
        store.counter("stat:failed").await == 1
    })
    .await;
    eventually("the acknowledgement", || async {
        store.llen("queue:boom:1:inprogress").await.unwrap() == 0
    })
    .await;
    assert_eq!(store.zcard("goretry").await.unwrap(), 0);

    shutdown(&manager, task).await;
}

#[tokio::test]
async fn test_panicking_job_with_retry_moves_to_retry_set() {
    let store = MemoryStore::new();
    let manager = Manager::with_config(config(&store, ""));
    manager
        .add_worker(
            "boom",
            1,
            Arc::new(job_fn(|message: Message| async move {
                if message.jid() == "1" {
                    panic!("boom");
                }
                Ok::<(), JobError>(())
            })),
            None,
        )
        .await
        .unwrap();

    store
        .lpush("queue:boom", r#"{"jid":"1","args":[],"retry":true}"#)
        .await
        .unwrap();
    let task = start(&manager);

    eventually("the retry", || async {
        store.zcard("goretry").await.unwrap() == 1
    })
    .await;

    let retried = store.zrange("goretry", 0, 0).await.unwrap();
    let record: Value = serde_json::from_str(&retried[0]).unwrap();
    assert_eq!(record["error_message"], "boom");
    assert_eq!(record["queue"], "boom");
    assert_eq!(record["retry_count"], 0);

    eventually("the failure to be counted", || async {
        store.counter("stat:failed").await == 1
    })
    .await;
    shutdown(&manager, task).await;

    let in_progress = store.lrange_all("queue:boom:1:inprogress").await.unwrap();
    assert_eq!(in_progress, vec![r#"{"jid":"1","args":[],"retry":true}"#.to_string()]);
}

#[tokio::test]
async fn test_custom_chain_runs_outer_layers_first() {
    let store = MemoryStore::new();
    let manager = Manager::with_config(config(&store, ""));
    let calls = Arc::new(Mutex::new(Vec::new()));

    let tagging = |name: &'static str, calls: Arc<Mutex<Vec<&'static str>>>| {
        move |_: &str, _: &Config, next: job_worker::Handler| -> job_worker::Handler {
            Arc::new(Tagged {
                name,
                calls: calls.clone(),
                next,
            })
        }
    };
    let chain = Middlewares::new()
        .append(tagging("inner", calls.clone()))
        .prepend(tagging("outer", calls.clone()))
        .append(RetryJobs);

    let (seen, handler) = recorder();
    manager.add_worker("chain", 1, handler, Some(chain)).await.unwrap();
    store
        .lpush("queue:chain", r#"{"jid":"1","args":[]}"#)
        .await
        .unwrap();

    let task = start(&manager);
    eventually("the job to run", || async { seen.lock().unwrap().len() == 1 }).await;
    shutdown(&manager, task).await;

    assert_eq!(calls.lock().unwrap().clone(), ["outer", "inner"]);
}

struct Tagged {
    name: &'static str,
    calls: Arc<Mutex<Vec<&'static str>>>,
    next: job_worker::Handler,
}

#[async_trait::async_trait]
impl job_worker::JobHandler for Tagged {
    async fn perform(&self, message: &mut Message) -> Result<(), JobError> {
        self.calls.lock().unwrap().push(self.name);
        self.next.perform(message).await
    }
}

#[tokio::test]
async fn test_stop_and_run_are_idempotent() {
    let store = MemoryStore::new();
    let manager = Manager::with_config(config(&store, ""));
    let (_, handler) = recorder();
    manager.add_worker("idle", 3, handler, None).await.unwrap();

    manager.stop().await;

    let task = start(&manager);
    eventually("the manager to start", || async { manager.is_running().await }).await;
    shutdown(&manager, task).await;
    manager.stop().await;

    // Can be started again after a stop
    let task = start(&manager);
    eventually("the manager to restart", || async { manager.is_running().await }).await;
    shutdown(&manager, task).await;
}
