use std::sync::{Arc, Mutex};
use std::time::Duration;

use worksched::{SerialQueue, SerialQueueError};

#[tokio::test]
async fn items_run_in_submission_order_without_overlap() {
    let queue = SerialQueue::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let running = Arc::new(Mutex::new(false));

    for i in 0..20u64 {
        let log = log.clone();
        let running = running.clone();
        queue
            .enqueue(move || async move {
                assert!(!std::mem::replace(&mut *running.lock().unwrap(), true), "items overlapped");
                // Later items finish faster, so any reordering would show up.
                tokio::time::sleep(Duration::from_millis(20 - i)).await;
                log.lock().unwrap().push(i);
                *running.lock().unwrap() = false;
            })
            .unwrap();
    }

    queue.wait_for_current_operations().await.unwrap();
    assert_eq!(*log.lock().unwrap(), (0..20).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submitters_each_keep_their_order() {
    let queue = Arc::new(SerialQueue::new());
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut producers = Vec::new();
    for producer in 0..4u32 {
        let queue = queue.clone();
        let log = log.clone();
        producers.push(tokio::spawn(async move {
            for seq in 0..25u32 {
                let log = log.clone();
                queue.enqueue(move || async move { log.lock().unwrap().push((producer, seq)) }).unwrap();
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }
    queue.wait_for_current_operations().await.unwrap();

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 100);
    for producer in 0..4u32 {
        let seqs: Vec<u32> = log.iter().filter(|(p, _)| *p == producer).map(|(_, s)| *s).collect();
        assert_eq!(seqs, (0..25).collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn panic_is_isolated_to_its_item() {
    let queue = SerialQueue::new();
    let after = Arc::new(Mutex::new(false));

    queue.enqueue(|| async { panic!("work item failed") }).unwrap();
    let flag = after.clone();
    queue.enqueue(move || async move { *flag.lock().unwrap() = true }).unwrap();

    queue.wait_for_current_operations().await.unwrap();
    assert!(*after.lock().unwrap());
    assert_eq!(queue.run(|| async { panic!("again") }).await, Err::<(), _>(SerialQueueError::Aborted));
    assert_eq!(queue.run(|| async { 5 }).await, Ok(5));
}

#[tokio::test]
async fn wait_covers_only_prior_items() {
    let queue = SerialQueue::new();
    let gate = Arc::new(tokio::sync::Notify::new());
    let log = Arc::new(Mutex::new(Vec::new()));

    let first = log.clone();
    queue.enqueue(move || async move { first.lock().unwrap().push("first") }).unwrap();

    // Polling once places the wait marker in the queue.
    let mut wait = Box::pin(queue.wait_for_current_operations());
    assert!(futures::poll!(wait.as_mut()).is_pending());

    let blocked = gate.clone();
    let second = log.clone();
    queue
        .enqueue(move || async move {
            blocked.notified().await;
            second.lock().unwrap().push("second");
        })
        .unwrap();

    wait.await.unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["first"]);

    gate.notify_one();
    queue.stop().await;
    assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
}
