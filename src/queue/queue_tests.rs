use super::Queue;
use super::QueueError;
use super::Queueable;
use crate::JobId;
use crate::LockParams;
use crate::NewJob;
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::fs;
use std::panic;
use std::path::Path;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn test_queue(dir: &TempDir) -> Queue {
    Queue::builder()
        .path(dir.path().join("queue.json"))
        .lock_params(LockParams::with_timeout(Duration::from_secs(10)))
        .build()
}

fn new_job(command: &str) -> NewJob {
    let mut environment = BTreeMap::new();
    environment.insert("HOME".to_string(), "/home/tester".to_string());

    NewJob::builder()
        .command(command)
        .working_directory("/tmp")
        .environment(environment)
        .build()
}

fn corrupt_backups(dir: &TempDir) -> Vec<String> {
    let mut backups: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map_or(false, |name| name.starts_with("queue.json.corrupt-"))
        })
        .collect();
    backups.sort();

    backups
        .iter()
        .map(|path| fs::read_to_string(path).unwrap())
        .collect()
}

fn stored_json(path: &Path) -> serde_json::Value {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn enqueue_test() {
    let dir = tempfile::tempdir().unwrap();
    let queue = test_queue(&dir);

    let id = queue.enqueue(new_job("echo 1")).unwrap();

    assert_eq!(JobId(1), id);
    assert_eq!(1, queue.count().unwrap());

    let job = queue.find(id).unwrap().unwrap();

    assert_eq!("echo 1", job.command);
    assert_eq!(Path::new("/tmp"), job.working_directory);
    assert_eq!(Some("/home/tester"), job.environment.get("HOME").map(String::as_str));
    assert!(job.created_at.is_some());
}

#[test]
fn list_returns_ids_in_enqueue_order() {
    let dir = tempfile::tempdir().unwrap();
    let queue = test_queue(&dir);

    let ids: Vec<JobId> = (0..10)
        .map(|n| queue.enqueue(new_job(&format!("echo {n}"))).unwrap())
        .collect();

    let listing = queue.list().unwrap();

    assert_eq!(ids, listing.ids().collect::<Vec<_>>());
    // the snapshot can be walked again
    assert_eq!(10, listing.iter().count());
    assert_eq!(
        "echo 0",
        listing.into_iter().next().map(|job| job.command).unwrap()
    );
}

#[test]
fn pop_returns_the_oldest_job() {
    let dir = tempfile::tempdir().unwrap();
    let queue = test_queue(&dir);

    for n in 0..3 {
        queue.enqueue(new_job(&format!("echo {n}"))).unwrap();
    }

    for (n, expected_count) in [(0, 2), (1, 1), (2, 0)] {
        let job = queue.pop().unwrap().unwrap();

        assert_eq!(format!("echo {n}"), job.command);
        assert_eq!(expected_count, queue.count().unwrap());
    }

    assert_eq!(None, queue.pop().unwrap());
    assert_eq!(0, queue.count().unwrap());
}

#[test]
fn pop_on_a_fresh_store_is_none() {
    let dir = tempfile::tempdir().unwrap();
    let queue = test_queue(&dir);

    assert_eq!(None, queue.pop().unwrap());
    assert!(queue.list().unwrap().is_empty());
}

#[test]
fn remove_task_test() {
    let dir = tempfile::tempdir().unwrap();
    let queue = test_queue(&dir);

    let first = queue.enqueue(new_job("first")).unwrap();
    let second = queue.enqueue(new_job("second")).unwrap();

    assert_eq!(1, queue.remove(first).unwrap());
    assert_eq!(0, queue.remove(first).unwrap());
    assert_eq!(0, queue.remove(JobId(1234)).unwrap());

    assert_eq!(None, queue.find(first).unwrap());
    assert!(queue.find(second).unwrap().is_some());
    assert_eq!(1, queue.count().unwrap());
}

#[test]
fn ids_are_never_reused() {
    let dir = tempfile::tempdir().unwrap();
    let queue = test_queue(&dir);

    let first = queue.enqueue(new_job("first")).unwrap();
    let second = queue.enqueue(new_job("second")).unwrap();

    queue.remove(second).unwrap();
    queue.pop().unwrap();
    assert_eq!(0, queue.clear().unwrap());

    let third = queue.enqueue(new_job("third")).unwrap();

    assert!(third > first);
    assert!(third > second);
}

#[test]
fn clear_removes_everything() {
    let dir = tempfile::tempdir().unwrap();
    let queue = test_queue(&dir);

    queue.enqueue(new_job("first")).unwrap();
    queue.enqueue(new_job("second")).unwrap();

    assert_eq!(2, queue.clear().unwrap());
    assert_eq!(0, queue.count().unwrap());
}

#[test]
fn state_survives_between_queue_instances() {
    let dir = tempfile::tempdir().unwrap();

    test_queue(&dir).enqueue(new_job("first")).unwrap();
    test_queue(&dir).enqueue(new_job("second")).unwrap();

    let json = stored_json(&dir.path().join("queue.json"));

    assert_eq!(2, json["lastId"].as_u64().unwrap());
    assert_eq!(serde_json::json!(["1", "2"]), json["jobQueue"]);

    let job = test_queue(&dir).pop().unwrap().unwrap();
    assert_eq!("first", job.command);
}

#[test]
fn shorter_ledger_truncates_the_old_contents() {
    let dir = tempfile::tempdir().unwrap();
    let queue = test_queue(&dir);

    for n in 0..20 {
        queue.enqueue(new_job(&format!("a fairly long command number {n}"))).unwrap();
    }

    queue.clear().unwrap();

    let json = stored_json(&queue.path);

    assert_eq!(20, json["lastId"].as_u64().unwrap());
    assert!(json["jobs"].as_object().unwrap().is_empty());
}

#[test]
fn read_only_operations_do_not_write() {
    let dir = tempfile::tempdir().unwrap();
    let queue = test_queue(&dir);

    queue.count().unwrap();
    queue.list().unwrap();

    assert!(!queue.path.exists());
}

#[test]
fn corrupt_store_is_recovered_as_empty() {
    let dir = tempfile::tempdir().unwrap();
    let queue = test_queue(&dir);

    fs::write(&queue.path, "{ this is not json").unwrap();

    assert_eq!(0, queue.count().unwrap());
    assert_eq!(vec!["{ this is not json".to_string()], corrupt_backups(&dir));

    let id = queue.enqueue(new_job("after corruption")).unwrap();

    assert_eq!(JobId(1), id);
    assert_eq!(1, queue.count().unwrap());
}

#[test]
fn writes_replace_the_file_without_leftovers() {
    let dir = tempfile::tempdir().unwrap();
    let queue = test_queue(&dir);

    for n in 0..5 {
        queue.enqueue(new_job(&format!("echo {n}"))).unwrap();
    }

    let mut names: Vec<String> = fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();

    assert_eq!(vec!["queue.json", "queue.json.lock"], names);
    assert_eq!(5, stored_json(&queue.path)["lastId"].as_u64().unwrap());
}

#[test]
fn half_written_file_is_kept_aside_when_recovered() {
    let dir = tempfile::tempdir().unwrap();
    let queue = test_queue(&dir);

    for n in 0..5 {
        queue.enqueue(new_job(&format!("echo {n}"))).unwrap();
    }

    let full = fs::read_to_string(&queue.path).unwrap();
    let torn = full[..full.len() / 2].to_string();
    fs::write(&queue.path, &torn).unwrap();

    assert_eq!(0, queue.count().unwrap());
    assert!(!queue.path.exists());
    assert_eq!(vec![torn], corrupt_backups(&dir));

    queue.enqueue(new_job("after the crash")).unwrap();

    assert_eq!(1, queue.count().unwrap());
    assert_eq!(1, corrupt_backups(&dir).len());
}

#[test]
fn inconsistent_store_is_recovered_as_empty() {
    let dir = tempfile::tempdir().unwrap();
    let queue = test_queue(&dir);

    fs::write(
        &queue.path,
        r#"{"lastId": 3, "jobs": {}, "jobQueue": ["3"]}"#,
    )
    .unwrap();

    assert_eq!(None, queue.pop().unwrap());
}

#[test]
fn corrupt_store_is_an_error_when_recovery_is_off() {
    let dir = tempfile::tempdir().unwrap();
    let queue = Queue::builder()
        .path(dir.path().join("queue.json"))
        .recover_corrupt(false)
        .build();

    fs::write(&queue.path, "[1, 2, 3]").unwrap();

    match queue.enqueue(new_job("lost")) {
        Err(QueueError::CorruptStore { path, .. }) => assert_eq!(queue.path, path),
        other => panic!("expected a corrupt store error, got {other:?}"),
    }

    // the broken file is left alone for inspection
    assert_eq!("[1, 2, 3]", fs::read_to_string(&queue.path).unwrap());
}

#[test]
fn failed_transaction_writes_nothing_and_releases_the_lock() {
    let dir = tempfile::tempdir().unwrap();
    let queue = test_queue(&dir);

    queue.enqueue(new_job("kept")).unwrap();

    let result: Result<(), QueueError> = queue.transaction(|ledger| {
        ledger.clear();

        Err(QueueError::CorruptStore {
            path: dir.path().to_path_buf(),
            reason: "simulated".to_string(),
        })
    });

    assert!(result.is_err());
    assert_eq!(1, queue.count().unwrap());
}

#[test]
fn panic_inside_a_transaction_releases_the_lock() {
    let dir = tempfile::tempdir().unwrap();
    let queue = test_queue(&dir);

    queue.enqueue(new_job("kept")).unwrap();

    let panicking = queue.clone();
    let outcome = panic::catch_unwind(move || {
        let _: Result<(), QueueError> = panicking.transaction(|_ledger| panic!("boom"));
    });

    assert!(outcome.is_err());

    let quick = Queue::builder()
        .path(queue.path.clone())
        .lock_params(LockParams::with_timeout(Duration::from_millis(500)))
        .build();

    assert_eq!(1, quick.count().unwrap());
}

#[test]
fn busy_store_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let queue = test_queue(&dir);

    let impatient = Queue::builder()
        .path(queue.path.clone())
        .lock_params(LockParams::with_timeout(Duration::from_millis(100)))
        .build();

    let result = queue.transaction(|_ledger| Ok(impatient.count())).unwrap();

    match result {
        Err(QueueError::LockTimeout { path, .. }) => assert_eq!(queue.lock_path(), path),
        other => panic!("expected a lock timeout, got {other:?}"),
    }
}

#[test]
fn concurrent_enqueues_and_pops_lose_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let queue = test_queue(&dir);

    let producers: Vec<_> = (0..8)
        .map(|worker| {
            let queue = queue.clone();

            thread::spawn(move || {
                (0..10)
                    .map(|n| {
                        queue
                            .enqueue(new_job(&format!("worker {worker} job {n}")))
                            .unwrap()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let issued: Vec<JobId> = producers
        .into_iter()
        .flat_map(|handle| handle.join().unwrap())
        .collect();

    let unique: HashSet<JobId> = issued.iter().copied().collect();

    assert_eq!(80, issued.len());
    assert_eq!(80, unique.len());
    assert_eq!(80, queue.count().unwrap());

    let consumers: Vec<_> = (0..4)
        .map(|_| {
            let queue = queue.clone();

            thread::spawn(move || {
                let mut popped = Vec::new();

                while let Some(job) = queue.pop().unwrap() {
                    popped.push(job.id);
                }

                popped
            })
        })
        .collect();

    let popped: Vec<JobId> = consumers
        .into_iter()
        .flat_map(|handle| handle.join().unwrap())
        .collect();

    let popped_unique: HashSet<JobId> = popped.iter().copied().collect();

    assert_eq!(80, popped.len());
    assert_eq!(unique, popped_unique);
    assert_eq!(0, queue.count().unwrap());
}
