//! End-to-end tests of the orchestration service with scripted collaborators.

mod common;

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use flate2::read::GzDecoder;
use image_forge::credentials::CredentialHealth;
use image_forge::storage::BlobStore;
use image_forge::tasks::TaskStatus;
use image_forge::{CreateTaskRequest, ErrorCode};

fn request(name: &str, prompts: &[&str]) -> CreateTaskRequest {
    CreateTaskRequest {
        name: name.to_string(),
        prompts: prompts.iter().map(|p| p.to_string()).collect(),
        ..CreateTaskRequest::default()
    }
}

#[tokio::test]
async fn test_zero_prompts_rejected_without_persisting() {
    let h = harness(&[KEY_A]);
    let err = h
        .service
        .create_task(request("empty", &[]))
        .await
        .expect_err("should reject");
    assert_eq!(err.code(), ErrorCode::InvalidInput);
    assert_eq!(err.to_body().code, ErrorCode::InvalidInput);
    assert!(h.service.list_tasks().is_empty());
}

#[tokio::test]
async fn test_credentials_round_robin() {
    let h = harness_with(
        test_config().with_max_parallel_jobs(1),
        ScriptedGenerator::default(),
        &[KEY_A, KEY_B],
    );
    h.service.start().expect("should start");

    let mut req = request("trio", &["a red kite", "a blue kite", "a green kite"]);
    req.auto_start = true;
    let created = h.service.create_task(req).await.expect("should create");
    let task = wait_terminal(&h.service, created.task_id).await;

    assert_eq!(task.status, TaskStatus::Completed);
    let suffixes: Vec<&str> = task
        .results
        .iter()
        .filter_map(|r| r.credential_suffix.as_deref())
        .collect();
    assert_eq!(suffixes, vec![SUFFIX_A, SUFFIX_B, SUFFIX_A]);
    let keys: Vec<String> = h.generator.calls().into_iter().map(|c| c.key).collect();
    assert_eq!(keys, vec![KEY_A, KEY_B, KEY_A]);

    h.service.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_jobs_keep_counts_consistent() {
    let h = harness_with(
        test_config().with_max_parallel_jobs(4),
        ScriptedGenerator::default(),
        &[KEY_A, KEY_B],
    );
    h.service.start().expect("should start");

    let prompts: Vec<String> = (0..8).map(|i| format!("tile number {}", i)).collect();
    let prompt_refs: Vec<&str> = prompts.iter().map(String::as_str).collect();
    let mut req = request("tiles", &prompt_refs);
    req.auto_start = true;
    let created = h.service.create_task(req).await.expect("should create");
    let task = wait_terminal(&h.service, created.task_id).await;

    assert_eq!(task.counts.completed + task.counts.failed, task.counts.total);
    let indices: Vec<usize> = task.results.iter().map(|r| r.prompt_index).collect();
    assert_eq!(indices, (0..8).collect::<Vec<_>>());
    for result in &task.results {
        assert_eq!(result.prompt, prompts[result.prompt_index]);
    }

    h.service.shutdown().await;
}

#[tokio::test]
async fn test_character_sync_runs_in_prompt_order() {
    let h = harness_with(
        test_config().with_max_parallel_jobs(8),
        ScriptedGenerator::default(),
        &[KEY_A, KEY_B],
    );
    h.service.start().expect("should start");

    let mut req = request("story", &["p1 hero wakes", "p2 hero eats", "p3 hero leaves"]);
    req.character_sync = true;
    req.character_context = Some("red scarf".to_string());
    req.auto_start = true;
    let created = h.service.create_task(req).await.expect("should create");
    let task = wait_terminal(&h.service, created.task_id).await;

    assert_eq!(task.status, TaskStatus::Completed);
    let calls = h.generator.calls();
    let prompts: Vec<&str> = calls.iter().map(|c| c.prompt.as_str()).collect();
    assert_eq!(prompts, vec!["p1 hero wakes", "p2 hero eats", "p3 hero leaves"]);
    let previous: Vec<bool> = calls.iter().map(|c| c.had_previous_image).collect();
    assert_eq!(previous, vec![false, true, true]);

    h.service.shutdown().await;
}

#[tokio::test]
async fn test_character_analysed_from_reference_image() {
    let h = harness(&[KEY_A]);
    let handle = h
        .service
        .upload_reference_image("knight.png", &image_for("knight"))
        .await
        .expect("should upload");

    let mut req = request("knight", &["knight on a horse"]);
    req.reference_image = Some(handle);
    req.character_sync = true;
    let created = h.service.create_task(req).await.expect("should create");

    let task = h.service.get_task(created.task_id).expect("exists");
    assert_eq!(
        task.character_context.as_deref(),
        Some("a tall knight in silver armour")
    );
}

#[tokio::test]
async fn test_partial_and_failed_statuses() {
    let h = harness(&[KEY_A, KEY_B]);
    h.service.start().expect("should start");

    let mut mixed = request("mixed", &["a quiet pond", "reject this prompt"]);
    mixed.auto_start = true;
    let mixed = h.service.create_task(mixed).await.expect("should create");
    let task = wait_terminal(&h.service, mixed.task_id).await;
    assert_eq!(task.status, TaskStatus::Partial);
    assert_eq!(task.results[1].error_code, Some(ErrorCode::InvalidPrompt));

    let mut failing = request("failing", &["reject one", "reject two"]);
    failing.auto_start = true;
    let failing = h.service.create_task(failing).await.expect("should create");
    let task = wait_terminal(&h.service, failing.task_id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.counts.failed, 2);

    h.service.shutdown().await;
}

#[tokio::test]
async fn test_quota_exhausted_credential_cools_down() {
    let h = harness_with(
        test_config().with_max_parallel_jobs(1),
        ScriptedGenerator::default(),
        &[KEY_A, KEY_B],
    );
    h.service.start().expect("should start");

    let mut req = request("quota", &["quota hit first", "second scene", "third scene"]);
    req.auto_start = true;
    let created = h.service.create_task(req).await.expect("should create");
    let task = wait_terminal(&h.service, created.task_id).await;

    assert_eq!(task.status, TaskStatus::Completed);
    // A fails over to B, then B serves everything while A cools down
    let keys: Vec<String> = h.generator.calls().into_iter().map(|c| c.key).collect();
    assert_eq!(keys, vec![KEY_A, KEY_B, KEY_B, KEY_B]);

    let views = h.service.list_credentials();
    let a = views.iter().find(|v| v.suffix == SUFFIX_A).expect("A listed");
    assert_eq!(a.health, CredentialHealth::Exhausted);
    assert!(a.cooldown_until.is_some());
    assert_eq!(h.service.pool_health().exhausted, 1);

    h.service.shutdown().await;
}

#[tokio::test]
async fn test_delete_queued_task_never_processes() {
    let h = harness_with(
        test_config(),
        ScriptedGenerator::with_delay(Duration::from_millis(200)),
        &[KEY_A],
    );
    h.service.start().expect("should start");

    let mut running = request("running", &["slow sunrise"]);
    running.auto_start = true;
    let running = h.service.create_task(running).await.expect("should create");
    let queued = h
        .service
        .create_task(request("queued", &["never drawn"]))
        .await
        .expect("should create");
    h.service.enqueue_task(queued.task_id).expect("should enqueue");

    h.service
        .delete_task(queued.task_id)
        .await
        .expect("should delete");
    assert!(h.service.queue_status().queue.is_empty());
    assert_eq!(
        h.service.get_task(queued.task_id).unwrap_err().code(),
        ErrorCode::NotFound
    );

    wait_terminal(&h.service, running.task_id).await;
    assert_eq!(h.generator.prompts(), vec!["slow sunrise"]);

    h.service.shutdown().await;
}

#[tokio::test]
async fn test_delete_processing_task_does_not_block() {
    let h = harness_with(
        test_config(),
        ScriptedGenerator::with_delay(Duration::from_secs(30)),
        &[KEY_A],
    );
    h.service.start().expect("should start");

    let mut req = request("long", &["slow first", "slow second"]);
    req.auto_start = true;
    let created = h.service.create_task(req).await.expect("should create");
    wait_until(|| !h.generator.calls().is_empty()).await;

    tokio::time::timeout(
        Duration::from_secs(2),
        h.service.delete_task(created.task_id),
    )
    .await
    .expect("delete should not wait for the external call")
    .expect("should delete");

    // The driver frees the slot once it observes the cancellation
    let service = &h.service;
    wait_until(|| service.queue_status().active.is_none()).await;
    assert!(h.blobs.is_empty());
    assert_eq!(h.generator.calls().len(), 1);

    h.service.shutdown().await;
}

#[tokio::test]
async fn test_cancel_keeps_produced_results() {
    let h = harness_with(
        test_config().with_max_parallel_jobs(1),
        ScriptedGenerator::with_delay(Duration::from_secs(30)),
        &[KEY_A],
    );
    h.service.start().expect("should start");

    let mut req = request("abort", &["quick one", "slow two", "quick three"]);
    req.auto_start = true;
    let created = h.service.create_task(req).await.expect("should create");
    wait_until(|| h.generator.calls().len() == 2).await;

    h.service.cancel_task(created.task_id).expect("should cancel");
    let task = wait_terminal(&h.service, created.task_id).await;

    assert_eq!(task.status, TaskStatus::Partial);
    assert_eq!(task.results.len(), 1);
    assert!(task.results[0].is_success());
    wait_until(|| h.service.queue_status().active.is_none()).await;
    assert_eq!(
        h.service.cancel_task(created.task_id).unwrap_err().code(),
        ErrorCode::InvalidState
    );

    h.service.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_start_yields_one_busy() {
    let h = harness(&[KEY_A]);
    let first = h
        .service
        .create_task(request("one", &["an apple"]))
        .await
        .expect("should create");
    let second = h
        .service
        .create_task(request("two", &["a pear"]))
        .await
        .expect("should create");

    let service = Arc::new(h.service);
    let a = {
        let service = Arc::clone(&service);
        tokio::task::spawn_blocking(move || service.start_task(first.task_id))
    };
    let b = {
        let service = Arc::clone(&service);
        tokio::task::spawn_blocking(move || service.start_task(second.task_id))
    };
    let results = [a.await.expect("join"), b.await.expect("join")];

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let busy: Vec<_> = results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .map(|e| e.code())
        .collect();
    assert_eq!(busy, vec![ErrorCode::Busy]);
    assert_eq!(service.system_status().tasks.processing, 1);

    // The running Task cannot be started again
    let active = service.queue_status().active.expect("one active");
    assert_eq!(
        service.start_task(active).unwrap_err().code(),
        ErrorCode::InvalidState
    );
}

#[tokio::test]
async fn test_requeue_goes_to_tail() {
    let h = harness(&[KEY_A]);
    let mut ids = Vec::new();
    for name in ["first", "second", "third"] {
        let created = h
            .service
            .create_task(request(name, &["a mountain lake"]))
            .await
            .expect("should create");
        h.service.enqueue_task(created.task_id).expect("should enqueue");
        ids.push(created.task_id);
    }

    h.service.dequeue_task(ids[0]).expect("should dequeue");
    assert_eq!(
        h.service.get_task(ids[0]).expect("exists").status,
        TaskStatus::Pending
    );
    let position = h.service.enqueue_task(ids[0]).expect("should enqueue");

    assert_eq!(position, 3);
    let status = h.service.queue_status();
    assert_eq!(status.queue, vec![ids[1], ids[2], ids[0]]);
    assert_eq!(status.next_task, Some(ids[1]));

    h.service.dequeue_task(ids[0]).expect("should dequeue");
    assert_eq!(
        h.service.dequeue_task(ids[0]).unwrap_err().code(),
        ErrorCode::InvalidState
    );
}

#[tokio::test]
async fn test_queue_drains_in_fifo_order() {
    let h = harness(&[KEY_A, KEY_B]);
    let mut ids = Vec::new();
    for name in ["alpha", "beta", "gamma"] {
        let created = h
            .service
            .create_task(request(name, &[format!("{} landscape", name).as_str()]))
            .await
            .expect("should create");
        h.service.enqueue_task(created.task_id).expect("should enqueue");
        ids.push(created.task_id);
    }

    h.service.start().expect("should start");
    for id in &ids {
        wait_terminal(&h.service, *id).await;
    }
    assert_eq!(
        h.generator.prompts(),
        vec!["alpha landscape", "beta landscape", "gamma landscape"]
    );
    wait_until(|| !h.service.queue_status().is_processing).await;
    let status = h.service.system_status();
    assert_eq!(status.tasks.completed, 3);
    assert!(status.driver_active);
    assert!(!status.queue.is_processing);

    h.service.shutdown().await;
    assert!(!h.service.system_status().driver_active);
}

#[tokio::test]
async fn test_artifact_bytes_round_trip_and_archive() {
    let h = harness(&[KEY_A]);
    h.service.start().expect("should start");

    let mut req = request("pair", &["a paper boat", "reject me", "a glass bird"]);
    req.auto_start = true;
    let created = h.service.create_task(req).await.expect("should create");
    let task = wait_terminal(&h.service, created.task_id).await;

    let artifact = h
        .service
        .fetch_artifact(task.id, 0)
        .await
        .expect("should fetch");
    assert_eq!(artifact.bytes, image_for("a paper boat"));
    assert_eq!(artifact.mime_type, "image/png");
    assert_eq!(
        h.service.fetch_artifact(task.id, 1).await.unwrap_err().code(),
        ErrorCode::NotFound
    );

    let archive = h
        .service
        .export_task_archive(task.id)
        .await
        .expect("should export");
    assert_eq!(archive.entries, 2);
    assert!(archive.file_name.ends_with(".tar.gz"));

    let mut tar = tar::Archive::new(GzDecoder::new(archive.bytes.as_slice()));
    let mut names = Vec::new();
    for entry in tar.entries().expect("entries") {
        let mut entry = entry.expect("entry");
        let name = entry.path().expect("path").display().to_string();
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes).expect("read");
        if name.starts_with("001_") {
            assert_eq!(bytes, image_for("a paper boat"));
        }
        names.push(name);
    }
    assert_eq!(names, vec!["001_a_paper_boat.png", "003_a_glass_bird.png"]);

    h.service.shutdown().await;
}

#[tokio::test]
async fn test_delete_finished_task_removes_artifacts_only() {
    let h = harness(&[KEY_A]);
    h.service.start().expect("should start");
    let reference = h
        .service
        .upload_reference_image("ref.webp", &image_for("reference"))
        .await
        .expect("should upload");

    let mut req = request("cleanup", &["a small house", "a tall tower"]);
    req.reference_image = Some(reference.clone());
    req.auto_start = true;
    let created = h.service.create_task(req).await.expect("should create");
    let task = wait_terminal(&h.service, created.task_id).await;
    assert_eq!(h.blobs.len(), 3);

    h.service.delete_task(task.id).await.expect("should delete");
    assert_eq!(h.blobs.len(), 1);
    assert!(h.blobs.exists(&reference).await.expect("exists"));

    h.service.shutdown().await;
}

#[tokio::test]
async fn test_assisted_split_uses_pool() {
    let h = harness(&[KEY_A]);
    let outcome = h
        .service
        .split_prompts("a cat; a dog ;", true)
        .await
        .expect("should split");
    assert_eq!(outcome.prompts, vec!["a cat", "a dog"]);
    assert_eq!(
        h.service.list_credentials()[0].health,
        CredentialHealth::Available
    );
    assert!(h.service.list_credentials()[0].last_used_at.is_some());
}

#[tokio::test]
async fn test_snapshot_restores_queue_after_restart() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let state = dir.path().join("tasks.json");
    let config = test_config().with_state_file(&state);

    let (queued_first, queued_second, interrupted) = {
        let h = harness_with(config.clone(), ScriptedGenerator::default(), &[KEY_A]);
        let mut ids = Vec::new();
        for name in ["windmill", "waterfall", "harbour"] {
            let created = h
                .service
                .create_task(request(name, &[format!("a {} at noon", name).as_str()]))
                .await
                .expect("should create");
            ids.push(created.task_id);
        }
        h.service.enqueue_task(ids[0]).expect("should enqueue");
        h.service.enqueue_task(ids[1]).expect("should enqueue");
        // Never picked up by a driver: looks like a crash mid-run after restart
        h.service.start_task(ids[2]).expect("should start");
        h.service.shutdown().await;
        (ids[0], ids[1], ids[2])
    };
    assert!(state.exists());
    assert!(dir.path().join("tasks.credentials.json").exists());

    // Keys come back from the credential file
    let h = harness_with(config, ScriptedGenerator::default(), &[]);
    let suffixes: Vec<String> = h
        .service
        .list_credentials()
        .into_iter()
        .map(|v| v.suffix)
        .collect();
    assert_eq!(suffixes, vec![SUFFIX_A.to_string()]);
    assert_eq!(
        h.service.queue_status().queue,
        vec![interrupted, queued_first, queued_second]
    );
    assert_eq!(
        h.service.get_task(interrupted).expect("restored").status,
        TaskStatus::Queued
    );

    h.service.start().expect("should start");
    for id in [interrupted, queued_first, queued_second] {
        assert_eq!(wait_terminal(&h.service, id).await.status, TaskStatus::Completed);
    }
    assert_eq!(
        h.generator.prompts(),
        vec!["a harbour at noon", "a windmill at noon", "a waterfall at noon"]
    );
    h.service.shutdown().await;
}

#[tokio::test]
async fn test_recovered_tasks_wait_for_first_credential() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let state = dir.path().join("tasks.json");
    let config = test_config().with_state_file(&state);

    let queued = {
        let h = harness_with(config.clone(), ScriptedGenerator::default(), &[KEY_A]);
        let created = h
            .service
            .create_task(request("lighthouse", &["a lighthouse in fog"]))
            .await
            .expect("should create");
        h.service.enqueue_task(created.task_id).expect("should enqueue");
        h.service.shutdown().await;
        created.task_id
    };
    std::fs::remove_file(dir.path().join("tasks.credentials.json"))
        .expect("credential file should exist");

    let h = harness_with(config, ScriptedGenerator::default(), &[]);
    assert!(h.service.list_credentials().is_empty());
    h.service.start().expect("should start");

    // Without a key the driver leaves the Queue alone
    tokio::time::sleep(Duration::from_millis(100)).await;
    let task = h.service.get_task(queued).expect("restored");
    assert_eq!(task.status, TaskStatus::Queued);
    assert!(task.results.is_empty());
    assert!(h.generator.prompts().is_empty());

    h.service
        .add_credential(secrecy::SecretString::from(KEY_B.to_string()))
        .expect("should add credential");
    assert_eq!(wait_terminal(&h.service, queued).await.status, TaskStatus::Completed);
    assert_eq!(h.generator.calls()[0].key, KEY_B);
    h.service.shutdown().await;
}
