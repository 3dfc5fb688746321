mod common;

use aura_downloader::downloader::{DownloadManager, OriginContext, TaskId, TaskStatus};
use common::{Script, ScriptedEngine, fast_config, wait_for_status};
use serde_json::{Value, json};

#[tokio::test]
async fn queue_and_tasks_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = fast_config(dir.path(), 1);

    let (first, second) = {
        let manager = DownloadManager::open(config.clone(), ScriptedEngine::new())
            .await
            .unwrap();
        let origin = OriginContext::new("https://www.example.com/bangumi/play/ep1")
            .with_gate_token("SESSDATA=abc")
            .with_title("测试番剧");
        let first = manager
            .submit("https://cdn.example.com/ep1.mp4", dir.path(), Some("ep1.mp4"), Some(origin))
            .await
            .unwrap();
        let second = manager
            .submit("https://cdn.example.com/ep2.mp4", dir.path(), None, None)
            .await
            .unwrap();
        (first, second)
    };

    // 每次变更都已落盘，不需要显式保存
    let raw: Value = serde_json::from_slice(&std::fs::read(&config.state_file).unwrap()).unwrap();
    assert_eq!(raw["queue"], json!([first.as_str(), second.as_str()]));
    assert_eq!(raw["tasks"][first.as_str()]["status"], json!("Queued"));

    let manager = DownloadManager::open(config, ScriptedEngine::new())
        .await
        .unwrap();
    assert_eq!(manager.queued_ids().await, vec![first.clone(), second.clone()]);

    let task = manager.get_task(&first).await.unwrap();
    assert_eq!(task.filename.as_deref(), Some("ep1.mp4"));
    let origin = task.origin.unwrap();
    assert_eq!(origin.gate_token.as_deref(), Some("SESSDATA=abc"));
    assert_eq!(origin.title.as_deref(), Some("测试番剧"));
    assert!(manager.get_task(&second).await.unwrap().origin.is_none());
}

#[tokio::test]
async fn interrupted_download_is_requeued_on_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = fast_config(dir.path(), 1);
    let url = "https://cdn.example.com/long.mp4";

    let engine = ScriptedEngine::new();
    engine.script(url, Script::Endless { chunk: 8 });
    let manager = DownloadManager::open(config.clone(), engine).await.unwrap();
    let waiting_url = "https://cdn.example.com/waiting.mp4";
    let id = manager.submit(url, dir.path(), Some("long.mp4"), None).await.unwrap();
    let waiting = manager.submit(waiting_url, dir.path(), None, None).await.unwrap();
    manager.start();

    assert!(wait_for_status(&manager, &id, TaskStatus::Downloading).await);
    manager.shutdown().await;
    assert_eq!(manager.get_task(&id).await.unwrap().status, TaskStatus::Downloading);

    let reopened = DownloadManager::open(config, ScriptedEngine::new())
        .await
        .unwrap();
    let task = reopened.get_task(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.speed, 0.0);
    assert_eq!(reopened.queued_ids().await, vec![waiting, id]);
}

#[tokio::test]
async fn completed_history_is_kept_without_queue_entry() {
    let dir = tempfile::tempdir().unwrap();
    let config = fast_config(dir.path(), 1);

    let manager = DownloadManager::open(config.clone(), ScriptedEngine::new())
        .await
        .unwrap();
    let id = manager
        .submit("https://cdn.example.com/ep1.mp4", dir.path(), Some("ep1.mp4"), None)
        .await
        .unwrap();
    manager.start();
    assert!(wait_for_status(&manager, &id, TaskStatus::Completed).await);
    manager.shutdown().await;

    let reopened = DownloadManager::open(config, ScriptedEngine::new())
        .await
        .unwrap();
    let task = reopened.get_task(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.progress, 100.0);
    assert!(reopened.queued_ids().await.is_empty());
    assert!(dir.path().join("ep1.mp4").exists());
}

#[tokio::test]
async fn corrupt_entries_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let config = fast_config(dir.path(), 1);

    let snapshot = json!({
        "queue": ["good", "broken", "ghost", "good"],
        "tasks": {
            "good": {
                "id": "good",
                "url": "https://cdn.example.com/good.mp4",
                "dest_folder": dir.path(),
                "filename": "good.mp4",
                "status": "Queued",
                "downloaded": 0,
                "total": 0,
                "progress": 0.0,
                "speed": 0.0,
                "error": null
            },
            "broken": { "url": 42 },
            "stale": {
                "id": "stale",
                "url": "https://cdn.example.com/stale.mp4",
                "dest_folder": dir.path(),
                "filename": null,
                "status": "Expired",
                "error": "HTTP 403: Forbidden"
            }
        }
    });
    std::fs::write(&config.state_file, serde_json::to_vec(&snapshot).unwrap()).unwrap();

    let manager = DownloadManager::open(config, ScriptedEngine::new())
        .await
        .unwrap();
    assert_eq!(manager.list_tasks().await.len(), 2);
    assert_eq!(manager.queued_ids().await, vec![TaskId::from("good")]);
    assert!(manager.get_task(&TaskId::from("broken")).await.is_none());

    let stale = manager.get_task(&TaskId::from("stale")).await.unwrap();
    assert_eq!(stale.status, TaskStatus::Expired);
    assert_eq!(stale.last_error.as_deref(), Some("HTTP 403: Forbidden"));
}

#[tokio::test]
async fn unreadable_state_file_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let config = fast_config(dir.path(), 1);
    std::fs::write(&config.state_file, b"{ not json").unwrap();

    let manager = DownloadManager::open(config.clone(), ScriptedEngine::new())
        .await
        .unwrap();
    assert!(manager.list_tasks().await.is_empty());
    assert!(manager.queued_ids().await.is_empty());

    // 下一次变更会覆盖损坏的文件
    manager
        .submit("https://cdn.example.com/ep1.mp4", dir.path(), None, None)
        .await
        .unwrap();
    let raw: Value = serde_json::from_slice(&std::fs::read(&config.state_file).unwrap()).unwrap();
    assert_eq!(raw["queue"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn missing_state_file_is_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_config(dir.path(), 1);
    config.state_file = dir.path().join("nested").join("state.json");

    let manager = DownloadManager::open(config.clone(), ScriptedEngine::new())
        .await
        .unwrap();
    assert!(manager.list_tasks().await.is_empty());

    manager.save().await;
    assert!(config.state_file.exists());
}
