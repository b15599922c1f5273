use serde_json::json;
use std::{sync::Arc, time::Duration};
use tempfile::tempdir;
use tlite::config::AdmissionPolicy;
use tlite::engine::{Engine, Envelope, Origin, Record, Scheduler};
use tlite::protocol::{Command, Request, Response, Status};
use tlite::server::handle_session;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::time::timeout;

fn request(line: serde_json::Value) -> Envelope {
    let request = Request::decode(line.to_string().as_bytes()).expect("decode");
    Envelope::new(&request, Origin::detached(1))
}

#[tokio::test]
async fn dump_round_trips_every_table() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("snapshots").join("data.sqlite");

    let engine = Arc::new(Engine::open(&path).await.unwrap());
    let scheduler = Arc::new(Scheduler::start(engine.clone(), AdmissionPolicy::Serial));
    for (k, v) in [("a", "1"), ("b", "")] {
        scheduler.enqueue(request(json!({"cmd": "set", "args": {"k": k, "v": v}}))).await;
    }
    scheduler.enqueue(request(json!({"cmd": "use", "args": {"k": "users"}}))).await;
    scheduler.enqueue(request(json!({"cmd": "set", "args": {"k": "u1", "v": "{\"name\":\"ann\"}"}}))).await;

    let (client, server) = tokio::io::duplex(1 << 16);
    let session = tokio::spawn({
        let engine = engine.clone();
        let scheduler = scheduler.clone();
        async move { handle_session(server, 1, &engine, &scheduler).await }
    });
    let (r, mut w) = tokio::io::split(client);
    let mut lines = BufReader::new(r).lines();
    w.write_all(b"{\"cmd\":\"dump\"}\n").await.unwrap();

    let mut replies = Vec::new();
    for _ in 0..2 {
        let line = timeout(Duration::from_secs(10), lines.next_line())
            .await
            .expect("reply in time")
            .unwrap()
            .expect("line");
        replies.push(serde_json::from_str::<Response>(&line).unwrap());
    }
    let ack = replies.iter().find(|r| r.data.is_some()).expect("immediate ack");
    assert_eq!(ack.data, Some(json!("Syncing...")));
    let done = replies.iter().find(|r| r.message.is_some()).expect("completion notice");
    assert_eq!(done.status, Status::Success);
    assert_eq!(done.command.as_deref(), Some("dump"));
    assert!(path.exists());

    drop(w);
    drop(lines);
    timeout(Duration::from_secs(5), session).await.unwrap().unwrap();

    let reloaded = Engine::open(&path).await.unwrap();
    let store = reloaded.store();
    assert_eq!(store.tables().unwrap(), vec!["store".to_string(), "users".to_string()]);
    assert_eq!(
        store.list().unwrap(),
        vec![
            Record { key: "a".into(), value: "1".into() },
            Record { key: "b".into(), value: "".into() },
        ]
    );
    store.use_table("users").unwrap();
    assert_eq!(store.get("u1").unwrap(), r#"{"name":"ann"}"#);
}

#[tokio::test]
async fn snapshot_reflects_state_at_export_time() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.sqlite");
    let engine = Engine::open(&path).await.unwrap();
    let persistence = engine.persistence();

    engine.store().set("before", "1").unwrap();
    persistence.export().await.unwrap();
    engine.store().set("after", "2").unwrap();

    let reloaded = Engine::open(&path).await.unwrap();
    assert_eq!(reloaded.store().get("before").unwrap(), "1");
    assert!(reloaded.store().get("after").is_err());
}

#[tokio::test]
async fn periodic_timer_writes_snapshots() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.sqlite");
    let engine = Engine::open(&path).await.unwrap();
    engine.store().set("k", "v").unwrap();

    let timer = engine.persistence().spawn_periodic(Duration::from_millis(50));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !path.exists() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    timer.abort();
    assert!(path.exists(), "timer never exported");

    let reloaded = Engine::open(&path).await.unwrap();
    assert_eq!(reloaded.store().get("k").unwrap(), "v");
}

#[tokio::test]
async fn export_into_occupied_path_fails_cleanly() {
    let dir = tempdir().unwrap();
    // A directory where the snapshot file should be makes the final rename fail.
    let path = dir.path().join("occupied");
    std::fs::create_dir_all(path.join("child")).unwrap();

    let engine = Arc::new(Engine::open(dir.path().join("unused.sqlite")).await.unwrap());
    let broken = tlite::engine::Persistence::new(engine.store().clone(), engine.gate(), path);
    assert!(broken.export().await.is_err());
    assert!(dir.path().join("occupied").join("child").is_dir());
}

#[tokio::test]
async fn corrupt_snapshot_fails_startup() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.sqlite");
    std::fs::write(&path, vec![b'x'; 8192]).unwrap();
    assert!(Engine::open(&path).await.is_err());
}

#[tokio::test]
async fn detached_dump_still_acknowledges() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path().join("data.sqlite")).await.unwrap();
    let resp = engine
        .execute(Envelope::from_command("dump", Command::Dump, Origin::detached(3)))
        .await;
    assert_eq!(resp.data, Some(json!("Syncing...")));
}
