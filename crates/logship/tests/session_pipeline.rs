// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use logship::bookmark::codec;
use logship::config::session::SessionConfig;
use logship::parameter_store::MemoryParameterStore;
use logship::plugin::PluginRegistry;
use logship::session::{Session, SessionDeps, SessionSettings};

const SESSION_ID: u64 = 7;

fn append(path: &Path, text: &str) {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    file.write_all(text.as_bytes()).unwrap();
}

fn deps(data_dir: &Path) -> SessionDeps {
    SessionDeps {
        registry: Arc::new(PluginRegistry::with_builtins()),
        parameter_store: Arc::new(MemoryParameterStore::default()),
        fallback_credentials: None,
        settings: SessionSettings {
            data_dir: data_dir.to_path_buf(),
            bookmark_flush_period: Duration::from_millis(50),
            shutdown_timeout: Duration::from_secs(5),
        },
    }
}

fn session_config(logs: &Path, output: &Path, position: &str, on_flush: bool) -> SessionConfig {
    let config = json!({
        "Name": "integration",
        "Sources": [{
            "Id": "apache",
            "SourceType": "DirectorySource",
            "Directory": logs.display().to_string(),
            "FileNameFilter": "*.log",
            "Interval": 0.05,
            "InitialPosition": position,
            "BookmarkOnBufferFlush": on_flush
        }],
        "Sinks": [{
            "Id": "out",
            "SinkType": "File",
            "FilePath": output.display().to_string(),
            "FlushInterval": 0.05
        }],
        "Pipes": [{
            "Id": "errors",
            "Type": "RegexFilterPipe",
            "FilterPattern": "^ERROR",
            "SourceRef": "apache",
            "SinkRef": "out"
        }]
    });
    SessionConfig::from_json(&config.to_string()).unwrap()
}

async fn wait_for_lines(path: &Path, expected: &[&str]) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let lines: Vec<String> = std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect();
        if lines == expected {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {expected:?}, got {lines:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn saved_positions(data_dir: &Path) -> Vec<i64> {
    let path = SessionSettings {
        data_dir: data_dir.to_path_buf(),
        ..SessionSettings::default()
    }
    .bookmark_dir(SESSION_ID)
    .join("apache.bm");
    let bytes = std::fs::read(path).unwrap();
    codec::decode(&bytes)
        .unwrap()
        .into_iter()
        .map(|(_, position)| position)
        .collect()
}

#[tokio::test]
async fn test_directory_to_file_through_filter_pipe() {
    let logs = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let output = out.path().join("errors.txt");
    append(&logs.path().join("app.log"), "INFO a\nERROR b\nWARN c\n");

    let session = Session::new(
        data.path().join("integration.json"),
        session_config(logs.path(), &output, "BOS", false),
        SESSION_ID,
        deps(data.path()),
    );
    session.start().await.unwrap();
    assert_eq!(session.source_ids().await, vec!["apache"]);
    assert_eq!(session.sink_ids().await, vec!["out"]);
    assert_eq!(session.pipe_ids().await, vec!["errors"]);

    wait_for_lines(&output, &["ERROR b"]).await;
    append(&logs.path().join("app.log"), "ERROR d\n");
    wait_for_lines(&output, &["ERROR b", "ERROR d"]).await;

    session.stop().await;
    let snapshot = session.counters().snapshot();
    assert_eq!(snapshot.sources.started, 1);
    assert_eq!(snapshot.sinks.started, 1);
    assert_eq!(snapshot.pipes.failed_to_load, 0);
    assert_eq!(snapshot.records_delivered, 2);
}

#[tokio::test]
async fn test_buffer_flush_bookmark_resumes_after_restart() {
    let logs = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let log = logs.path().join("app.log");
    let output = out.path().join("errors.txt");
    append(&log, "INFO a\nERROR b\n");

    let first = Session::new(
        data.path().join("integration.json"),
        session_config(logs.path(), &output, "BOS", true),
        SESSION_ID,
        deps(data.path()),
    );
    first.start().await.unwrap();
    wait_for_lines(&output, &["ERROR b"]).await;
    first.stop().await;

    // "INFO a\n" is dropped by the pipe; the ack of "ERROR b\n" covers it.
    assert_eq!(saved_positions(data.path()), vec![15]);

    append(&log, "ERROR c\nINFO d\n");
    let second = Session::new(
        data.path().join("integration.json"),
        session_config(logs.path(), &output, "Bookmark", true),
        SESSION_ID,
        deps(data.path()),
    );
    second.start().await.unwrap();
    wait_for_lines(&output, &["ERROR b", "ERROR c"]).await;
    second.stop().await;

    assert_eq!(saved_positions(data.path()), vec![23]);
}

#[tokio::test]
async fn test_cursor_bookmark_resumes_after_restart() {
    let logs = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let log = logs.path().join("app.log");
    let output = out.path().join("errors.txt");
    append(&log, "ERROR one\n");

    let first = Session::new(
        data.path().join("integration.json"),
        session_config(logs.path(), &output, "BOS", false),
        SESSION_ID,
        deps(data.path()),
    );
    first.start().await.unwrap();
    wait_for_lines(&output, &["ERROR one"]).await;
    first.stop().await;
    assert_eq!(saved_positions(data.path()), vec![10]);

    append(&log, "ERROR two\n");
    let second = Session::new(
        data.path().join("integration.json"),
        session_config(logs.path(), &output, "Bookmark", false),
        SESSION_ID,
        deps(data.path()),
    );
    second.start().await.unwrap();
    wait_for_lines(&output, &["ERROR one", "ERROR two"]).await;
    second.stop().await;
}
