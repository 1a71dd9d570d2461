use std::net::SocketAddr;

use tempfile::TempDir;

use super::*;

fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn config_defaults() {
    let config = SinkConfig::parse(&vars(&[])).unwrap();
    assert_eq!(config.port, 8080);
    assert_eq!(config.dump_dir, PathBuf::from("dumps"));
    assert_eq!(config.config_file, PathBuf::from("config/config.yaml"));
}

#[test]
fn config_overrides() {
    let config = SinkConfig::parse(&vars(&[
        ("TEST_SINK_PORT", "9000"),
        ("TEST_SINK_DUMP_DIR", "/tmp/out"),
        ("TEST_SINK_CONFIG_FILE", "/etc/sink.yaml"),
    ]))
    .unwrap();
    assert_eq!(config.port, 9000);
    assert_eq!(config.dump_dir, PathBuf::from("/tmp/out"));
    assert_eq!(config.config_file, PathBuf::from("/etc/sink.yaml"));
}

#[test]
fn config_rejects_bad_port() {
    let err = SinkConfig::parse(&vars(&[("TEST_SINK_PORT", "http")])).unwrap_err();
    assert!(matches!(err, SinkConfigError::InvalidPort(v) if v == "http"));
}

struct Running {
    addr: SocketAddr,
    dir: TempDir,
    cancel: CancellationToken,
}

impl Drop for Running {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn start(config_contents: Option<&str>) -> Running {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let dir = TempDir::new().unwrap();
    let config_file = dir.path().join("config.yaml");
    if let Some(contents) = config_contents {
        std::fs::write(&config_file, contents).unwrap();
    }
    let config = SinkConfig {
        port: 0,
        dump_dir: dir.path().join("dumps"),
        config_file,
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    tokio::spawn(serve(listener, Arc::new(Sink::new(&config)), cancel.clone()));

    Running { addr, dir, cancel }
}

#[tokio::test]
async fn post_body_is_saved_to_its_own_file() {
    let sink = start(None).await;
    let client = reqwest::Client::new();

    for body in ["first", "second"] {
        let resp = client
            .post(format!("http://{}/anything", sink.addr))
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        assert_eq!(resp.text().await.unwrap(), "Request received and saved");
    }

    let dumps = read_dumps(&sink.dir.path().join("dumps")).unwrap();
    assert_eq!(dumps, vec![b"first".to_vec(), b"second".to_vec()]);
}

#[tokio::test]
async fn dump_files_follow_naming_scheme() {
    let sink = start(None).await;
    reqwest::Client::new()
        .post(format!("http://{}/", sink.addr))
        .body("x")
        .send()
        .await
        .unwrap();

    let names: Vec<String> = std::fs::read_dir(sink.dir.path().join("dumps"))
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(names.len(), 1);
    assert!(names[0].starts_with("request_body_"), "{}", names[0]);
    assert!(names[0].ends_with(".txt"), "{}", names[0]);
}

#[tokio::test]
async fn get_config_serves_file() {
    let sink = start(Some("endpoint: http://collector\n")).await;
    let resp = reqwest::get(format!("http://{}/config", sink.addr))
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "endpoint: http://collector\n");
}

#[tokio::test]
async fn get_config_missing_file_is_404() {
    let sink = start(None).await;
    let resp = reqwest::get(format!("http://{}/config", sink.addr))
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unwritable_dump_dir_returns_500() {
    let sink = start(None).await;
    // A regular file where the dump directory should be.
    std::fs::write(sink.dir.path().join("dumps"), "").unwrap();

    let resp = reqwest::Client::new()
        .post(format!("http://{}/", sink.addr))
        .body("lost")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
}

#[test]
fn read_dumps_of_missing_dir_is_empty() {
    let dir = TempDir::new().unwrap();
    assert!(read_dumps(&dir.path().join("nope")).unwrap().is_empty());
}

#[tokio::test]
async fn wait_for_dumps_returns_early_when_enough() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("request_body_1_000000.txt"), "a").unwrap();
    std::fs::write(dir.path().join("unrelated.txt"), "b").unwrap();

    let dumps = wait_for_dumps(dir.path(), 1, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(dumps, vec![b"a".to_vec()]);
}
