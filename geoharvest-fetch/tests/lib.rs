use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use geoharvest_fetch::{FetchCoordinator, FetchError, FetchSettings, FetchTarget, Refresh};

fn settings(server_uri: &str, dir: &Path) -> FetchSettings {
    FetchSettings {
        retry_wait: Duration::from_millis(30),
        // a marker written moments ago is already stale, every test run
        // starts from the refresh path
        stale_after: Duration::ZERO,
        ..FetchSettings::new(format!("{server_uri}/"), dir)
    }
}

fn zip_with_entry(name: &str, content: &str) -> Vec<u8> {
    let cursor = std::io::Cursor::new(Vec::new());
    let mut writer = zip::ZipWriter::new(cursor);
    writer
        .start_file(name, zip::write::FileOptions::default())
        .unwrap();
    writer.write_all(content.as_bytes()).unwrap();
    let cursor = writer.finish().unwrap();
    cursor.into_inner()
}

fn leftover_temp_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_file())
        .count()
}

#[test_log::test(tokio::test)]
async fn fresh_archive_is_staged_and_marker_written() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    Mock::given(method("GET"))
        .and(path("/LI.zip"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(zip_with_entry("LI.txt", "3042030\tVaduz\n"))
                .insert_header("ETag", "\"v1\""),
        )
        .mount(&server)
        .await;

    let coordinator = FetchCoordinator::new(settings(&server.uri(), dir.path())).unwrap();
    let refresh = coordinator.refresh_if_stale("LI", ".zip").await.unwrap();
    assert_eq!(refresh, Refresh::Refreshed);

    let country_dir = dir.path().join("LI");
    assert_eq!(
        std::fs::read_to_string(country_dir.join("etag")).unwrap(),
        "\"v1\""
    );
    assert_eq!(
        std::fs::read_to_string(country_dir.join("LI.txt")).unwrap(),
        "3042030\tVaduz\n"
    );
    assert!(!country_dir.join("LI.zip").exists());
    // the staged body went through a temp file that must be gone now
    assert_eq!(leftover_temp_files(dir.path()), 0);
}

#[test_log::test(tokio::test)]
async fn fresh_marker_skips_the_network_entirely() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    let country_dir = dir.path().join("GB");
    std::fs::create_dir_all(&country_dir).unwrap();
    std::fs::write(country_dir.join("etag"), "\"v1\"").unwrap();

    let coordinator = FetchCoordinator::new(FetchSettings {
        stale_after: Duration::from_secs(86_400),
        ..FetchSettings::new(format!("{}/", server.uri()), dir.path())
    })
    .unwrap();

    assert!(!coordinator.is_stale("GB"));
    let refresh = coordinator.refresh_if_stale("GB", ".zip").await.unwrap();
    assert_eq!(refresh, Refresh::Current);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[test_log::test(tokio::test)]
async fn not_modified_replays_the_stored_validator() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    let country_dir = dir.path().join("LI");
    std::fs::create_dir_all(&country_dir).unwrap();
    std::fs::write(country_dir.join("etag"), "\"v1\"").unwrap();

    Mock::given(method("GET"))
        .and(path("/LI.zip"))
        .and(header("If-None-Match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .mount(&server)
        .await;

    let coordinator = FetchCoordinator::new(settings(&server.uri(), dir.path())).unwrap();
    let refresh = coordinator.refresh_if_stale("LI", ".zip").await.unwrap();

    assert_eq!(refresh, Refresh::Current);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
    // the marker is not rewritten on 304
    assert_eq!(
        std::fs::read_to_string(country_dir.join("etag")).unwrap(),
        "\"v1\""
    );
}

#[test_log::test(tokio::test)]
async fn http_errors_retry_with_spacing_until_success() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    Mock::given(method("GET"))
        .and(path("/LI.zip"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/LI.zip"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(zip_with_entry("LI.txt", "row\n"))
                .insert_header("ETag", "\"v2\""),
        )
        .mount(&server)
        .await;

    let coordinator = FetchCoordinator::new(settings(&server.uri(), dir.path())).unwrap();
    let started = Instant::now();
    let refresh = coordinator.refresh_if_stale("LI", ".zip").await.unwrap();

    assert_eq!(refresh, Refresh::Refreshed);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
    // two waits separate the three attempts
    assert!(started.elapsed() >= Duration::from_millis(60));
}

#[test_log::test(tokio::test)]
async fn retry_exhaustion_reports_the_remaining_set() {
    // a just-closed port refuses connections deterministically
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let dir = tempfile::tempdir().unwrap();
    let coordinator = FetchCoordinator::new(FetchSettings {
        retry_wait: Duration::from_millis(20),
        stale_after: Duration::ZERO,
        ..FetchSettings::new(format!("http://127.0.0.1:{port}/"), dir.path())
    })
    .unwrap();

    let started = Instant::now();
    let result = coordinator
        .fetch_targets(vec![FetchTarget::new("VA", ".zip")], true)
        .await;

    match result {
        Err(FetchError::RetryExhausted {
            attempts,
            remaining,
        }) => {
            assert_eq!(attempts, 3);
            assert_eq!(remaining, vec![FetchTarget::new("VA", ".zip")]);
        }
        other => panic!("expected retry exhaustion, got {other:?}"),
    }
    assert!(started.elapsed() >= Duration::from_millis(40));
    // nothing was written for the failed country
    assert!(!dir.path().join("VA").exists());
}

#[test_log::test(tokio::test)]
async fn master_index_is_fetched_unconditionally() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    // a stored validator must not turn the master fetch into a 304 probe
    let index_dir = dir.path().join("countryInfo");
    std::fs::create_dir_all(&index_dir).unwrap();
    std::fs::write(index_dir.join("etag"), "\"old\"").unwrap();

    // a conditional request would match this mock and get an empty 304
    Mock::given(method("GET"))
        .and(path("/countryInfo.txt"))
        .and(header("If-None-Match", "\"old\""))
        .respond_with(ResponseTemplate::new(304))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/countryInfo.txt"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string("# comment\nLI\tLIE\t438\tLS\tLiechtenstein\tVaduz\t160\t39137\tEU\n"),
        )
        .mount(&server)
        .await;

    let coordinator = FetchCoordinator::new(settings(&server.uri(), dir.path())).unwrap();
    let staged = coordinator.load_master_index().await.unwrap();

    assert_eq!(staged, index_dir.join("countryInfo.txt"));
    let content = std::fs::read_to_string(&staged).unwrap();
    assert!(content.contains("Liechtenstein"));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[test_log::test(tokio::test)]
async fn unusable_archive_fails_the_refresh() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    Mock::given(method("GET"))
        .and(path("/LI.zip"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"this is not a zip".to_vec())
                .insert_header("ETag", "\"v1\""),
        )
        .mount(&server)
        .await;

    let coordinator = FetchCoordinator::new(settings(&server.uri(), dir.path())).unwrap();
    let result = coordinator.refresh_if_stale("LI", ".zip").await;
    assert!(matches!(result, Err(FetchError::Archive { .. })));
    assert!(!dir.path().join("LI").join("LI.txt").exists());
}
