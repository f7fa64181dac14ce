//! End-to-end crawl scenarios against in-process mock HTTP servers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tempfile::TempDir;

use mediagrab::api::{AppState, build_state_with_thumbnailer};
use mediagrab::config::AppConfig;
use mediagrab::download::ThumbnailGenerator;
use mediagrab::error::Result as ScrapeResult;
use mediagrab::model::{Asset, Job, JobStatus, Selector, SelectorPurpose};

struct FixedThumb;

#[async_trait::async_trait]
impl ThumbnailGenerator for FixedThumb {
    async fn generate(
        &self,
        asset: &Asset,
        _source: &std::path::Path,
        thumb_root: &std::path::Path,
    ) -> ScrapeResult<Option<String>> {
        let rel = format!("{}/{}.png", asset.job_id, asset.id);
        let path = thumb_root.join(&rel);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, b"thumb").await?;
        Ok(Some(rel))
    }
}

fn build_app() -> (AppState, TempDir) {
    let temp = TempDir::new().expect("temp dir");
    let mut config = AppConfig::default();
    config.paths.data_path = temp.path().join("data");
    config.paths.storage_path = temp.path().join("storage");
    config.paths.thumbnails_path = temp.path().join("thumbs");
    config.paths.log_file = temp.path().join("logs");

    let state = build_state_with_thumbnailer(&config, Arc::new(FixedThumb)).expect("state");
    (state, temp)
}

fn crawl_job(name: &str, base_url: &str) -> Job {
    let mut job = Job::new(name, base_url);
    job.selectors = vec![
        Selector {
            id: "links".into(),
            name: String::new(),
            value: "a[href]".into(),
            attribute: String::new(),
            purpose: SelectorPurpose::Links,
            priority: 0,
            optional: false,
            url_pattern: None,
        },
        Selector {
            id: "imgs".into(),
            name: String::new(),
            value: "img".into(),
            attribute: "src".into(),
            purpose: SelectorPurpose::Assets,
            priority: 0,
            optional: false,
            url_pattern: None,
        },
    ];
    job.rules.max_depth = 1;
    job
}

async fn wait_for_status(
    state: &AppState,
    job_id: &str,
    wanted: JobStatus,
    budget: Duration,
) -> JobStatus {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        let status = state.store.get_job(job_id).unwrap().job_snapshot().status;
        if status == wanted || tokio::time::Instant::now() >= deadline {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Serve `app` on an ephemeral port, returning its base URL.
async fn serve(app: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn happy_path_three_images() {
    let mut server = mockito::Server::new_async().await;
    let page = server
        .mock("GET", "/")
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_body(
            r#"<html><head><title>Gallery</title></head><body>
                <img src="/a.jpg"><img src="/b.jpg"><img src="/c.jpg">
            </body></html>"#,
        )
        .expect(1)
        .create_async()
        .await;
    for name in ["a", "b", "c"] {
        server
            .mock("GET", format!("/{name}.jpg").as_str())
            .with_status(200)
            .with_header("content-type", "image/jpeg")
            .with_body(vec![0u8; 256])
            .create_async()
            .await;
    }

    let (state, _temp) = build_app();
    let mut job = crawl_job("happy", &server.url());
    job.selectors.push(Selector {
        id: "meta-title".into(),
        name: "title".into(),
        value: "title".into(),
        attribute: "text".into(),
        purpose: SelectorPurpose::Metadata,
        priority: 0,
        optional: true,
        url_pattern: None,
    });
    let job_id = job.id.clone();
    state.store.add_job(job).unwrap();

    state.supervisor.start(&job_id).await.unwrap();
    let status = wait_for_status(&state, &job_id, JobStatus::Completed, Duration::from_secs(10)).await;
    assert_eq!(status, JobStatus::Completed);

    let assets = state.store.list_assets(&job_id).unwrap();
    assert_eq!(assets.len(), 3);
    let storage = state.store.settings_snapshot().storage_path;
    for asset in &assets {
        assert!(asset.downloaded, "asset not downloaded: {}", asset.url);
        assert!(asset.error.is_empty());
        assert_eq!(asset.size, 256);
        assert_eq!(asset.title, "Gallery");
        assert!(storage.join(&asset.local_path).exists());
        assert!(!asset.thumbnail_path.is_empty());
    }
    page.assert_async().await;
}

#[tokio::test]
async fn self_links_and_duplicate_assets_dedupe() {
    let mut server = mockito::Server::new_async().await;
    let page = server
        .mock("GET", "/")
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_body(
            r#"<html><body>
                <a href="/">again</a>
                <a href="/#anchor">and again</a>
                <img src="/x.png"><img src="/x.png">
            </body></html>"#,
        )
        .expect(1)
        .create_async()
        .await;
    let image = server
        .mock("GET", "/x.png")
        .with_status(200)
        .with_header("content-type", "image/png")
        .with_body(vec![1u8; 64])
        .expect(1)
        .create_async()
        .await;

    let (state, _temp) = build_app();
    let job = crawl_job("dedup", &server.url());
    let job_id = job.id.clone();
    state.store.add_job(job).unwrap();

    state.supervisor.start(&job_id).await.unwrap();
    let status = wait_for_status(&state, &job_id, JobStatus::Completed, Duration::from_secs(10)).await;
    assert_eq!(status, JobStatus::Completed);

    let assets = state.store.list_assets(&job_id).unwrap();
    assert_eq!(assets.len(), 1);
    assert!(assets[0].downloaded);

    // The page was fetched once; the self-links died in the visited set.
    page.assert_async().await;
    image.assert_async().await;
}

#[tokio::test]
async fn flaky_asset_retries_then_downloads() {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = {
        let hits = hits.clone();
        axum::Router::new()
            .route(
                "/",
                axum::routing::get(|| async {
                    axum::response::Html(r#"<html><body><img src="/img.png"></body></html>"#)
                }),
            )
            .route(
                "/img.png",
                axum::routing::get(move || {
                    let hits = hits.clone();
                    async move {
                        if hits.fetch_add(1, Ordering::SeqCst) < 2 {
                            (axum::http::StatusCode::SERVICE_UNAVAILABLE, vec![])
                        } else {
                            (axum::http::StatusCode::OK, vec![7u8; 128])
                        }
                    }
                }),
            )
    };
    let base = serve(app).await;

    let (state, _temp) = build_app();
    let job = crawl_job("flaky", &base);
    let job_id = job.id.clone();
    state.store.add_job(job).unwrap();

    state.supervisor.start(&job_id).await.unwrap();
    // Two 503s cost 2s + 4s of backoff before the 200.
    let status = wait_for_status(&state, &job_id, JobStatus::Completed, Duration::from_secs(20)).await;
    assert_eq!(status, JobStatus::Completed);

    let assets = state.store.list_assets(&job_id).unwrap();
    assert_eq!(assets.len(), 1);
    assert!(assets[0].downloaded);
    assert!(assets[0].error.is_empty());
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn explicit_stop_cancels_streaming_download() {
    // An endless 1KB-per-100ms stream keeps the download in flight until
    // the operator stops the job.
    let app = axum::Router::new()
        .route(
            "/",
            axum::routing::get(|| async {
                axum::response::Html(r#"<html><body><img src="/big.bin"></body></html>"#)
            }),
        )
        .route(
            "/big.bin",
            axum::routing::get(|| async {
                let stream = futures::stream::unfold((), |()| async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Some((Ok::<_, std::io::Error>(bytes::Bytes::from_static(&[0u8; 1024])), ()))
                });
                axum::body::Body::from_stream(stream)
            }),
        );
    let base = serve(app).await;

    let (state, _temp) = build_app();
    let job = crawl_job("streaming", &base);
    let job_id = job.id.clone();
    state.store.add_job(job).unwrap();

    state.supervisor.start(&job_id).await.unwrap();

    // Wait until the download is actually in flight.
    let entry = state.store.get_job(&job_id).unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while entry.downloads_in_progress() == 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "download never started"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    let stop_started = std::time::Instant::now();
    state.supervisor.stop(&job_id).await.unwrap();
    assert!(stop_started.elapsed() < Duration::from_secs(2));
    assert_eq!(
        state.store.get_job(&job_id).unwrap().job_snapshot().status,
        JobStatus::Stopped
    );

    // The detached context unwinds promptly after an explicit stop.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while entry.downloads_in_progress() > 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "download did not unwind"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let assets = state.store.list_assets(&job_id).unwrap();
    assert_eq!(assets.len(), 1);
    let asset = &assets[0];
    assert!(!asset.downloaded);
    assert_eq!(asset.error, "cancelled");
    // Partial file is left on disk.
    let partial = state
        .store
        .settings_snapshot()
        .storage_path
        .join(&asset.local_path);
    assert!(partial.exists());
    assert!(std::fs::metadata(partial).unwrap().len() > 0);
}

#[tokio::test]
async fn slow_download_survives_logical_completion() {
    // The frontier drains instantly, but the single asset takes ~1s to
    // stream. Completion must wait for it instead of cancelling it.
    let app = axum::Router::new()
        .route(
            "/",
            axum::routing::get(|| async {
                axum::response::Html(r#"<html><body><img src="/slow.jpg"></body></html>"#)
            }),
        )
        .route(
            "/slow.jpg",
            axum::routing::get(|| async {
                let stream = futures::stream::unfold(0u32, |sent| async move {
                    if sent >= 10 {
                        return None;
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Some((
                        Ok::<_, std::io::Error>(bytes::Bytes::from_static(&[3u8; 512])),
                        sent + 1,
                    ))
                });
                axum::body::Body::from_stream(stream)
            }),
        );
    let base = serve(app).await;

    let (state, _temp) = build_app();
    let job = crawl_job("slow", &base);
    let job_id = job.id.clone();
    state.store.add_job(job).unwrap();

    state.supervisor.start(&job_id).await.unwrap();
    let status = wait_for_status(&state, &job_id, JobStatus::Completed, Duration::from_secs(10)).await;
    assert_eq!(status, JobStatus::Completed);

    let assets = state.store.list_assets(&job_id).unwrap();
    assert_eq!(assets.len(), 1);
    assert!(assets[0].downloaded);
    assert_eq!(assets[0].size, 10 * 512);
}

#[tokio::test]
async fn links_are_followed_to_depth_and_offsite_is_fenced() {
    let mut server = mockito::Server::new_async().await;
    let _root = server
        .mock("GET", "/")
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_body(
            r#"<html><body>
                <a href="/album">album</a>
                <a href="https://offsite.test/elsewhere">offsite</a>
                <img src="/cover.jpg">
            </body></html>"#,
        )
        .create_async()
        .await;
    let album = server
        .mock("GET", "/album")
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_body(r#"<html><body><a href="/deeper"><img src="/inner.jpg"></a></body></html>"#)
        .expect(1)
        .create_async()
        .await;
    // Depth 2 page must never be fetched with max_depth = 1.
    let deeper = server
        .mock("GET", "/deeper")
        .with_status(200)
        .expect(0)
        .create_async()
        .await;
    for name in ["cover", "inner"] {
        server
            .mock("GET", format!("/{name}.jpg").as_str())
            .with_status(200)
            .with_header("content-type", "image/jpeg")
            .with_body(vec![9u8; 32])
            .create_async()
            .await;
    }

    let (state, _temp) = build_app();
    let job = crawl_job("depth", &server.url());
    let job_id = job.id.clone();
    state.store.add_job(job).unwrap();

    state.supervisor.start(&job_id).await.unwrap();
    let status = wait_for_status(&state, &job_id, JobStatus::Completed, Duration::from_secs(10)).await;
    assert_eq!(status, JobStatus::Completed);

    let assets = state.store.list_assets(&job_id).unwrap();
    let mut urls: Vec<&str> = assets.iter().map(|a| a.url.as_str()).collect();
    urls.sort();
    assert_eq!(assets.len(), 2);
    assert!(urls[0].ends_with("/cover.jpg"));
    assert!(urls[1].ends_with("/inner.jpg"));

    album.assert_async().await;
    deeper.assert_async().await;
}

#[tokio::test]
async fn page_query_pagination_advances_cursor() {
    let mut server = mockito::Server::new_async().await;
    let page1 = server
        .mock("GET", "/list")
        .match_query(mockito::Matcher::UrlEncoded("page".into(), "1".into()))
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_body(r#"<html><body><img src="/p1.jpg"></body></html>"#)
        .expect(1)
        .create_async()
        .await;
    let page2 = server
        .mock("GET", "/list")
        .match_query(mockito::Matcher::UrlEncoded("page".into(), "2".into()))
        .with_status(200)
        .with_header("content-type", "text/html")
        // No assets: pagination stops after this page.
        .with_body(r#"<html><body>nothing new</body></html>"#)
        .expect(1)
        .create_async()
        .await;
    server
        .mock("GET", "/p1.jpg")
        .with_status(200)
        .with_header("content-type", "image/jpeg")
        .with_body(vec![5u8; 16])
        .create_async()
        .await;

    let (state, _temp) = build_app();
    let job = crawl_job("paged", &format!("{}/list?page=1", server.url()));
    let job_id = job.id.clone();
    state.store.add_job(job).unwrap();

    state.supervisor.start(&job_id).await.unwrap();
    let status = wait_for_status(&state, &job_id, JobStatus::Completed, Duration::from_secs(10)).await;
    assert_eq!(status, JobStatus::Completed);

    page1.assert_async().await;
    page2.assert_async().await;
    let job = state.store.get_job(&job_id).unwrap().job_snapshot();
    assert_eq!(job.current_page, 2);
    assert_eq!(state.store.list_assets(&job_id).unwrap().len(), 1);
}
