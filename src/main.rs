use std::{
    collections::HashSet,
    ffi::OsStr,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, LazyLock},
};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path as RoutePath, State},
    http::{
        HeaderMap, HeaderValue, Method, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use headless_chrome::{Browser, LaunchOptions, protocol::cdp::Network::Cookie as BrowserCookie};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    process::Command,
    sync::Mutex,
    task::JoinHandle,
    time::{Duration, MissedTickBehavior, interval},
};
use tokio_util::io::ReaderStream;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

const DEFAULT_DOWNLOADS_DIR: &str = "downloads";
const COOKIE_JAR_FILENAME: &str = "cookies.txt";
const DEFAULT_QUALITY: &str = "720p";
const FILE_MAX_AGE_HOURS: i64 = 1;
const COOKIE_REFRESH_INTERVAL_SECONDS: u64 = 30 * 60;
const COOKIE_SETTLE_SECONDS: u64 = 5;
const COOKIE_SOURCE_URL: &str = "https://www.youtube.com";
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
const FRAGMENT_RETRIES: u32 = 10;
const DOWNLOAD_RETRIES: u32 = 10;
const CONCURRENT_FRAGMENTS: u32 = 4;
const DOWNLOAD_BUFFER_SIZE: &str = "16K";
const PARTIAL_SUFFIXES: [&str; 2] = [".part", ".ytdl"];

static VIDEO_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:youtube\.com/(?:[^/\s]+/\S+/|(?:v|e(?:mbed)?)/|\S*?[?&]v=)|youtu\.be/)([A-Za-z0-9_-]{11})",
    )
    .expect("video id pattern compiles")
});

#[derive(Clone)]
struct AppState {
    downloads_dir: PathBuf,
    cookie_jar: Arc<CookieJar>,
}

#[derive(Debug, Deserialize)]
struct CheckVideoRequest {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    url: Option<String>,
    quality: Option<String>,
}

#[derive(Debug, Serialize)]
struct VideoDetailsReply {
    success: bool,
    title: String,
    thumbnail: String,
    duration: u64,
    formats: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct DownloadReply {
    success: bool,
    link: String,
}

#[derive(Debug, Serialize)]
struct FailureReply {
    success: bool,
    error: String,
}

fn failure(message: impl Into<String>) -> Json<FailureReply> {
    Json(FailureReply {
        success: false,
        error: message.into(),
    })
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, failure(self.message)).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct YtDlpVideoInfo {
    title: Option<String>,
    thumbnail: Option<String>,
    duration: Option<f64>,
    formats: Option<serde_json::Value>,
}

impl YtDlpVideoInfo {
    fn into_reply(self) -> VideoDetailsReply {
        VideoDetailsReply {
            success: true,
            title: self
                .title
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| "Unknown Title".to_string()),
            thumbnail: self.thumbnail.unwrap_or_default(),
            duration: self.duration.unwrap_or(0.0).round() as u64,
            formats: self
                .formats
                .unwrap_or_else(|| serde_json::Value::Array(Vec::new())),
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(resolve_env_filter())
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let downloads_dir = resolve_downloads_dir();
    tokio::fs::create_dir_all(&downloads_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!("Could not create downloads directory: {error}"))
        })?;

    let cookie_jar = Arc::new(CookieJar::new(resolve_cookie_jar_path(&downloads_dir)));
    let state = AppState {
        downloads_dir,
        cookie_jar: Arc::clone(&cookie_jar),
    };

    cleanup_old_files(&state.downloads_dir, state.cookie_jar.path()).await;

    let cookie_refresher = CookieRefresher::start(cookie_jar);
    let cors = build_cors_layer()?;

    let app = Router::new()
        .route("/", get(home))
        .route("/check-video", post(check_video))
        .route("/download", post(download))
        .route("/file/{filename}", get(serve_file))
        .route("/health", get(health))
        .fallback(not_found)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = resolve_bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|error| ApiError::internal(format!("Could not bind {addr}: {error}")))?;

    info!("tubedrop listening on http://{addr}");

    let served = axum::serve(listener, app).await;
    cookie_refresher.stop();
    served.map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

async fn home() -> Html<&'static str> {
    Html(include_str!("../templates/index.html"))
}

async fn not_found() -> ApiError {
    ApiError::not_found("Not Found")
}

async fn check_video(
    State(state): State<AppState>,
    Json(payload): Json<CheckVideoRequest>,
) -> Response {
    let Some(url) = payload.url.as_deref().and_then(non_empty) else {
        return failure("No URL provided").into_response();
    };
    if extract_video_id(url).is_none() {
        return failure("Invalid YouTube URL").into_response();
    }

    match fetch_video_details(&state, url).await {
        Ok(details) => Json(details).into_response(),
        Err(message) => failure(message).into_response(),
    }
}

async fn download(State(state): State<AppState>, Json(payload): Json<DownloadRequest>) -> Response {
    cleanup_old_files(&state.downloads_dir, state.cookie_jar.path()).await;

    let Some(url) = payload.url.as_deref().and_then(non_empty) else {
        return failure("No URL provided").into_response();
    };
    if extract_video_id(url).is_none() {
        return failure("Invalid YouTube URL").into_response();
    }

    let quality = payload
        .quality
        .as_deref()
        .and_then(non_empty)
        .unwrap_or(DEFAULT_QUALITY);
    let token = Uuid::new_v4().to_string();

    match run_download(&state, url, quality, &token).await {
        Ok(filename) => Json(DownloadReply {
            success: true,
            link: format!("/file/{filename}"),
        })
        .into_response(),
        Err(message) => failure(message).into_response(),
    }
}

async fn serve_file(
    State(state): State<AppState>,
    RoutePath(filename): RoutePath<String>,
) -> Result<Response, ApiError> {
    if !is_safe_filename(&filename) {
        return Err(ApiError::not_found("File not found"));
    }

    let path = state.downloads_dir.join(&filename);
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(error) if error.kind() == ErrorKind::NotFound => {
            return Err(ApiError::not_found("File not found"));
        }
        Err(error) => {
            return Err(ApiError::internal(format!("Could not open file: {error}")));
        }
    };

    let metadata = file
        .metadata()
        .await
        .map_err(|error| ApiError::internal(format!("Could not read file metadata: {error}")))?;
    if !metadata.is_file() {
        return Err(ApiError::not_found("File not found"));
    }

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_filename(&filename)),
    );
    headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&metadata.len().to_string())
            .map_err(|_| ApiError::internal("Could not build content length header"))?,
    );
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&filename))
            .map_err(|_| ApiError::internal("Could not build content disposition header"))?,
    );

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((headers, body).into_response())
}

async fn health(State(state): State<AppState>) -> Response {
    match health_report(&state).await {
        Ok(report) => Json(report).into_response(),
        Err(message) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "status": "unhealthy", "error": message })),
        )
            .into_response(),
    }
}

async fn health_report(state: &AppState) -> Result<serde_json::Value, String> {
    let output = run_yt_dlp(vec!["--version".to_string()])
        .await
        .map_err(|error| error.user_message())?;
    let version = String::from_utf8_lossy(&output.stdout).trim().to_string();

    let downloads_dir = tokio::fs::canonicalize(&state.downloads_dir)
        .await
        .unwrap_or_else(|_| state.downloads_dir.clone());
    let writable = tokio::fs::metadata(&state.downloads_dir)
        .await
        .map(|metadata| !metadata.permissions().readonly())
        .map_err(|error| format!("Could not inspect downloads directory: {error}"))?;

    Ok(serde_json::json!({
        "status": "healthy",
        "yt_dlp_version": version,
        "downloads_dir": downloads_dir.to_string_lossy(),
        "downloads_writable": writable,
    }))
}

fn extract_video_id(url: &str) -> Option<&str> {
    let captures = VIDEO_ID_PATTERN.captures(url)?;
    let id = captures.get(1)?;

    // Identifiers are exactly 11 characters; a longer run of id characters
    // means the URL does not carry a real one.
    let tail = url[id.end()..].chars().next();
    match tail {
        Some(next) if next.is_ascii_alphanumeric() || next == '_' || next == '-' => None,
        _ => Some(id.as_str()),
    }
}

async fn fetch_video_details(state: &AppState, url: &str) -> Result<VideoDetailsReply, String> {
    state.cookie_jar.ensure_present().await;

    let attempt = match dump_video_info(state, url).await {
        Err(error) if error.is_bot_challenge() => {
            info!("bot challenge while fetching metadata, refreshing cookie jar and retrying once");
            if let Err(refresh_error) = state.cookie_jar.refresh().await {
                warn!("cookie refresh during bot-challenge recovery failed: {refresh_error}");
            }
            dump_video_info(state, url).await
        }
        other => other,
    };

    let output = attempt.map_err(|error| error.user_message())?;
    let info: YtDlpVideoInfo = serde_json::from_slice(&output.stdout).map_err(|error| {
        warn!("could not parse yt-dlp metadata for {url:?}: {error}");
        "Could not fetch video information".to_string()
    })?;

    Ok(info.into_reply())
}

async fn dump_video_info(state: &AppState, url: &str) -> Result<std::process::Output, ToolError> {
    run_yt_dlp(vec![
        "--dump-json".to_string(),
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        "--cookies".to_string(),
        state.cookie_jar.path().to_string_lossy().into_owned(),
        "--user-agent".to_string(),
        BROWSER_USER_AGENT.to_string(),
        url.to_string(),
    ])
    .await
}

async fn run_download(
    state: &AppState,
    url: &str,
    quality: &str,
    token: &str,
) -> Result<String, String> {
    cleanup_partial_artifacts(&state.downloads_dir).await;
    state.cookie_jar.ensure_present().await;

    let args = build_download_args(state, url, quality, token);
    let invocation = match run_yt_dlp(args.clone()).await {
        Err(error) if error.is_bot_challenge() => {
            info!("bot challenge during download, refreshing cookie jar and retrying once");
            if let Err(refresh_error) = state.cookie_jar.refresh().await {
                warn!("cookie refresh during bot-challenge recovery failed: {refresh_error}");
            }
            run_yt_dlp(args).await
        }
        other => other,
    };

    // Leftover fragments from an aborted run would otherwise sit until the
    // next request's pre-sweep.
    cleanup_partial_artifacts(&state.downloads_dir).await;

    invocation.map_err(|error| error.user_message())?;

    match locate_download(&state.downloads_dir, token).await {
        Some(filename) => Ok(filename),
        None => Err("File not found after download".to_string()),
    }
}

fn build_download_args(state: &AppState, url: &str, quality: &str, token: &str) -> Vec<String> {
    let output_template = state
        .downloads_dir
        .join(format!("{token}.%(ext)s"))
        .to_string_lossy()
        .into_owned();

    let mut args = vec![
        "--format".to_string(),
        format_selector(quality).to_string(),
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        "--fragment-retries".to_string(),
        FRAGMENT_RETRIES.to_string(),
        "--retries".to_string(),
        DOWNLOAD_RETRIES.to_string(),
        "--concurrent-fragments".to_string(),
        CONCURRENT_FRAGMENTS.to_string(),
        "--buffer-size".to_string(),
        DOWNLOAD_BUFFER_SIZE.to_string(),
        "--geo-bypass".to_string(),
        "--no-check-certificates".to_string(),
        "--user-agent".to_string(),
        BROWSER_USER_AGENT.to_string(),
        "--cookies".to_string(),
        state.cookie_jar.path().to_string_lossy().into_owned(),
        "-o".to_string(),
        output_template,
    ];

    if quality == "audio" {
        args.push("--extract-audio".to_string());
        args.push("--audio-format".to_string());
        args.push("mp3".to_string());
        args.push("--audio-quality".to_string());
        args.push("0".to_string());
    }

    args.push(url.to_string());
    args
}

fn format_selector(quality: &str) -> &'static str {
    match quality {
        "360p" => "bestvideo[height<=360]+bestaudio/best[height<=360]",
        "480p" => "bestvideo[height<=480]+bestaudio/best[height<=480]",
        "720p" => "bestvideo[height<=720]+bestaudio/best[height<=720]",
        "1080p" => "bestvideo[height<=1080]+bestaudio/best[height<=1080]",
        "audio" => "bestaudio/best",
        _ => "best",
    }
}

async fn locate_download(downloads_dir: &Path, token: &str) -> Option<String> {
    let mut entries = tokio::fs::read_dir(downloads_dir).await.ok()?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(token) && !is_partial_artifact(name) {
            return Some(name.to_string());
        }
    }
    None
}

#[derive(Debug)]
enum ToolError {
    NotInstalled,
    Spawn(String),
    Failed { stderr: String },
}

impl ToolError {
    fn is_bot_challenge(&self) -> bool {
        matches!(self, ToolError::Failed { stderr } if is_bot_challenge(stderr))
    }

    fn user_message(&self) -> String {
        match self {
            ToolError::NotInstalled => "yt-dlp is not installed on the server.".to_string(),
            ToolError::Spawn(error) => format!("Could not run yt-dlp: {error}"),
            ToolError::Failed { stderr } => classify_tool_error(stderr),
        }
    }
}

async fn run_yt_dlp(args: Vec<String>) -> Result<std::process::Output, ToolError> {
    debug!("running yt-dlp {}", args.join(" "));
    let output = Command::new("yt-dlp")
        .args(args)
        .output()
        .await
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                ToolError::NotInstalled
            } else {
                ToolError::Spawn(error.to_string())
            }
        })?;

    if !output.status.success() {
        return Err(ToolError::Failed {
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    Ok(output)
}

fn classify_tool_error(stderr: &str) -> String {
    if stderr.contains("HTTP Error 429") {
        return "Too many requests. Please try again later.".to_string();
    }
    if stderr.contains("This video is not available") {
        return "This video is not available or may be private.".to_string();
    }
    if stderr.contains("Sign in to confirm your age") {
        return "Age-restricted video. Cannot download.".to_string();
    }
    if is_bot_challenge(stderr) {
        return "The video site asked for a verification challenge. Please try again in a moment."
            .to_string();
    }

    stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp could not complete the operation")
        .to_string()
}

fn is_bot_challenge(stderr: &str) -> bool {
    stderr.contains("not a bot")
}

struct CookieJar {
    path: PathBuf,
    refresh_gate: Mutex<()>,
}

impl CookieJar {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            refresh_gate: Mutex::new(()),
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn ensure_present(&self) {
        if matches!(tokio::fs::try_exists(&self.path).await, Ok(true)) {
            return;
        }
        if let Err(error) = self.refresh().await {
            warn!("first-use cookie refresh failed: {error}");
        }
    }

    async fn refresh(&self) -> Result<(), String> {
        let _gate = self.refresh_gate.lock().await;

        let records = tokio::task::spawn_blocking(harvest_session_cookies)
            .await
            .map_err(|error| format!("cookie harvest task failed: {error}"))??;
        self.write_records(&records).await?;

        info!("refreshed cookie jar with {} cookies", records.len());
        Ok(())
    }

    async fn write_records(&self, records: &[CookieRecord]) -> Result<(), String> {
        let mut contents =
            String::from("# Netscape HTTP Cookie File\n# Generated by tubedrop. Do not edit.\n\n");
        for record in records {
            contents.push_str(&record.jar_line());
            contents.push('\n');
        }

        // Staged write plus rename so a concurrent reader never observes a
        // half-written jar.
        let staging = self.path.with_extension("txt.tmp");
        tokio::fs::write(&staging, &contents)
            .await
            .map_err(|error| format!("could not stage cookie jar: {error}"))?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .map_err(|error| format!("could not replace cookie jar: {error}"))
    }
}

#[derive(Debug, Clone)]
struct CookieRecord {
    domain: String,
    path: String,
    secure: bool,
    expires: Option<i64>,
    name: String,
    value: String,
}

impl From<BrowserCookie> for CookieRecord {
    fn from(cookie: BrowserCookie) -> Self {
        let expires = if cookie.session || cookie.expires <= 0.0 {
            None
        } else {
            Some(cookie.expires as i64)
        };

        Self {
            domain: cookie.domain,
            path: cookie.path,
            secure: cookie.secure,
            expires,
            name: cookie.name,
            value: cookie.value,
        }
    }
}

impl CookieRecord {
    fn jar_line(&self) -> String {
        let include_subdomains = if self.domain.starts_with('.') {
            "TRUE"
        } else {
            "FALSE"
        };
        let secure = if self.secure { "TRUE" } else { "FALSE" };

        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.domain,
            include_subdomains,
            self.path,
            secure,
            self.expires.unwrap_or(0),
            self.name,
            self.value
        )
    }
}

fn harvest_session_cookies() -> Result<Vec<CookieRecord>, String> {
    let options = LaunchOptions::default_builder()
        .headless(true)
        .args(vec![OsStr::new("--disable-blink-features=AutomationControlled")])
        .build()
        .map_err(|error| format!("could not assemble browser launch options: {error}"))?;

    let browser = Browser::new(options)
        .map_err(|error| format!("could not launch headless browser: {error}"))?;
    let tab = browser
        .new_tab()
        .map_err(|error| format!("could not open browser tab: {error}"))?;

    tab.set_user_agent(BROWSER_USER_AGENT, None, None)
        .map_err(|error| format!("could not set browser user agent: {error}"))?;
    tab.navigate_to(COOKIE_SOURCE_URL)
        .map_err(|error| format!("could not navigate to {COOKIE_SOURCE_URL}: {error}"))?;
    tab.wait_until_navigated()
        .map_err(|error| format!("navigation to {COOKIE_SOURCE_URL} did not settle: {error}"))?;

    // Session cookies are issued shortly after the page settles.
    std::thread::sleep(Duration::from_secs(COOKIE_SETTLE_SECONDS));

    let cookies = tab
        .get_cookies()
        .map_err(|error| format!("could not read browser cookies: {error}"))?;

    Ok(cookies.into_iter().map(CookieRecord::from).collect())
}

struct CookieRefresher {
    handle: JoinHandle<()>,
}

impl CookieRefresher {
    fn start(jar: Arc<CookieJar>) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(COOKIE_REFRESH_INTERVAL_SECONDS));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(error) = jar.refresh().await {
                    warn!("scheduled cookie refresh failed: {error}");
                }
            }
        });

        Self { handle }
    }

    fn stop(self) {
        self.handle.abort();
    }
}

async fn cleanup_old_files(downloads_dir: &Path, cookie_jar: &Path) {
    let now = Utc::now();
    let mut entries = match tokio::fs::read_dir(downloads_dir).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("could not open downloads directory for cleanup: {error}");
            }
            return;
        }
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                warn!("could not iterate downloads directory for cleanup: {error}");
                break;
            }
        };

        let path = entry.path();
        if path == cookie_jar {
            continue;
        }

        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }

        let Ok(created) = metadata.created().or_else(|_| metadata.modified()) else {
            continue;
        };
        if !is_expired(DateTime::from(created), now) {
            continue;
        }

        if let Err(error) = tokio::fs::remove_file(&path).await
            && error.kind() != ErrorKind::NotFound
        {
            debug!("could not remove expired file {:?}: {error}", path);
        }
    }
}

fn is_expired(created: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    created < now - chrono::Duration::hours(FILE_MAX_AGE_HOURS)
}

async fn cleanup_partial_artifacts(downloads_dir: &Path) {
    let mut entries = match tokio::fs::read_dir(downloads_dir).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("could not open downloads directory for partial sweep: {error}");
            }
            return;
        }
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !is_partial_artifact(name) {
            continue;
        }

        if let Err(error) = tokio::fs::remove_file(entry.path()).await
            && error.kind() != ErrorKind::NotFound
        {
            debug!("could not remove partial artifact {name:?}: {error}");
        }
    }
}

fn is_partial_artifact(name: &str) -> bool {
    PARTIAL_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

fn is_safe_filename(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains("..")
}

fn resolve_env_filter() -> String {
    if let Ok(configured) = std::env::var("RUST_LOG") {
        return configured;
    }

    if is_production() {
        "tubedrop=info,tower_http=info".to_string()
    } else {
        "tubedrop=debug,tower_http=debug".to_string()
    }
}

fn is_production() -> bool {
    std::env::var("APP_ENV").is_ok_and(|value| value.trim().eq_ignore_ascii_case("production"))
}

fn resolve_downloads_dir() -> PathBuf {
    std::env::var("DOWNLOAD_FOLDER")
        .ok()
        .and_then(|value| non_empty(&value).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOADS_DIR))
}

fn resolve_cookie_jar_path(downloads_dir: &Path) -> PathBuf {
    std::env::var("COOKIE_JAR")
        .ok()
        .and_then(|value| non_empty(&value).map(PathBuf::from))
        .unwrap_or_else(|| downloads_dir.join(COOKIE_JAR_FILENAME))
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = std::env::var("APP_ADDR")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    "0.0.0.0:10000".to_string()
}

fn build_cors_layer() -> Result<CorsLayer, ApiError> {
    let configured = std::env::var("ALLOWED_ORIGINS")
        .ok()
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(ToString::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    // The landing page is served from this process, so same-origin traffic
    // needs no CORS at all; an allow-list only matters for a split frontend.
    if configured.is_empty() {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(Any));
    }

    let normalized = configured
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Invalid origin in ALLOWED_ORIGINS: {origin}. Use values like https://example.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    let allowed = Arc::new(normalized);

    info!("CORS allow-list loaded with {} origin(s)", allowed.len());

    let allow_origin = AllowOrigin::predicate({
        let allowed = Arc::clone(&allowed);
        move |origin: &HeaderValue, _| {
            origin
                .to_str()
                .ok()
                .and_then(normalize_origin)
                .is_some_and(|value| allowed.contains(&value))
        }
    });

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any))
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };
    let port = parsed.port();

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    if port.is_some_and(|explicit| explicit != default_port) {
        Some(format!("{scheme}://{host}:{}", port?))
    } else {
        Some(format!("{scheme}://{host}"))
    }
}

fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "opus" => "audio/ogg",
        "flac" => "audio/flac",
        _ => "application/octet-stream",
    }
}

fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let mut sanitized = String::with_capacity(value.len());

    for character in value.chars() {
        if character.is_ascii_alphanumeric()
            || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
        {
            sanitized.push(character);
        } else {
            sanitized.push('_');
        }
    }

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() { None } else { Some(trimmed) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use serde_json::Value;
    use std::fs;
    use tempfile::tempdir;

    fn test_state(dir: &Path) -> AppState {
        AppState {
            downloads_dir: dir.to_path_buf(),
            cookie_jar: Arc::new(CookieJar::new(dir.join(COOKIE_JAR_FILENAME))),
        }
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn extracts_id_from_watch_url() {
        assert_eq!(
            extract_video_id("https://www.youtube.com/watch?v=dQw4w9WgXcQ"),
            Some("dQw4w9WgXcQ")
        );
        assert_eq!(
            extract_video_id("https://youtube.com/watch?v=a1B2c3D4e5_&t=42s"),
            Some("a1B2c3D4e5_")
        );
    }

    #[test]
    fn extracts_id_from_short_url() {
        assert_eq!(
            extract_video_id("https://youtu.be/dQw4w9WgXcQ"),
            Some("dQw4w9WgXcQ")
        );
    }

    #[test]
    fn extracts_id_from_embed_and_v_paths() {
        assert_eq!(
            extract_video_id("https://www.youtube.com/embed/dQw4w9WgXcQ"),
            Some("dQw4w9WgXcQ")
        );
        assert_eq!(
            extract_video_id("https://www.youtube.com/v/dQw4w9WgXcQ"),
            Some("dQw4w9WgXcQ")
        );
    }

    #[test]
    fn rejects_malformed_urls() {
        assert_eq!(extract_video_id(""), None);
        assert_eq!(extract_video_id("not a url"), None);
        assert_eq!(
            extract_video_id("https://example.com/watch?v=dQw4w9WgXcQ"),
            None
        );
        // Ten id characters is one short.
        assert_eq!(extract_video_id("https://youtu.be/dQw4w9WgXc"), None);
        // Twelve is one too many.
        assert_eq!(extract_video_id("https://youtu.be/dQw4w9WgXcQ2"), None);
    }

    #[test]
    fn maps_known_quality_tiers() {
        assert_eq!(
            format_selector("360p"),
            "bestvideo[height<=360]+bestaudio/best[height<=360]"
        );
        assert_eq!(
            format_selector("1080p"),
            "bestvideo[height<=1080]+bestaudio/best[height<=1080]"
        );
        assert_eq!(format_selector("audio"), "bestaudio/best");
    }

    #[test]
    fn unknown_quality_falls_back_to_best() {
        assert_eq!(format_selector("4320p"), "best");
        assert_eq!(format_selector(""), "best");
    }

    #[test]
    fn classifies_rate_limiting() {
        let stderr = "ERROR: unable to download video data: HTTP Error 429: Too Many Requests";
        assert_eq!(
            classify_tool_error(stderr),
            "Too many requests. Please try again later."
        );
    }

    #[test]
    fn classifies_unavailable_and_age_restriction() {
        assert_eq!(
            classify_tool_error("ERROR: This video is not available"),
            "This video is not available or may be private."
        );
        assert_eq!(
            classify_tool_error("ERROR: Sign in to confirm your age"),
            "Age-restricted video. Cannot download."
        );
    }

    #[test]
    fn classifies_bot_challenge() {
        let stderr = "ERROR: [youtube] abc: Sign in to confirm you're not a bot.";
        assert!(is_bot_challenge(stderr));
        assert_eq!(
            classify_tool_error(stderr),
            "The video site asked for a verification challenge. Please try again in a moment."
        );
    }

    #[test]
    fn passes_through_unknown_errors() {
        let stderr = "WARNING: something minor\nERROR: some new failure mode\n";
        assert_eq!(classify_tool_error(stderr), "ERROR: some new failure mode");
    }

    #[test]
    fn cookie_record_serializes_netscape_line() {
        let record = CookieRecord {
            domain: "www.youtube.com".to_string(),
            path: "/".to_string(),
            secure: true,
            expires: Some(1_700_000_000),
            name: "VISITOR_INFO1_LIVE".to_string(),
            value: "abc123".to_string(),
        };

        assert_eq!(
            record.jar_line(),
            "www.youtube.com\tFALSE\t/\tTRUE\t1700000000\tVISITOR_INFO1_LIVE\tabc123"
        );
    }

    #[test]
    fn session_cookie_gets_zero_expiry_and_subdomain_flag() {
        let record = CookieRecord {
            domain: ".youtube.com".to_string(),
            path: "/".to_string(),
            secure: false,
            expires: None,
            name: "YSC".to_string(),
            value: "xyz".to_string(),
        };

        assert_eq!(
            record.jar_line(),
            ".youtube.com\tTRUE\t/\tFALSE\t0\tYSC\txyz"
        );
    }

    #[tokio::test]
    async fn jar_write_replaces_contents_atomically() {
        let temp = tempdir().unwrap();
        let jar = CookieJar::new(temp.path().join(COOKIE_JAR_FILENAME));

        let first = CookieRecord {
            domain: ".youtube.com".to_string(),
            path: "/".to_string(),
            secure: true,
            expires: Some(1),
            name: "old".to_string(),
            value: "1".to_string(),
        };
        let second = CookieRecord {
            domain: ".youtube.com".to_string(),
            path: "/".to_string(),
            secure: true,
            expires: Some(2),
            name: "new".to_string(),
            value: "2".to_string(),
        };

        jar.write_records(std::slice::from_ref(&first))
            .await
            .unwrap();
        jar.write_records(std::slice::from_ref(&second))
            .await
            .unwrap();

        let contents = fs::read_to_string(jar.path()).unwrap();
        assert!(contents.starts_with("# Netscape HTTP Cookie File"));
        assert!(contents.contains("\tnew\t"));
        assert!(!contents.contains("\told\t"));
        // The staging file never survives a completed write.
        assert!(!temp.path().join("cookies.txt.tmp").exists());
    }

    #[test]
    fn hour_old_files_are_expired() {
        let now = Utc::now();
        assert!(is_expired(now - chrono::Duration::hours(2), now));
        assert!(is_expired(now - chrono::Duration::minutes(61), now));
        assert!(!is_expired(now - chrono::Duration::minutes(10), now));
    }

    #[tokio::test]
    async fn sweep_removes_partial_artifacts_only() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("a.mp4.part"), b"x").unwrap();
        fs::write(temp.path().join("b.ytdl"), b"x").unwrap();
        fs::write(temp.path().join("c.mp3"), b"x").unwrap();

        cleanup_partial_artifacts(temp.path()).await;

        assert!(!temp.path().join("a.mp4.part").exists());
        assert!(!temp.path().join("b.ytdl").exists());
        assert!(temp.path().join("c.mp3").exists());
    }

    #[tokio::test]
    async fn sweep_keeps_recent_files_and_cookie_jar() {
        let temp = tempdir().unwrap();
        let jar_path = temp.path().join(COOKIE_JAR_FILENAME);
        fs::write(&jar_path, b"# Netscape HTTP Cookie File\n").unwrap();
        fs::write(temp.path().join("fresh.mp4"), b"x").unwrap();

        cleanup_old_files(temp.path(), &jar_path).await;

        assert!(jar_path.exists());
        assert!(temp.path().join("fresh.mp4").exists());
    }

    #[tokio::test]
    async fn finds_file_by_token_prefix() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("11111111-aaaa.mp3"), b"x").unwrap();
        fs::write(temp.path().join("22222222-bbbb.mp4"), b"x").unwrap();

        assert_eq!(
            locate_download(temp.path(), "11111111").await,
            Some("11111111-aaaa.mp3".to_string())
        );
        assert_eq!(locate_download(temp.path(), "33333333").await, None);
    }

    #[test]
    fn safe_filename_rejects_traversal() {
        assert!(is_safe_filename("video.mp4"));
        assert!(!is_safe_filename(""));
        assert!(!is_safe_filename("../etc/passwd"));
        assert!(!is_safe_filename("a/b.mp4"));
        assert!(!is_safe_filename("a\\b.mp4"));
        assert!(!is_safe_filename(".hidden"));
    }

    #[test]
    fn content_types_cover_common_extensions() {
        assert_eq!(content_type_for_filename("a.mp4"), "video/mp4");
        assert_eq!(content_type_for_filename("a.mp3"), "audio/mpeg");
        assert_eq!(
            content_type_for_filename("a.unknown"),
            "application/octet-stream"
        );
    }

    #[test]
    fn content_disposition_is_ascii_safe() {
        let header = build_content_disposition("tokén.mp3");
        assert!(header.starts_with("attachment; filename=\""));
        assert!(header.is_ascii());
    }

    #[test]
    fn metadata_defaults_apply_when_fields_missing() {
        let info: YtDlpVideoInfo = serde_json::from_str("{}").unwrap();
        let reply = info.into_reply();

        assert!(reply.success);
        assert_eq!(reply.title, "Unknown Title");
        assert_eq!(reply.thumbnail, "");
        assert_eq!(reply.duration, 0);
        assert_eq!(reply.formats, serde_json::Value::Array(Vec::new()));
    }

    #[test]
    fn metadata_passes_formats_through_verbatim() {
        let info: YtDlpVideoInfo = serde_json::from_str(
            r#"{"title":"Song","thumbnail":"https://i.ytimg.com/t.jpg","duration":212.4,
                "formats":[{"format_id":"251","ext":"webm"}]}"#,
        )
        .unwrap();
        let reply = info.into_reply();

        assert_eq!(reply.title, "Song");
        assert_eq!(reply.duration, 212);
        assert_eq!(reply.formats[0]["format_id"], "251");
    }

    #[tokio::test]
    async fn check_video_requires_url() {
        let temp = tempdir().unwrap();
        let state = test_state(temp.path());

        let response = check_video(State(state), Json(CheckVideoRequest { url: None })).await;
        let body = json_body(response).await;

        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "No URL provided");
    }

    #[tokio::test]
    async fn download_rejects_invalid_url() {
        let temp = tempdir().unwrap();
        let state = test_state(temp.path());

        let response = download(
            State(state),
            Json(DownloadRequest {
                url: Some("https://example.com/watch?v=dQw4w9WgXcQ".to_string()),
                quality: None,
            }),
        )
        .await;
        let body = json_body(response).await;

        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Invalid YouTube URL");
    }

    #[tokio::test]
    async fn missing_file_returns_404() {
        let temp = tempdir().unwrap();
        let state = test_state(temp.path());

        let response = serve_file(State(state.clone()), RoutePath("nope.mp4".to_string()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let traversal = serve_file(State(state), RoutePath("../secret".to_string()))
            .await
            .into_response();
        assert_eq!(traversal.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn served_file_is_an_attachment() {
        let temp = tempdir().unwrap();
        let state = test_state(temp.path());
        fs::write(temp.path().join("token.mp3"), b"audio bytes").unwrap();

        let response = serve_file(State(state), RoutePath("token.mp3".to_string()))
            .await
            .into_response();

        assert_eq!(response.status(), StatusCode::OK);
        let disposition = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .unwrap();
        assert!(disposition.starts_with("attachment"));
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "audio/mpeg");
    }
}
