//! Chrome/Chromium engine over the DevTools protocol
//!
//! Each session gets its own browser process with a throwaway profile
//! directory, or, when attached to a running browser, its own browser
//! context. Downloads are accepted into a temporary directory and reported
//! on the session's download channel once complete.

use super::{
    BrowserEngine, BrowserSession, Download, HopResponse, Interaction, Navigation,
    NavigationOutcome, PageContent, SessionProfile,
};
use crate::config::EngineConfig;
use crate::cookies::StoredCookie;
use crate::error::{NavigationError, ScrapeError};
use crate::stealth;
use crate::types::ResponseMetadata;
use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use chromiumoxide::cdp::browser_protocol::browser::{
    BrowserContextId, DownloadProgressState, EventDownloadProgress, EventDownloadWillBegin,
    GrantPermissionsParams, PermissionType, SetDownloadBehaviorBehavior,
    SetDownloadBehaviorParams,
};
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetLocaleOverrideParams, SetTimezoneOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchMouseEventParams, DispatchMouseEventType,
};
use chromiumoxide::cdp::browser_protocol::network::{
    Cookie, CookieParam, CookieSameSite, EnableParams, EventLoadingFailed, EventLoadingFinished,
    EventRequestWillBeSent, EventResponseReceived, GetResponseBodyParams, Headers, RequestId,
    ResourceType, Response, SetExtraHttpHeadersParams, SetUserAgentOverrideParams,
    TimeSinceEpoch,
};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, EventFrameNavigated, FrameId, NavigateParams,
};
use chromiumoxide::cdp::browser_protocol::security::SetIgnoreCertificateErrorsParams;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::handler::HandlerConfig;
use chromiumoxide::listeners::EventStream;
use chromiumoxide::{Browser, BrowserConfig, Handler, Page};
use futures::{future, FutureExt, Stream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// Well-known browser install locations, checked before `PATH`
const CHROME_PATHS: &[&str] = &[
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/snap/bin/chromium",
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
];

const CHROME_COMMANDS: &[&str] = &[
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
];

/// How long the network must stay empty before a page counts as idle
const NETWORK_QUIET: Duration = Duration::from_millis(500);

/// Extra room on CDP command timeouts so the navigation budget fires first
const COMMAND_TIMEOUT_SLACK: Duration = Duration::from_secs(5);

/// How long an abandoned remote session may take to dispose its context
const DISPOSE_TIMEOUT: Duration = Duration::from_secs(5);

fn browser_err(e: impl std::fmt::Display) -> ScrapeError {
    ScrapeError::Browser(e.to_string())
}

fn launch_err(e: impl std::fmt::Display) -> ScrapeError {
    ScrapeError::Launch(e.to_string())
}

/// Locate a Chrome or Chromium executable
pub fn find_chrome() -> Option<PathBuf> {
    for path in CHROME_PATHS {
        let p = Path::new(path);
        if p.exists() {
            debug!("Found Chrome at: {}", path);
            return Some(p.to_path_buf());
        }
    }

    for cmd in CHROME_COMMANDS {
        if let Ok(output) = std::process::Command::new("which").arg(cmd).output() {
            if output.status.success() {
                let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !path.is_empty() {
                    debug!("Found Chrome in PATH: {}", path);
                    return Some(PathBuf::from(path));
                }
            }
        }
    }

    None
}

/// Resolve a DevTools endpoint to its browser websocket URL
///
/// `ws://` URLs are used as-is; `http://host:port` is looked up through
/// `/json/version`.
pub async fn discover_websocket_url(remote: &str) -> Result<String, ScrapeError> {
    if remote.starts_with("ws://") || remote.starts_with("wss://") {
        return Ok(remote.to_string());
    }

    let version_url = format!("{}/json/version", remote.trim_end_matches('/'));
    debug!("Discovering DevTools endpoint at {}", version_url);

    let info: serde_json::Value = reqwest::Client::new()
        .get(&version_url)
        .send()
        .await
        .map_err(|e| ScrapeError::Launch(format!("cannot reach {}: {}", version_url, e)))?
        .error_for_status()
        .map_err(launch_err)?
        .json()
        .await
        .map_err(|e| ScrapeError::Launch(format!("bad version info from {}: {}", version_url, e)))?;

    info.get("webSocketDebuggerUrl")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| ScrapeError::Launch("no webSocketDebuggerUrl in version info".to_string()))
}

fn spawn_handler(mut handler: Handler) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(e) = event {
                debug!("CDP handler error: {}", e);
            }
        }
    })
}

/// Timeout for individual CDP commands
///
/// Kept above the navigation budget so the orchestrator reports the timeout.
fn command_timeout(config: &EngineConfig) -> Duration {
    config.navigation_timeout() + COMMAND_TIMEOUT_SLACK
}

fn handler_config(config: &EngineConfig) -> HandlerConfig {
    HandlerConfig {
        request_timeout: command_timeout(config),
        ..Default::default()
    }
}

/// Engine backed by a real Chrome/Chromium
#[derive(Debug, Clone)]
pub struct ChromiumEngine {
    config: EngineConfig,
}

impl ChromiumEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    async fn launch_local(&self, profile: &SessionProfile) -> Result<Connected, ScrapeError> {
        let chrome = match &self.config.chrome_path {
            Some(path) => path.clone(),
            None => find_chrome().ok_or_else(|| {
                ScrapeError::Launch(
                    "Chrome/Chromium not found; install it or set LIGHTHEAD_CHROME".to_string(),
                )
            })?,
        };

        let profile_dir = tempfile::Builder::new()
            .prefix("lighthead-profile-")
            .tempdir()?;

        let (width, height) = profile.fingerprint.viewport;
        let mut builder = BrowserConfig::builder()
            .chrome_executable(chrome)
            .user_data_dir(profile_dir.path())
            .window_size(width, height)
            .viewport(Some(Viewport {
                width,
                height,
                device_scale_factor: Some(1.0),
                ..Default::default()
            }))
            .request_timeout(command_timeout(&self.config))
            .args(stealth::launch_args(profile.stealth))
            .args(self.config.extra_args.iter().map(String::as_str));
        if !self.config.headless {
            builder = builder.with_head();
        }
        let config = builder.build().map_err(launch_err)?;

        info!("Launching browser (headless={})", self.config.headless);
        let (browser, handler) = Browser::launch(config).await.map_err(launch_err)?;
        let handler_task = spawn_handler(handler);
        let page = browser.new_page("about:blank").await.map_err(launch_err)?;

        Ok(Connected {
            browser,
            page,
            handler_task,
            context_id: None,
            profile_dir: Some(profile_dir),
        })
    }

    async fn attach_remote(&self, remote: &str) -> Result<Connected, ScrapeError> {
        let ws_url = discover_websocket_url(remote).await?;
        info!("Attaching to browser at {}", ws_url);

        let (browser, handler) = Browser::connect_with_config(ws_url, handler_config(&self.config))
            .await
            .map_err(launch_err)?;
        let handler_task = spawn_handler(handler);

        let context_id = browser
            .execute(CreateBrowserContextParams::default())
            .await
            .map_err(launch_err)?
            .result
            .browser_context_id;
        let target = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(context_id.clone())
            .build()
            .map_err(launch_err)?;
        let page = match browser.new_page(target).await {
            Ok(page) => page,
            Err(e) => {
                dispose_context(browser, context_id, Some(handler_task)).await;
                return Err(launch_err(e));
            }
        };

        Ok(Connected {
            browser,
            page,
            handler_task,
            context_id: Some(context_id),
            profile_dir: None,
        })
    }
}

struct Connected {
    browser: Browser,
    page: Page,
    handler_task: JoinHandle<()>,
    context_id: Option<BrowserContextId>,
    profile_dir: Option<TempDir>,
}

#[async_trait]
impl BrowserEngine for ChromiumEngine {
    fn name(&self) -> &'static str {
        "chromium"
    }

    async fn launch(
        &self,
        profile: &SessionProfile,
    ) -> Result<Box<dyn BrowserSession>, ScrapeError> {
        let connected = match &self.config.remote_url {
            Some(remote) => self.attach_remote(remote).await?,
            None => self.launch_local(profile).await?,
        };

        let download_dir = tempfile::Builder::new()
            .prefix("lighthead-downloads-")
            .tempdir()?;
        let (tx, rx) = mpsc::channel(4);
        let (network_tx, network) = watch::channel(NetworkActivity::default());

        let mut session = ChromiumSession {
            browser: Some(connected.browser),
            page: connected.page,
            handler_task: Some(connected.handler_task),
            download_task: None,
            network_task: None,
            downloads: Some(rx),
            network,
            context_id: connected.context_id,
            document_request: None,
            profile_dir: connected.profile_dir,
            download_dir,
        };

        // Any setup failure drops the session, which tears the browser down
        session.apply_profile(profile).await?;
        session.watch_network(network_tx).await?;
        session.watch_downloads(tx).await?;

        Ok(Box::new(session))
    }
}

/// How a session gives its browser back
#[derive(Debug, Clone, PartialEq, Eq)]
enum Teardown {
    /// Attached to a shared browser: only our context goes
    DisposeContext(BrowserContextId),
    /// Our own process: shut it down
    Shutdown,
}

impl Teardown {
    fn for_context(context_id: Option<BrowserContextId>) -> Self {
        match context_id {
            Some(id) => Teardown::DisposeContext(id),
            None => Teardown::Shutdown,
        }
    }
}

async fn dispose_context(
    browser: Browser,
    id: BrowserContextId,
    handler_task: Option<JoinHandle<()>>,
) {
    let dispose = browser.execute(DisposeBrowserContextParams::new(id.clone()));
    match tokio::time::timeout(DISPOSE_TIMEOUT, dispose).await {
        Ok(Ok(_)) => debug!("Disposed browser context {:?}", id),
        Ok(Err(e)) => warn!("Failed to dispose browser context: {}", e),
        Err(_) => warn!("Timed out disposing browser context {:?}", id),
    }
    if let Some(task) = handler_task {
        task.abort();
    }
}

struct ChromiumSession {
    /// `None` once torn down
    browser: Option<Browser>,
    page: Page,
    handler_task: Option<JoinHandle<()>>,
    download_task: Option<JoinHandle<()>>,
    network_task: Option<JoinHandle<()>>,
    downloads: Option<mpsc::Receiver<Download>>,
    /// Requests in flight, kept current by the network task
    network: watch::Receiver<NetworkActivity>,
    context_id: Option<BrowserContextId>,
    document_request: Option<RequestId>,
    profile_dir: Option<TempDir>,
    download_dir: TempDir,
}

impl Drop for ChromiumSession {
    fn drop(&mut self) {
        for task in [self.download_task.take(), self.network_task.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }

        let handler_task = self.handler_task.take();
        if let Some(browser) = self.browser.take() {
            match Teardown::for_context(self.context_id.take()) {
                // Dropped mid-scrape: the shared browser would keep the context
                Teardown::DisposeContext(id) => match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        runtime.spawn(dispose_context(browser, id, handler_task));
                        return;
                    }
                    Err(_) => warn!("No runtime left to dispose browser context {:?}", id),
                },
                // Dropping the browser kills the process
                Teardown::Shutdown => drop(browser),
            }
        }
        if let Some(task) = handler_task {
            task.abort();
        }
        if let Some(dir) = &self.profile_dir {
            debug!("Releasing browser profile {:?}", dir.path());
        }
    }
}

impl ChromiumSession {
    fn browser(&self) -> Result<&Browser, ScrapeError> {
        self.browser
            .as_ref()
            .ok_or_else(|| ScrapeError::Browser("browser connection already closed".to_string()))
    }

    async fn apply_profile(&mut self, profile: &SessionProfile) -> Result<(), ScrapeError> {
        let fp = &profile.fingerprint;

        self.page
            .execute(EnableParams::default())
            .await
            .map_err(launch_err)?;

        let mut user_agent =
            SetUserAgentOverrideParams::builder().user_agent(fp.user_agent.clone());
        if let Some(lang) = fp.accept_language() {
            user_agent = user_agent.accept_language(lang);
        }
        self.page
            .execute(user_agent.platform("Win32").build().map_err(launch_err)?)
            .await
            .map_err(launch_err)?;

        self.page
            .execute(SetTimezoneOverrideParams::new(fp.timezone.clone()))
            .await
            .map_err(launch_err)?;
        self.page
            .execute(SetLocaleOverrideParams {
                locale: Some(fp.locale.clone()),
            })
            .await
            .map_err(launch_err)?;
        self.page
            .execute(SetIgnoreCertificateErrorsParams::new(true))
            .await
            .map_err(launch_err)?;

        let headers: serde_json::Map<String, serde_json::Value> = fp
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        self.page
            .execute(SetExtraHttpHeadersParams::new(Headers::new(
                serde_json::Value::Object(headers),
            )))
            .await
            .map_err(launch_err)?;

        let mut permissions = GrantPermissionsParams::new(vec![PermissionType::Geolocation]);
        permissions.browser_context_id = self.context_id.clone();
        if let Err(e) = self.browser()?.execute(permissions).await {
            warn!("Could not grant geolocation permission: {}", e);
        }

        for script in &fp.init_scripts {
            self.page
                .execute(AddScriptToEvaluateOnNewDocumentParams::new(script.clone()))
                .await
                .map_err(launch_err)?;
        }

        Ok(())
    }

    async fn watch_network(
        &mut self,
        tx: watch::Sender<NetworkActivity>,
    ) -> Result<(), ScrapeError> {
        let started = self
            .page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .map_err(launch_err)?;
        let finished = self
            .page
            .event_listener::<EventLoadingFinished>()
            .await
            .map_err(launch_err)?;
        let failed = self
            .page
            .event_listener::<EventLoadingFailed>()
            .await
            .map_err(launch_err)?;

        self.network_task = Some(tokio::spawn(track_network(started, finished, failed, tx)));
        Ok(())
    }

    async fn watch_downloads(&mut self, tx: mpsc::Sender<Download>) -> Result<(), ScrapeError> {
        let mut behavior = SetDownloadBehaviorParams::builder()
            .behavior(SetDownloadBehaviorBehavior::AllowAndName)
            .download_path(self.download_dir.path().to_string_lossy().into_owned())
            .events_enabled(true);
        if let Some(id) = &self.context_id {
            behavior = behavior.browser_context_id(id.clone());
        }
        let browser = self.browser()?;
        browser
            .execute(behavior.build().map_err(launch_err)?)
            .await
            .map_err(launch_err)?;

        let begins = browser
            .event_listener::<EventDownloadWillBegin>()
            .await
            .map_err(launch_err)?;
        let progress = browser
            .event_listener::<EventDownloadProgress>()
            .await
            .map_err(launch_err)?;
        let main_frame = self.page.mainframe().await.map_err(launch_err)?;
        let dir = self.download_dir.path().to_path_buf();

        self.download_task = Some(tokio::spawn(collect_downloads(
            begins, progress, main_frame, dir, tx,
        )));
        Ok(())
    }
}

fn in_main_frame(frame_id: Option<&FrameId>, main_frame: Option<&FrameId>) -> bool {
    match main_frame {
        Some(main) => frame_id == Some(main),
        None => true,
    }
}

async fn collect_downloads(
    mut begins: EventStream<EventDownloadWillBegin>,
    mut progress: EventStream<EventDownloadProgress>,
    main_frame: Option<FrameId>,
    dir: PathBuf,
    tx: mpsc::Sender<Download>,
) {
    // guid -> (url, suggested filename)
    let mut pending: HashMap<String, (String, String)> = HashMap::new();

    loop {
        tokio::select! {
            Some(event) = begins.next() => {
                // Other sessions share the browser when attached remotely
                if !in_main_frame(Some(&event.frame_id), main_frame.as_ref()) {
                    continue;
                }
                debug!("Download started: {} ({})", event.url, event.suggested_filename);
                pending.insert(
                    event.guid.clone(),
                    (event.url.clone(), event.suggested_filename.clone()),
                );
            }
            Some(event) = progress.next() => {
                let finished = match event.state {
                    DownloadProgressState::Completed => pending.remove(&event.guid),
                    DownloadProgressState::Canceled => {
                        pending.remove(&event.guid);
                        None
                    }
                    _ => None,
                };
                if let Some((url, suggested)) = finished {
                    match tokio::fs::read(dir.join(&event.guid)).await {
                        Ok(bytes) => {
                            let download = Download {
                                url,
                                suggested_filename: Some(suggested).filter(|s| !s.is_empty()),
                                bytes: Bytes::from(bytes),
                            };
                            if tx.send(download).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Download finished but could not be read: {}", e),
                    }
                }
            }
            else => break,
        }
    }
}

/// Requests the page has started and not yet finished
#[derive(Debug, Default)]
struct NetworkActivity {
    in_flight: HashSet<String>,
}

impl NetworkActivity {
    /// Returns whether the set changed; redirects reuse the request id
    fn started(&mut self, request_id: &str) -> bool {
        self.in_flight.insert(request_id.to_string())
    }

    fn settled(&mut self, request_id: &str) -> bool {
        self.in_flight.remove(request_id)
    }

    fn is_idle(&self) -> bool {
        self.in_flight.is_empty()
    }

    fn is_loading(&self, request_id: &str) -> bool {
        self.in_flight.contains(request_id)
    }
}

async fn track_network(
    mut started: EventStream<EventRequestWillBeSent>,
    mut finished: EventStream<EventLoadingFinished>,
    mut failed: EventStream<EventLoadingFailed>,
    tx: watch::Sender<NetworkActivity>,
) {
    loop {
        tokio::select! {
            Some(event) = started.next() => {
                tx.send_if_modified(|net| net.started(event.request_id.inner()));
            }
            Some(event) = finished.next() => {
                tx.send_if_modified(|net| net.settled(event.request_id.inner()));
            }
            Some(event) = failed.next() => {
                tx.send_if_modified(|net| net.settled(event.request_id.inner()));
            }
            else => break,
        }
    }
}

/// Resolves once no request has been in flight for `quiet`
async fn network_quiet(
    mut network: watch::Receiver<NetworkActivity>,
    quiet: Duration,
) -> Result<(), ScrapeError> {
    loop {
        let idle = network.borrow_and_update().is_idle();
        if idle {
            match tokio::time::timeout(quiet, network.changed()).await {
                Err(_) => return Ok(()),
                Ok(changed) => changed.map_err(browser_err)?,
            }
        } else {
            network.changed().await.map_err(browser_err)?;
        }
    }
}

/// Resolves once the request has finished or failed
async fn request_settled(
    mut network: watch::Receiver<NetworkActivity>,
    request_id: &str,
) -> Result<(), ScrapeError> {
    network
        .wait_for(|net| !net.is_loading(request_id))
        .await
        .map_err(browser_err)?;
    Ok(())
}

/// Navigation events, already narrowed to the main frame's document
#[derive(Debug, Clone)]
enum NavEvent {
    /// Document request, carrying the redirect response it follows
    Request {
        request_id: String,
        redirect: Option<HopResponse>,
    },
    /// Document response headers
    Response {
        request_id: String,
        url: String,
        response: ResponseMetadata,
    },
    LoadingFailed {
        request_id: String,
        error_text: String,
        canceled: bool,
    },
    /// The main frame committed a new document
    FrameNavigated,
    DownloadBegin { url: String },
    /// Reply to the navigate command
    Reply { error_text: Option<String> },
    ReplyFailed(String),
}

/// How the event stream decided a navigation
#[derive(Debug, Clone, PartialEq, Eq)]
enum Settled {
    Committed {
        request_id: String,
        final_url: String,
        response: ResponseMetadata,
    },
    Aborted(String),
    Failed(String),
    NoResponse,
}

fn failure(error_text: String, canceled: bool) -> Settled {
    if canceled || error_text.contains("ERR_ABORTED") {
        Settled::Aborted(error_text)
    } else {
        Settled::Failed(error_text)
    }
}

/// Folds navigation events into an outcome
///
/// Events come from separate listeners, so their relative order is not
/// guaranteed: a failure may arrive before its request, and the frame
/// commit before the response that caused it.
#[derive(Debug, Default)]
struct NavigationTracker {
    document: Option<String>,
    redirects: Vec<HopResponse>,
    response: Option<(String, String, ResponseMetadata)>,
    navigated: bool,
    early_failures: HashMap<String, (String, bool)>,
}

impl NavigationTracker {
    fn observe(&mut self, event: NavEvent) -> Option<Settled> {
        match event {
            NavEvent::Request {
                request_id,
                redirect,
            } => {
                self.redirects.extend(redirect);
                let failed = self.early_failures.remove(&request_id);
                self.document = Some(request_id);
                failed.map(|(error_text, canceled)| failure(error_text, canceled))
            }
            NavEvent::Response {
                request_id,
                url,
                response,
            } => {
                self.response = Some((request_id, url, response));
                self.commit()
            }
            NavEvent::LoadingFailed {
                request_id,
                error_text,
                canceled,
            } => {
                if self.document.as_deref() == Some(request_id.as_str()) {
                    Some(failure(error_text, canceled))
                } else {
                    self.early_failures
                        .insert(request_id, (error_text, canceled));
                    None
                }
            }
            NavEvent::FrameNavigated => {
                self.navigated = true;
                self.commit()
            }
            NavEvent::DownloadBegin { url } => {
                Some(Settled::Aborted(format!("download started for {}", url)))
            }
            NavEvent::Reply {
                error_text: Some(error_text),
            } => Some(failure(error_text, false)),
            // The page loaded; its response may still be queued
            NavEvent::Reply { error_text: None } => {
                self.navigated = true;
                self.commit()
            }
            NavEvent::ReplyFailed(reason) => Some(Settled::Failed(reason)),
        }
    }

    fn commit(&mut self) -> Option<Settled> {
        if !self.navigated {
            return None;
        }
        self.response
            .take()
            .map(|(request_id, final_url, response)| Settled::Committed {
                request_id,
                final_url,
                response,
            })
    }
}

/// Consume events until the navigation commits, aborts or fails
async fn settle_navigation<S>(mut events: S) -> (Vec<HopResponse>, Settled)
where
    S: Stream<Item = NavEvent> + Unpin,
{
    let mut tracker = NavigationTracker::default();
    let mut settled = Settled::NoResponse;
    while let Some(event) = events.next().await {
        if let Some(outcome) = tracker.observe(event) {
            settled = outcome;
            break;
        }
    }

    // Redirect hops still queued on the request listener
    while let Some(Some(event)) = events.next().now_or_never() {
        if let NavEvent::Request {
            redirect: Some(hop),
            ..
        } = event
        {
            tracker.redirects.push(hop);
        }
    }

    (tracker.redirects, settled)
}

fn document_request(
    event: &EventRequestWillBeSent,
    main_frame: Option<&FrameId>,
) -> Option<NavEvent> {
    let is_document = matches!(event.r#type, Some(ResourceType::Document));
    if !is_document || !in_main_frame(event.frame_id.as_ref(), main_frame) {
        return None;
    }
    Some(NavEvent::Request {
        request_id: event.request_id.inner().clone(),
        redirect: event.redirect_response.as_ref().map(|resp| HopResponse {
            url: resp.url.clone(),
            response: to_metadata(resp),
        }),
    })
}

fn document_response(
    event: &EventResponseReceived,
    main_frame: Option<&FrameId>,
) -> Option<NavEvent> {
    let is_document = matches!(event.r#type, ResourceType::Document);
    if !is_document || !in_main_frame(event.frame_id.as_ref(), main_frame) {
        return None;
    }
    Some(NavEvent::Response {
        request_id: event.request_id.inner().clone(),
        url: event.response.url.clone(),
        response: to_metadata(&event.response),
    })
}

fn document_failure(event: &EventLoadingFailed) -> Option<NavEvent> {
    matches!(event.r#type, ResourceType::Document).then(|| NavEvent::LoadingFailed {
        request_id: event.request_id.inner().clone(),
        error_text: event.error_text.clone(),
        canceled: event.canceled.unwrap_or(false),
    })
}

fn to_metadata(response: &Response) -> ResponseMetadata {
    let headers: Vec<(String, String)> = response
        .headers
        .inner()
        .as_object()
        .map(|map| {
            map.iter()
                .map(|(k, v)| {
                    let value = v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string());
                    (k.clone(), value)
                })
                .collect()
        })
        .unwrap_or_default();

    ResponseMetadata::new(
        u16::try_from(response.status).unwrap_or(0),
        response.status_text.clone(),
        headers,
    )
}

fn to_cookie_param(cookie: &StoredCookie) -> Result<CookieParam, String> {
    let mut builder = CookieParam::builder()
        .name(cookie.name.clone())
        .value(cookie.value.clone())
        .domain(cookie.domain.clone())
        .path(cookie.path.clone())
        .secure(cookie.secure)
        .http_only(cookie.http_only);
    if !cookie.is_session() {
        builder = builder.expires(TimeSinceEpoch::new(cookie.expires));
    }
    match cookie.same_site.as_deref() {
        Some("Strict") => builder = builder.same_site(CookieSameSite::Strict),
        Some("Lax") => builder = builder.same_site(CookieSameSite::Lax),
        Some("None") => builder = builder.same_site(CookieSameSite::None),
        _ => {}
    }
    builder.build()
}

fn from_cookie(cookie: &Cookie) -> StoredCookie {
    let same_site = cookie.same_site.as_ref().map(|s| {
        match s {
            CookieSameSite::Strict => "Strict",
            CookieSameSite::Lax => "Lax",
            CookieSameSite::None => "None",
        }
        .to_string()
    });

    StoredCookie {
        name: cookie.name.clone(),
        value: cookie.value.clone(),
        domain: cookie.domain.clone(),
        path: cookie.path.clone(),
        expires: if cookie.session { -1.0 } else { cookie.expires },
        http_only: cookie.http_only,
        secure: cookie.secure,
        same_site,
    }
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    fn take_downloads(&mut self) -> Option<mpsc::Receiver<Download>> {
        self.downloads.take()
    }

    async fn set_cookies(&mut self, cookies: &[StoredCookie]) -> Result<(), ScrapeError> {
        let params: Vec<CookieParam> = cookies
            .iter()
            .filter(|c| !c.name.is_empty() && !c.domain.is_empty())
            .filter_map(|c| match to_cookie_param(c) {
                Ok(param) => Some(param),
                Err(e) => {
                    warn!("Skipping cookie {}: {}", c.name, e);
                    None
                }
            })
            .collect();

        if params.is_empty() {
            return Ok(());
        }
        self.page.set_cookies(params).await.map_err(browser_err)?;
        Ok(())
    }

    async fn navigate(&mut self, url: &Url) -> Result<Navigation, ScrapeError> {
        let main_frame = self.page.mainframe().await.map_err(browser_err)?;
        let requests = self
            .page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .map_err(browser_err)?;
        let responses = self
            .page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(browser_err)?;
        let failures = self
            .page
            .event_listener::<EventLoadingFailed>()
            .await
            .map_err(browser_err)?;
        let commits = self
            .page
            .event_listener::<EventFrameNavigated>()
            .await
            .map_err(browser_err)?;
        let downloads = self
            .browser()?
            .event_listener::<EventDownloadWillBegin>()
            .await
            .map_err(browser_err)?;

        // The navigate reply waits for `load`, which never comes for a
        // download, so the outcome is taken from whichever event lands first
        let (redirects, settled) = {
            let frame = main_frame.clone();
            let requests = requests
                .filter_map(move |e| future::ready(document_request(&e, frame.as_ref())));
            let frame = main_frame.clone();
            let responses = responses
                .filter_map(move |e| future::ready(document_response(&e, frame.as_ref())));
            let failures = failures.filter_map(|e| future::ready(document_failure(&e)));
            let commits = commits.filter_map(|e| {
                future::ready(e.frame.parent_id.is_none().then_some(NavEvent::FrameNavigated))
            });
            let frame = main_frame.clone();
            let downloads = downloads.filter_map(move |e| {
                future::ready(
                    in_main_frame(Some(&e.frame_id), frame.as_ref())
                        .then(|| NavEvent::DownloadBegin { url: e.url.clone() }),
                )
            });
            let navigate = self.page.execute(NavigateParams::new(url.as_str()));
            let reply = futures::stream::once(navigate).map(|reply| match reply {
                Ok(reply) => NavEvent::Reply {
                    error_text: reply.result.error_text.clone(),
                },
                Err(e) => NavEvent::ReplyFailed(e.to_string()),
            });

            let events = futures::stream::select_all([
                requests.boxed(),
                responses.boxed(),
                failures.boxed(),
                commits.boxed(),
                downloads.boxed(),
                reply.boxed(),
            ]);
            settle_navigation(events).await
        };

        let outcome = match settled {
            Settled::Committed {
                request_id,
                final_url,
                response,
            } => {
                self.document_request = Some(RequestId::new(request_id));
                NavigationOutcome::Committed {
                    final_url,
                    response,
                }
            }
            Settled::Aborted(reason) => NavigationOutcome::Aborted { reason },
            Settled::Failed(reason) => {
                return Err(NavigationError::Failed {
                    url: url.to_string(),
                    reason,
                }
                .into())
            }
            Settled::NoResponse => {
                return Err(NavigationError::NoResponse {
                    url: url.to_string(),
                }
                .into())
            }
        };

        Ok(Navigation { redirects, outcome })
    }

    async fn wait_for_network_idle(&mut self) -> Result<(), ScrapeError> {
        network_quiet(self.network.clone(), NETWORK_QUIET).await
    }

    async fn simulate_interaction(&mut self, interaction: Interaction) -> Result<(), ScrapeError> {
        let mouse = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseMoved)
            .x(interaction.pointer_x)
            .y(interaction.pointer_y)
            .build()
            .map_err(browser_err)?;
        self.page.execute(mouse).await.map_err(browser_err)?;
        self.page
            .evaluate(format!("window.scrollTo(0, {})", interaction.scroll_y))
            .await
            .map_err(browser_err)?;
        Ok(())
    }

    async fn page_content(&mut self) -> Result<PageContent, ScrapeError> {
        let markup = self.page.content().await.map_err(browser_err)?;
        let text: String = self
            .page
            .evaluate("document.body ? document.body.textContent : ''")
            .await
            .map_err(browser_err)?
            .into_value()
            .unwrap_or_default();
        Ok(PageContent { markup, text })
    }

    async fn document_body(&mut self) -> Result<Option<Bytes>, ScrapeError> {
        let Some(request_id) = self.document_request.clone() else {
            return Ok(None);
        };
        // Navigation returns at commit; the body is readable once loaded
        request_settled(self.network.clone(), request_id.inner()).await?;

        let body = self
            .page
            .execute(GetResponseBodyParams::new(request_id))
            .await
            .map_err(browser_err)?;

        let bytes = if body.result.base64_encoded {
            base64::engine::general_purpose::STANDARD
                .decode(body.result.body.as_bytes())
                .map_err(browser_err)?
        } else {
            body.result.body.clone().into_bytes()
        };
        Ok(Some(Bytes::from(bytes)))
    }

    async fn cookies(&mut self) -> Result<Vec<StoredCookie>, ScrapeError> {
        let cookies = self.page.get_cookies().await.map_err(browser_err)?;
        Ok(cookies.iter().map(from_cookie).collect())
    }

    async fn close(self: Box<Self>) {
        let mut this = self;
        let Some(browser) = this.browser.take() else {
            return;
        };
        match Teardown::for_context(this.context_id.take()) {
            Teardown::DisposeContext(id) => {
                dispose_context(browser, id, this.handler_task.take()).await;
            }
            Teardown::Shutdown => {
                let mut browser = browser;
                if let Err(e) = browser.close().await {
                    warn!("Failed to close browser: {}", e);
                }
                if let Err(e) = browser.wait().await {
                    warn!("Failed waiting for browser exit: {}", e);
                }
            }
        }
        debug!("Browser session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_discover_websocket_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/json/version"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Browser": "Chrome/120.0.0.0",
                "webSocketDebuggerUrl": "ws://127.0.0.1:9222/devtools/browser/abc"
            })))
            .mount(&server)
            .await;

        let ws = discover_websocket_url(&format!("{}/", server.uri()))
            .await
            .unwrap();
        assert_eq!(ws, "ws://127.0.0.1:9222/devtools/browser/abc");
    }

    #[tokio::test]
    async fn test_discover_missing_field() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/json/version"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let err = discover_websocket_url(&server.uri()).await.unwrap_err();
        assert!(matches!(err, ScrapeError::Launch(_)));
    }

    #[tokio::test]
    async fn test_discover_passes_websocket_through() {
        let ws = discover_websocket_url("ws://host:9222/devtools/browser/x")
            .await
            .unwrap();
        assert_eq!(ws, "ws://host:9222/devtools/browser/x");
    }

    #[test]
    fn test_cookie_param_conversion() {
        let mut cookie = StoredCookie::new("sid", "v", "example.com");
        cookie.same_site = Some("Lax".to_string());
        cookie.expires = 1_900_000_000.0;
        let param = to_cookie_param(&cookie).unwrap();
        assert_eq!(param.name, "sid");
        assert_eq!(param.domain.as_deref(), Some("example.com"));
        assert!(param.expires.is_some());
    }

    fn ok(status: u16) -> ResponseMetadata {
        ResponseMetadata::new(status, "", [("content-type", "text/html")])
    }

    fn request(id: &str) -> NavEvent {
        NavEvent::Request {
            request_id: id.to_string(),
            redirect: None,
        }
    }

    fn redirected(id: &str, from: &str) -> NavEvent {
        NavEvent::Request {
            request_id: id.to_string(),
            redirect: Some(HopResponse {
                url: from.to_string(),
                response: ResponseMetadata::new(301, "Moved Permanently", [("location", "/next")]),
            }),
        }
    }

    fn response(id: &str, url: &str) -> NavEvent {
        NavEvent::Response {
            request_id: id.to_string(),
            url: url.to_string(),
            response: ok(200),
        }
    }

    fn failed(id: &str, error_text: &str, canceled: bool) -> NavEvent {
        NavEvent::LoadingFailed {
            request_id: id.to_string(),
            error_text: error_text.to_string(),
            canceled,
        }
    }

    async fn settle(events: Vec<NavEvent>) -> (Vec<HopResponse>, Settled) {
        settle_navigation(futures::stream::iter(events)).await
    }

    #[tokio::test]
    async fn test_navigation_commits_on_frame_navigated() {
        let (redirects, settled) = settle(vec![
            request("1"),
            response("1", "https://example.com/"),
            NavEvent::FrameNavigated,
        ])
        .await;

        assert!(redirects.is_empty());
        assert_eq!(
            settled,
            Settled::Committed {
                request_id: "1".to_string(),
                final_url: "https://example.com/".to_string(),
                response: ok(200),
            }
        );
    }

    #[tokio::test]
    async fn test_navigation_commit_before_response() {
        let (_, settled) = settle(vec![
            NavEvent::FrameNavigated,
            request("1"),
            response("1", "https://example.com/"),
        ])
        .await;
        assert!(matches!(settled, Settled::Committed { .. }));
    }

    #[tokio::test]
    async fn test_navigation_collects_redirects() {
        let (redirects, settled) = settle(vec![
            request("1"),
            redirected("1", "http://example.com/"),
            response("1", "https://example.com/"),
            NavEvent::FrameNavigated,
            // Queued on the request listener behind the commit
            redirected("1", "https://example.com/old"),
        ])
        .await;

        let urls: Vec<&str> = redirects.iter().map(|hop| hop.url.as_str()).collect();
        assert_eq!(urls, ["http://example.com/", "https://example.com/old"]);
        assert!(matches!(settled, Settled::Committed { .. }));
    }

    #[tokio::test]
    async fn test_download_aborts_despite_response() {
        // A forced download gets response headers but never commits a document
        let (_, settled) = settle(vec![
            request("7"),
            response("7", "https://example.com/report"),
            failed("7", "net::ERR_ABORTED", true),
            NavEvent::FrameNavigated,
        ])
        .await;
        assert_eq!(settled, Settled::Aborted("net::ERR_ABORTED".to_string()));
    }

    #[tokio::test]
    async fn test_download_begin_aborts() {
        let (_, settled) = settle(vec![
            request("7"),
            NavEvent::DownloadBegin {
                url: "https://example.com/file.zip".to_string(),
            },
        ])
        .await;
        assert!(matches!(settled, Settled::Aborted(reason) if reason.contains("file.zip")));
    }

    #[tokio::test]
    async fn test_canceled_document_counts_as_abort() {
        let (_, settled) = settle(vec![request("2"), failed("2", "", true)]).await;
        assert_eq!(settled, Settled::Aborted(String::new()));
    }

    #[tokio::test]
    async fn test_failure_before_its_request() {
        let (_, settled) = settle(vec![
            failed("3", "net::ERR_NAME_NOT_RESOLVED", false),
            request("3"),
        ])
        .await;
        assert_eq!(
            settled,
            Settled::Failed("net::ERR_NAME_NOT_RESOLVED".to_string())
        );
    }

    #[tokio::test]
    async fn test_unrelated_failure_ignored() {
        let (_, settled) = settle(vec![
            request("1"),
            failed("9", "net::ERR_ABORTED", true),
            response("1", "https://example.com/"),
            NavEvent::FrameNavigated,
        ])
        .await;
        assert!(matches!(settled, Settled::Committed { request_id, .. } if request_id == "1"));
    }

    #[tokio::test]
    async fn test_navigate_reply_outcomes() {
        let (_, settled) = settle(vec![NavEvent::Reply {
            error_text: Some("net::ERR_ABORTED".to_string()),
        }])
        .await;
        assert_eq!(settled, Settled::Aborted("net::ERR_ABORTED".to_string()));

        let (_, settled) = settle(vec![NavEvent::Reply {
            error_text: Some("net::ERR_CONNECTION_REFUSED".to_string()),
        }])
        .await;
        assert_eq!(
            settled,
            Settled::Failed("net::ERR_CONNECTION_REFUSED".to_string())
        );

        let (_, settled) = settle(vec![
            NavEvent::Reply { error_text: None },
            response("1", "https://example.com/"),
        ])
        .await;
        assert!(matches!(settled, Settled::Committed { .. }));

        let (_, settled) =
            settle(vec![NavEvent::ReplyFailed("Request timed out.".to_string())]).await;
        assert_eq!(settled, Settled::Failed("Request timed out.".to_string()));
    }

    #[tokio::test]
    async fn test_navigation_without_events() {
        let (_, settled) = settle(vec![request("1"), NavEvent::FrameNavigated]).await;
        assert_eq!(settled, Settled::NoResponse);
    }

    #[test]
    fn test_main_frame_filter() {
        let main = FrameId::new("main");
        let child = FrameId::new("child");
        assert!(in_main_frame(Some(&main), Some(&main)));
        assert!(!in_main_frame(Some(&child), Some(&main)));
        assert!(!in_main_frame(None, Some(&main)));
        assert!(in_main_frame(Some(&child), None));
    }

    #[test]
    fn test_command_timeout_covers_navigation_budget() {
        let config = EngineConfig {
            navigation_timeout_ms: 120_000,
            ..Default::default()
        };
        let handler = handler_config(&config);
        assert!(handler.request_timeout > config.navigation_timeout());
        assert_eq!(handler.request_timeout, command_timeout(&config));
        assert!(handler.ignore_https_errors);
    }

    #[test]
    fn test_teardown_by_context() {
        let id = BrowserContextId::new("ctx-1");
        assert_eq!(
            Teardown::for_context(Some(id.clone())),
            Teardown::DisposeContext(id)
        );
        assert_eq!(Teardown::for_context(None), Teardown::Shutdown);
    }

    fn busy(ids: &[&str]) -> NetworkActivity {
        let mut net = NetworkActivity::default();
        for id in ids {
            net.started(id);
        }
        net
    }

    #[test]
    fn test_network_activity_counts_requests() {
        let mut net = NetworkActivity::default();
        assert!(net.is_idle());
        assert!(net.started("1"));
        assert!(net.started("2"));
        // Redirect continues the same request
        assert!(!net.started("1"));
        assert!(net.is_loading("1"));

        assert!(net.settled("1"));
        assert!(!net.settled("unknown"));
        assert!(!net.is_loading("1"));
        assert!(!net.is_idle());
        assert!(net.settled("2"));
        assert!(net.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_quiet_when_empty() {
        let (_tx, rx) = watch::channel(NetworkActivity::default());
        let start = tokio::time::Instant::now();
        network_quiet(rx, NETWORK_QUIET).await.unwrap();
        assert!(start.elapsed() >= NETWORK_QUIET);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_quiet_waits_for_requests() {
        let (tx, rx) = watch::channel(busy(&["a", "b", "c"]));
        let start = tokio::time::Instant::now();
        let feeder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            tx.send_replace(NetworkActivity::default());
            // A late request restarts the quiet window
            tokio::time::sleep(Duration::from_millis(200)).await;
            tx.send_modify(|net| {
                net.started("d");
            });
            tokio::time::sleep(Duration::from_secs(1)).await;
            tx.send_modify(|net| {
                net.settled("d");
            });
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        network_quiet(rx, NETWORK_QUIET).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(2700));
        feeder.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_never_quiet_while_busy() {
        let (_tx, rx) = watch::channel(busy(&["poll"]));
        let waited = tokio::time::timeout(
            Duration::from_secs(30),
            network_quiet(rx, NETWORK_QUIET),
        )
        .await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_network_quiet_errors_when_tracker_stops() {
        let (tx, rx) = watch::channel(busy(&["1"]));
        drop(tx);
        let err = network_quiet(rx, NETWORK_QUIET).await.unwrap_err();
        assert!(matches!(err, ScrapeError::Browser(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_document_body_waits_for_load() {
        let (tx, rx) = watch::channel(busy(&["doc", "img"]));
        let start = tokio::time::Instant::now();
        let feeder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            tx.send_modify(|net| {
                net.settled("doc");
            });
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        request_settled(rx.clone(), "doc").await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(2));
        // Other requests do not hold it up
        request_settled(rx, "doc").await.unwrap();
        feeder.abort();
    }
}
