//! Browser fingerprint and anti-automation countermeasures

/// Desktop Chrome on Windows
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Viewport and screen size
pub const VIEWPORT: (u32, u32) = (1920, 1080);

pub const LOCALE: &str = "en-US";

pub const TIMEZONE: &str = "America/New_York";

/// Headers sent with every request
pub const BASE_HEADERS: &[(&str, &str)] = &[
    (
        "Accept",
        "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7",
    ),
    ("Accept-Language", "en-US,en;q=0.9"),
    ("Accept-Encoding", "gzip, deflate, br"),
    ("Sec-Fetch-Dest", "document"),
    ("Sec-Fetch-Mode", "navigate"),
    ("Sec-Fetch-Site", "none"),
    ("Sec-Fetch-User", "?1"),
    ("Cache-Control", "max-age=0"),
    ("Upgrade-Insecure-Requests", "1"),
];

/// Client hints matching [`USER_AGENT`], sent only in stealth mode
pub const CLIENT_HINT_HEADERS: &[(&str, &str)] = &[
    (
        "sec-ch-ua",
        r#""Not_A Brand";v="8", "Chromium";v="120", "Google Chrome";v="120""#,
    ),
    ("sec-ch-ua-mobile", "?0"),
    ("sec-ch-ua-platform", r#""Windows""#),
];

/// Switches for every launched browser
pub const BASE_ARGS: &[&str] = &[
    "--no-sandbox",
    "--disable-setuid-sandbox",
    "--disable-dev-shm-usage",
    "--disable-blink-features=AutomationControlled",
    "--disable-features=VizDisplayCompositor",
    "--window-size=1920,1080",
    "--start-maximized",
];

/// Extra switches in stealth mode
pub const STEALTH_ARGS: &[&str] = &[
    "--disable-web-security",
    "--disable-features=TranslateUI",
    "--disable-ipc-flooding-protection",
    "--no-first-run",
    "--no-default-browser-check",
    "--disable-default-apps",
    "--disable-popup-blocking",
    "--disable-prompt-on-repost",
    "--disable-hang-monitor",
    "--disable-backgrounding-occluded-windows",
    "--disable-renderer-backgrounding",
    "--disable-background-networking",
    "--disable-background-timer-throttling",
    "--force-fieldtrials=*BackgroundTracing/default/",
];

/// Scripts evaluated before any page script in stealth mode
pub const STEALTH_SCRIPTS: &[&str] = &[
    // Automation flag
    r#"
    Object.defineProperty(navigator, 'webdriver', {
        get: () => undefined,
        configurable: true
    });
    try { delete Object.getPrototypeOf(navigator).webdriver; } catch (e) {}
    "#,
    r#"
    window.chrome = window.chrome || {};
    window.chrome.runtime = window.chrome.runtime || {};
    "#,
    r#"
    Object.defineProperty(navigator, 'languages', {
        get: () => ['en-US', 'en'],
        configurable: true
    });
    "#,
    r#"
    Object.defineProperty(navigator, 'plugins', {
        get: () => [
            { name: 'Chrome PDF Plugin', filename: 'internal-pdf-viewer', description: 'Portable Document Format' },
            { name: 'Chrome PDF Viewer', filename: 'mhjfbmdgcfjbbpaeojofohoefgiehjai', description: '' },
            { name: 'Native Client', filename: 'internal-nacl-plugin', description: '' }
        ],
        configurable: true
    });
    "#,
    // Notification permission must agree with Notification.permission
    r#"
    const originalQuery = window.navigator.permissions.query;
    window.navigator.permissions.query = (parameters) => (
        parameters.name === 'notifications' ?
        Promise.resolve({ state: Notification.permission }) :
        originalQuery(parameters)
    );
    "#,
];

/// Fixed identity presented by every session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub user_agent: String,
    pub viewport: (u32, u32),
    pub locale: String,
    pub timezone: String,
    /// Extra request headers, in send order
    pub headers: Vec<(String, String)>,
    /// Scripts to run before page scripts
    pub init_scripts: Vec<String>,
}

impl Fingerprint {
    /// Desktop fingerprint, with the stealth bundle when `stealth` is set
    pub fn desktop(stealth: bool) -> Self {
        let mut headers: Vec<(String, String)> = BASE_HEADERS
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut init_scripts = Vec::new();

        if stealth {
            headers.extend(
                CLIENT_HINT_HEADERS
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string())),
            );
            init_scripts.extend(STEALTH_SCRIPTS.iter().map(|s| s.to_string()));
        }

        Self {
            user_agent: USER_AGENT.to_string(),
            viewport: VIEWPORT,
            locale: LOCALE.to_string(),
            timezone: TIMEZONE.to_string(),
            headers,
            init_scripts,
        }
    }

    /// `Accept-Language` value, used to override the browser's own
    pub fn accept_language(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("accept-language"))
            .map(|(_, v)| v.as_str())
    }
}

/// Command-line switches for a launched browser
pub fn launch_args(stealth: bool) -> Vec<&'static str> {
    let mut args = BASE_ARGS.to_vec();
    if stealth {
        args.extend_from_slice(STEALTH_ARGS);
    }
    args
}
