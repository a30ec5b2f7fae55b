//! # Cookies
//!
//! Credentials handed to the fetch tool when a video needs a signed-in
//! session. A cookies.txt file is tried first, then the cookie stores of
//! installed browsers in priority order.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::info;

/// One way of passing a signed-in session to the fetch tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cookies {
    /// Netscape cookies.txt, passed as `--cookies`
    File(PathBuf),
    /// Browser name understood by `--cookies-from-browser`
    Browser(String),
}

impl fmt::Display for Cookies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cookies::File(path) => write!(f, "cookies file {}", path.display()),
            Cookies::Browser(name) => write!(f, "{name} cookies"),
        }
    }
}

/// Where the cookies file comes from. Asked again on every retry so an
/// operator can fix a broken file without a restart.
#[async_trait]
pub trait CookiesSource: Send + Sync {
    async fn cookies_file(&self) -> Option<PathBuf>;
}

/// A cookies file fixed at construction time
#[derive(Debug, Clone, Default)]
pub struct StaticCookies(pub Option<PathBuf>);

#[async_trait]
impl CookiesSource for StaticCookies {
    async fn cookies_file(&self) -> Option<PathBuf> {
        self.0.clone()
    }
}

/// Chromium cookie stores that cannot be read (DPAPI on Windows, locked database).
/// Worth moving on to the next browser.
pub fn is_browser_cookie_error(message: &str) -> bool {
    message.contains("DPAPI")
        || message.contains("failed to decrypt")
        || message.contains("Could not copy Chrome cookie database")
        || message.contains("could not copy")
        || message.contains("cookie database")
}

/// Browsers found on this machine, most reliable cookie store first.
pub fn detect_browsers() -> Vec<String> {
    let mut found = detect_installed();
    found.sort_by_key(|name| {
        BROWSER_PRIORITY
            .iter()
            .position(|b| b == name)
            .unwrap_or(usize::MAX)
    });
    info!(browsers = ?found, "Detected installed browsers");
    found.into_iter().map(str::to_owned).collect()
}

// Chrome and Edge cookies are DPAPI-encrypted on Windows and usually unreadable
#[cfg(windows)]
const BROWSER_PRIORITY: &[&str] = &["firefox", "whale", "chrome", "edge", "vivaldi", "opera", "brave"];

#[cfg(not(windows))]
const BROWSER_PRIORITY: &[&str] = &[
    "chrome", "edge", "firefox", "vivaldi", "opera", "brave", "chromium", "whale", "safari",
];

#[cfg(windows)]
fn detect_installed() -> Vec<&'static str> {
    use std::path::Path;

    // (browser, system-wide executables, executable under %LOCALAPPDATA%)
    const INSTALLS: &[(&str, &[&str], Option<&str>)] = &[
        (
            "chrome",
            &[
                r"C:\Program Files\Google\Chrome\Application\chrome.exe",
                r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
            ],
            Some(r"Google\Chrome\Application\chrome.exe"),
        ),
        (
            "edge",
            &[
                r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
                r"C:\Program Files\Microsoft\Edge\Application\msedge.exe",
            ],
            None,
        ),
        (
            "firefox",
            &[
                r"C:\Program Files\Mozilla Firefox\firefox.exe",
                r"C:\Program Files (x86)\Mozilla Firefox\firefox.exe",
            ],
            None,
        ),
        (
            "vivaldi",
            &[r"C:\Program Files\Vivaldi\Application\vivaldi.exe"],
            Some(r"Vivaldi\Application\vivaldi.exe"),
        ),
        (
            "opera",
            &[
                r"C:\Program Files\Opera\launcher.exe",
                r"C:\Program Files (x86)\Opera\launcher.exe",
            ],
            Some(r"Programs\Opera\launcher.exe"),
        ),
        (
            "brave",
            &[
                r"C:\Program Files\BraveSoftware\Brave-Browser\Application\brave.exe",
                r"C:\Program Files (x86)\BraveSoftware\Brave-Browser\Application\brave.exe",
            ],
            Some(r"BraveSoftware\Brave-Browser\Application\brave.exe"),
        ),
        (
            "whale",
            &[
                r"C:\Program Files\Naver\Naver Whale\Application\whale.exe",
                r"C:\Program Files (x86)\Naver\Naver Whale\Application\whale.exe",
            ],
            Some(r"Naver\Naver Whale\Application\whale.exe"),
        ),
    ];

    let local_app_data = std::env::var_os("LOCALAPPDATA").map(PathBuf::from);
    INSTALLS
        .iter()
        .filter(|(_, system, user)| {
            system.iter().any(|p| Path::new(p).exists())
                || user
                    .zip(local_app_data.as_ref())
                    .is_some_and(|(suffix, base)| base.join(suffix).exists())
        })
        .map(|(name, _, _)| *name)
        .collect()
}

#[cfg(target_os = "macos")]
fn detect_installed() -> Vec<&'static str> {
    const BUNDLES: &[(&str, &str)] = &[
        ("chrome", "Google Chrome.app"),
        ("edge", "Microsoft Edge.app"),
        ("firefox", "Firefox.app"),
        ("vivaldi", "Vivaldi.app"),
        ("opera", "Opera.app"),
        ("brave", "Brave Browser.app"),
        ("whale", "Whale.app"),
        ("safari", "Safari.app"),
    ];

    let mut roots = vec![PathBuf::from("/Applications")];
    if let Some(home) = std::env::var_os("HOME") {
        roots.push(PathBuf::from(home).join("Applications"));
    }
    BUNDLES
        .iter()
        .filter(|(_, bundle)| roots.iter().any(|root| root.join(bundle).exists()))
        .map(|(name, _)| *name)
        .collect()
}

#[cfg(all(unix, not(target_os = "macos")))]
fn detect_installed() -> Vec<&'static str> {
    browsers_on_path(&std::env::var_os("PATH").unwrap_or_default())
}

#[cfg(not(any(unix, windows)))]
fn detect_installed() -> Vec<&'static str> {
    Vec::new()
}

/// Browsers with an executable in one of the `PATH` directories
#[cfg(all(unix, not(target_os = "macos")))]
fn browsers_on_path(path_var: &std::ffi::OsStr) -> Vec<&'static str> {
    const COMMANDS: &[(&str, &[&str])] = &[
        ("chrome", &["google-chrome", "google-chrome-stable", "chrome"]),
        ("chromium", &["chromium", "chromium-browser"]),
        ("edge", &["microsoft-edge", "microsoft-edge-stable"]),
        ("firefox", &["firefox"]),
        ("vivaldi", &["vivaldi", "vivaldi-stable"]),
        ("opera", &["opera"]),
        ("brave", &["brave", "brave-browser"]),
    ];

    let dirs: Vec<PathBuf> = std::env::split_paths(path_var).collect();
    COMMANDS
        .iter()
        .filter(|(_, commands)| {
            commands
                .iter()
                .any(|cmd| dirs.iter().any(|dir| dir.join(cmd).is_file()))
        })
        .map(|(name, _)| *name)
        .collect()
}
