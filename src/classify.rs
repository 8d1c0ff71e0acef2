use log::info;
use regex::RegexSet;

/// Request metadata the classifier decides on, detached from any HTTP
/// framework type so the policy stays a pure function.
#[derive(Clone, Debug, Default)]
pub struct RequestFingerprint {
    pub user_agent: String,
    pub referer: String,
    /// Lowercased header name/value pairs of the inbound request.
    pub headers: Vec<(String, String)>,
}

impl RequestFingerprint {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Mail clients, image proxies and security scanners known to fetch pixels
/// and links without a human behind them.
const EMAIL_CLIENT_PATTERNS: &[&str] = &[
    // Apple Mail link preview
    r"AppleWebKit.*Mobile.*Safari.*(?:AppleMail|MailKit)",
    r"AppleMail",
    r"MailKit",
    r"iOS.*Mail",
    // Gmail image proxy and link scanning
    r"GoogleImageProxy",
    r"Gmail.*Image.*Proxy",
    r"Google.*SafeBrowsing",
    r"Google.*LinkScanner",
    // Outlook link preview
    r"Microsoft.*Office.*Outlook",
    r"Outlook.*LinkPreview",
    r"Microsoft.*SafeLinks",
    r"SkypeUriPreview",
    // Yahoo Mail
    r"Yahoo.*Mail",
    r"YahooMailProxy",
    // Email security/preview services
    r"Mimecast",
    r"Proofpoint",
    r"Barracuda",
    r"MessageLabs",
    r"TrendMicro",
    r"Symantec.*Email",
    // Generic automation
    r"bot",
    r"crawler",
    r"spider",
    r"preview",
    r"prefetch",
    r"scanner",
];

const GENUINE_BROWSER_PATTERNS: &[&str] = &[
    r"Chrome/\d+\.\d+",
    r"Firefox/\d+\.\d+",
    r"Safari/\d+\.\d+.*Version/\d+\.\d+",
    r"Edge/\d+\.\d+",
    r"Opera/\d+\.\d+",
];

/// (header name, suspicious values); any hit means an automated preview.
const SUSPICIOUS_HEADERS: &[(&str, &[&str])] = &[
    ("x-purpose", &["preview", "prefetch"]),
    ("x-moz", &["prefetch"]),
    ("purpose", &["preview", "prefetch"]),
    ("sec-purpose", &["prefetch"]),
];

const BOT_INDICATORS: &[&str] = &["headless", "phantom", "selenium", "webdriver", "automation"];

pub struct ClickClassifier {
    email_clients: RegexSet,
    browsers: RegexSet,
}

impl ClickClassifier {
    pub fn new() -> Self {
        ClickClassifier {
            email_clients: case_insensitive_set(EMAIL_CLIENT_PATTERNS),
            browsers: case_insensitive_set(GENUINE_BROWSER_PATTERNS),
        }
    }

    /// Decide whether a pixel/link hit was a genuine human action. Ordered
    /// policy, first match wins; uncertainty resolves to "reject" so the
    /// counters under-count rather than over-count. Heuristic only: known
    /// clients are recognized, novel ones are not.
    pub fn is_genuine(&self, fp: &RequestFingerprint) -> bool {
        if self.email_clients.is_match(&fp.user_agent) {
            info!(
                "[classify] email client prefetch detected user_agent={}",
                fp.user_agent
            );
            return false;
        }

        for (name, suspicious_values) in SUSPICIOUS_HEADERS {
            if let Some(value) = fp.header(name) {
                let value = value.to_lowercase();
                if suspicious_values.iter().any(|s| value.contains(s)) {
                    info!("[classify] suspicious header detected {}={}", name, value);
                    return false;
                }
            }
        }

        if !fp.user_agent.is_empty() && !self.browsers.is_match(&fp.user_agent) {
            info!(
                "[classify] unidentified user agent user_agent={}",
                fp.user_agent
            );
            return false;
        }

        if fp.referer.is_empty() && self.is_probable_bot(&fp.user_agent) {
            info!(
                "[classify] potential bot request user_agent={}, no referer",
                fp.user_agent
            );
            return false;
        }

        true
    }

    fn is_probable_bot(&self, user_agent: &str) -> bool {
        if user_agent.len() < 10 {
            return true;
        }
        let lowered = user_agent.to_lowercase();
        BOT_INDICATORS.iter().any(|i| lowered.contains(i))
    }
}

impl Default for ClickClassifier {
    fn default() -> Self {
        Self::new()
    }
}

fn case_insensitive_set(patterns: &[&str]) -> RegexSet {
    regex::RegexSetBuilder::new(patterns)
        .case_insensitive(true)
        .build()
        .expect("Invalid classifier pattern")
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHROME_UA: &str =
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 Chrome/117.0 Safari/537.36";

    fn fp(user_agent: &str) -> RequestFingerprint {
        RequestFingerprint {
            user_agent: user_agent.to_string(),
            referer: String::new(),
            headers: Vec::new(),
        }
    }

    #[test]
    fn rejects_google_image_proxy() {
        let classifier = ClickClassifier::new();
        assert!(!classifier.is_genuine(&fp("Mozilla/5.0 (Windows NT) GoogleImageProxy")));
    }

    #[test]
    fn rejects_known_mail_clients_and_scanners() {
        let classifier = ClickClassifier::new();
        for ua in [
            "Mozilla/5.0 AppleWebKit Mobile Safari MailKit",
            "Proofpoint Protection Server",
            "Mozilla/5.0 (compatible; Barracuda/1.0)",
            "linkcrawler/2.1",
            "Microsoft Office Outlook LinkPreview",
        ] {
            assert!(!classifier.is_genuine(&fp(ua)), "should reject {}", ua);
        }
    }

    #[test]
    fn accepts_desktop_chrome() {
        let classifier = ClickClassifier::new();
        assert!(classifier.is_genuine(&fp(CHROME_UA)));
    }

    #[test]
    fn accepts_firefox_with_referer() {
        let classifier = ClickClassifier::new();
        let mut f = fp("Mozilla/5.0 (X11; Linux x86_64; rv:109.0) Gecko/20100101 Firefox/119.0");
        f.referer = "https://mail.example.com/".to_string();
        assert!(classifier.is_genuine(&f));
    }

    #[test]
    fn rejects_purpose_header_prefetch() {
        let classifier = ClickClassifier::new();
        let mut f = fp(CHROME_UA);
        f.headers = vec![("sec-purpose".to_string(), "prefetch;prerender".to_string())];
        assert!(!classifier.is_genuine(&f));
    }

    #[test]
    fn rejects_unrecognized_nonempty_user_agent() {
        let classifier = ClickClassifier::new();
        assert!(!classifier.is_genuine(&fp("SomeStrangeClient/9.9 (unknown)")));
    }

    #[test]
    fn rejects_headless_browser_without_referer() {
        let classifier = ClickClassifier::new();
        // HeadlessChrome carries a Chrome token but the bot heuristics catch it
        assert!(!classifier.is_genuine(&fp(
            "Mozilla/5.0 (X11; Linux x86_64) HeadlessChrome/117.0 Chrome/117.0 Safari/537.36"
        )));
    }

    #[test]
    fn rejects_empty_user_agent_without_referer() {
        let classifier = ClickClassifier::new();
        assert!(!classifier.is_genuine(&fp("")));
    }
}
