use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

const DEFAULT_MAX_CHARS: usize = 50_000;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WebFetchResult {
    pub url: String,
    pub content: String,
    pub content_type: String,
    pub truncated: bool,
}

/// Fetch a URL and return its content as text.
///
/// - Only `http`/`https` schemes are allowed.
/// - Hostnames resolving to loopback, link-local, or private ranges are
///   rejected before any connection is made (SSRF guard).
/// - HTML responses are stripped of tags to produce plain text.
/// - Content is truncated to `max_chars` to avoid blowing up context.
pub async fn fetch_url(raw_url: &str, max_chars: Option<usize>) -> Result<WebFetchResult> {
    let limit = max_chars.unwrap_or(DEFAULT_MAX_CHARS);

    let parsed = url::Url::parse(raw_url).with_context(|| format!("invalid URL: {raw_url}"))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => bail!("unsupported URL scheme '{}': only http/https allowed", other),
    }
    guard_ssrf(&parsed).await?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .redirect(reqwest::redirect::Policy::limited(10))
        .user_agent("Mozilla/5.0 (compatible; bashclaw/0.3)")
        .build()
        .context("failed to build HTTP client")?;

    let resp = client
        .get(parsed.clone())
        .send()
        .await
        .context("failed to fetch URL")?;

    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("text/plain")
        .to_string();

    let body = resp.text().await.context("failed to read response body")?;

    let text = if content_type.contains("text/html") {
        strip_html_tags(&body)
    } else {
        body
    };

    let truncated = text.len() > limit;
    let content = if truncated {
        // Truncate at a char boundary
        let mut end = limit;
        while !text.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        text[..end].to_string()
    } else {
        text
    };

    Ok(WebFetchResult {
        url: raw_url.to_string(),
        content,
        content_type,
        truncated,
    })
}

/// Resolve the URL's host and reject private destinations. Literal IPs are
/// checked directly; hostnames go through DNS first.
async fn guard_ssrf(parsed: &url::Url) -> Result<()> {
    let host = parsed.host_str().context("URL has no host")?;

    if let Ok(ip) = host.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
        if is_private_ip(&ip) {
            bail!("SSRF blocked: {} resolves to a private address", host);
        }
        return Ok(());
    }

    let port = parsed.port_or_known_default().unwrap_or(80);
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("failed to resolve host {host}"))?;
    for addr in addrs {
        if is_private_ip(&addr.ip()) {
            bail!(
                "SSRF blocked: {} resolves to private address {}",
                host,
                addr.ip()
            );
        }
    }
    Ok(())
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            v4.is_loopback()                       // 127.0.0.0/8
                || v4.is_private()                 // 10/8, 172.16/12, 192.168/16
                || v4.is_link_local()              // 169.254/16
                || v4.is_unspecified()
                || octets[0] == 100 && (64..=127).contains(&octets[1]) // CGNAT
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xffc0) == 0xfe80 // link-local
                || (v6.segments()[0] & 0xfe00) == 0xfc00 // unique-local
                || v6.to_ipv4_mapped().map(|v4| {
                    let ip = IpAddr::V4(v4);
                    is_private_ip(&ip)
                }).unwrap_or(false)
        }
    }
}

/// Strip HTML tags and collapse whitespace to produce readable plain text.
fn strip_html_tags(html: &str) -> String {
    // Remove <script> and <style> blocks entirely
    let script_re = Regex::new(r"(?is)<script[^>]*>.*?</script>").unwrap();
    let style_re = Regex::new(r"(?is)<style[^>]*>.*?</style>").unwrap();
    let text = script_re.replace_all(html, "");
    let text = style_re.replace_all(&text, "");

    // Strip remaining HTML tags
    let tag_re = Regex::new(r"<[^>]+>").unwrap();
    let text = tag_re.replace_all(&text, "");

    // Decode common HTML entities
    let text = text
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ");

    // Collapse runs of whitespace into single spaces, trim lines
    let ws_re = Regex::new(r"[ \t]+").unwrap();
    let blank_re = Regex::new(r"\n{3,}").unwrap();
    let text = ws_re.replace_all(&text, " ");
    let text = blank_re.replace_all(&text, "\n\n");

    text.trim().to_string()
}
