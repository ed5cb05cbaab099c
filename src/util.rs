use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Fresh UUID v4, lowercase hyphenated.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Short random id for file markers and spawn labels (12 hex chars).
pub fn short_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..12].to_string()
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Seconds since the Unix epoch.
pub fn now_ts_secs() -> u64 {
    now_ms() / 1000
}

/// Current time as an ISO-8601 UTC string with second precision.
pub fn now_iso() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// FNV-1a 64-bit content hash, hex-encoded. Used for idempotency keys in
/// usage records and run markers.
pub fn fnv1a_64(data: &[u8]) -> String {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in data {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("{:016x}", hash)
}

/// Escape a string for embedding inside a JSON string literal.
pub fn json_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

/// Percent-encode a string for use in a URL query component.
pub fn url_encode(s: &str) -> String {
    urlencoding::encode(s).into_owned()
}

const RETRY_BASE_MS: u64 = 500;
const RETRY_FACTOR: u64 = 2;
const RETRY_MAX_ATTEMPTS: u32 = 3;

/// Run `op` up to 3 times with jittered exponential backoff (500 ms base,
/// factor 2, ±20 % jitter). `is_transient` decides whether a failure is worth
/// retrying; permanent errors return immediately.
pub async fn retry_with_backoff<T, F, Fut>(
    label: &str,
    is_transient: impl Fn(&anyhow::Error) -> bool,
    mut op: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                attempt += 1;
                if attempt >= RETRY_MAX_ATTEMPTS || !is_transient(&e) {
                    return Err(e);
                }
                let base = RETRY_BASE_MS * RETRY_FACTOR.pow(attempt - 1);
                let jitter = {
                    let mut rng = rand::rng();
                    let spread = (base / 5).max(1);
                    rng.random_range(0..=spread * 2) as i64 - spread as i64
                };
                let delay = (base as i64 + jitter).max(0) as u64;
                tracing::warn!(
                    "{} failed (attempt {}/{}), retrying in {} ms: {}",
                    label,
                    attempt,
                    RETRY_MAX_ATTEMPTS,
                    delay,
                    e
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_new_id_unique() {
        assert_ne!(new_id(), new_id());
        assert_eq!(short_id().len(), 12);
    }

    #[test]
    fn test_fnv1a_stable() {
        assert_eq!(fnv1a_64(b"hello"), fnv1a_64(b"hello"));
        assert_ne!(fnv1a_64(b"hello"), fnv1a_64(b"hellp"));
        assert_eq!(fnv1a_64(b"").len(), 16);
    }

    #[test]
    fn test_json_escape() {
        assert_eq!(json_escape("a\"b\\c\nd"), "a\\\"b\\\\c\\nd");
        assert_eq!(json_escape("\u{1}"), "\\u0001");
        assert_eq!(json_escape("plain"), "plain");
    }

    #[test]
    fn test_url_encode() {
        assert_eq!(url_encode("a b&c"), "a%20b%26c");
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let calls = std::sync::Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = retry_with_backoff("test", |_| true, move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("transient");
                }
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_on_permanent_error() {
        let calls = std::sync::Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: anyhow::Result<()> = retry_with_backoff("test", |_| false, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("permanent")
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
