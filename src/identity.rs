use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};

/// Hex characters of the hash suffix
pub const SUFFIX_LEN: usize = 10;

/// Longest name both backends accept (Kubernetes label limit)
pub const MAX_NAME_LEN: usize = 63;

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Replace path, tag and digest separators (and anything else a pod name
/// cannot carry) with '-'.
pub fn sanitize_image(image: &str) -> String {
    let sanitized: String = image
        .to_ascii_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' | '.' => c,
            _ => '-',
        })
        .collect();
    let trimmed = sanitized.trim_matches(|c| c == '-' || c == '.');
    let budget = MAX_NAME_LEN - SUFFIX_LEN - 1;
    let mut prefix: String = trimmed.chars().take(budget).collect();
    while prefix.ends_with('-') || prefix.ends_with('.') {
        prefix.pop();
    }
    if prefix.is_empty() {
        prefix.push_str("target");
    }
    prefix
}

/// Generate a unique target name from the image, process id and wall clock.
pub fn target_name(image: &str) -> String {
    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.9f");
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let seed = format!("{}{}{}", timestamp, std::process::id(), seq);
    let digest = hex::encode(Sha256::digest(seed.as_bytes()));
    format!("{}-{}", sanitize_image(image), &digest[..SUFFIX_LEN])
}
