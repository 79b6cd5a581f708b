use log::{info, warn};
use crate::models::{DynamicMix, SourceFile, StemPart};
use crate::store::JobStore;

/// A stored URL that did not answer with 2xx
#[derive(Debug, Clone, PartialEq)]
pub struct BrokenUrl {
    /// Which record holds the URL, e.g. `dynamic mix <id> (bass)`
    pub owner: String,
    pub url: String,
    /// HTTP status, or the transport error when no response came back
    pub problem: String,
}

/// Every remote URL the store references: source files and dynamic mix stems
fn collect_urls(store: &JobStore) -> Vec<(String, String)> {
    let mut urls = Vec::new();
    for file in store.all::<SourceFile>() {
        if let Some(url) = file.file_url.filter(|u| !u.is_empty()) {
            urls.push((format!("source file {}", file.id), url));
        }
    }
    for mix in store.all::<DynamicMix>() {
        for part in StemPart::DYNAMIC_ORDER {
            if let Some(url) = mix.stem(part).url.as_deref().filter(|u| !u.is_empty()) {
                urls.push((format!("dynamic mix {} ({})", mix.id, part), url.to_string()));
            }
        }
    }
    urls
}

/// Check that every referenced remote artifact still resolves. Read-only.
pub async fn audit_remote_urls(store: &JobStore, client: &reqwest::Client) -> Vec<BrokenUrl> {
    let urls = collect_urls(store);
    info!("🔍 Auditing {} remote URL(s)", urls.len());

    let mut broken = Vec::new();
    for (owner, url) in urls {
        let problem = match client.get(&url).send().await {
            Ok(response) if response.status().is_success() => continue,
            Ok(response) => format!("HTTP {}", response.status()),
            Err(e) => e.to_string(),
        };
        warn!("❗ {} -> {}: {}", owner, url, problem);
        broken.push(BrokenUrl { owner, url, problem });
    }

    info!("Audit finished: {} broken URL(s)", broken.len());
    broken
}
