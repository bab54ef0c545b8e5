use url::Url;

use crate::db::Snapshot;

use super::SearchQuery;

fn url_host(raw: &str) -> Option<String> {
    Url::parse(raw)
        .ok()
        .and_then(|url| url.host_str().map(str::to_lowercase))
}

impl SearchQuery {
    /// Whether `snapshot` falls inside the interval and satisfies any branch:
    /// app filter, window title, URL host, or (full text) every term in the
    /// recognized text. A query without terms matches everything in range.
    pub fn matches(&self, snapshot: &Snapshot) -> bool {
        if !self.contains_timestamp(snapshot.timestamp) {
            return false;
        }
        if !self.has_filters() {
            return true;
        }

        let info = &snapshot.info;
        let app_id = info.app_id.as_deref().map(str::to_lowercase);
        let app_name = info.app_name.as_deref().map(str::to_lowercase);

        let app_match = self.app_filters.iter().any(|filter| {
            app_id.as_deref() == Some(filter.as_str())
                || app_name
                    .as_deref()
                    .is_some_and(|name| name.contains(filter.as_str()))
        });
        if app_match {
            return true;
        }

        if let Some(title) = info.window_name.as_deref().map(str::to_lowercase) {
            if self
                .free_text_terms
                .iter()
                .any(|term| title.contains(term.as_str()))
            {
                return true;
            }
        }

        if let Some(host) = info.url.as_deref().and_then(url_host) {
            if self
                .free_text_terms
                .iter()
                .any(|term| host.contains(term.as_str()))
            {
                return true;
            }
        }

        if self.full_text && !self.free_text_terms.is_empty() {
            if let Some(text) = snapshot.ocr_text.as_deref().map(str::to_lowercase) {
                return self
                    .free_text_terms
                    .iter()
                    .all(|term| text.contains(term.as_str()));
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::db::{SnapshotInfo, WindowBounds};

    fn snapshot(app_id: &str, app_name: &str, title: &str, url: Option<&str>) -> Snapshot {
        Snapshot {
            timestamp: 100,
            image: None,
            info: SnapshotInfo {
                window_id: 1,
                bounds: WindowBounds::default(),
                window_name: Some(title.into()),
                app_id: Some(app_id.into()),
                app_name: Some(app_name.into()),
                url: url.map(String::from),
            },
            phash: "0000000000000000".into(),
            ocr_text: None,
        }
    }

    fn query(apps: &[&str], terms: &[&str], full_text: bool) -> SearchQuery {
        SearchQuery {
            min_timestamp: 0,
            max_timestamp: 1_000,
            app_filters: apps.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
            free_text_terms: terms.iter().map(|s| s.to_string()).collect(),
            full_text,
        }
    }

    #[test]
    fn app_filter_matches_app_id_without_terms() {
        let snap = snapshot("com.apple.Safari", "Safari", "Start Page", None);
        assert!(query(&["com.apple.safari"], &[], false).matches(&snap));
    }

    #[test]
    fn app_filter_matches_name_substring() {
        let snap = snapshot("com.apple.Safari", "Safari", "Start Page", None);
        assert!(query(&["safari"], &[], false).matches(&snap));
        assert!(!query(&["firefox"], &[], false).matches(&snap));
    }

    #[test]
    fn free_text_matches_title_case_insensitively() {
        let snap = snapshot("code", "Code", "Quarterly REPORT.md", None);
        assert!(query(&[], &["report"], false).matches(&snap));
    }

    #[test]
    fn free_text_matches_url_host_only() {
        let snap = snapshot(
            "firefox",
            "Firefox",
            "Welcome",
            Some("https://Docs.Rust-Lang.org/book/?q=ownership"),
        );
        assert!(query(&[], &["rust-lang"], false).matches(&snap));
        assert!(!query(&[], &["ownership"], false).matches(&snap));
    }

    #[test]
    fn full_text_requires_every_term() {
        let mut snap = snapshot("term", "Terminal", "shell", None);
        snap.ocr_text = Some("Cargo build finished with 3 warnings".into());

        assert!(query(&[], &["cargo", "warnings"], true).matches(&snap));
        assert!(!query(&[], &["cargo", "errors"], true).matches(&snap));
        assert!(!query(&[], &["cargo", "warnings"], false).matches(&snap));
    }

    #[test]
    fn empty_query_matches_everything_in_range() {
        let snap = snapshot("a", "A", "b", None);
        let q = query(&[], &[], false);
        assert!(q.matches(&snap));

        let mut late = snap.clone();
        late.timestamp = 1_000;
        assert!(!q.matches(&late));
    }
}
