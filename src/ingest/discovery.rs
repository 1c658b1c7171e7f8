use crate::ingest::{
    rate_limiter::RateLimiter,
    source::{ResultsSource, SourceError, VenueConfig}
};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

lazy_static! {
    static ref TOURNAMENT_LINK: Regex = Regex::new(r"/tournament/[^/]+/(\d+)").unwrap();
    static ref NEXT_CLASS: Regex = Regex::new(r#"(?i)<a\b[^>]*\bclass\s*=\s*["'][^"']*\bnext\b[^"']*["']"#).unwrap();
    static ref NEXT_TEXT: Regex = Regex::new(r"(?i)>\s*next\s*(?:»|&raquo;|&#187;)").unwrap();
}

/// Everything found for one venue. `error` is set when crawling stopped early because a
/// page could not be fetched; the ids found before that are still valid.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VenueListing {
    pub venue_id: i64,
    pub ids: BTreeSet<i64>,
    pub pages_fetched: u32,
    pub error: Option<SourceError>
}

pub fn extract_tournament_ids(html: &str) -> BTreeSet<i64> {
    TOURNAMENT_LINK
        .captures_iter(html)
        .filter_map(|c| c.get(1).and_then(|m| m.as_str().parse().ok()))
        .collect()
}

pub fn has_next_page(html: &str) -> bool {
    NEXT_CLASS.is_match(html) || NEXT_TEXT.is_match(html)
}

/// Walks a venue's listing one rate-limited page at a time.
///
/// Stops when a page adds no ids we have not seen, when there is no link to a next
/// page, or after `max_pages` pages.
pub async fn discover_venue<S: ResultsSource>(
    source: &S,
    limiter: &RateLimiter,
    venue: &VenueConfig,
    max_pages: u32
) -> VenueListing {
    let mut listing = VenueListing {
        venue_id: venue.id,
        ..VenueListing::default()
    };

    for page in 1..=max_pages {
        let html = match limiter.call(|| source.listing_page(venue, page)).await {
            Ok(html) => html,
            Err(e) => {
                warn!(venue_id = venue.id, page, "Failed to fetch listing page: {}", e);
                listing.error = Some(e);
                break;
            }
        };
        listing.pages_fetched = page;

        let found = extract_tournament_ids(&html);
        let before = listing.ids.len();
        listing.ids.extend(found);
        let added = listing.ids.len() - before;

        debug!(venue_id = venue.id, page, added, "Listing page parsed");

        if added == 0 {
            break;
        }

        if !has_next_page(&html) {
            break;
        }

        if page == max_pages {
            warn!(venue_id = venue.id, max_pages, "Listing still has more pages, stopping at the page cap");
        }
    }

    info!(
        venue_id = venue.id,
        pages = listing.pages_fetched,
        "Found {} tournaments at {}",
        listing.ids.len(),
        venue.name
    );
    listing
}

#[cfg(test)]
mod tests {
    use crate::{
        ingest::{
            discovery::{discover_venue, extract_tournament_ids, has_next_page},
            rate_limiter::{BackoffPolicy, RateLimiter},
            source::{SourceError, VenueConfig}
        },
        utils::test_utils::{listing_html, ScriptedSource}
    };
    use std::time::Duration;

    fn limiter() -> RateLimiter {
        RateLimiter::new("listing", Duration::from_millis(10), BackoffPolicy::default())
    }

    #[test]
    fn test_extract_ids() {
        let html = r#"<a href="/tournament/Friday+9-ball/7001">x</a>
            <a href="https://cuescore.com/tournament/Open/7002">y</a>
            <a href="/tournament/Friday+9-ball/7001">dup</a>
            <a href="/player/Someone/55">z</a>"#;

        assert_eq!(extract_tournament_ids(html).into_iter().collect::<Vec<_>>(), vec![7001, 7002]);
    }

    #[test]
    fn test_next_link_detection() {
        assert!(has_next_page(r#"<a class="pager next" href="?page=2">2</a>"#));
        assert!(has_next_page(r#"<a href="?page=2">Next &raquo;</a>"#));
        assert!(has_next_page(r#"<a href="?page=2">Next »</a>"#));
        assert!(!has_next_page(r#"<a href="?page=1">Previous</a>"#));
    }

    #[tokio::test(start_paused = true)]
    async fn test_paginates_until_last_page() {
        let venue = VenueConfig::new(1, "Club");
        let source = ScriptedSource::default()
            .with_listing(1, 1, listing_html(&[10, 11], true))
            .with_listing(1, 2, listing_html(&[12], true))
            .with_listing(1, 3, listing_html(&[13], false));

        let listing = discover_venue(&source, &limiter(), &venue, 50).await;

        assert_eq!(listing.ids.into_iter().collect::<Vec<_>>(), vec![10, 11, 12, 13]);
        assert_eq!(listing.pages_fetched, 3);
        assert!(listing.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_a_page_repeats() {
        let venue = VenueConfig::new(1, "Club");
        let source = ScriptedSource::default()
            .with_listing(1, 1, listing_html(&[10, 11], true))
            .with_listing(1, 2, listing_html(&[10, 11], true));

        let listing = discover_venue(&source, &limiter(), &venue, 50).await;

        assert_eq!(listing.ids.len(), 2);
        assert_eq!(listing.pages_fetched, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_page_cap() {
        let venue = VenueConfig::new(1, "Club");
        let mut source = ScriptedSource::default();
        for page in 1..=10 {
            source = source.with_listing(1, page, listing_html(&[page as i64 * 100], true));
        }

        let listing = discover_venue(&source, &limiter(), &venue, 4).await;

        assert_eq!(listing.pages_fetched, 4);
        assert_eq!(listing.ids.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_keeps_earlier_pages() {
        let venue = VenueConfig::new(1, "Club");
        // Page 2 is not scripted, so it fails permanently
        let source = ScriptedSource::default().with_listing(1, 1, listing_html(&[10, 11], true));

        let listing = discover_venue(&source, &limiter(), &venue, 50).await;

        assert_eq!(listing.ids.len(), 2);
        assert!(matches!(listing.error, Some(SourceError::Permanent { .. })));
    }
}
