use scraper::{ElementRef, Html, Selector as CssSelector};
use tracing::{debug, warn};
use url::Url;

use crate::model::{Job, Selector, SelectorPurpose};

/// Attributes tried, in order, when a selector names none.
const VALUE_ATTRIBUTES: &[&str] = &["src", "href", "data-src", "data-video", "data-media"];

/// Page-level metadata pulled once per page.
#[derive(Debug, Default, Clone)]
pub struct PageMeta {
    pub title: String,
    pub description: String,
    pub author: String,
    pub date: String,
}

/// One URL that matched an assets selector.
#[derive(Debug, Clone)]
pub struct AssetCandidate {
    /// Absolutized URL, fragment annotations intact.
    pub url: Url,
    /// Id of the selector that produced it.
    pub selector_id: String,
}

/// Everything one extraction pass yields from a page.
#[derive(Debug, Default)]
pub struct Extraction {
    pub meta: PageMeta,
    pub assets: Vec<AssetCandidate>,
    pub links: Vec<Url>,
    pub next_page: Option<Url>,
}

/// Run every selector of the job against one page body.
///
/// Parsing happens synchronously; the caller must not hold the document
/// across awaits. Candidates that fail to absolutize are dropped with a
/// debug log. When several selectors match the same URL the first one
/// (priority order) sticks.
pub fn extract(body: &str, page_url: &Url, job: &Job) -> Extraction {
    let document = Html::parse_document(body);
    let mut out = Extraction::default();

    extract_meta(&document, job, &mut out.meta);
    extract_assets(&document, page_url, job, &mut out.assets);
    extract_links(&document, page_url, job, &mut out.links);
    out.next_page = extract_next_page(&document, page_url, job);

    out
}

fn parse_css(selector: &Selector) -> Option<CssSelector> {
    match CssSelector::parse(&selector.value) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!(selector_id = %selector.id, value = %selector.value, error = %e,
                "Unparseable selector skipped");
            None
        }
    }
}

fn element_value(element: &ElementRef<'_>, selector: &Selector) -> Option<String> {
    if !selector.attribute.is_empty() {
        if selector.attribute == "text" {
            let text: String = element.text().collect::<String>().trim().to_string();
            return (!text.is_empty()).then_some(text);
        }
        return element
            .value()
            .attr(&selector.attribute)
            .map(str::to_string);
    }
    for attr in VALUE_ATTRIBUTES {
        if let Some(value) = element.value().attr(attr) {
            return Some(value.to_string());
        }
    }
    None
}

fn matches_pattern(url: &Url, selector: &Selector) -> bool {
    match &selector.url_pattern {
        Some(pattern) if !pattern.is_empty() => url.as_str().contains(pattern.as_str()),
        _ => true,
    }
}

fn extract_meta(document: &Html, job: &Job, meta: &mut PageMeta) {
    for selector in job.selectors_for(SelectorPurpose::Metadata) {
        let Some(css) = parse_css(selector) else {
            continue;
        };
        let Some(element) = document.select(&css).next() else {
            continue;
        };
        let value = if selector.attribute.is_empty() || selector.attribute == "text" {
            element.text().collect::<String>().trim().to_string()
        } else {
            element
                .value()
                .attr(&selector.attribute)
                .unwrap_or_default()
                .to_string()
        };
        if value.is_empty() {
            continue;
        }
        match selector.name.as_str() {
            "title" => meta.title = value,
            "description" => meta.description = value,
            "author" => meta.author = value,
            "date" => meta.date = value,
            other => debug!(name = other, "Unrecognized metadata selector name"),
        }
    }
}

fn extract_assets(document: &Html, page_url: &Url, job: &Job, out: &mut Vec<AssetCandidate>) {
    let mut seen_on_page = std::collections::HashSet::new();
    for selector in job.selectors_for(SelectorPurpose::Assets) {
        let Some(css) = parse_css(selector) else {
            continue;
        };
        for element in document.select(&css) {
            let Some(raw) = element_value(&element, selector) else {
                continue;
            };
            let Ok(url) = page_url.join(raw.trim()) else {
                debug!(raw, "Dropping unparseable asset candidate");
                continue;
            };
            if !matches!(url.scheme(), "http" | "https") {
                continue;
            }
            if !matches_pattern(&url, selector) {
                continue;
            }
            // First selector to claim a URL wins.
            if !seen_on_page.insert(url.to_string()) {
                continue;
            }
            out.push(AssetCandidate {
                url,
                selector_id: selector.id.clone(),
            });
        }
    }
}

fn extract_links(document: &Html, page_url: &Url, job: &Job, out: &mut Vec<Url>) {
    let mut seen_on_page = std::collections::HashSet::new();
    for selector in job.selectors_for(SelectorPurpose::Links) {
        let Some(css) = parse_css(selector) else {
            continue;
        };
        for element in document.select(&css) {
            let raw = if selector.attribute.is_empty() {
                element.value().attr("href").map(str::to_string)
            } else {
                element_value(&element, selector)
            };
            let Some(raw) = raw else {
                continue;
            };
            let Ok(mut url) = page_url.join(raw.trim()) else {
                debug!(raw, "Dropping unparseable link");
                continue;
            };
            if !matches!(url.scheme(), "http" | "https") {
                continue;
            }
            // Fragments never change the fetched document.
            url.set_fragment(None);
            if !matches_pattern(&url, selector) {
                continue;
            }
            if !job.rules.follow_external && !same_host(page_url, &url) {
                continue;
            }
            if seen_on_page.insert(url.to_string()) {
                out.push(url);
            }
        }
    }
}

fn extract_next_page(document: &Html, page_url: &Url, job: &Job) -> Option<Url> {
    for selector in job.selectors_for(SelectorPurpose::Pagination) {
        let Some(css) = parse_css(selector) else {
            continue;
        };
        for element in document.select(&css) {
            let raw = if selector.attribute.is_empty() {
                element.value().attr("href").map(str::to_string)
            } else {
                element_value(&element, selector)
            };
            let Some(raw) = raw else {
                continue;
            };
            if let Ok(url) = page_url.join(raw.trim()) {
                if url != *page_url {
                    return Some(url);
                }
            }
        }
    }
    None
}

pub fn same_host(a: &Url, b: &Url) -> bool {
    a.host_str() == b.host_str() && a.port_or_known_default() == b.port_or_known_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Rules;

    fn selector(
        id: &str,
        value: &str,
        attribute: &str,
        purpose: SelectorPurpose,
    ) -> Selector {
        Selector {
            id: id.to_string(),
            name: String::new(),
            value: value.to_string(),
            attribute: attribute.to_string(),
            purpose,
            priority: 0,
            optional: false,
            url_pattern: None,
        }
    }

    fn gallery_job() -> Job {
        let mut job = Job::new("g", "https://example.com/gallery");
        job.selectors = vec![
            selector("links", "a.page", "", SelectorPurpose::Links),
            selector("imgs", "img", "", SelectorPurpose::Assets),
        ];
        job
    }

    fn page_url() -> Url {
        Url::parse("https://example.com/gallery").unwrap()
    }

    #[test]
    fn assets_absolutize_and_dedupe() {
        let body = r#"<html><body>
            <img src="/media/a.jpg">
            <img src="/media/a.jpg">
            <img src="https://cdn.example.net/b.png">
            <img data-src="/lazy/c.webp">
        </body></html>"#;

        let out = extract(body, &page_url(), &gallery_job());
        let urls: Vec<String> = out.assets.iter().map(|c| c.url.to_string()).collect();
        assert_eq!(
            urls,
            vec![
                "https://example.com/media/a.jpg",
                "https://cdn.example.net/b.png",
                "https://example.com/lazy/c.webp",
            ]
        );
    }

    #[test]
    fn links_stay_on_host_by_default() {
        let body = r#"<html><body>
            <a class="page" href="/gallery?page=2">next</a>
            <a class="page" href="https://elsewhere.test/x">offsite</a>
            <a class="page" href="/gallery?page=2#top">dupe with fragment</a>
        </body></html>"#;

        let out = extract(body, &page_url(), &gallery_job());
        assert_eq!(out.links.len(), 1);
        assert_eq!(out.links[0].as_str(), "https://example.com/gallery?page=2");
    }

    #[test]
    fn follow_external_opens_the_fence() {
        let body = r#"<a class="page" href="https://elsewhere.test/x">offsite</a>"#;
        let mut job = gallery_job();
        job.rules = Rules {
            follow_external: true,
            ..Rules::default()
        };
        let out = extract(body, &page_url(), &job);
        assert_eq!(out.links.len(), 1);
    }

    #[test]
    fn url_pattern_filters_matches() {
        let body = r#"<html><body>
            <img src="/media/photo.jpg">
            <img src="/ads/banner.jpg">
        </body></html>"#;
        let mut job = gallery_job();
        job.selectors[1].url_pattern = Some("/media/".to_string());

        let out = extract(body, &page_url(), &job);
        assert_eq!(out.assets.len(), 1);
        assert!(out.assets[0].url.as_str().contains("/media/"));
    }

    #[test]
    fn metadata_selectors_fill_page_meta() {
        let body = r#"<html><head>
            <title>Spring Collection</title>
            <meta name="author" content="J. Doe">
        </head><body></body></html>"#;
        let mut job = gallery_job();
        let mut title = selector("m1", "title", "text", SelectorPurpose::Metadata);
        title.name = "title".to_string();
        let mut author = selector("m2", "meta[name='author']", "content", SelectorPurpose::Metadata);
        author.name = "author".to_string();
        job.selectors.push(title);
        job.selectors.push(author);

        let out = extract(body, &page_url(), &job);
        assert_eq!(out.meta.title, "Spring Collection");
        assert_eq!(out.meta.author, "J. Doe");
        assert!(out.meta.date.is_empty());
    }

    #[test]
    fn pagination_selector_yields_next_page() {
        let body = r#"<a rel="next" href="/gallery?page=2">older</a>"#;
        let mut job = gallery_job();
        job.selectors.push(selector(
            "next",
            "a[rel='next']",
            "",
            SelectorPurpose::Pagination,
        ));

        let out = extract(body, &page_url(), &job);
        assert_eq!(
            out.next_page.unwrap().as_str(),
            "https://example.com/gallery?page=2"
        );
    }

    #[test]
    fn self_referencing_pagination_is_ignored() {
        let body = r#"<a rel="next" href="/gallery">same page</a>"#;
        let mut job = gallery_job();
        job.selectors.push(selector(
            "next",
            "a[rel='next']",
            "",
            SelectorPurpose::Pagination,
        ));
        let out = extract(body, &page_url(), &job);
        assert!(out.next_page.is_none());
    }

    #[test]
    fn broken_selector_is_skipped_not_fatal() {
        let body = r#"<img src="/a.jpg">"#;
        let mut job = gallery_job();
        job.selectors.push(selector(
            "broken",
            ":::not-a-selector",
            "",
            SelectorPurpose::Assets,
        ));
        let out = extract(body, &page_url(), &job);
        assert_eq!(out.assets.len(), 1);
    }

    #[test]
    fn first_selector_claims_shared_urls() {
        let body = r#"<img class="hero" src="/a.jpg"><img src="/a.jpg">"#;
        let mut job = gallery_job();
        let mut hero = selector("hero", "img.hero", "", SelectorPurpose::Assets);
        hero.priority = -1;
        job.selectors.push(hero);

        let out = extract(body, &page_url(), &job);
        assert_eq!(out.assets.len(), 1);
        assert_eq!(out.assets[0].selector_id, "hero");
    }
}
