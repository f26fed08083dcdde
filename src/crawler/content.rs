//! Product page content extraction
//!
//! Given a product URL, fetches the page through the configured engine and
//! pulls out the cleaned text, the main image URL, the display names, and
//! the prices. All HTML work happens synchronously on an owned document so
//! no parser state crosses an await point.

use crate::config::{SelectorConfig, SelectorList};
use crate::net::{BehaviorContext, Engine, EngineRequest, FetchError};
use ego_tree::NodeRef;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Node, Selector};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use url::Url;

/// Extracted pieces of one product page
#[derive(Debug, Clone, Default)]
pub struct ProductContent {
    pub text: Option<String>,
    pub image_url: Option<String>,
    /// og:title / <title> / <h1>, used as the image file-name hint
    pub title: Option<String>,
    pub name_en: Option<String>,
    pub name_ru: Option<String>,
    pub price_without_discount: Option<String>,
    pub price_with_discount: Option<String>,
}

/// Consecutive product-fetch failures before a cooldown warning
const FAIL_COOLDOWN_THRESHOLD: u32 = 5;

pub struct ContentFetcher {
    engine: Arc<dyn Engine>,
    fail_streak: AtomicU32,
}

impl ContentFetcher {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            fail_streak: AtomicU32::new(0),
        }
    }

    /// Fetches a product page and extracts its content.
    ///
    /// # Arguments
    ///
    /// * `product_url` - Canonical product URL
    /// * `selectors` - The site's selector block
    /// * `behavior_context` - Passed through to the browser engine so the
    ///   behavior layer also runs on product pages
    pub async fn fetch(
        &self,
        product_url: &str,
        selectors: &SelectorConfig,
        behavior_context: Option<BehaviorContext>,
    ) -> Result<ProductContent, FetchError> {
        let mut request = EngineRequest::new(product_url);
        request.behavior_context = behavior_context;
        let result = match self.engine.fetch(&request).await {
            Ok(result) => result,
            Err(err) => {
                self.register_failure(product_url);
                return Err(err);
            }
        };
        if result.html.trim().is_empty() {
            self.register_failure(product_url);
            return Err(FetchError::ExtractionEmpty {
                url: product_url.to_string(),
            });
        }
        self.fail_streak.store(0, Ordering::Relaxed);
        Ok(extract_content(&result.html, product_url, selectors))
    }

    fn register_failure(&self, url: &str) {
        let streak = self.fail_streak.fetch_add(1, Ordering::Relaxed) + 1;
        if streak >= FAIL_COOLDOWN_THRESHOLD {
            tracing::warn!(
                url,
                streak,
                "Repeated product fetch failures, consider a pause or pool refresh"
            );
            self.fail_streak.store(0, Ordering::Relaxed);
        }
    }
}

/// Parses a product page and extracts every configured piece
pub fn extract_content(html: &str, base_url: &str, selectors: &SelectorConfig) -> ProductContent {
    let document = Html::parse_document(html);
    ProductContent {
        text: extract_text(
            &document,
            &selectors.content_drop_after,
            &selectors.exclude_selectors,
        ),
        image_url: extract_image_url(&document, base_url, selectors.main_image_selector.as_deref()),
        title: extract_title(&document),
        name_en: select_first_text(&document, &selectors.name_en_selector),
        name_ru: select_first_text(&document, &selectors.name_ru_selector),
        price_without_discount: select_first_text(
            &document,
            &selectors.price_without_discount_selector,
        )
        .and_then(|raw| clean_price(&raw)),
        price_with_discount: select_first_text(&document, &selectors.price_with_discount_selector)
            .and_then(|raw| clean_price(&raw)),
    }
}

/// Renders the visible page text with whitespace normalized.
///
/// Script/style/noscript/template subtrees and `exclude` matches are
/// skipped. When any `drop_after` selector matches, the matched element and
/// everything after it in document order is discarded.
fn extract_text(document: &Html, drop_after: &[String], exclude: &[String]) -> Option<String> {
    let stop_at = drop_after
        .iter()
        .filter_map(|selector| Selector::parse(selector).ok())
        .filter_map(|selector| document.select(&selector).next())
        .map(|element| element.id())
        .min_by_key(|id| {
            // Earliest match in document order wins
            document
                .root_element()
                .descendants()
                .position(|node| node.id() == *id)
        });

    let excluded: HashSet<_> = exclude
        .iter()
        .filter_map(|selector| Selector::parse(selector).ok())
        .flat_map(|selector| {
            document
                .select(&selector)
                .map(|element| element.id())
                .collect::<Vec<_>>()
        })
        .collect();

    let mut raw = String::new();
    let mut stopped = false;
    collect_text(
        *document.root_element(),
        stop_at,
        &excluded,
        &mut raw,
        &mut stopped,
    );

    let text = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    (!text.is_empty()).then_some(text)
}

fn collect_text(
    node: NodeRef<'_, Node>,
    stop_at: Option<ego_tree::NodeId>,
    excluded: &HashSet<ego_tree::NodeId>,
    out: &mut String,
    stopped: &mut bool,
) {
    if *stopped {
        return;
    }
    if Some(node.id()) == stop_at {
        *stopped = true;
        return;
    }
    if excluded.contains(&node.id()) {
        return;
    }
    match node.value() {
        Node::Element(element) => {
            if matches!(element.name(), "script" | "style" | "noscript" | "template") {
                return;
            }
        }
        Node::Text(text) => {
            out.push_str(&text.text);
            out.push(' ');
        }
        _ => {}
    }
    for child in node.children() {
        collect_text(child, stop_at, excluded, out, stopped);
        if *stopped {
            return;
        }
    }
}

/// Main image selection: site override, then `og:image`, then zoom/lazy
/// attributes, then the best srcset candidate, then a plain `<img src>`
fn extract_image_url(document: &Html, base_url: &str, override_selector: Option<&str>) -> Option<String> {
    if let Some(selector) = override_selector {
        if let Ok(parsed) = Selector::parse(selector) {
            if let Some(element) = document.select(&parsed).next() {
                if let Some(url) = image_from_element(element, base_url) {
                    return Some(url);
                }
            }
        }
    }

    static OG_IMAGE: Lazy<Selector> =
        Lazy::new(|| Selector::parse(r#"meta[property="og:image"]"#).unwrap());
    if let Some(content) = document
        .select(&OG_IMAGE)
        .next()
        .and_then(|meta| meta.value().attr("content"))
    {
        return absolutize(base_url, content);
    }

    for attr in ["data-zoom-image", "data-large_image", "data-large-src"] {
        if let Ok(selector) = Selector::parse(&format!("[{}]", attr)) {
            if let Some(value) = document
                .select(&selector)
                .next()
                .and_then(|element| element.value().attr(attr))
            {
                return absolutize(base_url, value);
            }
        }
    }

    static IMG: Lazy<Selector> = Lazy::new(|| Selector::parse("img").unwrap());
    document
        .select(&IMG)
        .find_map(|img| image_from_element(img, base_url))
}

/// Pulls an image URL out of an element: srcset (best candidate) first,
/// then src and common lazy-loading attributes, then nested `<source>` tags
fn image_from_element(element: scraper::ElementRef<'_>, base_url: &str) -> Option<String> {
    if let Some(srcset) = element
        .value()
        .attr("srcset")
        .or_else(|| element.value().attr("data-srcset"))
    {
        if let Some(url) = best_srcset_candidate(srcset, base_url) {
            return Some(url);
        }
    }
    for attr in ["src", "data-src", "data-nuxt-img"] {
        if let Some(value) = element.value().attr(attr) {
            return absolutize(base_url, value);
        }
    }
    static SOURCE: Lazy<Selector> = Lazy::new(|| Selector::parse("source").unwrap());
    for source in element.select(&SOURCE) {
        if let Some(srcset) = source
            .value()
            .attr("srcset")
            .or_else(|| source.value().attr("data-srcset"))
        {
            if let Some(url) = best_srcset_candidate(srcset, base_url) {
                return Some(url);
            }
        }
    }
    None
}

/// Picks the srcset candidate with the highest width descriptor; width
/// descriptors (`640w`) outrank density descriptors (`2x`)
fn best_srcset_candidate(srcset: &str, base_url: &str) -> Option<String> {
    let mut best: Option<(u8, f64, &str)> = None;
    for candidate in srcset.split(',') {
        let mut parts = candidate.split_whitespace();
        let Some(url_part) = parts.next() else {
            continue;
        };
        let descriptor = parts.next().unwrap_or("");
        let (priority, score) = if let Some(width) = descriptor.strip_suffix('w') {
            (2u8, width.parse::<f64>().unwrap_or(0.0))
        } else if let Some(density) = descriptor.strip_suffix('x') {
            (1, density.parse::<f64>().unwrap_or(0.0))
        } else {
            (0, 0.0)
        };
        let better = match &best {
            Some((best_priority, best_score, _)) => {
                priority > *best_priority || (priority == *best_priority && score > *best_score)
            }
            None => true,
        };
        if better {
            best = Some((priority, score, url_part));
        }
    }
    best.and_then(|(_, _, url)| absolutize(base_url, url))
}

fn extract_title(document: &Html) -> Option<String> {
    static OG_TITLE: Lazy<Selector> =
        Lazy::new(|| Selector::parse(r#"meta[property="og:title"]"#).unwrap());
    static TITLE: Lazy<Selector> = Lazy::new(|| Selector::parse("title").unwrap());
    static H1: Lazy<Selector> = Lazy::new(|| Selector::parse("h1").unwrap());

    if let Some(content) = document
        .select(&OG_TITLE)
        .next()
        .and_then(|meta| meta.value().attr("content"))
    {
        let trimmed = content.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }
    for selector in [&*TITLE, &*H1] {
        if let Some(text) = document.select(selector).next() {
            let joined = text.text().collect::<String>().trim().to_string();
            if !joined.is_empty() {
                return Some(joined);
            }
        }
    }
    None
}

/// First selector in the fallback list that yields non-empty text wins
fn select_first_text(document: &Html, selectors: &SelectorList) -> Option<String> {
    for raw in selectors.iter() {
        let Ok(selector) = Selector::parse(raw) else {
            continue;
        };
        if let Some(element) = document.select(&selector).next() {
            let text = element
                .text()
                .collect::<Vec<_>>()
                .join(" ")
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ");
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    None
}

/// Resolves an extracted href against the page URL
fn absolutize(base_url: &str, href: &str) -> Option<String> {
    Url::parse(base_url)
        .and_then(|base| base.join(href))
        .map(|url| url.to_string())
        .ok()
}

static PRICE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d[\d\s.,]*)(?:\s*(₽|руб(?:\.|ль|ля|лей)?))?").unwrap());

/// Normalizes raw price text into `"<amount> <currency>"`, keeping the
/// ruble marker when present
fn clean_price(value: &str) -> Option<String> {
    let normalized = value.replace('\u{a0}', " ");
    let normalized = normalized.trim();
    if normalized.is_empty() {
        return None;
    }
    let captures = PRICE_PATTERN.captures(normalized)?;
    let amount = captures
        .get(1)
        .map(|m| m.as_str())
        .unwrap_or("")
        .replace(|c: char| !c.is_ascii_digit() && c != '.' && c != ',', " ");
    let amount = amount.split_whitespace().collect::<Vec<_>>().join(" ");
    if amount.is_empty() {
        return None;
    }
    let currency = match captures.get(2).map(|m| m.as_str()) {
        Some("₽") => "₽",
        Some(word) if word.to_lowercase().starts_with("руб") => "руб.",
        _ if normalized.contains('₽') => "₽",
        _ => "",
    };
    if currency.is_empty() {
        Some(amount)
    } else {
        Some(format!("{} {}", amount, currency))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selectors() -> SelectorConfig {
        serde_yaml::from_str("product_link_selector: \"a.product\"").unwrap()
    }

    #[test]
    fn test_text_strips_scripts_and_normalizes_whitespace() {
        let html = r#"<html><body>
            <h1>Green   tea</h1>
            <script>var x = 1;</script>
            <style>.a{}</style>
            <p>Loose leaf,
            100g</p>
        </body></html>"#;
        let content = extract_content(html, "https://x.ru/a", &selectors());
        assert_eq!(content.text.as_deref(), Some("Green tea Loose leaf, 100g"));
    }

    #[test]
    fn test_drop_after_truncates_inclusive() {
        let html = r#"<html><body>
            <p>Description</p>
            <div class="reviews">Review text</div>
            <footer>Footer text</footer>
        </body></html>"#;
        let mut config = selectors();
        config.content_drop_after = vec![".reviews".to_string()];
        let content = extract_content(html, "https://x.ru/a", &config);
        let text = content.text.unwrap();
        assert!(text.contains("Description"));
        assert!(!text.contains("Review text"));
        assert!(!text.contains("Footer text"));
    }

    #[test]
    fn test_exclude_selectors_remove_subtrees() {
        let html = r#"<html><body>
            <p>Keep</p><div class="ads">Drop this</div><p>Also keep</p>
        </body></html>"#;
        let mut config = selectors();
        config.exclude_selectors = vec![".ads".to_string()];
        let content = extract_content(html, "https://x.ru/a", &config);
        assert_eq!(content.text.as_deref(), Some("Keep Also keep"));
    }

    #[test]
    fn test_og_image_wins_over_img() {
        let html = r#"<html><head>
            <meta property="og:image" content="/img/main.jpg">
            </head><body><img src="/img/thumb.jpg"></body></html>"#;
        let content = extract_content(html, "https://x.ru/a", &selectors());
        assert_eq!(content.image_url.as_deref(), Some("https://x.ru/img/main.jpg"));
    }

    #[test]
    fn test_srcset_picks_highest_width() {
        let html = r#"<html><body>
            <img srcset="/img/s.jpg 320w, /img/l.jpg 1280w, /img/m.jpg 640w">
        </body></html>"#;
        let content = extract_content(html, "https://x.ru/a", &selectors());
        assert_eq!(content.image_url.as_deref(), Some("https://x.ru/img/l.jpg"));
    }

    #[test]
    fn test_plain_src_fallback() {
        let html = r#"<html><body><img src="/img/only.png"></body></html>"#;
        let content = extract_content(html, "https://x.ru/a", &selectors());
        assert_eq!(content.image_url.as_deref(), Some("https://x.ru/img/only.png"));
    }

    #[test]
    fn test_title_ladder() {
        let html = r#"<html><head><title>Fallback</title>
            <meta property="og:title" content="OG name"></head><body></body></html>"#;
        let content = extract_content(html, "https://x.ru/a", &selectors());
        assert_eq!(content.title.as_deref(), Some("OG name"));
    }

    #[test]
    fn test_price_selector_fallback_list() {
        let html = r#"<html><body><span class="price">1 290 ₽</span></body></html>"#;
        let mut config = selectors();
        config.price_with_discount_selector =
            serde_yaml::from_str("[\".price-new\", \".price\"]").unwrap();
        let content = extract_content(html, "https://x.ru/a", &config);
        assert_eq!(content.price_with_discount.as_deref(), Some("1 290 ₽"));
    }

    #[test]
    fn test_clean_price_variants() {
        assert_eq!(clean_price("1 290 ₽").as_deref(), Some("1 290 ₽"));
        assert_eq!(clean_price("1290 руб.").as_deref(), Some("1290 руб."));
        assert_eq!(clean_price("от 990 рублей").as_deref(), Some("990 руб."));
        assert_eq!(clean_price("   ").as_deref(), None);
        assert_eq!(clean_price("нет в наличии").as_deref(), None);
    }
}
