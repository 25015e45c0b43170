//! Breadth-first, same-host site crawler used by the discovery phase.
//!
//! Pages are fetched with `reqwest` and scanned with regexes for links and
//! interactive elements. Each element gets the most stable selector its
//! attributes allow (`data-testid`, then `id`, then `name`, then visible text).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use reqwest::Url;
use tracing::{debug, warn};

use super::models::{DiscoveredPage, ElementKind, PageElement};

static TITLE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap());

static ANCHOR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<a\b([^>]*)>(.*?)</a>").unwrap());

static BUTTON_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<button\b([^>]*)>(.*?)</button>").unwrap());

static FIELD_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<(input|select|textarea|form)\b([^>]*)>").unwrap());

static ATTR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)([a-z_:][-a-z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#).unwrap()
});

static TAG_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());

static SCRIPT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<(script|style)\b.*?</(script|style)>").unwrap());

pub struct Crawler {
    client: reqwest::Client,
}

impl Crawler {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("testforge/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }

    /// Crawl from `start` following same-host links up to `depth` hops,
    /// stopping after `max_pages` pages. Fails only if the start page itself
    /// cannot be fetched.
    pub async fn crawl(
        &self,
        start: &str,
        depth: u32,
        max_pages: usize,
    ) -> Result<Vec<DiscoveredPage>> {
        let start = Url::parse(start).with_context(|| format!("Invalid start URL {}", start))?;
        let host = start.host_str().unwrap_or_default().to_string();

        let mut queue = VecDeque::from([(start.clone(), 0u32)]);
        let mut seen = HashSet::from([start.to_string()]);
        let mut pages = Vec::new();

        while let Some((url, level)) = queue.pop_front() {
            if pages.len() >= max_pages {
                break;
            }
            let html = match self.fetch(&url).await {
                Ok(Some(html)) => html,
                Ok(None) => continue,
                Err(e) if url == start => return Err(e),
                Err(e) => {
                    warn!(url = %url, error = %e, "Skipping page that failed to load");
                    continue;
                }
            };
            let page = extract_page(&url, &html, level);
            debug!(url = %url, elements = page.elements.len(), "Discovered page");

            if level < depth {
                for link in &page.links {
                    let Ok(next) = Url::parse(link) else { continue };
                    if next.host_str() == Some(host.as_str()) && seen.insert(next.to_string()) {
                        queue.push_back((next, level + 1));
                    }
                }
            }
            pages.push(page);
        }
        Ok(pages)
    }

    /// Fetch a page body. `Ok(None)` for non-HTML responses.
    async fn fetch(&self, url: &Url) -> Result<Option<String>> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}", url))?
            .error_for_status()
            .with_context(|| format!("Bad status from {}", url))?;
        let is_html = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_none_or(|ct| ct.contains("html"));
        if !is_html {
            return Ok(None);
        }
        let body = response
            .text()
            .await
            .with_context(|| format!("Failed to read body of {}", url))?;
        Ok(Some(body))
    }
}

/// Extract title, outgoing links and interactive elements from one page.
pub fn extract_page(base: &Url, html: &str, depth: u32) -> DiscoveredPage {
    let html = SCRIPT_REGEX.replace_all(html, "");
    let title = TITLE_REGEX
        .captures(&html)
        .map(|c| visible_text(&c[1]))
        .filter(|t| !t.is_empty());

    let mut elements = Vec::new();
    let mut links = Vec::new();
    let mut seen_links = HashSet::new();

    for cap in ANCHOR_REGEX.captures_iter(&html) {
        let attrs = parse_attrs(&cap[1]);
        let text = non_empty(visible_text(&cap[2]));
        let Some(href) = attrs.get("href") else { continue };
        if let Some(link) = resolve_link(base, href)
            && seen_links.insert(link.clone())
        {
            links.push(link);
        }
        let selector = stable_selector("a", &attrs).or_else(|| {
            text.as_ref()
                .map(|t| format!("a:has-text(\"{}\")", escape_quotes(t)))
        });
        if let Some(selector) = selector {
            elements.push(PageElement {
                kind: ElementKind::Link,
                selector,
                text,
            });
        }
    }

    for cap in BUTTON_REGEX.captures_iter(&html) {
        let attrs = parse_attrs(&cap[1]);
        let text = non_empty(visible_text(&cap[2]));
        let selector = stable_selector("button", &attrs).or_else(|| {
            text.as_ref()
                .map(|t| format!("button:has-text(\"{}\")", escape_quotes(t)))
        });
        if let Some(selector) = selector {
            elements.push(PageElement {
                kind: ElementKind::Button,
                selector,
                text,
            });
        }
    }

    for cap in FIELD_REGEX.captures_iter(&html) {
        let tag = cap[1].to_ascii_lowercase();
        let attrs = parse_attrs(&cap[2]);
        if tag == "input" && attrs.get("type").is_some_and(|t| t == "hidden") {
            continue;
        }
        let kind = match tag.as_str() {
            "select" => ElementKind::Select,
            "textarea" => ElementKind::TextArea,
            "form" => ElementKind::Form,
            _ if attrs
                .get("type")
                .is_some_and(|t| t == "submit" || t == "button") =>
            {
                ElementKind::Button
            }
            _ => ElementKind::Input,
        };
        if let Some(selector) = stable_selector(&tag, &attrs) {
            let text = attrs
                .get("placeholder")
                .or_else(|| attrs.get("aria-label"))
                .or_else(|| attrs.get("value"))
                .cloned();
            elements.push(PageElement {
                kind,
                selector,
                text,
            });
        }
    }

    DiscoveredPage {
        url: base.to_string(),
        title,
        depth,
        elements,
        links,
    }
}

fn parse_attrs(raw: &str) -> HashMap<String, String> {
    ATTR_REGEX
        .captures_iter(raw)
        .map(|c| {
            let value = c
                .get(2)
                .or_else(|| c.get(3))
                .or_else(|| c.get(4))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            (c[1].to_ascii_lowercase(), value)
        })
        .collect()
}

fn stable_selector(tag: &str, attrs: &HashMap<String, String>) -> Option<String> {
    if let Some(test_id) = attrs.get("data-testid").filter(|v| !v.is_empty()) {
        return Some(format!("[data-testid=\"{}\"]", escape_quotes(test_id)));
    }
    if let Some(id) = attrs.get("id").filter(|v| is_css_ident(v)) {
        return Some(format!("#{}", id));
    }
    if let Some(name) = attrs.get("name").filter(|v| !v.is_empty()) {
        return Some(format!("{}[name=\"{}\"]", tag, escape_quotes(name)));
    }
    if let Some(label) = attrs.get("aria-label").filter(|v| !v.is_empty()) {
        return Some(format!("{}[aria-label=\"{}\"]", tag, escape_quotes(label)));
    }
    None
}

fn is_css_ident(value: &str) -> bool {
    let mut chars = value.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn resolve_link(base: &Url, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty()
        || href.starts_with('#')
        || href.starts_with("javascript:")
        || href.starts_with("mailto:")
        || href.starts_with("tel:")
    {
        return None;
    }
    let mut url = base.join(href).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);
    Some(url.to_string())
}

fn visible_text(fragment: &str) -> String {
    let stripped = TAG_REGEX.replace_all(fragment, " ");
    stripped
        .replace("&amp;", "&")
        .replace("&nbsp;", " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() { None } else { Some(text) }
}

fn escape_quotes(value: &str) -> String {
    value.replace('"', "\\\"")
}
