// -------------------------
// Listing scraper (auto-paging; per-page client reset)
// -------------------------

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use rand::{Rng, rng};
use reqwest::header::{
    ACCEPT, ACCEPT_LANGUAGE, CACHE_CONTROL, CONNECTION, DNT, HeaderMap, HeaderName, HeaderValue,
    PRAGMA, REFERER, UPGRADE_INSECURE_REQUESTS, USER_AGENT,
};
use robotstxt::DefaultMatcher;
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ScrapeConfig;

const FETCH_ATTEMPTS: usize = 5;

/// CSS selectors for one listing card and its fields, relative to the card.
#[derive(Debug, Clone)]
pub struct ListingSelectors {
    pub card: String,
    pub name: String,
    pub link: String,
    pub address: String,
}

impl Default for ListingSelectors {
    fn default() -> Self {
        Self {
            card: "article.listing".to_string(),
            name: ".listing-name".to_string(),
            link: "a.listing-link".to_string(),
            address: ".listing-address".to_string(),
        }
    }
}

pub struct CompiledSelectors {
    card: Selector,
    name: Selector,
    link: Selector,
    address: Selector,
}

impl ListingSelectors {
    pub fn compile(&self) -> Result<CompiledSelectors> {
        let parse = |css: &str| {
            Selector::parse(css).map_err(|e| anyhow!("invalid selector {css:?}: {e}"))
        };
        Ok(CompiledSelectors {
            card: parse(&self.card)?,
            name: parse(&self.name)?,
            link: parse(&self.link)?,
            address: parse(&self.address)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Listing {
    pub id: String,
    pub name: String,
    pub listing_url: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ScrapeMeta {
    pub page_count: usize,
    pub total_hits: usize,
    pub next_url: Option<String>,
}

pub struct ListingScraper {
    allowed_hosts: HashSet<String>,
    page_cap: usize,
    selectors: CompiledSelectors,
}

impl ListingScraper {
    pub fn new(cfg: &ScrapeConfig) -> Result<Self> {
        Ok(Self {
            allowed_hosts: cfg.allowed_hosts.iter().cloned().collect(),
            page_cap: cfg.page_cap,
            selectors: cfg.selectors.compile()?,
        })
    }

    pub async fn scrape(
        &self,
        start_url: &str,
        page_range: Option<usize>,
    ) -> Result<(Vec<Listing>, ScrapeMeta)> {
        let url = Url::parse(start_url).context("invalid url")?;
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("url has no host"))?
            .to_ascii_lowercase();
        if !self.allowed_hosts.contains(&host) {
            return Err(anyhow!("domain not in whitelist"));
        }

        let origin = url.origin().ascii_serialization();

        // robots.txt check
        let robots_txt = match reqwest::get(robots_url(&origin)).await {
            Ok(rsp) => rsp.text().await.unwrap_or_default(),
            Err(_) => String::new(),
        };
        let mut robots_matcher = DefaultMatcher::default();
        if !robots_matcher.one_agent_allowed_by_robots(&robots_txt, "Mozilla", start_url) {
            return Err(anyhow!("robots.txt disallows this URL"));
        }

        let (base, mut page) = normalize_pager(&url);
        let max_pages = page_range.unwrap_or(self.page_cap).min(self.page_cap);

        let mut listings: Vec<Listing> = Vec::new();
        let mut seen_ids: HashSet<String> = HashSet::new();
        let mut pages = 0usize;
        let mut last_next_url: Option<String> = None;
        let mut prev_page_url: Option<Url> = None;

        loop {
            if pages >= max_pages {
                info!(max_pages, "reached page cap, stopping");
                break;
            }

            let page_url = build_page_url(&base, page);
            pages += 1;

            // per-page client reset
            let client = reqwest::Client::builder()
                .user_agent(random_desktop_ua())
                .redirect(reqwest::redirect::Policy::limited(8))
                .timeout(Duration::from_secs(25))
                .build()?;

            warmup_hit(&client, &origin).await;

            let referer = prev_page_url
                .as_ref()
                .map(|u| u.as_str().to_string())
                .unwrap_or_else(|| origin.clone());

            let html = retry_fetch_html(&client, &page_url, &referer).await?;

            let mut page_count = 0usize;
            for listing in parse_page(&html, &page_url, &self.selectors) {
                if register_listing(listing, &mut listings, &mut seen_ids) {
                    page_count += 1;
                }
            }

            info!(page, url = %page_url, cards = page_count, total = listings.len(), "scraped page");

            if page_count == 0 {
                last_next_url = None;
                break;
            }
            last_next_url = Some(build_page_url(&base, page + 1).to_string());
            prev_page_url = Some(page_url);
            page += 1;
            sleep(Duration::from_millis(rng().random_range(900..2200))).await;
        }

        let meta = ScrapeMeta {
            page_count: pages,
            total_hits: listings.len(),
            next_url: last_next_url,
        };
        Ok((listings, meta))
    }
}

fn register_listing(
    listing: Listing,
    listings: &mut Vec<Listing>,
    seen: &mut HashSet<String>,
) -> bool {
    if !seen.insert(listing.id.clone()) {
        return false;
    }
    listings.push(listing);
    true
}

// -------------------------
// Fetch helpers
// -------------------------

#[derive(Clone, Copy, Debug)]
enum Profile {
    Desktop,
    Mobile,
}

fn base_headers(profile: Profile, referer: &str) -> HeaderMap {
    let mut h = HeaderMap::new();
    let ua = match profile {
        Profile::Desktop => random_desktop_ua(),
        Profile::Mobile => random_mobile_ua(),
    };
    h.insert(USER_AGENT, HeaderValue::from_static(ua));
    h.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    );
    h.insert(
        ACCEPT_LANGUAGE,
        HeaderValue::from_static("en-US,en;q=0.9"),
    );
    if let Ok(v) = HeaderValue::from_str(referer) {
        h.insert(REFERER, v);
    }
    h.insert(UPGRADE_INSECURE_REQUESTS, HeaderValue::from_static("1"));
    h.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    h.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=0"));
    h.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    h.insert(DNT, HeaderValue::from_static("1"));

    h.insert(
        HeaderName::from_static("sec-fetch-site"),
        HeaderValue::from_static("same-origin"),
    );
    h.insert(
        HeaderName::from_static("sec-fetch-mode"),
        HeaderValue::from_static("navigate"),
    );
    h.insert(
        HeaderName::from_static("sec-fetch-dest"),
        HeaderValue::from_static("document"),
    );
    h
}

async fn warmup_hit(client: &reqwest::Client, origin: &str) {
    let headers = base_headers(Profile::Desktop, origin);
    match client.get(origin).headers(headers).send().await {
        Ok(r) => {
            let _ = r.text().await;
        }
        Err(e) => warn!(error = %e, "warmup request failed"),
    }
}

async fn retry_fetch_html(client: &reqwest::Client, page_url: &Url, referer: &str) -> Result<String> {
    let mut last_err: Option<anyhow::Error> = None;
    let mut profile = Profile::Desktop;

    for _ in 0..FETCH_ATTEMPTS {
        let headers = base_headers(profile, referer);
        match client.get(page_url.as_str()).headers(headers).send().await {
            Ok(rsp) => {
                // Capture these BEFORE .text() (which consumes the response)
                let status = rsp.status();
                let final_url = rsp.url().clone();
                let text = rsp.text().await.unwrap_or_default();

                debug!(
                    url = %page_url,
                    profile = ?profile,
                    status = %status,
                    final_url = %final_url,
                    len = text.len(),
                    "fetched page"
                );

                if status.is_success() && !text.trim().is_empty() {
                    return Ok(text);
                }
                last_err = Some(anyhow!("unusable response: status {status}"));

                // Not good enough, flip profile and back off
                profile = match profile {
                    Profile::Desktop => Profile::Mobile,
                    Profile::Mobile => Profile::Desktop,
                };
            }
            Err(e) => last_err = Some(e.into()),
        }
        sleep(Duration::from_millis(rng().random_range(600..1500))).await;
    }

    Err(last_err.unwrap_or_else(|| anyhow!("failed to fetch page after retries")))
}

// -------------------------
// Parsing helpers
// -------------------------

pub fn parse_page(html: &str, page_url: &Url, sel: &CompiledSelectors) -> Vec<Listing> {
    let doc = Html::parse_document(html);
    doc.select(&sel.card)
        .filter_map(|card| parse_card(&card, page_url, sel))
        .collect()
}

fn parse_card(card: &ElementRef, page_url: &Url, sel: &CompiledSelectors) -> Option<Listing> {
    let name = card
        .select(&sel.name)
        .next()
        .map(|e| collapse_ws(&e.text().collect::<String>()))
        .filter(|n| !n.is_empty())?;

    let href = card
        .select(&sel.link)
        .next()
        .and_then(|a| a.value().attr("href"))
        .or_else(|| card.value().attr("data-href"));
    let listing_url = href
        .and_then(|h| page_url.join(h).ok())
        .map(|u| u.to_string());

    let address = card
        .select(&sel.address)
        .next()
        .map(|e| collapse_ws(&e.text().collect::<String>()))
        .filter(|a| !a.is_empty());

    let id = listing_url
        .as_deref()
        .map(extract_id)
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| name.to_lowercase());

    Some(Listing {
        id,
        name,
        listing_url,
        address,
    })
}

/// Last non-empty path segment of a listing URL.
fn extract_id(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|s| s.filter(|p| !p.is_empty()).last().map(String::from))
        })
        .unwrap_or_default()
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

// -------------------------
// Pager helpers (page=N scheme)
// -------------------------

fn normalize_pager(url: &Url) -> (Url, usize) {
    let mut base = url.clone();

    let mut start_page: usize = 1;
    for (k, v) in url.query_pairs() {
        if k == "page" {
            if let Ok(n) = v.parse::<usize>() {
                start_page = n.max(1);
            }
        }
    }

    let qp: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "page")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if qp.is_empty() {
        base.set_query(None);
    } else {
        base.query_pairs_mut()
            .clear()
            .extend_pairs(qp.iter().map(|(k, v)| (&**k, &**v)));
    }

    (base, start_page)
}

fn robots_url(origin: &str) -> String {
    format!("{origin}/robots.txt")
}

fn build_page_url(base: &Url, page: usize) -> Url {
    let mut u = base.clone();
    u.query_pairs_mut().append_pair("page", &page.to_string());
    u
}

// -------------------------
// Misc helpers
// -------------------------

fn random_desktop_ua() -> &'static str {
    const UAS: &[&str] = &[
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Safari/605.1.15",
    ];
    UAS[rng().random_range(0..UAS.len())]
}

fn random_mobile_ua() -> &'static str {
    const UAS: &[&str] = &[
        "Mozilla/5.0 (Linux; Android 14; Pixel 7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Mobile Safari/537.36",
        "Mozilla/5.0 (iPhone; CPU iPhone OS 17_5 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Mobile/15E148 Safari/604.1",
    ];
    UAS[rng().random_range(0..UAS.len())]
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><body>
          <article class="listing" data-href="/biz/fallback-diner">
            <h3 class="listing-name">  Fallback
               Diner </h3>
          </article>
          <article class="listing">
            <h3 class="listing-name">Tasca do Chico</h3>
            <a class="listing-link" href="/biz/tasca-do-chico?src=search">open</a>
            <p class="listing-address">Rua do Diario 39, Lisboa</p>
          </article>
          <article class="listing">
            <a class="listing-link" href="/biz/nameless">no name</a>
          </article>
        </body></html>"#;

    #[test]
    fn parses_cards_with_fallbacks() {
        let sel = ListingSelectors::default().compile().unwrap();
        let page_url = Url::parse("https://maps.example.com/search?q=restaurants&page=2").unwrap();
        let listings = parse_page(PAGE, &page_url, &sel);
        assert_eq!(listings.len(), 2);

        assert_eq!(listings[0].name, "Fallback Diner");
        assert_eq!(listings[0].id, "fallback-diner");
        assert_eq!(
            listings[0].listing_url.as_deref(),
            Some("https://maps.example.com/biz/fallback-diner")
        );

        assert_eq!(listings[1].name, "Tasca do Chico");
        assert_eq!(listings[1].id, "tasca-do-chico");
        assert_eq!(listings[1].address.as_deref(), Some("Rua do Diario 39, Lisboa"));
    }

    #[test]
    fn pager_strips_and_rebuilds_page_param() {
        let url = Url::parse("https://maps.example.com/search?q=food&page=3").unwrap();
        let (base, start) = normalize_pager(&url);
        assert_eq!(start, 3);
        assert_eq!(base.as_str(), "https://maps.example.com/search?q=food");
        assert_eq!(
            build_page_url(&base, 4).as_str(),
            "https://maps.example.com/search?q=food&page=4"
        );

        let (bare, start) = normalize_pager(&Url::parse("https://maps.example.com/list").unwrap());
        assert_eq!(start, 1);
        assert_eq!(build_page_url(&bare, 1).as_str(), "https://maps.example.com/list?page=1");
    }

    #[test]
    fn robots_url_keeps_the_port() {
        let url = Url::parse("http://maps.example.com:8081/search?q=food").unwrap();
        assert_eq!(
            robots_url(&url.origin().ascii_serialization()),
            "http://maps.example.com:8081/robots.txt"
        );
        let url = Url::parse("https://maps.example.com/search").unwrap();
        assert_eq!(
            robots_url(&url.origin().ascii_serialization()),
            "https://maps.example.com/robots.txt"
        );
    }

    #[test]
    fn duplicate_ids_are_dropped() {
        let mut listings = Vec::new();
        let mut seen = HashSet::new();
        let l = Listing {
            id: "x".to_string(),
            name: "X".to_string(),
            listing_url: None,
            address: None,
        };
        assert!(register_listing(l.clone(), &mut listings, &mut seen));
        assert!(!register_listing(l, &mut listings, &mut seen));
        assert_eq!(listings.len(), 1);
    }

    #[tokio::test]
    async fn rejects_hosts_outside_whitelist() {
        let cfg = ScrapeConfig {
            allowed_hosts: vec!["maps.example.com".to_string()],
            page_cap: 5,
            selectors: ListingSelectors::default(),
        };
        let scraper = ListingScraper::new(&cfg).unwrap();
        let err = scraper
            .scrape("https://elsewhere.example.org/search", None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("whitelist"));
    }
}
