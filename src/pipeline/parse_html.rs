// src/pipeline/parse_html.rs
// =============================================================================
// Extracts links from HTML responses.
//
// We use the `scraper` crate which:
// - Parses HTML into a DOM (built on html5ever)
// - Supports CSS selectors for finding elements
//
// Every <a href> is resolved against the response's final URL. Anchors,
// mailto:, tel: and javascript: links are skipped, and only http(s) results
// are kept. The links land in Response::links for the callback to follow.
// =============================================================================

use scraper::{Html, Selector};
use url::Url;

use super::ResponseInterceptor;
use crate::request::Response;

pub struct ParseHtml;

impl ResponseInterceptor for ParseHtml {
    fn process(&self, res: &mut Response) {
        if res.body.is_empty() || !res.is_html() {
            return;
        }
        res.links = extract_links(res);
    }
}

// Returns every followable link of the page, in document order
pub fn extract_links(res: &Response) -> Vec<Url> {
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    let document = Html::parse_document(&res.text());

    document
        .select(&selector)
        .filter_map(|element| element.value().attr("href"))
        .filter_map(|href| res.join_url(href.trim()))
        .filter(|url| url.scheme() == "http" || url.scheme() == "https")
        .collect()
}

// -----------------------------------------------------------------------------
// NOTES:
//
// 1. Why resolve against res.url and not the request URL?
//    - After a redirect the page lives somewhere else
//    - Relative links are relative to where the browser ended up
//
// 2. Why `let ... else` on the selector?
//    - Selector::parse returns a Result even for constant selectors
//    - Falling back to "no links" keeps a bad selector from taking the
//      crawl down
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Request;
    use bytes::Bytes;
    use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
    use reqwest::StatusCode;
    use std::sync::Arc;

    fn html_response(url: &str, html: &'static str) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
        let req = Arc::new(Request::get(url).unwrap());
        Response::new(req, StatusCode::OK, headers, Bytes::from_static(html.as_bytes()))
    }

    fn links(res: &Response) -> Vec<String> {
        res.links.iter().map(|u| u.to_string()).collect()
    }

    #[test]
    fn test_extract_absolute_link() {
        let mut res = html_response(
            "https://example.com",
            r#"<a href="https://www.rust-lang.org">Rust</a>"#,
        );
        ParseHtml.process(&mut res);
        assert_eq!(links(&res), vec!["https://www.rust-lang.org/"]);
    }

    #[test]
    fn test_resolve_relative_link() {
        let mut res = html_response("https://example.com/page", r#"<a href="/docs">Docs</a>"#);
        ParseHtml.process(&mut res);
        assert_eq!(links(&res), vec!["https://example.com/docs"]);
    }

    #[test]
    fn test_skip_special_links() {
        let mut res = html_response(
            "https://example.com",
            r##"<a href="mailto:test@example.com">Email</a>
                <a href="#top">Top</a>
                <a href="ftp://example.com/file">FTP</a>"##,
        );
        ParseHtml.process(&mut res);
        assert!(res.links.is_empty());
    }

    #[test]
    fn test_multiple_links() {
        let mut res = html_response(
            "https://example.com/page/",
            r#"
                <a href="https://rust-lang.org">Rust</a>
                <a href="/docs">Docs</a>
                <a href="../about">About</a>
            "#,
        );
        ParseHtml.process(&mut res);
        assert_eq!(res.links.len(), 3);
    }

    #[test]
    fn test_resolves_against_final_url() {
        let mut res = html_response("https://example.com/old/", r#"<a href="next">Next</a>"#);
        res.url = Url::parse("https://example.com/new/").unwrap();
        ParseHtml.process(&mut res);
        assert_eq!(links(&res), vec!["https://example.com/new/next"]);
    }

    #[test]
    fn test_non_html_is_ignored() {
        let mut res = html_response("https://example.com/", r#"<a href="/x">x</a>"#);
        res.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        ParseHtml.process(&mut res);
        assert!(res.links.is_empty());
    }
}
