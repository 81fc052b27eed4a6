//! Best-effort OpenGraph link previews for chat messages.
//!
//! One bounded fetch per chat message containing a URL: 4 s timeout,
//! 256 KB body cap, at most 3 redirects. Failure just means no
//! `link_preview` broadcast.

use std::time::Duration;
use tracing::debug;

pub const FETCH_TIMEOUT: Duration = Duration::from_secs(4);
pub const MAX_REDIRECTS: usize = 3;
pub const MAX_BODY: usize = 256 * 1024;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Preview {
    pub title: Option<String>,
    pub description: Option<String>,
    pub image: Option<String>,
}

pub fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .build()
        .expect("reqwest client")
}

/// First HTTP(S) URL in a message, if any.
pub fn find_url(text: &str) -> Option<&str> {
    let start = text
        .find("https://")
        .or_else(|| text.find("http://"))?;
    let tail = &text[start..];
    let end = tail
        .find(|c: char| c.is_whitespace() || c == '"' || c == '<' || c == '>')
        .unwrap_or(tail.len());
    let url = &tail[..end];
    // A bare scheme is not a link.
    (url.splitn(2, "://").nth(1).is_some_and(|rest| !rest.is_empty())).then_some(url)
}

/// Fetch a page and extract its OpenGraph metadata.
pub async fn fetch_preview(client: &reqwest::Client, url: &str) -> Option<Preview> {
    let resp = match client.get(url).send().await {
        Ok(resp) if resp.status().is_success() => resp,
        Ok(resp) => {
            debug!(%url, status = %resp.status(), "preview fetch non-success");
            return None;
        }
        Err(e) => {
            debug!(%url, "preview fetch failed: {e}");
            return None;
        }
    };

    let mut body: Vec<u8> = Vec::new();
    let mut resp = resp;
    while let Ok(Some(chunk)) = resp.chunk().await {
        let take = chunk.len().min(MAX_BODY - body.len());
        body.extend_from_slice(&chunk[..take]);
        if body.len() >= MAX_BODY {
            break;
        }
    }

    let html = String::from_utf8_lossy(&body);
    let preview = extract(&html);
    (preview != Preview::default()).then_some(preview)
}

/// Pull og:title / og:description / og:image out of the page head,
/// falling back to `<title>` for the title.
pub fn extract(html: &str) -> Preview {
    Preview {
        title: meta_content(html, "og:title").or_else(|| title_tag(html)),
        description: meta_content(html, "og:description"),
        image: meta_content(html, "og:image"),
    }
}

fn meta_content(html: &str, property: &str) -> Option<String> {
    let mut rest = html;
    while let Some(pos) = rest.find("<meta") {
        rest = &rest[pos..];
        let end = rest.find('>').unwrap_or(rest.len());
        let tag = &rest[..end];
        if attr_value(tag, "property").as_deref() == Some(property)
            || attr_value(tag, "name").as_deref() == Some(property)
        {
            if let Some(content) = attr_value(tag, "content") {
                let content = unescape(&content);
                if !content.is_empty() {
                    return Some(content);
                }
            }
        }
        rest = &rest[end.min(rest.len() - 1) + 1..];
    }
    None
}

fn title_tag(html: &str) -> Option<String> {
    let start = html.find("<title")?;
    let open_end = html[start..].find('>')? + start + 1;
    let close = html[open_end..].find("</title>")? + open_end;
    let title = unescape(html[open_end..close].trim());
    (!title.is_empty()).then_some(title)
}

fn attr_value(tag: &str, attr: &str) -> Option<String> {
    let mut search = 0;
    while let Some(rel) = tag[search..].find(attr) {
        let pos = search + rel;
        let after = &tag[pos + attr.len()..];
        let after = after.trim_start();
        if let Some(rest) = after.strip_prefix('=') {
            let rest = rest.trim_start();
            let quote = rest.chars().next()?;
            if quote == '"' || quote == '\'' {
                let inner = &rest[1..];
                let end = inner.find(quote)?;
                return Some(inner[..end].to_string());
            }
        }
        search = pos + attr.len();
    }
    None
}

fn unescape(s: &str) -> String {
    s.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
}
