/*
 * SPDX-FileCopyrightText: 2026 Unifeed Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::http_fetch::{FetchRequest, Transport};
use crate::protocol::find_urls;
use std::sync::Arc;
use tracing::{debug, warn};

/// One shortening service. `fqdn` doubles as the already-shortened check.
#[derive(Debug, Clone, Copy)]
pub struct Provider {
    pub name: &'static str,
    pub fqdn: &'static str,
    request: RequestStyle,
    response: ResponseStyle,
}

#[derive(Debug, Clone, Copy)]
enum RequestStyle {
    /// GET with the encoded long URL substituted into a template.
    Get(&'static str),
    /// POST of a form body with the encoded long URL substituted in.
    PostForm(&'static str, &'static str),
}

#[derive(Debug, Clone, Copy)]
enum ResponseStyle {
    /// The short URL is the whole response body.
    Bare,
    /// The short URL is the anchor text inside the `<p class="success">`
    /// element of an HTML reply.
    SuccessAnchor,
}

pub const PROVIDERS: &[Provider] = &[
    Provider {
        name: "is.gd",
        fqdn: "http://is.gd",
        request: RequestStyle::Get("http://is.gd/api.php?longurl={}"),
        response: ResponseStyle::Bare,
    },
    Provider {
        name: "tinyurl.com",
        fqdn: "http://tinyurl.com",
        request: RequestStyle::Get("http://tinyurl.com/api-create.php?url={}"),
        response: ResponseStyle::Bare,
    },
    Provider {
        name: "ur1.ca",
        fqdn: "http://ur1.ca",
        request: RequestStyle::PostForm("http://ur1.ca/", "submit=Make+it+an+ur1%21&longurl={}"),
        response: ResponseStyle::SuccessAnchor,
    },
];

/// True when the URL already points at a known shortening service.
pub fn is_shortened(url: &str) -> bool {
    PROVIDERS.iter().any(|p| url.starts_with(p.fqdn))
}

/// URL-shortening pass applied to outgoing text. An unknown or unset
/// provider shortens nothing, and every failure falls back to the original
/// URL, so this can never make a message unsendable.
#[derive(Clone)]
pub struct Shortener {
    provider: Option<&'static Provider>,
    transport: Arc<dyn Transport>,
}

impl Shortener {
    pub fn lookup(name: &str, transport: Arc<dyn Transport>) -> Self {
        let provider = PROVIDERS.iter().find(|p| p.name == name);
        if provider.is_none() && !name.is_empty() {
            debug!(provider = name, "unknown url shortener, shortening disabled");
        }
        Self {
            provider,
            transport,
        }
    }

    pub fn disabled(transport: Arc<dyn Transport>) -> Self {
        Self {
            provider: None,
            transport,
        }
    }

    pub fn provider_name(&self) -> Option<&'static str> {
        self.provider.map(|p| p.name)
    }

    /// Shorten one URL, returning the original on any failure or when it is
    /// already short.
    pub async fn shorten(&self, url: &str) -> String {
        let Some(provider) = self.provider else {
            return url.to_string();
        };
        if is_shortened(url) {
            return url.to_string();
        }

        let encoded = urlencoding::encode(url);
        let req = match provider.request {
            RequestStyle::Get(template) => FetchRequest::get(template.replace("{}", &encoded)),
            RequestStyle::PostForm(endpoint, body) => {
                FetchRequest::post(endpoint, body.replace("{}", &encoded).into_bytes())
                    .header("Content-Type", "application/x-www-form-urlencoded")
            }
        };

        match self.transport.fetch(req).await {
            Ok(resp) if resp.is_success() => {
                let body = String::from_utf8_lossy(&resp.body);
                let short = match provider.response {
                    ResponseStyle::Bare => {
                        let trimmed = body.trim();
                        (trimmed.starts_with("http")
                            && !trimmed.contains(char::is_whitespace))
                        .then(|| trimmed.to_string())
                    }
                    ResponseStyle::SuccessAnchor => {
                        extract_success_anchor(&body).filter(|s| s.starts_with("http"))
                    }
                };
                match short {
                    Some(short) => short,
                    None => {
                        warn!(provider = provider.name, "shortener returned junk");
                        url.to_string()
                    }
                }
            }
            Ok(resp) => {
                warn!(provider = provider.name, status = resp.status, "shortener failed");
                url.to_string()
            }
            Err(e) => {
                warn!(provider = provider.name, "shortener failed: {e}");
                url.to_string()
            }
        }
    }

    /// Shorten every URL found in outgoing message text.
    pub async fn shorten_text(&self, text: &str) -> String {
        if self.provider.is_none() {
            return text.to_string();
        }
        let ranges = find_urls(text);
        if ranges.is_empty() {
            return text.to_string();
        }
        let mut out = String::with_capacity(text.len());
        let mut at = 0;
        for (start, end) in ranges {
            out.push_str(&text[at..start]);
            out.push_str(&self.shorten(&text[start..end]).await);
            at = end;
        }
        out.push_str(&text[at..]);
        out
    }
}

/// Pull the short URL out of ur1.ca's HTML reply. The page as a whole is not
/// well-formed markup, so locate the success landmark and read the anchor
/// text inside it by hand.
fn extract_success_anchor(body: &str) -> Option<String> {
    let start = body.find("<p class=\"success\">")?;
    let end = start + body[start..].find("</p>")?;
    let para = &body[start..end];
    let anchor = para.find("<a ")?;
    let text_start = anchor + para[anchor..].find('>')? + 1;
    let text_end = text_start + para[text_start..].find("</a>")?;
    let text = para[text_start..text_end].trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}
