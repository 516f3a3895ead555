//! Identifier normalisation and provider discovery (XRDS and HTML link tags).

use crate::error::OpenIdError;
use crate::http::{HttpClient, HttpResponse};
use crate::openid::{PendingDiscovery, ProtocolVersion};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;
use url::Url;

const XRDS_ACCEPT: &str = "application/xrds+xml, text/html;q=0.9, */*;q=0.1";
const XRDS_LOCATION: &str = "x-xrds-location";

const TYPE_OP_SERVER: &str = "http://specs.openid.net/auth/2.0/server";
const TYPE_SIGNON_2: &str = "http://specs.openid.net/auth/2.0/signon";
const TYPE_SIGNON_11: &str = "http://openid.net/signon/1.1";
const TYPE_SIGNON_10: &str = "http://openid.net/signon/1.0";

static SERVICE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(?:[a-z0-9_]+:)?Service\b([^>]*)>(.*?)</(?:[a-z0-9_]+:)?Service\s*>")
        .expect("static regex")
});
static TYPE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(?:[a-z0-9_]+:)?Type\b[^>]*>\s*(.*?)\s*</(?:[a-z0-9_]+:)?Type\s*>")
        .expect("static regex")
});
static URI_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(?:[a-z0-9_]+:)?URI\b([^>]*)>\s*(.*?)\s*</(?:[a-z0-9_]+:)?URI\s*>")
        .expect("static regex")
});
static LOCAL_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(?:[a-z0-9_]+:)?LocalID\b[^>]*>\s*(.*?)\s*</(?:[a-z0-9_]+:)?LocalID\s*>")
        .expect("static regex")
});
static DELEGATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(?:[a-z0-9_]+:)?Delegate\b[^>]*>\s*(.*?)\s*</(?:[a-z0-9_]+:)?Delegate\s*>")
        .expect("static regex")
});
static PRIORITY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)priority\s*=\s*["'](\d+)["']"#).expect("static regex"));
static LINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<link\b([^>]*)>").expect("static regex"));
static ATTR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)([a-z][a-z0-9_:-]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#)
        .expect("static regex")
});

/// Normalise a user-supplied identifier into the URL discovery starts from.
pub fn normalize_identifier(identifier: &str) -> Result<Url, OpenIdError> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        return Err(OpenIdError::Discovery("empty identifier".into()));
    }
    if trimmed.starts_with("xri://")
        || trimmed.starts_with(['=', '@', '+', '$', '!', '('])
    {
        return Err(OpenIdError::UnsupportedIdentifier(format!(
            "{trimmed} (XRI resolution is not supported)"
        )));
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    let mut url = Url::parse(&with_scheme)
        .map_err(|e| OpenIdError::Discovery(format!("{trimmed} is not a valid URL: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(OpenIdError::UnsupportedIdentifier(trimmed.to_string()));
    }
    url.set_fragment(None);
    Ok(url)
}

/// Strip the fragment from an identifier URL.
pub fn without_fragment(identifier: &str) -> &str {
    identifier.split('#').next().unwrap_or(identifier)
}

/// Discover provider endpoints for `identifier`, preferred endpoint first.
#[tracing::instrument(skip(http))]
pub async fn discover(
    http: &HttpClient,
    identifier: &str,
) -> Result<Vec<PendingDiscovery>, OpenIdError> {
    let url = normalize_identifier(identifier)?;
    let response = http.get(&url, Some(XRDS_ACCEPT)).await?;
    if !response.status.is_success() {
        return Err(OpenIdError::Discovery(format!(
            "HTTP {} fetching {url}",
            response.status
        )));
    }
    let claimed_id = response.final_url.to_string();

    if is_xrds(&response) {
        let endpoints = parse_xrds(&response.text(), &claimed_id);
        if !endpoints.is_empty() {
            return Ok(endpoints);
        }
    } else if let Some(location) = response
        .headers
        .get(XRDS_LOCATION)
        .and_then(|v| v.to_str().ok())
    {
        match response.final_url.join(location) {
            Ok(xrds_url) => {
                debug!(%xrds_url, "following X-XRDS-Location");
                let xrds = http.get(&xrds_url, Some(XRDS_ACCEPT)).await?;
                if xrds.status.is_success() {
                    let endpoints = parse_xrds(&xrds.text(), &claimed_id);
                    if !endpoints.is_empty() {
                        return Ok(endpoints);
                    }
                }
            }
            Err(e) => debug!("ignoring bad X-XRDS-Location {location}: {e}"),
        }
    }

    let endpoints = parse_html(&response.text(), &claimed_id);
    if endpoints.is_empty() {
        return Err(OpenIdError::Discovery(format!(
            "No OpenID services found for {url}"
        )));
    }
    Ok(endpoints)
}

fn is_xrds(response: &HttpResponse) -> bool {
    response
        .content_type()
        .map(|ct| ct.to_ascii_lowercase().starts_with("application/xrds+xml"))
        .unwrap_or(false)
}

fn priority(attrs: &str) -> u32 {
    PRIORITY_RE
        .captures(attrs)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(u32::MAX)
}

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// OpenID services of an XRDS document; OP identifier services sort first.
pub fn parse_xrds(body: &str, claimed_id: &str) -> Vec<PendingDiscovery> {
    let mut services: Vec<(u32, PendingDiscovery)> = Vec::new();

    for service in SERVICE_RE.captures_iter(body) {
        let service_priority = priority(&service[1]);
        let content = &service[2];
        let types: Vec<String> = TYPE_RE
            .captures_iter(content)
            .map(|c| c[1].trim().to_string())
            .collect();
        let Some(server_url) = URI_RE
            .captures_iter(content)
            .map(|c| (priority(&c[1]), unescape(c[2].trim())))
            .min_by_key(|(p, _)| *p)
            .map(|(_, uri)| uri)
        else {
            continue;
        };

        let has = |t: &str| types.iter().any(|x| x == t);
        let endpoint = if has(TYPE_OP_SERVER) {
            PendingDiscovery {
                server_url,
                claimed_id: None,
                local_id: None,
                version: ProtocolVersion::V2,
                op_identifier: true,
            }
        } else if has(TYPE_SIGNON_2) {
            PendingDiscovery {
                server_url,
                claimed_id: Some(claimed_id.to_string()),
                local_id: LOCAL_ID_RE
                    .captures(content)
                    .map(|c| unescape(c[1].trim())),
                version: ProtocolVersion::V2,
                op_identifier: false,
            }
        } else if has(TYPE_SIGNON_11) || has(TYPE_SIGNON_10) {
            PendingDiscovery {
                server_url,
                claimed_id: Some(claimed_id.to_string()),
                local_id: DELEGATE_RE
                    .captures(content)
                    .map(|c| unescape(c[1].trim())),
                version: ProtocolVersion::V1,
                op_identifier: false,
            }
        } else {
            continue;
        };
        services.push((service_priority, endpoint));
    }

    services.sort_by_key(|(p, e)| (!e.op_identifier, e.version == ProtocolVersion::V1, *p));
    services.into_iter().map(|(_, e)| e).collect()
}

/// OpenID endpoints advertised through `<link rel=...>` tags.
pub fn parse_html(body: &str, claimed_id: &str) -> Vec<PendingDiscovery> {
    let mut provider2 = None;
    let mut local_id2 = None;
    let mut server1 = None;
    let mut delegate1 = None;

    for link in LINK_RE.captures_iter(body) {
        let mut rel = None;
        let mut href = None;
        for attr in ATTR_RE.captures_iter(&link[1]) {
            let value = attr
                .get(2)
                .or_else(|| attr.get(3))
                .or_else(|| attr.get(4))
                .map(|m| unescape(m.as_str()));
            match attr[1].to_ascii_lowercase().as_str() {
                "rel" => rel = value,
                "href" => href = value,
                _ => {}
            }
        }
        let (Some(rel), Some(href)) = (rel, href) else {
            continue;
        };
        for token in rel.split_whitespace() {
            match token.to_ascii_lowercase().as_str() {
                "openid2.provider" => provider2 = provider2.or(Some(href.clone())),
                "openid2.local_id" => local_id2 = local_id2.or(Some(href.clone())),
                "openid.server" => server1 = server1.or(Some(href.clone())),
                "openid.delegate" => delegate1 = delegate1.or(Some(href.clone())),
                _ => {}
            }
        }
    }

    let mut endpoints = Vec::new();
    if let Some(server_url) = provider2 {
        endpoints.push(PendingDiscovery {
            server_url,
            claimed_id: Some(claimed_id.to_string()),
            local_id: local_id2,
            version: ProtocolVersion::V2,
            op_identifier: false,
        });
    }
    if let Some(server_url) = server1 {
        endpoints.push(PendingDiscovery {
            server_url,
            claimed_id: Some(claimed_id.to_string()),
            local_id: delegate1,
            version: ProtocolVersion::V1,
            op_identifier: false,
        });
    }
    endpoints
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_identifiers() {
        assert_eq!(
            normalize_identifier("example.com").unwrap().as_str(),
            "http://example.com/"
        );
        assert_eq!(
            normalize_identifier(" https://example.com/user#frag ")
                .unwrap()
                .as_str(),
            "https://example.com/user"
        );
        assert!(matches!(
            normalize_identifier("=example"),
            Err(OpenIdError::UnsupportedIdentifier(_))
        ));
        assert!(matches!(
            normalize_identifier("ftp://example.com"),
            Err(OpenIdError::UnsupportedIdentifier(_))
        ));
        assert!(normalize_identifier("").is_err());
    }

    #[test]
    fn html_links_v2_preferred() {
        let html = r#"<html><head>
            <link rel="openid.server" href="https://op.example/v1">
            <link href='https://op.example/auth?a=1&amp;b=2' rel='openid2.provider openid.server'>
            <link rel="openid2.local_id" href="https://op.example/user/bob">
        </head></html>"#;
        let eps = parse_html(html, "https://bob.example/");
        assert_eq!(eps.len(), 2);
        assert_eq!(eps[0].version, ProtocolVersion::V2);
        assert_eq!(eps[0].server_url, "https://op.example/auth?a=1&b=2");
        assert_eq!(eps[0].local_id.as_deref(), Some("https://op.example/user/bob"));
        assert_eq!(eps[0].claimed_id.as_deref(), Some("https://bob.example/"));
        assert_eq!(eps[1].version, ProtocolVersion::V1);
        assert_eq!(eps[1].server_url, "https://op.example/v1");
    }

    #[test]
    fn html_without_links_is_empty() {
        assert!(parse_html("<html><head></head></html>", "https://x/").is_empty());
    }

    #[test]
    fn xrds_services_ordered() {
        let xrds = r#"<?xml version="1.0" encoding="UTF-8"?>
<xrds:XRDS xmlns:xrds="xri://$xrds" xmlns="xri://$xrd*($v*2.0)">
  <XRD>
    <Service priority="20">
      <Type>http://specs.openid.net/auth/2.0/signon</Type>
      <URI priority="5">https://op.example/low</URI>
      <URI priority="1">https://op.example/high</URI>
      <LocalID>https://op.example/id/bob</LocalID>
    </Service>
    <Service priority="30">
      <Type>http://specs.openid.net/auth/2.0/server</Type>
      <URI>https://op.example/select</URI>
    </Service>
    <Service priority="10">
      <Type>http://example.com/unrelated</Type>
      <URI>https://other.example/</URI>
    </Service>
  </XRD>
</xrds:XRDS>"#;
        let eps = parse_xrds(xrds, "https://bob.example/");
        assert_eq!(eps.len(), 2);
        assert!(eps[0].op_identifier);
        assert_eq!(eps[0].server_url, "https://op.example/select");
        assert_eq!(eps[1].server_url, "https://op.example/high");
        assert_eq!(eps[1].local_id.as_deref(), Some("https://op.example/id/bob"));
    }

    #[test]
    fn fragment_stripping() {
        assert_eq!(without_fragment("https://x/#a"), "https://x/");
        assert_eq!(without_fragment("https://x/"), "https://x/");
    }
}
