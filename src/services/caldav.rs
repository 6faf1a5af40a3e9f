//! Remote calendar client speaking CalDAV over HTTPS with Basic auth.
//!
//! Discovery follows the usual principal -> calendar-home-set chain. Redirects
//! are followed by hand: providers such as iCloud move every account to a
//! per-user shard host, and the credentials must be re-sent there.

use async_trait::async_trait;
use reqwest::{header, Method, StatusCode};
use url::Url;

use crate::config::CalDavConfig;
use crate::error::{SyncError, SyncResult};

const PROPFIND_PRINCIPAL: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<d:propfind xmlns:d="DAV:">
  <d:prop>
    <d:current-user-principal/>
  </d:prop>
</d:propfind>"#;

const PROPFIND_CALENDAR_HOME: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<d:propfind xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
  <d:prop>
    <c:calendar-home-set/>
  </d:prop>
</d:propfind>"#;

const PROPFIND_CALENDARS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<d:propfind xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav" xmlns:cs="http://calendarserver.org/ns/">
  <d:prop>
    <d:displayname/>
    <d:resourcetype/>
    <c:calendar-description/>
    <cs:getctag/>
  </d:prop>
</d:propfind>"#;

const PROPFIND_ETAG: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<d:propfind xmlns:d="DAV:">
  <d:prop>
    <d:getetag/>
  </d:prop>
</d:propfind>"#;

const REPORT_EVENTS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<c:calendar-query xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
  <d:prop>
    <d:getetag/>
    <c:calendar-data/>
  </d:prop>
  <c:filter>
    <c:comp-filter name="VCALENDAR">
      <c:comp-filter name="VEVENT"/>
    </c:comp-filter>
  </c:filter>
</c:calendar-query>"#;

const XML_CONTENT_TYPE: &str = "application/xml; charset=utf-8";
const ICS_CONTENT_TYPE: &str = "text/calendar; charset=utf-8";

/// Plaintext credentials, only ever held in memory for the length of a run.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &"[REDACTED]")
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RemoteCalendar {
    pub url: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub ctag: Option<String>,
}

/// One calendar object resource as returned by a calendar-query.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteObject {
    pub url: String,
    pub etag: Option<String>,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub url: String,
    pub etag: Option<String>,
}

/// Opens authenticated sessions against a remote calendar server.
#[async_trait]
pub trait CalendarProvider: Send + Sync + 'static {
    /// Fails fast with [`SyncError::Authentication`] when the credentials are rejected.
    async fn connect(&self, credentials: &Credentials) -> SyncResult<Box<dyn CalendarSession>>;
}

#[async_trait]
pub trait CalendarSession: Send + Sync {
    async fn list_calendars(&self) -> SyncResult<Vec<RemoteCalendar>>;

    async fn list_events(&self, calendar_url: &str) -> SyncResult<Vec<RemoteObject>>;

    /// Create or replace `<calendar_url>/<filename>`.
    async fn put_event(
        &self,
        calendar_url: &str,
        filename: &str,
        ics: &str,
    ) -> SyncResult<StoredEvent>;

    /// Replace an event that already exists at `event_url`.
    async fn replace_event(&self, event_url: &str, ics: &str) -> SyncResult<StoredEvent>;

    /// Current ETag of an event, `None` if it no longer exists.
    async fn event_etag(&self, event_url: &str) -> SyncResult<Option<String>>;
}

// ============================================================================
// CalDAV implementation
// ============================================================================

pub struct CalDavProvider {
    client: reqwest::Client,
    server_url: Url,
    max_redirects: usize,
}

impl CalDavProvider {
    pub fn new(config: &CalDavConfig) -> SyncResult<Self> {
        let server_url = Url::parse(&config.server_url).map_err(|e| {
            SyncError::Protocol(format!("invalid CalDAV server URL {}: {}", config.server_url, e))
        })?;
        ensure_secure(&server_url)?;

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| SyncError::Protocol(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            server_url,
            max_redirects: config.max_redirects,
        })
    }
}

#[async_trait]
impl CalendarProvider for CalDavProvider {
    async fn connect(&self, credentials: &Credentials) -> SyncResult<Box<dyn CalendarSession>> {
        let http = DavHttp {
            client: self.client.clone(),
            credentials: credentials.clone(),
            max_redirects: self.max_redirects,
        };

        let (base, body) = http
            .request(propfind(), self.server_url.clone(), Some("0"), Some(PROPFIND_PRINCIPAL))
            .await?;
        let principal_href = find_prop_href(&body, "current-user-principal")?.ok_or_else(|| {
            SyncError::Protocol("server did not report a current-user-principal".to_string())
        })?;
        let principal_url = resolve(&base, &principal_href)?;

        let (base, body) = http
            .request(propfind(), principal_url, Some("0"), Some(PROPFIND_CALENDAR_HOME))
            .await?;
        let home_href = find_prop_href(&body, "calendar-home-set")?.ok_or_else(|| {
            SyncError::Protocol("principal has no calendar-home-set".to_string())
        })?;
        let calendar_home = resolve(&base, &home_href)?;

        tracing::debug!("Discovered calendar home {}", calendar_home);

        Ok(Box::new(CalDavSession {
            http,
            calendar_home,
        }))
    }
}

pub struct CalDavSession {
    http: DavHttp,
    calendar_home: Url,
}

#[async_trait]
impl CalendarSession for CalDavSession {
    async fn list_calendars(&self) -> SyncResult<Vec<RemoteCalendar>> {
        let (base, body) = self
            .http
            .request(
                propfind(),
                self.calendar_home.clone(),
                Some("1"),
                Some(PROPFIND_CALENDARS),
            )
            .await?;

        parse_calendars(&body)?
            .into_iter()
            .map(|mut calendar| {
                calendar.url = resolve(&base, &calendar.url)?.to_string();
                Ok(calendar)
            })
            .collect()
    }

    async fn list_events(&self, calendar_url: &str) -> SyncResult<Vec<RemoteObject>> {
        let url = parse_url(calendar_url)?;
        let (base, body) = self
            .http
            .request(report(), url, Some("1"), Some(REPORT_EVENTS))
            .await?;

        parse_calendar_objects(&body)?
            .into_iter()
            .map(|mut object| {
                object.url = resolve(&base, &object.url)?.to_string();
                Ok(object)
            })
            .collect()
    }

    async fn put_event(
        &self,
        calendar_url: &str,
        filename: &str,
        ics: &str,
    ) -> SyncResult<StoredEvent> {
        let url = collection_url(calendar_url)?
            .join(filename)
            .map_err(|e| SyncError::Protocol(format!("invalid event filename {}: {}", filename, e)))?;
        self.put_at(url, ics).await
    }

    async fn replace_event(&self, event_url: &str, ics: &str) -> SyncResult<StoredEvent> {
        self.put_at(parse_url(event_url)?, ics).await
    }

    async fn event_etag(&self, event_url: &str) -> SyncResult<Option<String>> {
        let url = parse_url(event_url)?;
        match self
            .http
            .request(propfind(), url, Some("0"), Some(PROPFIND_ETAG))
            .await
        {
            Ok((_, body)) => parse_getetag(&body),
            Err(SyncError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl CalDavSession {
    async fn put_at(&self, url: Url, ics: &str) -> SyncResult<StoredEvent> {
        let (final_url, response) = self
            .http
            .send(Method::PUT, url, None, Some((ICS_CONTENT_TYPE, ics)))
            .await?;
        check_status(response.status(), "PUT event")?;

        let header_etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        let etag = match header_etag {
            Some(etag) => Some(etag),
            None => self.event_etag(final_url.as_str()).await?,
        };

        Ok(StoredEvent {
            url: final_url.to_string(),
            etag,
        })
    }
}

/// HTTP plumbing shared by a session: Basic auth on every hop, bounded redirects.
#[derive(Clone)]
struct DavHttp {
    client: reqwest::Client,
    credentials: Credentials,
    max_redirects: usize,
}

impl DavHttp {
    /// Send an XML request and return the final URL together with the checked body.
    async fn request(
        &self,
        method: Method,
        url: Url,
        depth: Option<&str>,
        body: Option<&str>,
    ) -> SyncResult<(Url, String)> {
        let context = method.to_string();
        let (final_url, response) = self
            .send(method, url, depth, body.map(|b| (XML_CONTENT_TYPE, b)))
            .await?;
        check_status(response.status(), &context)?;

        let text = response.text().await.map_err(map_transport_error)?;
        Ok((final_url, text))
    }

    async fn send(
        &self,
        method: Method,
        mut url: Url,
        depth: Option<&str>,
        body: Option<(&str, &str)>,
    ) -> SyncResult<(Url, reqwest::Response)> {
        for _ in 0..=self.max_redirects {
            ensure_secure(&url)?;
            let mut req = self
                .client
                .request(method.clone(), url.clone())
                .basic_auth(&self.credentials.username, Some(&self.credentials.password));
            if let Some(depth) = depth {
                req = req.header("Depth", depth);
            }
            if let Some((content_type, body)) = body {
                req = req
                    .header(header::CONTENT_TYPE, content_type)
                    .body(body.to_string());
            }

            let response = req.send().await.map_err(map_transport_error)?;
            if !is_followed_redirect(response.status()) {
                return Ok((url, response));
            }

            let location = response
                .headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| SyncError::Protocol("redirect without Location header".to_string()))?;
            let next = resolve(&url, location)?;
            tracing::debug!("Following {} redirect to {}", method, next);
            url = next;
        }

        Err(SyncError::Protocol(format!(
            "too many redirects (limit {})",
            self.max_redirects
        )))
    }
}

fn is_followed_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

fn propfind() -> Method {
    Method::from_bytes(b"PROPFIND").unwrap_or(Method::GET)
}

fn report() -> Method {
    Method::from_bytes(b"REPORT").unwrap_or(Method::GET)
}

/// Map an HTTP status onto the sync error taxonomy.
pub fn check_status(status: StatusCode, context: &str) -> SyncResult<()> {
    if status.is_success() {
        return Ok(());
    }

    let message = format!("{} returned {}", context, status);
    Err(match status.as_u16() {
        401 | 403 => SyncError::Authentication(message),
        404 | 410 => SyncError::NotFound(message),
        408 | 429 | 500..=599 => SyncError::Transient(message),
        _ => SyncError::Protocol(message),
    })
}

fn map_transport_error(err: reqwest::Error) -> SyncError {
    if err.is_timeout() {
        SyncError::Transient(format!("request timed out: {}", err))
    } else if err.is_connect() || err.is_request() || err.is_body() {
        SyncError::Transient(format!("connection failed: {}", err))
    } else {
        SyncError::Protocol(format!("unexpected HTTP failure: {}", err))
    }
}

/// Basic credentials only travel over TLS. Plain HTTP is limited to loopback hosts.
fn ensure_secure(url: &Url) -> SyncResult<()> {
    let loopback = match url.host() {
        Some(url::Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
        Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    };

    match url.scheme() {
        "https" => Ok(()),
        "http" if loopback => Ok(()),
        scheme => Err(SyncError::Protocol(format!(
            "refusing to send credentials to {} over {}",
            url.host_str().unwrap_or("unknown host"),
            scheme
        ))),
    }
}

fn parse_url(url: &str) -> SyncResult<Url> {
    Url::parse(url).map_err(|e| SyncError::Protocol(format!("invalid URL {}: {}", url, e)))
}

/// Calendar collection URL with a trailing slash so `join` appends instead of replacing.
fn collection_url(calendar_url: &str) -> SyncResult<Url> {
    if calendar_url.ends_with('/') {
        parse_url(calendar_url)
    } else {
        parse_url(&format!("{}/", calendar_url))
    }
}

fn resolve(base: &Url, href: &str) -> SyncResult<Url> {
    base.join(href.trim())
        .map_err(|e| SyncError::Protocol(format!("invalid href {}: {}", href, e)))
}

// ============================================================================
// Multistatus parsing
// ============================================================================

fn parse_xml(body: &str) -> SyncResult<roxmltree::Document<'_>> {
    roxmltree::Document::parse(body)
        .map_err(|e| SyncError::Protocol(format!("malformed multistatus XML: {}", e)))
}

fn child_text(node: roxmltree::Node<'_, '_>, name: &str) -> Option<String> {
    node.descendants()
        .find(|n| n.tag_name().name() == name)
        .and_then(|n| n.text())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// The `href` nested inside the first `<prop_name>` element.
fn find_prop_href(body: &str, prop_name: &str) -> SyncResult<Option<String>> {
    let doc = parse_xml(body)?;
    let href = doc
        .descendants()
        .find(|n| n.tag_name().name() == prop_name)
        .and_then(|prop| child_text(prop, "href"));
    Ok(href)
}

fn responses<'a, 'input>(
    doc: &'a roxmltree::Document<'input>,
) -> impl Iterator<Item = roxmltree::Node<'a, 'input>> {
    doc.root_element()
        .descendants()
        .filter(|n| n.tag_name().name() == "response")
}

fn parse_calendars(body: &str) -> SyncResult<Vec<RemoteCalendar>> {
    let doc = parse_xml(body)?;

    let calendars = responses(&doc)
        .filter(|response| {
            response
                .descendants()
                .find(|n| n.tag_name().name() == "resourcetype")
                .map(|rt| rt.children().any(|c| c.tag_name().name() == "calendar"))
                .unwrap_or(false)
        })
        .filter_map(|response| {
            Some(RemoteCalendar {
                url: child_text(response, "href")?,
                display_name: child_text(response, "displayname"),
                description: child_text(response, "calendar-description"),
                ctag: child_text(response, "getctag"),
            })
        })
        .collect();

    Ok(calendars)
}

fn parse_calendar_objects(body: &str) -> SyncResult<Vec<RemoteObject>> {
    let doc = parse_xml(body)?;

    let objects = responses(&doc)
        .filter_map(|response| {
            let url = child_text(response, "href")?;
            let data = response
                .descendants()
                .find(|n| n.tag_name().name() == "calendar-data")
                .and_then(|n| n.text())?
                .to_string();
            Some(RemoteObject {
                url,
                etag: child_text(response, "getetag"),
                data,
            })
        })
        .collect();

    Ok(objects)
}

fn parse_getetag(body: &str) -> SyncResult<Option<String>> {
    let doc = parse_xml(body)?;
    let etag = responses(&doc).find_map(|response| child_text(response, "getetag"));
    Ok(etag)
}
