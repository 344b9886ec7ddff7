use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use regex::Regex;
use reqwest::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Client, Method, Request, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use tracing::debug;

use super::{MessageEncoding, QueueClient, ReceivedMessage};
use crate::config::HttpSettings;
use crate::error::{ConfigError, QueueError};

const API_VERSION: &str = "2021-12-02";

const DEV_ACCOUNT: &str = "devstoreaccount1";
const DEV_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";
const DEV_ENDPOINT: &str = "http://127.0.0.1:10001/devstoreaccount1/";

static QUEUE_MESSAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<QueueMessage>(.*?)</QueueMessage>").expect("static regex"));
static ERROR_MESSAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<Message>(.*?)</Message>").expect("static regex"));

#[derive(Clone, Debug)]
enum StorageAuth {
    SharedKey(SecretString),
    Sas(SecretString),
}

/// A storage account as described by a connection string.
#[derive(Clone, Debug)]
pub struct StorageAccount {
    name: String,
    queue_endpoint: Url,
    auth: StorageAuth,
}

impl StorageAccount {
    /// Parses `Key=Value;...` connection strings, including
    /// `UseDevelopmentStorage=true` for the local emulator.
    pub fn parse(connection: &str) -> Result<Self, ConfigError> {
        let mut protocol = "https".to_string();
        let mut name = None;
        let mut key = None;
        let mut sas = None;
        let mut suffix = "core.windows.net".to_string();
        let mut endpoint = None;

        for part in connection.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (k, v) = part.split_once('=').ok_or_else(|| {
                ConfigError::ConnectionString(format!("segment `{k}` has no value", k = part))
            })?;
            match k.to_ascii_lowercase().as_str() {
                "usedevelopmentstorage" if v.eq_ignore_ascii_case("true") => {
                    return Ok(Self {
                        name: DEV_ACCOUNT.to_string(),
                        queue_endpoint: Url::parse(DEV_ENDPOINT)
                            .map_err(|e| ConfigError::ConnectionString(e.to_string()))?,
                        auth: StorageAuth::SharedKey(SecretString::from(DEV_KEY)),
                    });
                }
                "defaultendpointsprotocol" => protocol = v.to_string(),
                "accountname" => name = Some(v.to_string()),
                "accountkey" => key = Some(v.to_string()),
                "sharedaccesssignature" => sas = Some(v.trim_start_matches('?').to_string()),
                "endpointsuffix" => suffix = v.to_string(),
                "queueendpoint" => endpoint = Some(v.to_string()),
                _ => {}
            }
        }

        let auth = match (key, sas) {
            (Some(key), _) => {
                STANDARD.decode(&key).map_err(|_| {
                    ConfigError::ConnectionString("AccountKey is not valid base64".to_string())
                })?;
                StorageAuth::SharedKey(SecretString::from(key))
            }
            (None, Some(sas)) => StorageAuth::Sas(SecretString::from(sas)),
            (None, None) => {
                return Err(ConfigError::ConnectionString(
                    "either AccountKey or SharedAccessSignature is required".to_string(),
                ))
            }
        };

        let raw_endpoint = match (endpoint, &name) {
            (Some(endpoint), _) => endpoint,
            (None, Some(name)) => format!("{protocol}://{name}.queue.{suffix}"),
            (None, None) => {
                return Err(ConfigError::ConnectionString(
                    "AccountName or QueueEndpoint is required".to_string(),
                ))
            }
        };
        let queue_endpoint = with_trailing_slash(&raw_endpoint)?;

        let name = match name {
            Some(name) => name,
            None if matches!(auth, StorageAuth::SharedKey(_)) => {
                return Err(ConfigError::ConnectionString(
                    "AccountName is required with AccountKey".to_string(),
                ))
            }
            None => queue_endpoint
                .host_str()
                .and_then(|host| host.split('.').next())
                .unwrap_or_default()
                .to_string(),
        };

        Ok(Self { name, queue_endpoint, auth })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue_endpoint(&self) -> &Url {
        &self.queue_endpoint
    }
}

fn with_trailing_slash(raw: &str) -> Result<Url, ConfigError> {
    let raw = if raw.ends_with('/') { raw.to_string() } else { format!("{raw}/") };
    Url::parse(&raw).map_err(|e| ConfigError::ConnectionString(format!("bad queue endpoint: {e}")))
}

/// Storage queue REST client.
#[derive(Clone)]
pub struct StorageQueueClient {
    http: Client,
    account: StorageAccount,
    encoding: MessageEncoding,
}

impl StorageQueueClient {
    pub fn new(
        account: StorageAccount,
        encoding: MessageEncoding,
        http: &HttpSettings,
    ) -> Result<Self, QueueError> {
        Ok(Self { http: http.client()?, account, encoding })
    }

    fn url(&self, path: &str, query: &[(&str, String)]) -> Result<Url, QueueError> {
        let mut url = self
            .account
            .queue_endpoint
            .join(path)
            .map_err(|e| QueueError::Signing(format!("bad queue path `{path}`: {e}")))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query.iter().map(|(k, v)| (*k, v.as_str())));
        }
        if let StorageAuth::Sas(sas) = &self.account.auth {
            let combined = match url.query() {
                Some(q) => format!("{q}&{}", sas.expose_secret()),
                None => sas.expose_secret().to_string(),
            };
            url.set_query(Some(&combined));
        }
        Ok(url)
    }

    async fn execute(
        &self,
        method: Method,
        url: Url,
        body: Option<String>,
    ) -> Result<reqwest::Response, QueueError> {
        let mut builder = self.http.request(method, url);
        if let Some(body) = body {
            builder = builder.header(CONTENT_TYPE, "application/xml").body(body);
        }
        let mut request = builder.build()?;
        self.authorize(&mut request, &http_date())?;

        let response = self.http.execute(request).await?;
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let message = ERROR_MESSAGE
            .captures(&text)
            .map(|c| xml_unescape(&c[1]))
            .unwrap_or(text);
        Err(QueueError::Api { status, message })
    }

    fn authorize(&self, request: &mut Request, date: &str) -> Result<(), QueueError> {
        let headers = request.headers_mut();
        headers.insert("x-ms-date", header_value(date)?);
        headers.insert("x-ms-version", HeaderValue::from_static(API_VERSION));

        let StorageAuth::SharedKey(key) = &self.account.auth else {
            return Ok(());
        };

        let content_length = request
            .body()
            .and_then(|b| b.as_bytes())
            .map_or(0, <[u8]>::len);
        let content_type = request
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let to_sign = string_to_sign(
            request.method(),
            request.url(),
            content_length,
            &content_type,
            date,
            &self.account.name,
        );
        let signature = sign(key.expose_secret(), &to_sign)?;

        let headers = request.headers_mut();
        headers.insert(
            "authorization",
            header_value(&format!("SharedKey {}:{}", self.account.name, signature))?,
        );
        if content_length > 0 {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(content_length));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueClient for StorageQueueClient {
    async fn ensure_queue(&self, queue: &str) -> Result<(), QueueError> {
        let url = self.url(queue, &[])?;
        match self.execute(Method::PUT, url, None).await {
            Ok(_) => Ok(()),
            // Already exists with different metadata; still usable.
            Err(QueueError::Api { status, .. }) if status == StatusCode::CONFLICT.as_u16() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn send(&self, queue: &str, body: &[u8]) -> Result<(), QueueError> {
        let text = match self.encoding {
            MessageEncoding::Base64 => STANDARD.encode(body),
            MessageEncoding::Text => std::str::from_utf8(body)
                .map_err(|e| QueueError::Decode(format!("text-encoded message is not UTF-8: {e}")))?
                .to_string(),
        };
        let xml = format!(
            "<QueueMessage><MessageText>{}</MessageText></QueueMessage>",
            xml_escape(&text)
        );
        let url = self.url(&format!("{queue}/messages"), &[])?;
        self.execute(Method::POST, url, Some(xml)).await?;
        debug!(queue, bytes = body.len(), "queue message sent");
        Ok(())
    }

    async fn receive(
        &self,
        queue: &str,
        max_messages: u32,
        visibility_timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let url = self.url(
            &format!("{queue}/messages"),
            &[
                ("numofmessages", max_messages.clamp(1, 32).to_string()),
                ("visibilitytimeout", visibility_timeout.as_secs().max(1).to_string()),
            ],
        )?;
        let xml = self.execute(Method::GET, url, None).await?.text().await?;
        parse_messages(&xml, self.encoding)
    }

    async fn delete(&self, queue: &str, message: &ReceivedMessage) -> Result<(), QueueError> {
        let url = self.url(
            &format!("{queue}/messages/{}", message.id),
            &[("popreceipt", message.pop_receipt.clone())],
        )?;
        self.execute(Method::DELETE, url, None).await?;
        Ok(())
    }
}

fn header_value(value: &str) -> Result<HeaderValue, QueueError> {
    HeaderValue::from_str(value).map_err(|e| QueueError::Signing(e.to_string()))
}

fn http_date() -> String {
    chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Shared Key string-to-sign for the queue service.
fn string_to_sign(
    method: &Method,
    url: &Url,
    content_length: usize,
    content_type: &str,
    date: &str,
    account: &str,
) -> String {
    let length = if content_length == 0 { String::new() } else { content_length.to_string() };
    let fields = [
        method.as_str(),
        "", // Content-Encoding
        "", // Content-Language
        &length,
        "", // Content-MD5
        content_type,
        "", // Date, superseded by x-ms-date
        "",
        "",
        "",
        "",
        "",
    ];

    let mut out = fields.join("\n");
    out.push('\n');
    out.push_str(&format!("x-ms-date:{date}\nx-ms-version:{API_VERSION}\n"));
    out.push_str(&format!("/{account}{}", url.path()));

    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.into_owned()))
        .collect();
    params.sort();
    for (k, v) in params {
        out.push_str(&format!("\n{k}:{v}"));
    }
    out
}

fn sign(key: &str, to_sign: &str) -> Result<String, QueueError> {
    let key = STANDARD
        .decode(key)
        .map_err(|e| QueueError::Signing(format!("account key is not base64: {e}")))?;
    let mut mac = Hmac::<Sha256>::new_from_slice(&key)
        .map_err(|e| QueueError::Signing(e.to_string()))?;
    mac.update(to_sign.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

fn parse_messages(xml: &str, encoding: MessageEncoding) -> Result<Vec<ReceivedMessage>, QueueError> {
    QUEUE_MESSAGE
        .captures_iter(xml)
        .map(|c| {
            let block = c.get(1).map_or("", |m| m.as_str());
            let text = element(block, "MessageText")?;
            let body = match encoding {
                MessageEncoding::Base64 => STANDARD
                    .decode(text.trim())
                    .map_err(|e| QueueError::Decode(format!("MessageText is not base64: {e}")))?,
                MessageEncoding::Text => text.into_bytes(),
            };
            let dequeue_count = element(block, "DequeueCount")?
                .parse()
                .map_err(|e| QueueError::Decode(format!("bad DequeueCount: {e}")))?;
            Ok(ReceivedMessage {
                id: element(block, "MessageId")?,
                pop_receipt: element(block, "PopReceipt")?,
                dequeue_count,
                body,
            })
        })
        .collect()
}

fn element(block: &str, name: &str) -> Result<String, QueueError> {
    let open = format!("<{name}>");
    let close = format!("</{name}>");
    let start = block
        .find(&open)
        .ok_or_else(|| QueueError::Decode(format!("missing <{name}>")))?
        + open.len();
    let end = block[start..]
        .find(&close)
        .ok_or_else(|| QueueError::Decode(format!("unterminated <{name}>")))?;
    Ok(xml_unescape(&block[start..start + end]))
}

fn xml_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn xml_unescape(raw: &str) -> String {
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
