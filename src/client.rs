//! Core HTTP client for the AppScan services.
//!
//! This module wraps reqwest with the transport behavior shared by both
//! backends: proxy and TLS-bypass configuration, multipart file uploads, and
//! full capture of status/headers/body so callers can interpret non-success
//! responses themselves.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use log::debug;
use reqwest::{Client, multipart};
use serde::{Deserialize, Serialize};

use crate::{AppScanConfig, AppScanError};

/// Core AppScan HTTP client.
///
/// Backend adapters compose full request URLs (server base comes from the
/// authentication session) and pass per-request headers; the client owns the
/// connection pool and transport settings.
#[derive(Clone)]
pub struct AppScanClient {
    config: AppScanConfig,
    client: Client,
}

/// A fully buffered HTTP response.
///
/// Both backends make decisions on exact status codes and on message fields
/// inside error bodies, so responses are captured whole instead of being
/// deserialized eagerly.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    status: u16,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl ApiResponse {
    /// Build a response from raw parts. Mostly useful in tests.
    #[must_use]
    pub fn new(status: u16, headers: HashMap<String, String>, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// HTTP status code.
    #[must_use]
    pub fn status(&self) -> u16 {
        self.status
    }

    /// True for any 2xx status.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        let lower = name.to_ascii_lowercase();
        self.headers.get(&lower).map(String::as_str)
    }

    /// Raw response body.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body parsed as JSON, or `None` when the body is empty or not JSON.
    #[must_use]
    pub fn body_json(&self) -> Option<serde_json::Value> {
        if self.body.is_empty() {
            return None;
        }
        serde_json::from_slice(&self.body).ok()
    }

    /// Deserialize the body into a typed document.
    ///
    /// # Errors
    ///
    /// Returns a serialization error when the body does not match `T`.
    pub fn body_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T, AppScanError> {
        serde_json::from_slice(&self.body).map_err(AppScanError::from)
    }

    /// The `Message` field of a JSON error body, when present.
    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        self.body_json()
            .and_then(|v| v.get("Message").and_then(|m| m.as_str().map(String::from)))
    }
}

/// One file destined for a multipart/form-data request.
///
/// Carries the part metadata explicitly so upload decisions (field name,
/// content type, byte length) are inspectable before anything hits the wire.
#[derive(Debug, Clone)]
pub struct FilePart {
    /// Form field name (`Content-Disposition: form-data; name="..."`).
    pub field_name: String,
    /// File name reported in the part's `Content-Disposition`.
    pub file_name: String,
    /// MIME type for the part's `Content-Type` header.
    pub content_type: String,
    /// File contents.
    pub data: Vec<u8>,
}

impl FilePart {
    /// Read a file from disk into a part with the given field name.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read.
    pub async fn from_path(
        field_name: &str,
        path: &Path,
        content_type: &str,
    ) -> Result<Self, AppScanError> {
        let data = tokio::fs::read(path).await.map_err(|e| {
            AppScanError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        Ok(Self {
            field_name: field_name.to_string(),
            file_name,
            content_type: content_type.to_string(),
            data,
        })
    }

    /// Byte length of the part's payload.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn into_multipart_part(self) -> Result<multipart::Part, AppScanError> {
        let len = self.data.len();
        let part = multipart::Part::bytes(self.data)
            .file_name(self.file_name)
            .mime_str(&self.content_type)
            .map_err(|e| AppScanError::InvalidConfig(e.to_string()))?;
        debug!("multipart part ready ({len} bytes)");
        Ok(part)
    }
}

impl AppScanClient {
    /// Create a new client from transport configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when the proxy URL is invalid or the underlying
    /// client cannot be constructed.
    pub fn new(config: AppScanConfig) -> Result<Self, AppScanError> {
        let mut client_builder = Client::builder();

        // Use the certificate validation setting from config
        if !config.validate_certificates {
            client_builder = client_builder.danger_accept_invalid_certs(true);
        }

        client_builder = client_builder
            .connect_timeout(Duration::from_secs(config.connect_timeout))
            .timeout(Duration::from_secs(config.request_timeout));

        // Configure proxy if specified
        if let Some(proxy_url) = &config.proxy_url {
            let mut proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| AppScanError::InvalidConfig(format!("Invalid proxy URL: {e}")))?;

            if let (Some(username), Some(password)) =
                (&config.proxy_username, &config.proxy_password)
            {
                proxy = proxy.basic_auth(username, password);
            }

            client_builder = client_builder.proxy(proxy);
        }

        let client = client_builder.build().map_err(AppScanError::Http)?;
        Ok(Self { config, client })
    }

    /// Get access to the configuration.
    #[must_use]
    pub fn config(&self) -> &AppScanConfig {
        &self.config
    }

    /// Append query parameters to a URL, percent-encoding keys and values.
    #[must_use]
    pub fn url_with_params(base: &str, query_params: &[(&str, &str)]) -> String {
        let estimated_capacity = base
            .len()
            .saturating_add(query_params.len().saturating_mul(32));
        let mut url = String::with_capacity(estimated_capacity);
        url.push_str(base);

        if !query_params.is_empty() {
            url.push('?');
            for (i, (key, value)) in query_params.iter().enumerate() {
                if i > 0 {
                    url.push('&');
                }
                url.push_str(&urlencoding::encode(key));
                url.push('=');
                url.push_str(&urlencoding::encode(value));
            }
        }

        url
    }

    async fn capture(response: reqwest::Response) -> Result<ApiResponse, AppScanError> {
        let status = response.status().as_u16();
        let mut headers = HashMap::with_capacity(response.headers().len());
        for (name, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(name.as_str().to_ascii_lowercase(), v.to_string());
            }
        }
        let body = response.bytes().await.map_err(AppScanError::Http)?.to_vec();
        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }

    fn apply_headers(
        mut builder: reqwest::RequestBuilder,
        headers: &[(String, String)],
    ) -> reqwest::RequestBuilder {
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        builder
    }

    /// Make a GET request.
    ///
    /// # Errors
    ///
    /// Returns an error when the request cannot be sent or the body cannot be
    /// read. Non-2xx statuses are not errors at this layer.
    pub async fn get(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<ApiResponse, AppScanError> {
        debug!("GET {url}");
        let builder = Self::apply_headers(self.client.get(url), headers);
        let response = builder.send().await.map_err(AppScanError::Http)?;
        Self::capture(response).await
    }

    /// Make a POST request with a JSON body.
    ///
    /// # Errors
    ///
    /// Returns an error when the body cannot be serialized or the request
    /// cannot be sent.
    pub async fn post_json<T: Serialize>(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &T,
    ) -> Result<ApiResponse, AppScanError> {
        debug!("POST {url}");
        let serialized = serde_json::to_string(body)?;
        let builder = Self::apply_headers(self.client.post(url), headers)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .body(serialized);
        let response = builder.send().await.map_err(AppScanError::Http)?;
        Self::capture(response).await
    }

    /// Make a POST request with a form-encoded body.
    ///
    /// # Errors
    ///
    /// Returns an error when the request cannot be sent.
    pub async fn post_form(
        &self,
        url: &str,
        headers: &[(String, String)],
        form: &[(String, String)],
    ) -> Result<ApiResponse, AppScanError> {
        debug!("POST {url} (form)");
        let builder = Self::apply_headers(self.client.post(url), headers)
            .header("Accept", "application/json")
            .form(form);
        let response = builder.send().await.map_err(AppScanError::Http)?;
        Self::capture(response).await
    }

    /// Make a PUT request with no body.
    ///
    /// # Errors
    ///
    /// Returns an error when the request cannot be sent.
    pub async fn put(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<ApiResponse, AppScanError> {
        debug!("PUT {url}");
        let builder = Self::apply_headers(self.client.put(url), headers)
            .header("Accept", "application/json");
        let response = builder.send().await.map_err(AppScanError::Http)?;
        Self::capture(response).await
    }

    /// Upload files as multipart/form-data, one part per file.
    ///
    /// The boundary is regenerated per request by the multipart encoder.
    ///
    /// # Errors
    ///
    /// Returns an error when a part cannot be constructed or the request
    /// cannot be sent.
    pub async fn post_multipart(
        &self,
        url: &str,
        headers: &[(String, String)],
        parts: Vec<FilePart>,
    ) -> Result<ApiResponse, AppScanError> {
        debug!("POST {url} (multipart, {} part(s))", parts.len());
        let mut form = multipart::Form::new();
        for part in parts {
            let field = part.field_name.clone();
            form = form.part(field, part.into_multipart_part()?);
        }

        let builder = Self::apply_headers(self.client.post(url), headers).multipart(form);
        let response = builder.send().await.map_err(AppScanError::Http)?;
        Self::capture(response).await
    }
}

/// One entry in the platform's regions document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionServer {
    /// Region name (e.g. `"default"`, `"eu"`).
    #[serde(rename = "Name")]
    pub name: String,
    /// Server base URL for that region.
    #[serde(rename = "ServerUrl")]
    pub server_url: String,
}

/// Explicit region to server mapping, initialized once at process start.
///
/// There is no process-wide cached server state: callers construct one
/// registry (from the regions endpoint or from static configuration) and
/// pass it to whatever needs it.
#[derive(Debug, Clone, Default)]
pub struct ServerRegistry {
    servers: Vec<RegionServer>,
}

impl ServerRegistry {
    /// Build a registry from a known set of regions.
    #[must_use]
    pub fn new(servers: Vec<RegionServer>) -> Self {
        Self { servers }
    }

    /// Fetch the regions document from the service and build a registry.
    ///
    /// # Errors
    ///
    /// Returns an error when the request fails or the document cannot be
    /// parsed.
    pub async fn fetch(
        client: &AppScanClient,
        server_url: &str,
        headers: &[(String, String)],
    ) -> Result<Self, AppScanError> {
        let url = format!("{server_url}/api/v4/Utils/Regions");
        let response = client.get(&url, headers).await?;
        if !response.is_success() {
            return Err(AppScanError::InvalidResponse(format!(
                "regions request returned HTTP {}",
                response.status()
            )));
        }
        let servers: Vec<RegionServer> = response.body_as()?;
        Ok(Self { servers })
    }

    /// Server URL for the named region.
    #[must_use]
    pub fn server_for(&self, region: &str) -> Option<&str> {
        self.servers
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(region))
            .map(|s| s.server_url.as_str())
    }

    /// All known regions.
    #[must_use]
    pub fn regions(&self) -> impl Iterator<Item = &str> {
        self.servers.iter().map(|s| s.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_with_params_encoding() {
        let url = AppScanClient::url_with_params(
            "https://cloud.appscan.com/api/v4/Scans",
            &[("$filter", "Id eq 42"), ("$count", "false")],
        );
        assert_eq!(
            url,
            "https://cloud.appscan.com/api/v4/Scans?%24filter=Id%20eq%2042&%24count=false"
        );
    }

    #[test]
    fn test_url_with_no_params() {
        let url = AppScanClient::url_with_params("https://ase.local/api/jobs/5", &[]);
        assert_eq!(url, "https://ase.local/api/jobs/5");
    }

    #[test]
    fn test_api_response_json_helpers() {
        let body = br#"{"Message":"scan {0} not found","Id":"abc"}"#.to_vec();
        let response = ApiResponse::new(404, HashMap::new(), body);

        assert!(!response.is_success());
        assert_eq!(
            response.error_message().as_deref(),
            Some("scan {0} not found")
        );
        let json = response.body_json().unwrap();
        assert_eq!(json["Id"], "abc");
    }

    #[test]
    fn test_api_response_header_lookup_case_insensitive() {
        let mut headers = HashMap::new();
        headers.insert("etag".to_string(), "\"v7\"".to_string());
        let response = ApiResponse::new(200, headers, Vec::new());

        assert_eq!(response.header("ETag"), Some("\"v7\""));
        assert_eq!(response.header("etag"), Some("\"v7\""));
        assert!(response.header("location").is_none());
    }

    #[test]
    fn test_file_part_metadata() {
        let part = FilePart {
            field_name: "fileToUpload".to_string(),
            file_name: "app.irx".to_string(),
            content_type: "multipart/form-data".to_string(),
            data: vec![0u8; 1234],
        };
        assert_eq!(part.len(), 1234);
        assert!(!part.is_empty());
    }

    #[test]
    fn test_server_registry_lookup() {
        let registry = ServerRegistry::new(vec![
            RegionServer {
                name: "default".to_string(),
                server_url: "https://cloud.appscan.com".to_string(),
            },
            RegionServer {
                name: "eu".to_string(),
                server_url: "https://eu.cloud.appscan.com".to_string(),
            },
        ]);

        assert_eq!(
            registry.server_for("EU"),
            Some("https://eu.cloud.appscan.com")
        );
        assert!(registry.server_for("apac").is_none());
        assert_eq!(registry.regions().count(), 2);
    }
}
