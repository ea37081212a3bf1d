//! Signed S3 REST calls.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{header, Client, Method, Response, StatusCode};
use std::sync::Arc;
use tracing::debug;
use url::Url;

use siberian_common::{Error, Result};

use super::provider::S3Config;
use super::signing::{sign, Credentials, SigningRequest};
use super::xml;
use crate::http::{build_client, check, remote_error, transport_error};
use crate::token::Clock;
use crate::transfer::CompletedPart;

/// Where requests go and how the bucket is addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Endpoint {
    /// Scheme and authority, e.g. `https://bucket.s3.eu-west-1.amazonaws.com`.
    origin: String,
    /// Value of the `Host` header, including a non-default port.
    host: String,
    /// `/bucket` for path-style addressing, empty for virtual-hosted style.
    base_path: String,
}

impl Endpoint {
    fn resolve(config: &S3Config) -> Result<Self> {
        match &config.endpoint {
            Some(raw) => {
                let url = Url::parse(raw)
                    .map_err(|e| Error::Config(format!("Invalid S3 endpoint '{}': {}", raw, e)))?;
                let host = url
                    .host_str()
                    .ok_or_else(|| Error::Config(format!("S3 endpoint has no host: {}", raw)))?;
                let host = match url.port() {
                    Some(port) => format!("{}:{}", host, port),
                    None => host.to_string(),
                };
                Ok(Self {
                    origin: format!("{}://{}", url.scheme(), host),
                    host,
                    base_path: format!("/{}", config.bucket),
                })
            }
            None => {
                let host = format!("{}.s3.{}.amazonaws.com", config.bucket, config.region);
                Ok(Self {
                    origin: format!("https://{}", host),
                    host,
                    base_path: String::new(),
                })
            }
        }
    }
}

/// One object from a bucket listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Object {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// One page of a ListObjectsV2 response.
#[derive(Debug, Default)]
pub struct ListPage {
    pub objects: Vec<S3Object>,
    pub next_token: Option<String>,
}

/// Low-level S3 client. Every request is signed with the current time.
pub struct S3Client {
    http: Client,
    config: S3Config,
    endpoint: Endpoint,
    clock: Arc<dyn Clock>,
}

impl S3Client {
    pub fn new(config: S3Config, clock: Arc<dyn Clock>) -> Result<Self> {
        let endpoint = Endpoint::resolve(&config)?;
        Ok(Self {
            http: build_client()?,
            config,
            endpoint,
            clock,
        })
    }

    fn credentials(&self) -> Credentials<'_> {
        Credentials {
            access_key_id: &self.config.access_key_id,
            secret_access_key: &self.config.secret_access_key,
            region: &self.config.region,
            service: "s3",
        }
    }

    fn object_path(&self, key: &str) -> String {
        format!("{}/{}", self.endpoint.base_path, key)
    }

    fn bucket_path(&self) -> String {
        if self.endpoint.base_path.is_empty() {
            "/".to_string()
        } else {
            self.endpoint.base_path.clone()
        }
    }

    fn request(&self, method: &str, path: String) -> SigningRequest {
        SigningRequest::new(method, path, self.endpoint.host.clone())
    }

    /// Headers set on every object write.
    fn with_write_headers(
        &self,
        mut request: SigningRequest,
        meta: &[(String, String)],
    ) -> SigningRequest {
        request = request.header("content-type", "application/zip");
        if let Some(class) = &self.config.storage_class {
            request = request.header("x-amz-storage-class", class.clone());
        }
        for (name, value) in meta {
            request = request.header(&format!("x-amz-meta-{}", name), value.clone());
        }
        request
    }

    async fn send(&self, request: SigningRequest, body: Option<Bytes>) -> Result<Response> {
        let signed = sign(&request, &self.credentials(), self.clock.now());

        let mut url = format!("{}{}", self.endpoint.origin, request.canonical_uri());
        let query = request.canonical_query();
        if !query.is_empty() {
            url.push('?');
            url.push_str(&query);
        }

        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| Error::Protocol(format!("Invalid HTTP method: {}", request.method)))?;
        let mut builder = self.http.request(method, &url);
        for (name, value) in request.headers.iter().filter(|(n, _)| n.as_str() != "host") {
            builder = builder.header(name.as_str(), value.as_str());
        }
        for (name, value) in signed.pairs() {
            builder = builder.header(name, value);
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }

        debug!(method = %request.method, path = %request.path, "S3 request");
        builder
            .send()
            .await
            .map_err(|e| transport_error(&format!("S3 {} {}", request.method, request.path), e))
    }

    /// Single-request upload.
    pub async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        meta: &[(String, String)],
    ) -> Result<()> {
        let request = self
            .with_write_headers(self.request("PUT", self.object_path(key)), meta)
            .payload(&body);
        let response = self.send(request, Some(body)).await?;
        check(response, xml::error_message).await?;
        Ok(())
    }

    /// Start a multipart upload and return its upload id.
    pub async fn create_multipart(&self, key: &str, meta: &[(String, String)]) -> Result<String> {
        let request = self.with_write_headers(
            self.request("POST", self.object_path(key)).query("uploads", ""),
            meta,
        );
        let response = check(self.send(request, None).await?, xml::error_message).await?;
        let body = response
            .text()
            .await
            .map_err(|e| transport_error("Reading multipart initiation", e))?;
        xml::first_tag(&body, "UploadId")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::Protocol("Multipart initiation returned no UploadId".to_string()))
    }

    /// Upload one part and return its ETag.
    pub async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String> {
        let request = self
            .request("PUT", self.object_path(key))
            .query("partNumber", &part_number.to_string())
            .query("uploadId", upload_id)
            .payload(&body);
        let response = check(self.send(request, Some(body)).await?, xml::error_message).await?;
        response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| Error::Protocol(format!("Part {} returned no ETag", part_number)))
    }

    /// Assemble the uploaded parts into the final object.
    pub async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()> {
        let body = Bytes::from(complete_multipart_body(parts));
        let request = self
            .request("POST", self.object_path(key))
            .query("uploadId", upload_id)
            .header("content-type", "application/xml")
            .payload(&body);
        let response = check(self.send(request, Some(body)).await?, xml::error_message).await?;

        // Completion can fail after the 200 status line has been sent.
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| transport_error("Reading multipart completion", e))?;
        if text.contains("<Error>") {
            return Err(Error::Remote {
                status: status.as_u16(),
                message: xml::error_message(&text)
                    .unwrap_or_else(|| "Multipart completion failed".to_string()),
            });
        }
        Ok(())
    }

    /// Discard an unfinished multipart upload and its parts.
    pub async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()> {
        let request = self
            .request("DELETE", self.object_path(key))
            .query("uploadId", upload_id);
        check(self.send(request, None).await?, xml::error_message).await?;
        Ok(())
    }

    /// Fetch one ListObjectsV2 page.
    pub async fn list_page(
        &self,
        prefix: &str,
        continuation: Option<&str>,
        max_keys: Option<u32>,
    ) -> Result<ListPage> {
        let mut request = self
            .request("GET", self.bucket_path())
            .query("list-type", "2");
        if !prefix.is_empty() {
            request = request.query("prefix", prefix);
        }
        if let Some(token) = continuation {
            request = request.query("continuation-token", token);
        }
        if let Some(max) = max_keys {
            request = request.query("max-keys", &max.to_string());
        }

        let response = check(self.send(request, None).await?, xml::error_message).await?;
        let body = response
            .text()
            .await
            .map_err(|e| transport_error("Reading bucket listing", e))?;
        parse_list_page(&body)
    }

    /// All objects under `prefix`, following continuation tokens.
    pub async fn list_objects(&self, prefix: &str) -> Result<Vec<S3Object>> {
        let mut objects = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self.list_page(prefix, token.as_deref(), None).await?;
            objects.extend(page.objects);
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(objects)
    }

    /// `true` if the object exists, `false` on 404.
    pub async fn head_object(&self, key: &str) -> Result<bool> {
        let request = self.request("HEAD", self.object_path(key));
        let response = self.send(request, None).await?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(remote_error(response, xml::error_message).await),
        }
    }

    /// Start a download. The caller streams the body.
    pub async fn get_object(&self, key: &str) -> Result<Response> {
        let request = self.request("GET", self.object_path(key));
        let response = self.send(request, None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("Object not found: {}", key)));
        }
        check(response, xml::error_message).await
    }

    /// Delete an object. Returns `false` if the server reported 404.
    pub async fn delete_object(&self, key: &str) -> Result<bool> {
        let request = self.request("DELETE", self.object_path(key));
        let response = self.send(request, None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check(response, xml::error_message).await?;
        Ok(true)
    }
}

fn complete_multipart_body(parts: &[CompletedPart]) -> String {
    let mut body = String::from("<CompleteMultipartUpload>");
    for part in parts {
        body.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            part.part_number,
            xml::escape(&part.etag)
        ));
    }
    body.push_str("</CompleteMultipartUpload>");
    body
}

fn parse_list_page(body: &str) -> Result<ListPage> {
    if body.contains("<Error>") {
        return Err(Error::Protocol(
            xml::error_message(body).unwrap_or_else(|| "Malformed bucket listing".to_string()),
        ));
    }

    let mut objects = Vec::new();
    for block in xml::blocks(body, "Contents") {
        let key = xml::first_tag(block, "Key")
            .ok_or_else(|| Error::Protocol("Listing entry without Key".to_string()))?;
        let size = xml::first_tag(block, "Size")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let last_modified = xml::first_tag(block, "LastModified")
            .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
            .map(|t| t.with_timezone(&Utc));
        objects.push(S3Object {
            key,
            size,
            last_modified,
        });
    }

    let truncated = xml::first_tag(body, "IsTruncated").as_deref() == Some("true");
    let next_token = if truncated {
        Some(xml::first_tag(body, "NextContinuationToken").ok_or_else(|| {
            Error::Protocol("Truncated listing without continuation token".to_string())
        })?)
    } else {
        None
    };

    Ok(ListPage {
        objects,
        next_token,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(endpoint: Option<&str>) -> S3Config {
        S3Config {
            access_key_id: "AK".into(),
            secret_access_key: "SK".into(),
            region: "eu-west-1".into(),
            bucket: "backups".into(),
            endpoint: endpoint.map(str::to_string),
            prefix: None,
            storage_class: None,
        }
    }

    #[test]
    fn test_endpoint_virtual_hosted() {
        let endpoint = Endpoint::resolve(&config(None)).unwrap();
        assert_eq!(endpoint.host, "backups.s3.eu-west-1.amazonaws.com");
        assert_eq!(endpoint.origin, "https://backups.s3.eu-west-1.amazonaws.com");
        assert_eq!(endpoint.base_path, "");
    }

    #[test]
    fn test_endpoint_path_style() {
        let endpoint = Endpoint::resolve(&config(Some("http://127.0.0.1:9000"))).unwrap();
        assert_eq!(endpoint.host, "127.0.0.1:9000");
        assert_eq!(endpoint.origin, "http://127.0.0.1:9000");
        assert_eq!(endpoint.base_path, "/backups");

        assert!(Endpoint::resolve(&config(Some("not a url"))).is_err());
    }

    #[test]
    fn test_complete_body_orders_parts() {
        let parts = vec![
            CompletedPart {
                part_number: 1,
                etag: "\"a\"".into(),
            },
            CompletedPart {
                part_number: 2,
                etag: "\"b\"".into(),
            },
        ];
        let body = complete_multipart_body(&parts);
        assert_eq!(
            body,
            "<CompleteMultipartUpload>\
             <Part><PartNumber>1</PartNumber><ETag>\"a\"</ETag></Part>\
             <Part><PartNumber>2</PartNumber><ETag>\"b\"</ETag></Part>\
             </CompleteMultipartUpload>"
        );
    }

    #[test]
    fn test_parse_list_page() {
        let body = r#"<ListBucketResult>
<IsTruncated>true</IsTruncated>
<NextContinuationToken>tok-2</NextContinuationToken>
<Contents><Key>siberian-backup-db-2024-01-01-00-00-00.zip</Key><LastModified>2024-01-01T00:00:05.000Z</LastModified><Size>42</Size></Contents>
</ListBucketResult>"#;
        let page = parse_list_page(body).unwrap();
        assert_eq!(page.objects.len(), 1);
        assert_eq!(page.objects[0].size, 42);
        assert!(page.objects[0].last_modified.is_some());
        assert_eq!(page.next_token.as_deref(), Some("tok-2"));

        let broken = "<ListBucketResult><IsTruncated>true</IsTruncated></ListBucketResult>";
        assert!(matches!(parse_list_page(broken), Err(Error::Protocol(_))));
    }
}
