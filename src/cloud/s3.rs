//! S3-compatible provider (AWS S3, Cloudflare R2, MinIO)
//!
//! Path-style `PUT {endpoint}/{bucket}/{prefix}/{name}` signed with AWS
//! Signature Version 4. The payload hash is sent in
//! `x-amz-content-sha256`. Listing uses ListObjectsV2 under the prefix;
//! only `.tar.gz` keys count as backups.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use regex::Regex;
use reqwest::{Method, StatusCode};
use sha2::{Digest, Sha256};

use super::{
    http_client, write_body, CloudError, CloudProvider, CloudResult, RemoteBackup, RemoteObject,
};
use crate::backup::ARCHIVE_EXTENSION;
use crate::config::S3Config;

pub const PROVIDER_NAME: &str = "s3";

const SERVICE: &str = "s3";
const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SIGNED_HEADERS: &str = "host;x-amz-content-sha256;x-amz-date";

type HmacSha256 = Hmac<Sha256>;

pub struct S3Provider {
    config: S3Config,
    endpoint: reqwest::Url,
    access_key_id: String,
    secret_access_key: String,
    bucket: String,
    client: reqwest::Client,
}

impl S3Provider {
    pub fn new(config: S3Config) -> CloudResult<Self> {
        let (Some(endpoint), Some(access_key_id), Some(secret_access_key), Some(bucket)) = (
            config.endpoint.clone(),
            config.access_key_id.clone(),
            config.secret_access_key.clone(),
            config.bucket.clone(),
        ) else {
            return Err(CloudError::NotConfigured(
                "BACKUP_S3_ENDPOINT, BACKUP_S3_ACCESS_KEY_ID, BACKUP_S3_SECRET_ACCESS_KEY and BACKUP_S3_BUCKET are required"
                    .to_string(),
            ));
        };
        let endpoint = reqwest::Url::parse(endpoint.trim_end_matches('/'))
            .map_err(|e| CloudError::NotConfigured(format!("invalid S3 endpoint: {}", e)))?;

        Ok(Self {
            config,
            endpoint,
            access_key_id,
            secret_access_key,
            bucket,
            client: http_client()?,
        })
    }

    /// Object key for an archive
    pub fn object_key(&self, remote_name: &str) -> String {
        let prefix = self.config.prefix.trim_matches('/');
        if prefix.is_empty() {
            remote_name.to_string()
        } else {
            format!("{}/{}", prefix, remote_name)
        }
    }

    fn host(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or_default();
        match self.endpoint.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    fn canonical_path(&self, key: &str) -> String {
        let base = self.endpoint.path().trim_end_matches('/');
        let encoded: Vec<String> = std::iter::once(self.bucket.as_str())
            .chain(key.split('/'))
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        format!("{}/{}", base, encoded.join("/"))
    }

    fn bucket_path(&self) -> String {
        let base = self.endpoint.path().trim_end_matches('/');
        format!("{}/{}", base, urlencoding::encode(&self.bucket))
    }

    /// Headers for a signed PUT: `(authorization, x-amz-date, payload hash)`
    pub(crate) fn sign_put(
        &self,
        canonical_path: &str,
        payload: &[u8],
        now: DateTime<Utc>,
    ) -> (String, String, String) {
        let payload_hash = hex(&Sha256::digest(payload));
        let (authorization, amz_date) =
            self.sign(&Method::PUT, canonical_path, "", &payload_hash, now);
        (authorization, amz_date, payload_hash)
    }

    /// `(authorization, x-amz-date)` for a request. `canonical_query` is
    /// already sorted and encoded.
    pub(crate) fn sign(
        &self,
        method: &Method,
        canonical_path: &str,
        canonical_query: &str,
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> (String, String) {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        let canonical_request = format!(
            "{}\n{}\n{}\nhost:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n\n{}\n{}",
            method.as_str(),
            canonical_path,
            canonical_query,
            self.host(),
            payload_hash,
            amz_date,
            SIGNED_HEADERS,
            payload_hash
        );

        let region = self.config.signing_region();
        let credential_scope = format!("{}/{}/{}/aws4_request", date, region, SERVICE);
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM,
            amz_date,
            credential_scope,
            hex(&Sha256::digest(canonical_request.as_bytes()))
        );

        let key = signing_key(&self.secret_access_key, &date, region, SERVICE);
        let signature = hex(&hmac_sha256(&key, string_to_sign.as_bytes()));
        let authorization = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM, self.access_key_id, credential_scope, SIGNED_HEADERS, signature
        );
        (authorization, amz_date)
    }

    /// Send a signed request without a body
    async fn send_empty(
        &self,
        method: Method,
        canonical_path: &str,
        query: &[(&str, &str)],
    ) -> CloudResult<reqwest::Response> {
        let canonical_query = canonical_query(query);
        let payload_hash = hex(&Sha256::digest(b""));
        let (authorization, amz_date) =
            self.sign(&method, canonical_path, &canonical_query, &payload_hash, Utc::now());

        let mut url = self.endpoint.clone();
        url.set_path(canonical_path);
        url.set_query((!canonical_query.is_empty()).then_some(canonical_query.as_str()));

        let response = self
            .client
            .request(method, url)
            .header(reqwest::header::AUTHORIZATION, authorization)
            .header("x-amz-date", amz_date)
            .header("x-amz-content-sha256", payload_hash)
            .send()
            .await
            .map_err(CloudError::request)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CloudError::from_status(
                status,
                format!("S3 returned {}: {}", status, text),
                CloudError::Request,
            ));
        }
        Ok(response)
    }

    fn remote_backup(&self, object: ListedObject) -> RemoteBackup {
        RemoteBackup {
            name: object.key.rsplit('/').next().unwrap_or(&object.key).to_string(),
            path: format!("s3://{}/{}", self.bucket, object.key),
            id: object.key,
            size: object.size,
            created_at: object.last_modified,
        }
    }
}

/// SigV4 canonical query string: keys sorted, both sides URI-encoded
fn canonical_query(params: &[(&str, &str)]) -> String {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (urlencoding::encode(k).into_owned(), urlencoding::encode(v).into_owned()))
        .collect();
    encoded.sort();
    encoded
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

#[derive(Debug, PartialEq)]
struct ListedObject {
    key: String,
    size: Option<u64>,
    last_modified: Option<DateTime<Utc>>,
}

/// One ListObjectsV2 page plus the continuation token when truncated
fn parse_list_page(xml: &str) -> CloudResult<(Vec<ListedObject>, Option<String>)> {
    let pattern = |p: &str| {
        Regex::new(p).map_err(|e| CloudError::Request(format!("list parser: {}", e)))
    };
    let contents = pattern(r"(?s)<Contents>(.*?)</Contents>")?;
    let key = pattern(r"<Key>(.*?)</Key>")?;
    let size = pattern(r"<Size>(\d+)</Size>")?;
    let modified = pattern(r"<LastModified>(.*?)</LastModified>")?;
    let next = pattern(r"<NextContinuationToken>(.*?)</NextContinuationToken>")?;
    let truncated = xml.contains("<IsTruncated>true</IsTruncated>");

    let mut objects = Vec::new();
    for entry in contents.captures_iter(xml) {
        let body = &entry[1];
        let Some(k) = key.captures(body) else {
            continue;
        };
        objects.push(ListedObject {
            key: xml_unescape(&k[1]),
            size: size.captures(body).and_then(|c| c[1].parse().ok()),
            last_modified: modified
                .captures(body)
                .and_then(|c| DateTime::parse_from_rfc3339(&c[1]).ok())
                .map(|t| t.with_timezone(&Utc)),
        });
    }
    let token = if truncated {
        next.captures(xml).map(|c| xml_unescape(&c[1]))
    } else {
        None
    };
    Ok((objects, token))
}

fn xml_unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// SigV4 signing key: HMAC chain over date, region, service
pub fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[async_trait]
impl CloudProvider for S3Provider {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn upload(&self, path: &Path, remote_name: &str) -> CloudResult<RemoteObject> {
        let content = tokio::fs::read(path)
            .await
            .map_err(|e| CloudError::Upload(format!("cannot read {}: {}", path.display(), e)))?;

        let key = self.object_key(remote_name);
        let canonical_path = self.canonical_path(&key);
        let (authorization, amz_date, payload_hash) =
            self.sign_put(&canonical_path, &content, Utc::now());

        let mut url = self.endpoint.clone();
        url.set_path(&canonical_path);

        let response = self
            .client
            .put(url)
            .header(reqwest::header::AUTHORIZATION, authorization)
            .header("x-amz-date", amz_date)
            .header("x-amz-content-sha256", payload_hash)
            .header(reqwest::header::CONTENT_TYPE, "application/gzip")
            .body(content)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = format!("S3 returned {}: {}", status, text);
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CloudError::Auth(message),
                _ => CloudError::Upload(message),
            });
        }

        Ok(RemoteObject {
            provider: PROVIDER_NAME.to_string(),
            path: format!("s3://{}/{}", self.bucket, key),
            id: key,
        })
    }

    async fn list(&self) -> CloudResult<Vec<RemoteBackup>> {
        let prefix = match self.config.prefix.trim_matches('/') {
            "" => String::new(),
            p => format!("{}/", p),
        };
        let bucket_path = self.bucket_path();

        let mut backups = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut query = vec![("list-type", "2"), ("prefix", prefix.as_str())];
            if let Some(token) = token.as_deref() {
                query.push(("continuation-token", token));
            }
            let xml = self
                .send_empty(Method::GET, &bucket_path, &query)
                .await?
                .text()
                .await
                .map_err(CloudError::request)?;

            let (objects, next) = parse_list_page(&xml)?;
            backups.extend(
                objects
                    .into_iter()
                    .filter(|o| o.key.ends_with(ARCHIVE_EXTENSION))
                    .map(|o| self.remote_backup(o)),
            );
            match next {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.name.cmp(&b.name)));
        Ok(backups)
    }

    async fn download(&self, remote_id: &str, dest: &Path) -> CloudResult<u64> {
        let response = self
            .send_empty(Method::GET, &self.canonical_path(remote_id), &[])
            .await?;
        write_body(response, dest).await
    }

    async fn delete(&self, remote_id: &str) -> CloudResult<()> {
        self.send_empty(Method::DELETE, &self.canonical_path(remote_id), &[])
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path as AxumPath, Query};
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::{get, put};
    use axum::Router;
    use std::collections::HashMap;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn config(endpoint: &str) -> S3Config {
        S3Config {
            endpoint: Some(endpoint.to_string()),
            access_key_id: Some("AKIDEXAMPLE".into()),
            secret_access_key: Some("wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".into()),
            bucket: Some("gk-backups".into()),
            ..S3Config::default()
        }
    }

    #[test]
    fn test_signing_key_matches_reference_vector() {
        let key = signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        );
        assert_eq!(
            hex(&key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn test_signature_shape() {
        let provider = S3Provider::new(config("https://acct.r2.cloudflarestorage.com")).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let path = provider.canonical_path(&provider.object_key("b 1.tar.gz"));
        assert_eq!(path, "/gk-backups/backups/b%201.tar.gz");

        let (auth, date, hash) = provider.sign_put(&path, b"", now);
        assert_eq!(date, "20260102T030405Z");
        assert_eq!(
            hash,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert!(auth.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20260102/us-east-1/s3/aws4_request, SignedHeaders=host;x-amz-content-sha256;x-amz-date, Signature="
        ));

        // Deterministic for identical input
        assert_eq!(provider.sign_put(&path, b"", now).0, auth);
        assert_ne!(provider.sign_put(&path, b"x", now).0, auth);
    }

    #[test]
    fn test_requires_configuration() {
        assert!(matches!(
            S3Provider::new(S3Config::default()),
            Err(CloudError::NotConfigured(_))
        ));
    }

    async fn serve(status: AxumStatus) -> String {
        let router = Router::new().route(
            "/gk-backups/backups/:name",
            put(move |headers: HeaderMap| async move {
                if headers.get("authorization").is_none() || headers.get("x-amz-date").is_none() {
                    return AxumStatus::BAD_REQUEST;
                }
                status
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_upload_success_and_auth_failure() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("b.tar.gz");
        std::fs::write(&archive, b"archive").unwrap();

        let ok = S3Provider::new(config(&serve(AxumStatus::OK).await)).unwrap();
        let remote = ok.upload(&archive, "b.tar.gz").await.unwrap();
        assert_eq!(remote.path, "s3://gk-backups/backups/b.tar.gz");

        let denied = S3Provider::new(config(&serve(AxumStatus::FORBIDDEN).await)).unwrap();
        assert!(matches!(
            denied.upload(&archive, "b.tar.gz").await,
            Err(CloudError::Auth(_))
        ));

        let broken =
            S3Provider::new(config(&serve(AxumStatus::INTERNAL_SERVER_ERROR).await)).unwrap();
        assert!(matches!(
            broken.upload(&archive, "b.tar.gz").await,
            Err(CloudError::Upload(_))
        ));
    }

    #[test]
    fn test_canonical_query_is_sorted_and_encoded() {
        assert_eq!(
            canonical_query(&[("prefix", "backups/"), ("list-type", "2")]),
            "list-type=2&prefix=backups%2F"
        );
        assert_eq!(canonical_query(&[]), "");
    }

    #[test]
    fn test_parse_list_page() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult>
  <IsTruncated>true</IsTruncated>
  <Contents><Key>backups/a&amp;b.tar.gz</Key><LastModified>2026-03-01T10:00:00.000Z</LastModified><Size>42</Size></Contents>
  <Contents><Key>backups/notes.txt</Key><Size>1</Size></Contents>
  <NextContinuationToken>tok-2</NextContinuationToken>
</ListBucketResult>"#;
        let (objects, token) = parse_list_page(xml).unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].key, "backups/a&b.tar.gz");
        assert_eq!(objects[0].size, Some(42));
        assert!(objects[0].last_modified.is_some());
        assert_eq!(token.as_deref(), Some("tok-2"));
    }

    #[tokio::test]
    async fn test_list_download_delete() {
        let router = Router::new()
            .route(
                "/gk-backups",
                get(|Query(params): Query<HashMap<String, String>>| async move {
                    assert_eq!(params["list-type"], "2");
                    assert_eq!(params["prefix"], "backups/");
                    let body = if params.contains_key("continuation-token") {
                        "<ListBucketResult><IsTruncated>false</IsTruncated>\
                         <Contents><Key>backups/old.tar.gz</Key><Size>3</Size>\
                         <LastModified>2026-01-01T00:00:00Z</LastModified></Contents>\
                         </ListBucketResult>"
                    } else {
                        "<ListBucketResult><IsTruncated>true</IsTruncated>\
                         <Contents><Key>backups/new.tar.gz</Key><Size>5</Size>\
                         <LastModified>2026-02-01T00:00:00Z</LastModified></Contents>\
                         <Contents><Key>backups/readme.md</Key><Size>1</Size></Contents>\
                         <NextContinuationToken>next</NextContinuationToken>\
                         </ListBucketResult>"
                    };
                    body.to_string()
                }),
            )
            .route(
                "/gk-backups/backups/:name",
                get(|AxumPath(name): AxumPath<String>| async move {
                    if name == "new.tar.gz" {
                        (AxumStatus::OK, b"hello".to_vec())
                    } else {
                        (AxumStatus::NOT_FOUND, Vec::new())
                    }
                })
                .delete(|headers: HeaderMap| async move {
                    if headers.get("authorization").is_none() {
                        return AxumStatus::BAD_REQUEST;
                    }
                    AxumStatus::NO_CONTENT
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        let provider = S3Provider::new(config(&format!("http://{}", addr))).unwrap();

        let listed = provider.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].name, "new.tar.gz");
        assert_eq!(listed[0].id, "backups/new.tar.gz");
        assert_eq!(listed[0].path, "s3://gk-backups/backups/new.tar.gz");
        assert_eq!(listed[1].name, "old.tar.gz");

        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("new.tar.gz");
        assert_eq!(provider.download("backups/new.tar.gz", &dest).await.unwrap(), 5);
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello");
        assert!(matches!(
            provider
                .download("backups/gone.tar.gz", &temp.path().join("gone"))
                .await,
            Err(CloudError::NotFound(_))
        ));
        assert!(!temp.path().join("gone").exists());

        provider.delete("backups/new.tar.gz").await.unwrap();
    }
}
