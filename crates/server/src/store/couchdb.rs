use super::{AssociationStore, digest};
use crate::error::StoreError;
use crate::http::{HttpClient, HttpResponse};
use crate::openid::{Association, nonce};
use async_trait::async_trait;
use hyper::Method;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};
use url::Url;

/// Upper bound on documents fetched by one `_find` query.
const FIND_LIMIT: usize = 10_000;

/// Associations and nonces as documents in a CouchDB database.
///
/// Document ids are derived from hashed keys, so creating a nonce document
/// that already exists fails with `409 Conflict`; that conflict is how a
/// replay is detected.
#[derive(Clone, Debug)]
pub struct CouchDbStore {
    http: HttpClient,
    database: Url,
}

#[derive(Debug, Deserialize)]
struct FindResponse {
    docs: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct DocRev {
    #[serde(rename = "_rev")]
    rev: String,
}

fn association_id(server_url: &str, handle: &str) -> String {
    format!("association:{}:{}", digest(server_url), digest(handle))
}

fn nonce_id(server_url: &str, timestamp: i64, salt: &str) -> String {
    format!(
        "nonce:{timestamp}:{}",
        digest(&format!("{server_url}\0{salt}"))
    )
}

fn expect_status(
    response: HttpResponse,
    accepted: &[u16],
    context: &str,
) -> Result<HttpResponse, StoreError> {
    if accepted.contains(&response.status.as_u16()) {
        Ok(response)
    } else {
        Err(StoreError::CouchDb {
            status: response.status.as_u16(),
            context: format!("{context}: {}", response.text()),
        })
    }
}

impl CouchDbStore {
    pub fn new(http: HttpClient, database: Url) -> Self {
        Self { http, database }
    }

    fn url(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = self.database.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::Unavailable(format!("{} cannot be a base URL", self.database)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Create the database unless it already exists.
    pub async fn ensure_database(&self) -> Result<(), StoreError> {
        let response = self
            .http
            .send_json(Method::PUT, &self.database, None)
            .await?;
        let response = expect_status(response, &[201, 202, 412], "create database")?;
        if response.status.as_u16() == 412 {
            debug!(database = %self.database, "CouchDB database already exists");
        } else {
            info!(database = %self.database, "created CouchDB database");
        }
        Ok(())
    }

    async fn get_doc(&self, id: &str) -> Result<Option<Value>, StoreError> {
        let response = self
            .http
            .send_json(Method::GET, &self.url(&[id])?, None)
            .await?;
        if response.status.as_u16() == 404 {
            return Ok(None);
        }
        let response = expect_status(response, &[200], "get document")?;
        Ok(Some(serde_json::from_slice(&response.body)?))
    }

    async fn find(&self, selector: Value) -> Result<Vec<Value>, StoreError> {
        let body = json!({ "selector": selector, "limit": FIND_LIMIT });
        let response = self
            .http
            .send_json(Method::POST, &self.url(&["_find"])?, Some(&body))
            .await?;
        let response = expect_status(response, &[200], "find documents")?;
        let found: FindResponse = serde_json::from_slice(&response.body)?;
        Ok(found.docs)
    }

    async fn bulk_delete(&self, docs: &[Value]) -> Result<usize, StoreError> {
        if docs.is_empty() {
            return Ok(0);
        }
        let deletions: Vec<Value> = docs
            .iter()
            .map(|doc| json!({ "_id": doc["_id"], "_rev": doc["_rev"], "_deleted": true }))
            .collect();
        let response = self
            .http
            .send_json(
                Method::POST,
                &self.url(&["_bulk_docs"])?,
                Some(&json!({ "docs": deletions })),
            )
            .await?;
        let response = expect_status(response, &[201, 202], "bulk delete")?;
        let results: Vec<Value> = serde_json::from_slice(&response.body)?;
        Ok(results
            .iter()
            .filter(|r| r.get("ok").and_then(Value::as_bool) == Some(true))
            .count())
    }
}

fn association_from_doc(doc: Value) -> Result<Association, StoreError> {
    Ok(serde_json::from_value(doc)?)
}

#[async_trait]
impl AssociationStore for CouchDbStore {
    async fn store_association(
        &self,
        server_url: &str,
        association: &Association,
    ) -> Result<(), StoreError> {
        let id = association_id(server_url, &association.handle);
        let mut doc = serde_json::to_value(association)?;
        doc["type"] = json!("association");
        doc["server_url"] = json!(server_url);
        if let Some(existing) = self.get_doc(&id).await? {
            let rev: DocRev = serde_json::from_value(existing)?;
            doc["_rev"] = json!(rev.rev);
        }
        let response = self
            .http
            .send_json(Method::PUT, &self.url(&[id.as_str()])?, Some(&doc))
            .await?;
        expect_status(response, &[201, 202], "store association")?;
        Ok(())
    }

    async fn get_association(
        &self,
        server_url: &str,
        handle: Option<&str>,
    ) -> Result<Option<Association>, StoreError> {
        if let Some(handle) = handle {
            return self
                .get_doc(&association_id(server_url, handle))
                .await?
                .map(association_from_doc)
                .transpose();
        }

        let now = nonce::now();
        let docs = self
            .find(json!({ "type": "association", "server_url": server_url }))
            .await?;
        let mut newest: Option<Association> = None;
        for doc in docs {
            let association = association_from_doc(doc)?;
            if association.is_expired(now) {
                continue;
            }
            if newest.as_ref().is_none_or(|n| association.issued > n.issued) {
                newest = Some(association);
            }
        }
        Ok(newest)
    }

    async fn remove_association(
        &self,
        server_url: &str,
        handle: &str,
    ) -> Result<bool, StoreError> {
        let id = association_id(server_url, handle);
        let Some(existing) = self.get_doc(&id).await? else {
            return Ok(false);
        };
        let rev: DocRev = serde_json::from_value(existing)?;
        let mut url = self.url(&[id.as_str()])?;
        url.query_pairs_mut().append_pair("rev", &rev.rev);
        let response = self.http.send_json(Method::DELETE, &url, None).await?;
        if response.status.as_u16() == 404 {
            return Ok(false);
        }
        expect_status(response, &[200, 202], "remove association")?;
        Ok(true)
    }

    async fn use_nonce(
        &self,
        server_url: &str,
        timestamp: i64,
        salt: &str,
    ) -> Result<bool, StoreError> {
        if !nonce::within_skew(timestamp, nonce::now()) {
            return Ok(false);
        }
        let id = nonce_id(server_url, timestamp, salt);
        let doc = json!({ "type": "nonce", "server_url": server_url, "timestamp": timestamp });
        let response = self
            .http
            .send_json(Method::PUT, &self.url(&[id.as_str()])?, Some(&doc))
            .await?;
        match response.status.as_u16() {
            201 | 202 => Ok(true),
            409 => Ok(false),
            _ => expect_status(response, &[], "record nonce").map(|_| false),
        }
    }

    async fn cleanup_nonces(&self) -> Result<usize, StoreError> {
        let now = nonce::now();
        let docs = self
            .find(json!({
                "type": "nonce",
                "$or": [
                    { "timestamp": { "$lt": now - nonce::SKEW_SECS } },
                    { "timestamp": { "$gt": now + nonce::SKEW_SECS } }
                ]
            }))
            .await?;
        self.bulk_delete(&docs).await
    }

    async fn cleanup_associations(&self) -> Result<usize, StoreError> {
        let now = nonce::now();
        let docs = self.find(json!({ "type": "association" })).await?;
        let expired: Vec<Value> = docs
            .into_iter()
            .filter(|doc| {
                serde_json::from_value::<Association>(doc.clone())
                    .map(|a| a.is_expired(now))
                    .unwrap_or(true)
            })
            .collect();
        self.bulk_delete(&expired).await
    }
}
