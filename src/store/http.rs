//! HTTP client for the external record store.
//!
//! Wire format:
//! - `GET  {base}/tables/{table}/records` with `filter[field][op]=value`,
//!   `sort=[-]field` and `limit=n` query parameters, returning
//!   `{"records": [{"id": ..., "fields": {...}}]}`.
//! - `POST {base}/tables/{table}/records` with `{"fields": {...}}`,
//!   returning `{"id": ...}`.
//! - `PATCH {base}/tables/{table}/records/{id}` with `{"fields": {...}}`.

use super::{Filter, Record, Sort, StoreError, TableStore};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use tracing::{Instrument, info_span};
use url::Url;

/// Validate a base URL and join an absolute path onto it, preserving any
/// path prefix the base carries.
///
/// # Errors
/// Returns an error for non-HTTP schemes or URLs without a host.
pub(crate) fn endpoint_url(base: &str, path: &str) -> Result<String, StoreError> {
    let url = Url::parse(base).map_err(|err| StoreError::Endpoint(err.to_string()))?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(StoreError::Endpoint(format!(
                "unsupported scheme {scheme}"
            )));
        }
    }

    if url.host().is_none() {
        return Err(StoreError::Endpoint("no host specified".to_string()));
    }

    Ok(format!("{}{path}", base.trim_end_matches('/')))
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn build_query(
    filter: Option<&Filter>,
    sort: Option<&Sort>,
    limit: Option<usize>,
) -> Vec<(String, String)> {
    let mut pairs = Vec::new();

    if let Some(filter) = filter {
        for condition in filter.conditions() {
            pairs.push((
                format!("filter[{}][{}]", condition.field, condition.comparison.as_str()),
                render_value(&condition.value),
            ));
        }
    }

    if let Some(sort) = sort {
        let direction = if sort.descending {
            format!("-{}", sort.field)
        } else {
            sort.field.clone()
        };
        pairs.push(("sort".to_string(), direction));
    }

    if let Some(limit) = limit {
        pairs.push(("limit".to_string(), limit.to_string()));
    }

    pairs
}

#[derive(Deserialize)]
struct ListResponse {
    records: Vec<Record>,
}

#[derive(Deserialize)]
struct CreateResponse {
    id: String,
}

#[derive(Clone)]
pub struct HttpTableStore {
    client: Client,
    base_url: String,
    token: SecretString,
}

impl HttpTableStore {
    /// Build a store client with its own HTTP client.
    ///
    /// # Errors
    /// Returns an error if the base URL is invalid or the client cannot be built.
    pub fn new(base_url: &str, token: SecretString, user_agent: &str) -> Result<Self, StoreError> {
        let client = Client::builder().user_agent(user_agent).build()?;
        Self::with_client(client, base_url, token)
    }

    /// Build a store client on top of an existing HTTP client, typically one
    /// carrying a certificate-pinned TLS configuration.
    ///
    /// # Errors
    /// Returns an error if the base URL is invalid.
    pub fn with_client(
        client: Client,
        base_url: &str,
        token: SecretString,
    ) -> Result<Self, StoreError> {
        // Fail early on malformed URLs instead of on the first request.
        endpoint_url(base_url, "")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn records_url(&self, table: &str, id: Option<&str>) -> Result<String, StoreError> {
        let path = match id {
            Some(id) => format!("/tables/{table}/records/{id}"),
            None => format!("/tables/{table}/records"),
        };
        endpoint_url(&self.base_url, &path)
    }

    async fn backend_error(response: reqwest::Response) -> StoreError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        StoreError::Backend { status, body }
    }
}

impl std::fmt::Debug for HttpTableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTableStore")
            .field("base_url", &self.base_url)
            .field("token", &"***")
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TableStore for HttpTableStore {
    async fn list(
        &self,
        table: &str,
        filter: Option<&Filter>,
        sort: Option<&Sort>,
        limit: Option<usize>,
    ) -> Result<Vec<Record>, StoreError> {
        let url = self.records_url(table, None)?;
        let query = build_query(filter, sort, limit);

        let span = info_span!(
            "store.list",
            http.method = "GET",
            url = %url,
            table = %table
        );
        let response = self
            .client
            .get(&url)
            .query(&query)
            .bearer_auth(self.token.expose_secret())
            .send()
            .instrument(span)
            .await?;

        if !response.status().is_success() {
            return Err(Self::backend_error(response).await);
        }

        let body: ListResponse = response
            .json()
            .await
            .map_err(|err| StoreError::Malformed(err.to_string()))?;
        Ok(body.records)
    }

    async fn create(&self, table: &str, fields: Value) -> Result<String, StoreError> {
        let url = self.records_url(table, None)?;

        let span = info_span!(
            "store.create",
            http.method = "POST",
            url = %url,
            table = %table
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.token.expose_secret())
            .json(&serde_json::json!({ "fields": fields }))
            .send()
            .instrument(span)
            .await?;

        if !response.status().is_success() {
            return Err(Self::backend_error(response).await);
        }

        let body: CreateResponse = response
            .json()
            .await
            .map_err(|err| StoreError::Malformed(err.to_string()))?;
        Ok(body.id)
    }

    async fn update(&self, table: &str, id: &str, fields: Value) -> Result<(), StoreError> {
        let url = self.records_url(table, Some(id))?;

        let span = info_span!(
            "store.update",
            http.method = "PATCH",
            url = %url,
            table = %table
        );
        let response = self
            .client
            .patch(&url)
            .bearer_auth(self.token.expose_secret())
            .json(&serde_json::json!({ "fields": fields }))
            .send()
            .instrument(span)
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound {
                table: table.to_string(),
                id: id.to_string(),
            });
        }

        if !response.status().is_success() {
            return Err(Self::backend_error(response).await);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Comparison;
    use serde_json::json;

    #[test]
    fn endpoint_url_preserves_base_path() -> Result<(), StoreError> {
        let url = endpoint_url("https://store.example.com/api/v1/", "/tables/t/records")?;
        assert_eq!(url, "https://store.example.com/api/v1/tables/t/records");
        Ok(())
    }

    #[test]
    fn endpoint_url_rejects_unsupported_scheme() {
        let err = endpoint_url("ftp://store.example.com", "/tables/t/records")
            .err()
            .map(|e| e.to_string())
            .unwrap_or_default();
        assert!(err.contains("unsupported scheme"));
    }

    #[test]
    fn endpoint_url_rejects_missing_host() {
        assert!(endpoint_url("http://", "/tables/t/records").is_err());
    }

    #[test]
    fn query_pairs_cover_filter_sort_and_limit() {
        let filter = Filter::new()
            .eq("action", "LOGIN_FAILED")
            .gte("timestamp", "2025-01-01T00:00:00Z");
        let sort = Sort::descending("timestamp");

        let pairs = build_query(Some(&filter), Some(&sort), Some(50));

        assert_eq!(
            pairs,
            vec![
                (
                    "filter[action][eq]".to_string(),
                    "LOGIN_FAILED".to_string()
                ),
                (
                    "filter[timestamp][gte]".to_string(),
                    "2025-01-01T00:00:00Z".to_string()
                ),
                ("sort".to_string(), "-timestamp".to_string()),
                ("limit".to_string(), "50".to_string()),
            ]
        );
    }

    #[test]
    fn query_renders_non_string_values_as_json() {
        let filter = Filter::new().eq("success", false).gte("count", 10);
        let pairs = build_query(Some(&filter), None, None);

        assert_eq!(pairs[0].1, "false");
        assert_eq!(pairs[1].1, "10");
    }

    #[test]
    fn absent_parameters_produce_no_pairs() {
        assert!(build_query(None, None, None).is_empty());
    }

    #[test]
    fn list_response_parses_records() {
        let body: ListResponse = serde_json::from_value(json!({
            "records": [
                {"id": "rec-1", "fields": {"actor": "alice"}},
                {"id": "rec-2", "fields": {"actor": "bob"}}
            ]
        }))
        .expect("valid list body");
        assert_eq!(body.records.len(), 2);
        assert_eq!(body.records[0].id, "rec-1");
        assert_eq!(body.records[1].fields["actor"], "bob");
    }

    #[test]
    fn comparison_wire_names() {
        assert_eq!(Comparison::Eq.as_str(), "eq");
        assert_eq!(Comparison::Gte.as_str(), "gte");
    }
}
