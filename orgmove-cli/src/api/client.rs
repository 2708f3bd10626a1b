//! Narrow HTTP client for an org's data API
//!
//! Credentials arrive ready-made from the environment; this client only
//! issues the calls the migration needs: broad and filtered queries, the
//! bulk job lifecycles, and row-level batch submission. Retry and backoff
//! are deliberately absent here, so a failed call surfaces to the caller.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_json::json;

use crate::config::{BulkApiVersion, OperationKind};
use crate::data::Row;

/// Poll cadence for bulk query jobs; ingest jobs poll at the engine's
/// configured interval instead
const BULK_QUERY_POLL_MS: u64 = 2000;

/// Authenticated connection to one org
pub struct OrgClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl std::fmt::Debug for OrgClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrgClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    records: Vec<serde_json::Value>,
    #[serde(rename = "totalSize")]
    total_size: Option<usize>,
    #[serde(rename = "nextRecordsUrl")]
    next_records_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct JobStateResponse {
    state: String,
}

/// Outcome of one record in a row-level batch
#[derive(Debug, Clone, Deserialize)]
pub struct BatchResult {
    pub id: Option<String>,
    pub success: bool,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl BatchResult {
    /// Combined error text for a failed record
    pub fn error_message(&self) -> Option<String> {
        (!self.success).then(|| self.errors.join("; "))
    }
}

impl OrgClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http: reqwest::Client::new(),
            base_url,
            token: token.into(),
        }
    }

    /// Build a client for one endpoint from `<PREFIX>_URL` / `<PREFIX>_TOKEN`
    pub fn from_env(prefix: &str) -> Result<Self> {
        let url = std::env::var(format!("{prefix}_URL"))
            .with_context(|| format!("{prefix}_URL is not set"))?;
        let token = std::env::var(format!("{prefix}_TOKEN"))
            .with_context(|| format!("{prefix}_TOKEN is not set"))?;
        Ok(Self::new(url, token))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn query_url(&self, statement: &str) -> String {
        self.url(&format!("/query?q={}", urlencoding::encode(statement)))
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        bail!("org returned {}: {}", status, body)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn get_text(&self, url: &str) -> Result<String> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;
        Ok(Self::check(response).await?.text().await?)
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// Run a query, following result pages until exhausted
    pub async fn query(&self, statement: &str) -> Result<Vec<Row>> {
        let mut url = self.query_url(statement);
        let mut rows = Vec::new();
        loop {
            let response: QueryResponse = self.get_json(&url).await?;
            for record in &response.records {
                if let Some(object) = record.as_object() {
                    rows.push(Row::from_json_object(object));
                }
            }
            match response.next_records_url {
                Some(next) => url = self.url(&next),
                None => break,
            }
        }
        Ok(rows)
    }

    /// Total row count for a COUNT() query, without fetching records
    pub async fn query_count(&self, statement: &str) -> Result<usize> {
        let response: QueryResponse = self.get_json(&self.query_url(statement)).await?;
        Ok(response.total_size.unwrap_or(0))
    }

    /// Run a query through the asynchronous bulk path, for result sets too
    /// large to page through the synchronous endpoint
    pub async fn bulk_query(&self, statement: &str) -> Result<Vec<Row>> {
        let job: JobResponse = self
            .post_json(&self.url("/bulk/v2/query"), &json!({ "query": statement }))
            .await?;
        loop {
            let status: JobStateResponse = self
                .get_json(&self.url(&format!("/bulk/v2/query/{}", job.id)))
                .await?;
            match status.state.as_str() {
                "JobComplete" => break,
                "Failed" | "Aborted" => {
                    bail!("bulk query job {} ended in state {}", job.id, status.state)
                }
                _ => tokio::time::sleep(std::time::Duration::from_millis(BULK_QUERY_POLL_MS)).await,
            }
        }
        let body = self
            .get_text(&self.url(&format!("/bulk/v2/query/{}/results", job.id)))
            .await?;
        csv_to_rows(&body)
    }

    /// Open a bulk ingest job for one entity/operation
    pub async fn create_ingest_job(
        &self,
        version: BulkApiVersion,
        entity: &str,
        operation: OperationKind,
    ) -> Result<String> {
        let body = json!({ "object": entity, "operation": operation.label() });
        let job: JobResponse = self
            .post_json(&self.url(&format!("/bulk/{}/ingest", version.label())), &body)
            .await?;
        Ok(job.id)
    }

    /// Upload one CSV batch to an open ingest job
    pub async fn upload_ingest_batch(
        &self,
        version: BulkApiVersion,
        job_id: &str,
        batch: String,
    ) -> Result<()> {
        let url = self.url(&format!("/bulk/{}/ingest/{}/batches", version.label(), job_id));
        let response = self
            .http
            .put(&url)
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_TYPE, "text/csv")
            .body(batch)
            .send()
            .await
            .with_context(|| format!("PUT {} failed", url))?;
        Self::check(response).await?;
        Ok(())
    }

    /// Mark an ingest job's upload complete so the org starts processing
    pub async fn close_ingest_job(&self, version: BulkApiVersion, job_id: &str) -> Result<()> {
        let url = self.url(&format!("/bulk/{}/ingest/{}", version.label(), job_id));
        let response = self
            .http
            .patch(&url)
            .bearer_auth(&self.token)
            .json(&json!({ "state": "UploadComplete" }))
            .send()
            .await
            .with_context(|| format!("PATCH {} failed", url))?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn ingest_job_state(&self, version: BulkApiVersion, job_id: &str) -> Result<String> {
        let status: JobStateResponse = self
            .get_json(&self.url(&format!("/bulk/{}/ingest/{}", version.label(), job_id)))
            .await?;
        Ok(status.state)
    }

    /// Fetch an ingest job's per-record results, successful or failed
    pub async fn ingest_results(
        &self,
        version: BulkApiVersion,
        job_id: &str,
        successful: bool,
    ) -> Result<Vec<Row>> {
        let kind = if successful { "successfulResults" } else { "failedResults" };
        let body = self
            .get_text(&self.url(&format!(
                "/bulk/{}/ingest/{}/{}",
                version.label(),
                job_id,
                kind
            )))
            .await?;
        csv_to_rows(&body)
    }

    /// Submit one synchronous row-level batch
    pub async fn submit_batch(
        &self,
        entity: &str,
        operation: OperationKind,
        records: &[Row],
    ) -> Result<Vec<BatchResult>> {
        let payload: Vec<serde_json::Value> = records
            .iter()
            .map(|row| serde_json::Value::Object(row.to_json_object()))
            .collect();
        let body = json!({ "operation": operation.label(), "records": payload });
        let results: Vec<BatchResult> = self
            .post_json(&self.url(&format!("/records/{}/batch", entity)), &body)
            .await?;
        if results.len() != records.len() {
            bail!(
                "org returned {} results for a batch of {}",
                results.len(),
                records.len()
            );
        }
        Ok(results)
    }
}

/// Parse a CSV body returned by the bulk endpoints
fn csv_to_rows(body: &str) -> Result<Vec<Row>> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    let mut reader = csv::Reader::from_reader(body.as_bytes());
    let columns: Vec<String> = reader
        .headers()
        .context("bulk result is missing its header row")?
        .iter()
        .map(str::to_string)
        .collect();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(
            columns
                .iter()
                .enumerate()
                .map(|(i, column)| {
                    (
                        column.clone(),
                        crate::data::Value::from_csv(record.get(i).unwrap_or_default()),
                    )
                })
                .collect(),
        );
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_stripped() {
        let client = OrgClient::new("https://org.example/", "token");
        assert_eq!(
            client.query_url("select Id from Account"),
            "https://org.example/query?q=select%20Id%20from%20Account"
        );
    }

    #[test]
    fn test_csv_to_rows() {
        let rows = csv_to_rows("Id,Name\n001,Acme\n002,Globex\n").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].text("Id").as_deref(), Some("001"));
        assert_eq!(rows[1].text("Name").as_deref(), Some("Globex"));

        assert!(csv_to_rows("").unwrap().is_empty());
    }

    #[test]
    fn test_batch_result_error_message() {
        let results: Vec<BatchResult> = serde_json::from_str(
            r#"[
                { "id": "001", "success": true, "errors": [] },
                { "id": null, "success": false, "errors": ["required field missing: Name"] }
            ]"#,
        )
        .unwrap();
        assert_eq!(results[0].error_message(), None);
        assert_eq!(
            results[1].error_message().as_deref(),
            Some("required field missing: Name")
        );
    }
}
