//! Knowledge-management retrieval.
//!
//! One public `search` fans a small query set out in parallel, deduplicates
//! hits by document id, ranks by reranker score and truncates to the top
//! results. An individual query failure only costs that query; the search as
//! a whole fails when every query does.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{CoreError, Result};

pub const MAX_RESULTS: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KmDocument {
    pub id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub sample_questions: Option<String>,
    #[serde(default)]
    pub metadata: Option<String>,
    #[serde(default)]
    pub public_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KmDataItem {
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub reranker_score: f64,
    pub document: KmDocument,
    #[serde(default)]
    pub document_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KmSearchResponse {
    pub total: usize,
    pub data: Vec<KmDataItem>,
}

/// One retrieval call as issued by the orchestrator.
#[derive(Debug, Clone)]
pub struct KmQuery {
    pub query: String,
    pub keywords: Vec<String>,
    pub language: String,
    pub km_id: String,
}

/// Retrieval seam.
#[async_trait]
pub trait KnowledgeSearch: Send + Sync {
    async fn search(&self, query: &KmQuery) -> Result<KmSearchResponse>;
}

pub struct HttpKmClient {
    http: reqwest::Client,
    api_url: String,
    token: String,
    timeout: Duration,
}

impl HttpKmClient {
    pub fn new(http: reqwest::Client, api_url: String, token: String, timeout: Duration) -> Self {
        Self {
            http,
            api_url,
            token,
            timeout,
        }
    }

    async fn search_one(&self, text: &str, knowledge_id: i64, language: &str) -> Result<Vec<KmDataItem>> {
        let response = self
            .http
            .post(&self.api_url)
            .timeout(self.timeout)
            .header("Content-Type", "application/json")
            .bearer_auth(&self.token)
            .json(&serde_json::json!({
                "content": text,
                "knowledgeId": knowledge_id,
                "language": language,
            }))
            .send()
            .await
            .map_err(|e| CoreError::KmFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::KmFailed(format!("HTTP {status}: {body}")));
        }
        let parsed: KmSearchResponse = response
            .json()
            .await
            .map_err(|e| CoreError::KmFailed(e.to_string()))?;
        Ok(parsed.data)
    }
}

#[async_trait]
impl KnowledgeSearch for HttpKmClient {
    async fn search(&self, query: &KmQuery) -> Result<KmSearchResponse> {
        let knowledge_id: i64 = query
            .km_id
            .parse()
            .map_err(|_| CoreError::KmFailed(format!("Invalid knowledge id: {}", query.km_id)))?;

        let texts = build_query_set(&query.query, &query.keywords);
        if texts.is_empty() {
            return Ok(KmSearchResponse::default());
        }
        info!(queries = texts.len(), "Fanning out KM search");

        let calls = texts
            .iter()
            .map(|text| self.search_one(text, knowledge_id, &query.language));
        let outcomes = join_all(calls).await;

        let mut batches = Vec::new();
        let mut failures = 0usize;
        for (text, outcome) in texts.iter().zip(outcomes) {
            match outcome {
                Ok(items) => batches.push(items),
                Err(err) => {
                    failures += 1;
                    warn!(query = %text, error = %err, "KM query failed");
                }
            }
        }
        if failures == texts.len() {
            return Err(CoreError::KmFailed("Every KM query failed".into()));
        }
        Ok(merge_results(batches))
    }
}

/// The correction itself, plus the correction joined with the keyword set.
/// Duplicates and blanks drop out.
pub fn build_query_set(query: &str, keywords: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let mut push = |text: String| {
        let trimmed = text.trim().to_string();
        if !trimmed.is_empty() && seen.insert(trimmed.clone()) {
            out.push(trimmed);
        }
    };
    push(query.to_string());
    if !keywords.is_empty() {
        push(format!("{} {}", query, keywords.join(" ")));
    }
    out
}

/// Deduplicate by document id, rank by reranker score, keep the top
/// [`MAX_RESULTS`].
pub fn merge_results(batches: Vec<Vec<KmDataItem>>) -> KmSearchResponse {
    let mut seen = HashSet::new();
    let mut merged: Vec<KmDataItem> = Vec::new();
    for item in batches.into_iter().flatten() {
        let doc_id = if item.document_id.is_empty() {
            item.document.id.clone()
        } else {
            item.document_id.clone()
        };
        if seen.insert(doc_id) {
            merged.push(item);
        }
    }
    merged.sort_by(|a, b| b.reranker_score.total_cmp(&a.reranker_score));
    merged.truncate(MAX_RESULTS);
    KmSearchResponse {
        total: merged.len(),
        data: merged,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(doc_id: &str, reranker_score: f64) -> KmDataItem {
        KmDataItem {
            score: 0.5,
            reranker_score,
            document: KmDocument {
                id: doc_id.to_string(),
                content: format!("content of {doc_id}"),
                sample_questions: None,
                metadata: None,
                public_id: Some(format!("doc-{doc_id}")),
                title: None,
            },
            document_id: doc_id.to_string(),
        }
    }

    #[test]
    fn query_set_joins_keywords_with_the_correction() {
        let queries = build_query_set("where is the lobby", &["lobby".into(), "map".into()]);
        assert_eq!(
            queries,
            vec![
                "where is the lobby".to_string(),
                "where is the lobby lobby map".to_string()
            ]
        );
    }

    #[test]
    fn query_set_without_keywords_is_the_correction_alone() {
        let queries = build_query_set("hello", &[]);
        assert_eq!(queries, vec!["hello".to_string()]);
    }

    #[test]
    fn blank_query_yields_no_queries() {
        assert!(build_query_set("   ", &[]).is_empty());
    }

    #[test]
    fn merge_deduplicates_and_ranks_by_reranker_score() {
        let merged = merge_results(vec![
            vec![item("a", 0.2), item("b", 0.9)],
            vec![item("a", 0.2), item("c", 0.5)],
        ]);
        assert_eq!(merged.total, 3);
        let ids: Vec<&str> = merged.data.iter().map(|i| i.document_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn merge_truncates_to_max_results() {
        let batch: Vec<KmDataItem> = (0..20).map(|i| item(&format!("d{i}"), i as f64)).collect();
        let merged = merge_results(vec![batch]);
        assert_eq!(merged.total, MAX_RESULTS);
        assert_eq!(merged.data.len(), MAX_RESULTS);
    }

    #[test]
    fn wire_shape_round_trips() {
        let raw = serde_json::json!({
            "total": 1,
            "data": [{
                "score": 0.7,
                "rerankerScore": 0.9,
                "documentId": "42",
                "document": {
                    "id": "42",
                    "content": "lobby is on floor 1",
                    "publicId": "doc-42",
                    "sampleQuestions": "where is the lobby?"
                }
            }]
        });
        let parsed: KmSearchResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.data[0].document.public_id.as_deref(), Some("doc-42"));
        let back = serde_json::to_value(&parsed).unwrap();
        assert_eq!(back["data"][0]["rerankerScore"], 0.9);
    }
}
