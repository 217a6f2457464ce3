//! Two-phase document search: exact first, fuzzy only when exact finds
//! nothing.

mod index;

pub use index::{FieldQuery, IndexEntry, SearchBackend, SearchHit, TantivyIndex};

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, instrument};

use crate::error::{ServiceError, ServiceResult, format_error_chain};

/// Which phase produced the results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    Exact,
    Fuzzy,
}

impl MatchMode {
    fn as_str(self) -> &'static str {
        match self {
            MatchMode::Exact => "exact",
            MatchMode::Fuzzy => "fuzzy",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchOutcome {
    pub mode: MatchMode,
    pub hits: Vec<SearchHit>,
    /// More hits matched than `max_results`; only the best ones are returned
    pub truncated: bool,
}

/// Search service over a [`SearchBackend`]
pub struct SearchService {
    backend: Arc<dyn SearchBackend>,
    max_results: usize,
}

impl SearchService {
    pub fn new(backend: Arc<dyn SearchBackend>, max_results: usize) -> Self {
        Self {
            backend,
            max_results,
        }
    }

    /// Run the exact phase and, only if it returns nothing, the fuzzy phase.
    ///
    /// Results are never blended. A term with no indexable tokens matches
    /// nothing. At most `max_results` hits come back, with `truncated` set
    /// when the phase matched more.
    #[instrument(skip(self), fields(max_results = self.max_results))]
    pub async fn search(&self, term: &str) -> ServiceResult<SearchOutcome> {
        let tokens = tokenize(term);
        if tokens.is_empty() {
            debug!("Query has no indexable tokens");
            return Ok(SearchOutcome {
                mode: MatchMode::Exact,
                hits: Vec::new(),
                truncated: false,
            });
        }

        let exact = self.run(MatchMode::Exact, tokens.clone()).await?;
        if !exact.is_empty() {
            return Ok(self.finish(MatchMode::Exact, exact));
        }

        let fuzzy = self.run(MatchMode::Fuzzy, tokens).await?;
        Ok(self.finish(MatchMode::Fuzzy, fuzzy))
    }

    async fn run(&self, mode: MatchMode, tokens: Vec<String>) -> ServiceResult<Vec<SearchHit>> {
        let query = match mode {
            MatchMode::Exact => FieldQuery::Exact(tokens),
            MatchMode::Fuzzy => FieldQuery::Fuzzy(tokens),
        };

        // One extra hit tells a full page apart from a truncated one
        self.backend
            .query(query, self.max_results.saturating_add(1))
            .await
            .map_err(|e| {
                let e = ServiceError::from(e);
                error!(mode = mode.as_str(), error = %format_error_chain(&e), "Search failed");
                e
            })
    }

    fn finish(&self, mode: MatchMode, mut hits: Vec<SearchHit>) -> SearchOutcome {
        let truncated = hits.len() > self.max_results;
        hits.truncate(self.max_results);

        metrics::counter!("scribe_searches_total", "mode" => mode.as_str()).increment(1);
        debug!(mode = mode.as_str(), hits = hits.len(), truncated, "Search complete");
        SearchOutcome {
            mode,
            hits,
            truncated,
        }
    }
}

/// Split on non-alphanumerics and lowercase, matching the index's default
/// tokenizer.
pub fn tokenize(term: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    for token in term
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
    {
        if !tokens.contains(&token) {
            tokens.push(token);
        }
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IndexError;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    fn entry(id: &str, name: &str, author: &str, text: &str) -> IndexEntry {
        IndexEntry {
            document_id: id.to_string(),
            name: name.to_string(),
            author: author.to_string(),
            ocr_text: text.to_string(),
        }
    }

    /// Wraps a real index and records every query sent to it.
    struct CountingBackend {
        index: TantivyIndex,
        queries: Mutex<Vec<FieldQuery>>,
    }

    impl CountingBackend {
        fn fuzzy_queries(&self) -> usize {
            self.queries
                .lock()
                .iter()
                .filter(|q| matches!(q, FieldQuery::Fuzzy(_)))
                .count()
        }
    }

    #[async_trait]
    impl SearchBackend for CountingBackend {
        async fn upsert(&self, entry: IndexEntry) -> Result<(), IndexError> {
            self.index.upsert(entry).await
        }

        async fn query(
            &self,
            query: FieldQuery,
            limit: usize,
        ) -> Result<Vec<SearchHit>, IndexError> {
            self.queries.lock().push(query.clone());
            self.index.query(query, limit).await
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl SearchBackend for FailingBackend {
        async fn upsert(&self, _entry: IndexEntry) -> Result<(), IndexError> {
            Err(IndexError::ReadOnly)
        }

        async fn query(
            &self,
            _query: FieldQuery,
            _limit: usize,
        ) -> Result<Vec<SearchHit>, IndexError> {
            Err(IndexError::TaskFailed {
                message: "index unavailable".to_string(),
            })
        }
    }

    async fn counting(entries: Vec<IndexEntry>) -> (Arc<CountingBackend>, SearchService) {
        counting_with_limit(entries, 100).await
    }

    async fn counting_with_limit(
        entries: Vec<IndexEntry>,
        max_results: usize,
    ) -> (Arc<CountingBackend>, SearchService) {
        let backend = Arc::new(CountingBackend {
            index: TantivyIndex::in_memory().unwrap(),
            queries: Mutex::new(Vec::new()),
        });
        for e in entries {
            backend.upsert(e).await.unwrap();
        }
        let service = SearchService::new(backend.clone(), max_results);
        (backend, service)
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("Invoice 2024"), vec!["invoice", "2024"]);
        assert_eq!(tokenize("$500"), vec!["500"]);
        assert_eq!(tokenize("a-b a"), vec!["a", "b"]);
        assert!(tokenize(" !? ").is_empty());
    }

    #[tokio::test]
    async fn test_exact_hit_skips_fuzzy_phase() {
        let (backend, service) = counting(vec![entry("7", "Letters", "Wagner", "")]).await;

        let outcome = service.search("Wagner").await.unwrap();
        assert_eq!(outcome.mode, MatchMode::Exact);
        assert_eq!(outcome.hits.len(), 1);
        assert_eq!(backend.fuzzy_queries(), 0);
    }

    #[tokio::test]
    async fn test_typo_found_through_fallback_only() {
        let (backend, service) = counting(vec![entry("7", "Letters", "Wagner", "")]).await;

        let outcome = service.search("Wagnr").await.unwrap();
        assert_eq!(outcome.mode, MatchMode::Fuzzy);
        assert_eq!(outcome.hits.len(), 1);
        assert_eq!(outcome.hits[0].author, "Wagner");
        assert_eq!(backend.fuzzy_queries(), 1);
    }

    #[tokio::test]
    async fn test_invoice_found_by_name_and_ocr_text() {
        let (_, service) =
            counting(vec![entry("42", "Invoice 2024", "Jane", "Total due $500")]).await;

        for term in ["Invoice", "500"] {
            let outcome = service.search(term).await.unwrap();
            assert_eq!(outcome.mode, MatchMode::Exact, "term {term}");
            assert_eq!(outcome.hits[0].document_id, "42");
        }
    }

    #[tokio::test]
    async fn test_no_match_is_empty_not_error() {
        let (backend, service) = counting(vec![entry("1", "Minutes", "Board", "")]).await;

        let outcome = service.search("zzzzzzzz").await.unwrap();
        assert_eq!(outcome.mode, MatchMode::Fuzzy);
        assert!(outcome.hits.is_empty());
        assert_eq!(backend.queries.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_results_over_limit_are_flagged_truncated() {
        let entries = (0..5)
            .map(|i| entry(&i.to_string(), &format!("Ledger {i}"), "Clerk", ""))
            .collect();
        let (_, service) = counting_with_limit(entries, 3).await;

        let outcome = service.search("ledger").await.unwrap();
        assert_eq!(outcome.mode, MatchMode::Exact);
        assert_eq!(outcome.hits.len(), 3);
        assert!(outcome.truncated);
    }

    #[tokio::test]
    async fn test_results_at_limit_are_complete() {
        let entries = (0..3)
            .map(|i| entry(&i.to_string(), &format!("Ledger {i}"), "Clerk", ""))
            .collect();
        let (_, service) = counting_with_limit(entries, 3).await;

        let outcome = service.search("ledger").await.unwrap();
        assert_eq!(outcome.hits.len(), 3);
        assert!(!outcome.truncated);
    }

    #[tokio::test]
    async fn test_untokenizable_term_queries_nothing() {
        let (backend, service) = counting(vec![entry("1", "Minutes", "Board", "")]).await;

        let outcome = service.search("%%%").await.unwrap();
        assert!(outcome.hits.is_empty());
        assert!(backend.queries.lock().is_empty());
    }

    #[tokio::test]
    async fn test_backend_failure_propagates() {
        let service = SearchService::new(Arc::new(FailingBackend), 10);
        assert!(matches!(
            service.search("anything").await,
            Err(ServiceError::Index(IndexError::TaskFailed { .. }))
        ));
    }
}
