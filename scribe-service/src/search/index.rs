//! Embedded tantivy index keyed by document id.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tantivy::collector::TopDocs;
use tantivy::directory::MmapDirectory;
use tantivy::query::{BooleanQuery, FuzzyTermQuery, Occur, Query, RegexQuery, TermQuery};
use tantivy::schema::{Field, IndexRecordOption, STORED, STRING, Schema, TEXT, Value};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term, doc};
use tracing::{debug, info};

use crate::error::IndexError;

/// Edit distance for the fuzzy phase
pub const FUZZY_DISTANCE: u8 = 2;

/// One searchable document
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub document_id: String,
    pub name: String,
    pub author: String,
    pub ocr_text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub document_id: String,
    pub name: String,
    pub author: String,
    pub score: f32,
}

/// Query over `name`, `author` and `ocr_text`, OR'd across fields and tokens.
/// Tokens are already lowercased and split the way the index splits text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldQuery {
    /// Term match or substring (`*token*`) match
    Exact(Vec<String>),
    /// Terms within [`FUZZY_DISTANCE`] edits, transpositions counting once
    Fuzzy(Vec<String>),
}

#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Replace the entry for `entry.document_id`, or add it.
    async fn upsert(&self, entry: IndexEntry) -> Result<(), IndexError>;

    /// Hits ordered by descending score, at most `limit`.
    async fn query(&self, query: FieldQuery, limit: usize) -> Result<Vec<SearchHit>, IndexError>;
}

#[derive(Clone, Copy)]
struct IndexFields {
    document_id: Field,
    name: Field,
    author: Field,
    ocr_text: Field,
}

impl IndexFields {
    fn searchable(&self) -> [Field; 3] {
        [self.name, self.author, self.ocr_text]
    }
}

fn build_schema() -> (Schema, IndexFields) {
    let mut builder = Schema::builder();
    let fields = IndexFields {
        document_id: builder.add_text_field("document_id", STRING | STORED),
        name: builder.add_text_field("name", TEXT | STORED),
        author: builder.add_text_field("author", TEXT | STORED),
        ocr_text: builder.add_text_field("ocr_text", TEXT | STORED),
    };
    (builder.build(), fields)
}

struct IndexInner {
    reader: IndexReader,
    writer: Option<Mutex<IndexWriter>>,
    fields: IndexFields,
}

/// Tantivy-backed [`SearchBackend`]
///
/// Only one process may hold the writer for a directory; other processes
/// open it read-only and pick up commits as they land.
#[derive(Clone)]
pub struct TantivyIndex {
    inner: Arc<IndexInner>,
}

impl TantivyIndex {
    /// Open or create a writable index in `dir`.
    pub fn open(dir: &Path, writer_heap_bytes: usize) -> Result<Self, IndexError> {
        let index = Self::open_dir(dir)?;
        let index = Self::from_index(index, Some(writer_heap_bytes))?;
        info!(
            path = %dir.display(),
            docs = index.num_docs(),
            "Opened search index for writing"
        );
        Ok(index)
    }

    /// Open or create an index in `dir` for searching only.
    pub fn open_read_only(dir: &Path) -> Result<Self, IndexError> {
        let index = Self::open_dir(dir)?;
        let index = Self::from_index(index, None)?;
        info!(
            path = %dir.display(),
            docs = index.num_docs(),
            "Opened search index read-only"
        );
        Ok(index)
    }

    /// Writable index held entirely in memory.
    #[cfg(test)]
    pub fn in_memory() -> Result<Self, IndexError> {
        let (schema, _) = build_schema();
        Self::from_index(Index::create_in_ram(schema), Some(15_000_000))
    }

    fn open_dir(dir: &Path) -> Result<Index, IndexError> {
        std::fs::create_dir_all(dir).map_err(|source| IndexError::Directory {
            path: dir.to_path_buf(),
            source,
        })?;
        let directory = MmapDirectory::open(dir).map_err(tantivy::TantivyError::from)?;
        let (schema, _) = build_schema();
        Ok(Index::open_or_create(directory, schema)?)
    }

    fn from_index(index: Index, writer_heap_bytes: Option<usize>) -> Result<Self, IndexError> {
        let (_, fields) = build_schema();
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()?;
        let writer = writer_heap_bytes
            .map(|heap| index.writer(heap))
            .transpose()?
            .map(Mutex::new);

        Ok(Self {
            inner: Arc::new(IndexInner {
                reader,
                writer,
                fields,
            }),
        })
    }

    /// Number of live documents visible to searchers
    pub fn num_docs(&self) -> u64 {
        self.inner.reader.searcher().num_docs()
    }
}

impl IndexInner {
    fn upsert(&self, entry: &IndexEntry) -> Result<(), IndexError> {
        let writer = self.writer.as_ref().ok_or(IndexError::ReadOnly)?;
        let f = self.fields;

        let mut writer = writer.lock();
        writer.delete_term(Term::from_field_text(f.document_id, &entry.document_id));
        writer.add_document(doc!(
            f.document_id => entry.document_id.as_str(),
            f.name => entry.name.as_str(),
            f.author => entry.author.as_str(),
            f.ocr_text => entry.ocr_text.as_str()
        ))?;
        writer.commit()?;
        drop(writer);

        self.reader.reload()?;
        Ok(())
    }

    fn build_query(&self, query: &FieldQuery) -> Result<Box<dyn Query>, IndexError> {
        let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();

        for field in self.fields.searchable() {
            match query {
                FieldQuery::Exact(tokens) => {
                    for token in tokens {
                        let term = Term::from_field_text(field, token);
                        clauses.push((
                            Occur::Should,
                            Box::new(TermQuery::new(term, IndexRecordOption::WithFreqs)),
                        ));

                        let pattern = format!(".*{}.*", escape_regex(token));
                        let wildcard = RegexQuery::from_pattern(&pattern, field).map_err(|e| {
                            IndexError::InvalidQuery {
                                message: format!("{pattern}: {e}"),
                            }
                        })?;
                        clauses.push((Occur::Should, Box::new(wildcard)));
                    }
                }
                FieldQuery::Fuzzy(tokens) => {
                    for token in tokens {
                        let term = Term::from_field_text(field, token);
                        clauses.push((
                            Occur::Should,
                            Box::new(FuzzyTermQuery::new(term, FUZZY_DISTANCE, true)),
                        ));
                    }
                }
            }
        }

        Ok(Box::new(BooleanQuery::new(clauses)))
    }

    fn query(&self, query: &FieldQuery, limit: usize) -> Result<Vec<SearchHit>, IndexError> {
        let tokens = match query {
            FieldQuery::Exact(tokens) | FieldQuery::Fuzzy(tokens) => tokens,
        };
        if tokens.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let tantivy_query = self.build_query(query)?;
        let searcher = self.reader.searcher();
        let top = searcher.search(&*tantivy_query, &TopDocs::with_limit(limit))?;

        let f = self.fields;
        let mut hits = Vec::with_capacity(top.len());
        for (score, address) in top {
            let doc: TantivyDocument = searcher.doc(address)?;
            let text = |field: Field| {
                doc.get_first(field)
                    .and_then(|value| value.as_str())
                    .unwrap_or_default()
                    .to_string()
            };
            hits.push(SearchHit {
                document_id: text(f.document_id),
                name: text(f.name),
                author: text(f.author),
                score,
            });
        }
        Ok(hits)
    }
}

#[async_trait]
impl SearchBackend for TantivyIndex {
    async fn upsert(&self, entry: IndexEntry) -> Result<(), IndexError> {
        let inner = Arc::clone(&self.inner);
        let document_id = entry.document_id.clone();

        tokio::task::spawn_blocking(move || inner.upsert(&entry))
            .await
            .map_err(|e| IndexError::TaskFailed {
                message: e.to_string(),
            })??;

        debug!(doc_id = %document_id, "Index entry upserted");
        Ok(())
    }

    async fn query(&self, query: FieldQuery, limit: usize) -> Result<Vec<SearchHit>, IndexError> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.query(&query, limit))
            .await
            .map_err(|e| IndexError::TaskFailed {
                message: e.to_string(),
            })?
    }
}

/// Escape regex metacharacters so a token matches literally.
fn escape_regex(token: &str) -> String {
    let mut escaped = String::with_capacity(token.len());
    for c in token.chars() {
        if "\\.+*?()|[]{}^$#&-~".contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
