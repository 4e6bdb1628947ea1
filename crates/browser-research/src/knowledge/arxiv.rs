//! `arxiv` context: arXiv Atom API search.

use async_trait::async_trait;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{json, Value};
use url::Url;

use super::{str_param, ContextHandler, Parameters};
use crate::config::AcademicConfig;
use crate::error::{FetchError, KnowledgeError};
use crate::http_client::HttpClient;
use crate::types::Document;

const SORT_ORDERS: &[&str] = &["relevance", "lastUpdatedDate", "submittedDate"];

/// One paper from an Atom feed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArxivEntry {
    pub id: String,
    pub title: String,
    pub summary: String,
    pub authors: Vec<String>,
    pub published: String,
    pub pdf_url: Option<String>,
    pub doi: Option<String>,
    pub categories: Vec<String>,
}

impl ArxivEntry {
    /// `2101.00001v2` from `http://arxiv.org/abs/2101.00001v2`.
    pub fn arxiv_id(&self) -> &str {
        self.id.rsplit("/abs/").next().unwrap_or(&self.id)
    }

    fn into_document(self) -> Document {
        let summary = collapse_ws(&self.summary);
        let published = self.published.get(..10).unwrap_or(&self.published).to_string();
        let mut doc = Document::new(collapse_ws(&self.title), self.id.clone())
            .with_snippet(summary.clone())
            .with_text(summary)
            .with_meta("source", "arxiv")
            .with_meta("arxiv_id", self.arxiv_id())
            .with_meta("authors", self.authors.join(", "))
            .with_meta("published", published);
        if !self.categories.is_empty() {
            doc = doc.with_meta("categories", self.categories.join(", "));
        }
        if let Some(pdf) = self.pdf_url {
            doc = doc.with_meta("pdf_url", pdf);
        }
        if let Some(doi) = self.doi {
            doc = doc.with_meta("doi", doi);
        }
        doc
    }
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn append(slot: &mut String, text: &str) {
    if !slot.is_empty() {
        slot.push(' ');
    }
    slot.push_str(text);
}

fn attr(e: &BytesStart<'_>, name: &str) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name.as_bytes())
        .and_then(|a| a.unescape_value().ok().map(|v| v.to_string()))
}

fn on_element(e: &BytesStart<'_>, entry: &mut ArxivEntry) {
    match e.local_name().as_ref() {
        b"link" => match attr(e, "title").as_deref() {
            Some("pdf") => entry.pdf_url = attr(e, "href"),
            Some("doi") => {
                entry.doi = attr(e, "href").map(|h| {
                    h.split_once("doi.org/")
                        .map(|(_, d)| d.to_string())
                        .unwrap_or(h)
                })
            }
            _ => {}
        },
        b"category" | b"primary_category" => {
            if let Some(term) = attr(e, "term") {
                if !entry.categories.contains(&term) {
                    entry.categories.push(term);
                }
            }
        }
        _ => {}
    }
}

/// Parse an arXiv Atom feed into entries.
pub fn parse_feed(xml: &str) -> Result<Vec<ArxivEntry>, FetchError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut entries = Vec::new();
    let mut current: Option<ArxivEntry> = None;
    let mut current_tag = String::new();
    let mut in_author = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                match name.as_str() {
                    "entry" => current = Some(ArxivEntry::default()),
                    "author" => in_author = true,
                    _ => {
                        if let Some(entry) = current.as_mut() {
                            on_element(&e, entry);
                        }
                    }
                }
                current_tag = name;
            }
            Ok(Event::Empty(e)) => {
                if let Some(entry) = current.as_mut() {
                    on_element(&e, entry);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"entry" => {
                    if let Some(entry) = current.take() {
                        if !entry.id.is_empty() {
                            entries.push(entry);
                        }
                    }
                }
                b"author" => in_author = false,
                _ => current_tag.clear(),
            },
            Ok(Event::Text(e)) => {
                if let Some(entry) = current.as_mut() {
                    let text = e.unescape().unwrap_or_default();
                    let text = text.trim();
                    match current_tag.as_str() {
                        "name" if in_author => entry.authors.push(text.to_string()),
                        "id" => append(&mut entry.id, text),
                        "title" => append(&mut entry.title, text),
                        "summary" => append(&mut entry.summary, text),
                        "published" => append(&mut entry.published, text),
                        _ => {}
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(FetchError::permanent(format!(
                    "arXiv feed parse error at {}: {e}",
                    reader.buffer_position()
                )))
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(entries)
}

pub struct ArxivContext {
    http: HttpClient,
    config: AcademicConfig,
}

impl ArxivContext {
    pub fn new(http: HttpClient, config: AcademicConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl ContextHandler for ArxivContext {
    fn name(&self) -> &'static str {
        "arxiv"
    }

    fn description(&self) -> &'static str {
        "Academic preprints from arXiv"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Search query for arXiv papers"
                },
                "category": {
                    "type": "string",
                    "description": "arXiv category (e.g. 'cs.AI')",
                    "default": ""
                },
                "sort_by": {
                    "type": "string",
                    "enum": SORT_ORDERS,
                    "default": "relevance"
                }
            },
            "required": ["query"]
        })
    }

    fn gate_url(&self, _parameters: &Parameters) -> Result<Url, KnowledgeError> {
        Url::parse(&self.config.api_url).map_err(|e| {
            KnowledgeError::Fetch(FetchError::permanent(format!(
                "bad academic api_url {}: {e}",
                self.config.api_url
            )))
        })
    }

    async fn handle(
        &self,
        parameters: &Parameters,
        max_results: usize,
    ) -> Result<Vec<Document>, KnowledgeError> {
        let query = str_param(parameters, "query", "");
        let category = str_param(parameters, "category", "").trim();
        let sort_by = str_param(parameters, "sort_by", "relevance");
        let max_results = max_results.min(self.config.max_results_per_query).max(1);

        let search_query = if category.is_empty() {
            query.to_string()
        } else {
            format!("cat:{category} AND {query}")
        };
        let params = [
            ("search_query", search_query),
            ("start", "0".to_string()),
            ("max_results", max_results.to_string()),
            ("sortBy", sort_by.to_string()),
            ("sortOrder", "descending".to_string()),
        ];
        let resp = self
            .http
            .get(&self.config.api_url, &params, self.config.timeout_ms)
            .await?
            .error_for_status("arXiv query")?;

        let entries = parse_feed(&resp.body)?;
        tracing::debug!("arXiv returned {} entr(y/ies) for {query:?}", entries.len());
        Ok(entries
            .into_iter()
            .take(max_results)
            .map(ArxivEntry::into_document)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom" xmlns:arxiv="http://arxiv.org/schemas/atom">
  <title>ArXiv Query: search_query=all:transformers</title>
  <id>http://arxiv.org/api/abc</id>
  <entry>
    <id>http://arxiv.org/abs/1706.03762v7</id>
    <published>2017-06-12T17:57:34Z</published>
    <title>Attention Is All
      You Need</title>
    <summary>  The dominant sequence transduction models &amp; more.
    </summary>
    <author><name>Ashish Vaswani</name></author>
    <author><name>Noam Shazeer</name></author>
    <arxiv:doi>10.1000/xyz</arxiv:doi>
    <link title="doi" href="http://dx.doi.org/10.1000/xyz" rel="related"/>
    <link href="http://arxiv.org/abs/1706.03762v7" rel="alternate" type="text/html"/>
    <link title="pdf" href="http://arxiv.org/pdf/1706.03762v7" rel="related" type="application/pdf"/>
    <arxiv:primary_category term="cs.CL" scheme="http://arxiv.org/schemas/atom"/>
    <category term="cs.CL" scheme="http://arxiv.org/schemas/atom"/>
    <category term="cs.LG" scheme="http://arxiv.org/schemas/atom"/>
  </entry>
</feed>"#;

    #[test]
    fn test_parse_feed() {
        let entries = parse_feed(FEED).unwrap();
        assert_eq!(entries.len(), 1);
        let e = &entries[0];
        assert_eq!(e.arxiv_id(), "1706.03762v7");
        assert_eq!(e.authors, vec!["Ashish Vaswani", "Noam Shazeer"]);
        assert_eq!(e.pdf_url.as_deref(), Some("http://arxiv.org/pdf/1706.03762v7"));
        assert_eq!(e.doi.as_deref(), Some("10.1000/xyz"));
        assert_eq!(e.categories, vec!["cs.CL", "cs.LG"]);

        let doc = e.clone().into_document();
        assert_eq!(doc.title, "Attention Is All You Need");
        assert_eq!(doc.text, "The dominant sequence transduction models & more.");
        assert_eq!(doc.metadata["published"], "2017-06-12");
    }

    #[test]
    fn test_malformed_feed_is_permanent() {
        let err = parse_feed("<feed><entry><id>x</feed>").unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_query_with_category_and_cap() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("search_query", "cat:cs.CL AND attention"))
            .and(query_param("max_results", "2"))
            .and(query_param("sortBy", "submittedDate"))
            .respond_with(ResponseTemplate::new(200).set_body_string(FEED))
            .expect(1)
            .mount(&server)
            .await;

        let ctx = ArxivContext::new(
            HttpClient::new("test-agent", 5000),
            AcademicConfig {
                api_url: format!("{}/api/query", server.uri()),
                max_results_per_query: 2,
                ..AcademicConfig::default()
            },
        );
        let params = json!({"query": "attention", "category": "cs.CL", "sort_by": "submittedDate"})
            .as_object()
            .cloned()
            .unwrap();
        let docs = ctx.handle(&params, 5).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].metadata["arxiv_id"], "1706.03762v7");
    }
}
