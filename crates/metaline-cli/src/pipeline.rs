//! Pipeline glue: harvester callback → worker pool → enrichment → sink.
//!
//! Each harvested record envelope is serialized into a pool request; the
//! pool's job function turns it into a flat document, enriches configured
//! vocabulary fields, and hands the result to the record sink. The harvest
//! date is only persisted once every queued record has been worked off.

use std::fs::File;
use std::io::Write as _;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use metaline_core::{Fetcher, SharedProgress, WorkerPool};
use metaline_enrich::{EnrichConfig, Enricher, FlatDocument, MemoryLabelCache};
use metaline_oai::state::{HarvestState, MemoryState};
use metaline_oai::{Harvester, HttpBackend, RecordEnvelope, SourceConfig, dom};

use crate::config::Config;

/// Wire form of a record envelope submitted to the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkRequest {
    pub source: String,
    pub id: String,
    pub deleted: bool,
    pub payload: Option<String>,
}

impl From<RecordEnvelope> for WorkRequest {
    fn from(envelope: RecordEnvelope) -> Self {
        Self {
            source: envelope.source,
            id: envelope.id,
            deleted: envelope.deleted,
            payload: envelope.payload,
        }
    }
}

/// Per-format adapter turning a raw record into a flat document.
pub trait RecordDriver: Send + Sync {
    fn transform(&self, source: &str, id: &str, payload: &str) -> Result<FlatDocument>;
}

/// Pass-through driver: keeps the full record and lifts immediate child
/// elements into fields by local name.
pub struct XmlDriver;

impl RecordDriver for XmlDriver {
    fn transform(&self, _source: &str, id: &str, payload: &str) -> Result<FlatDocument> {
        let root = dom::parse(payload)
            .map_err(|e| anyhow::anyhow!("record {id} is not well-formed XML: {e}"))?;
        let mut doc = FlatDocument::new();
        doc.append("id", id);
        doc.append("fullrecord", payload);
        for node in &root.children {
            if let dom::Node::Element(child) = node {
                let text = child.text();
                let text = text.trim();
                if !text.is_empty() {
                    doc.append(child.local_name(), text);
                }
            }
        }
        Ok(doc)
    }
}

/// Destination for processed documents.
pub trait RecordSink: Send + Sync {
    /// Returns the number of indexed documents (counted as changed).
    fn upsert(&self, source: &str, id: &str, doc: &FlatDocument) -> Result<usize>;
    /// Returns the number of documents counted as changed (deletes: 0).
    fn delete(&self, source: &str, id: &str) -> Result<usize>;
}

/// Newline-delimited JSON sink, one action per line.
pub struct JsonFileSink {
    file: Mutex<File>,
}

impl JsonFileSink {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("cannot create output dir {}", dir.display()))?;
        }
        let file = File::create(path)
            .with_context(|| format!("cannot create sink file {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    fn write_line(&self, line: &Value) -> Result<()> {
        let mut file = self.file.lock().unwrap();
        writeln!(file, "{line}").context("cannot write to sink file")?;
        Ok(())
    }
}

impl RecordSink for JsonFileSink {
    fn upsert(&self, source: &str, id: &str, doc: &FlatDocument) -> Result<usize> {
        self.write_line(&json!({
            "action": "upsert",
            "source": source,
            "id": id,
            "doc": doc,
        }))?;
        Ok(1)
    }

    fn delete(&self, source: &str, id: &str) -> Result<usize> {
        self.write_line(&json!({
            "action": "delete",
            "source": source,
            "id": id,
        }))?;
        Ok(0)
    }
}

/// Everything a pool worker needs, shared read-only across workers.
pub struct PipelineContext {
    pub enrich: EnrichConfig,
    pub enrich_fields: Vec<String>,
    pub cache: MemoryLabelCache,
    pub vocab: Fetcher,
    pub driver: Box<dyn RecordDriver>,
    pub sink: Box<dyn RecordSink>,
}

/// Build the pool job function over a shared pipeline context.
pub fn make_run_fn(ctx: Arc<PipelineContext>) -> metaline_core::RunFn {
    Arc::new(move |request: Value| {
        let work: WorkRequest =
            serde_json::from_value(request).context("malformed work request")?;

        if work.deleted {
            let n = ctx.sink.delete(&work.source, &work.id)?;
            return Ok(json!(n));
        }

        let payload = work.payload.as_deref().unwrap_or_default();
        let mut doc = ctx.driver.transform(&work.source, &work.id, payload)?;

        let enricher = Enricher::new(&ctx.enrich, &ctx.cache, &ctx.vocab);
        for field in &ctx.enrich_fields {
            let uris: Vec<String> = doc.values(field).to_vec();
            for uri in uris {
                // A flaky vocabulary service must not take the worker down.
                if let Err(e) = enricher.enrich(&work.source, &mut doc, &uri, field) {
                    log::warn!("{}: enrichment of {uri} failed: {e:#}", work.source);
                }
            }
        }

        let n = ctx.sink.upsert(&work.source, &work.id, &doc)?;
        Ok(json!(n))
    })
}

/// Per-source run parameters resolved from CLI arguments.
#[derive(Debug, Default, Clone)]
pub struct RunOptions {
    pub from: Option<String>,
    pub until: Option<String>,
    pub workers: usize,
    pub max_queue: usize,
}

/// Outcome of one source run.
#[derive(Debug)]
pub struct RunSummary {
    pub changed: u64,
    pub deleted: u64,
    pub pages: u64,
    pub indexed: u64,
    pub harvested_until: Option<String>,
    pub elapsed: Duration,
}

/// Harvest one source end to end.
pub fn run_source(
    name: &str,
    source: &SourceConfig,
    config: &Config,
    opts: &RunOptions,
    state: &mut dyn HarvestState,
    progress: &SharedProgress,
) -> Result<RunSummary> {
    ensure!(
        source.transformation().is_none(),
        "source {name}: transformation {:?} is configured but no response transform engine is registered",
        source.transformation().unwrap_or_default()
    );

    let retry_wait = Duration::from_secs(config.http.retry_wait_secs);
    let oai_fetcher = Fetcher::new(config.http.max_tries, retry_wait, config.http.user_agent.as_str())
        .with_trace_log(source.debug_log.clone());
    let vocab_fetcher = Fetcher::new(config.http.max_tries, retry_wait, config.http.user_agent.as_str());

    let sink_path = config.output.dir.join(format!("{name}.ndjson"));
    let ctx = Arc::new(PipelineContext {
        enrich: config.enrichment.clone(),
        enrich_fields: source.enrich_fields.clone(),
        cache: MemoryLabelCache::default(),
        vocab: vocab_fetcher,
        driver: Box::new(XmlDriver),
        sink: Box::new(JsonFileSink::create(&sink_path)?),
    });
    let mut pool = WorkerPool::new(name, opts.workers, opts.max_queue, make_run_fn(ctx), None)?;

    let backend = HttpBackend::new(&source.url, &oai_fetcher);
    let mut harvester = Harvester::new(name, source, &backend)?;

    // Explicit --from wins; otherwise continue from the stored position.
    let from = opts.from.clone().or_else(|| state.last_harvested_date(name));
    if let Some(from) = &from {
        log::info!("{name}: harvesting records changed since {from}");
    } else {
        log::info!("{name}: harvesting all records");
    }

    let pb = progress.stage_line(name);
    let mut queued: u64 = 0;

    // Stage the completion date; it only reaches the real store after the
    // pool has drained without a worker failure.
    let mut staged = MemoryState::default();
    let harvested = harvester.harvest(
        from.as_deref(),
        opts.until.as_deref(),
        &mut staged,
        &mut |envelope| {
            let deleted = envelope.deleted;
            pool.add_request(serde_json::to_value(WorkRequest::from(envelope))?)?;
            queued += 1;
            pb.set_message(format!("{queued} records queued"));
            Ok(usize::from(!deleted))
        },
    );

    let summary = match harvested {
        Ok(summary) => summary,
        Err(e) => {
            pool.shutdown();
            pb.finish_and_clear();
            return Err(e.into());
        }
    };

    pb.set_message("draining worker pool");
    if let Err(e) = pool.wait_until_done() {
        pool.shutdown();
        pb.finish_and_clear();
        return Err(anyhow::Error::from(e).context(format!("{name}: worker pool failed")));
    }
    let indexed: u64 = pool
        .drain_results()
        .iter()
        .map(|v| v.as_u64().unwrap_or(0))
        .sum();
    pool.shutdown();
    pb.finish_and_clear();

    if let Some(date) = staged.last_harvested_date(name) {
        state.set_last_harvested_date(name, &date)?;
    }

    Ok(RunSummary {
        changed: summary.changed,
        deleted: summary.deleted,
        pages: summary.pages,
        indexed,
        harvested_until: summary.harvested_until,
        elapsed: summary.elapsed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_request_roundtrip() {
        let request = WorkRequest {
            source: "src".into(),
            id: "r1".into(),
            deleted: false,
            payload: Some("<doc/>".into()),
        };
        let value = serde_json::to_value(&request).unwrap();
        let back: WorkRequest = serde_json::from_value(value).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn xml_driver_lifts_child_elements() {
        let payload = "<doc><title>Atlas</title><subject>http://vocab.example/c1</subject><empty/></doc>";
        let doc = XmlDriver.transform("src", "r1", payload).unwrap();
        assert_eq!(doc.values("id"), ["r1"]);
        assert_eq!(doc.values("title"), ["Atlas"]);
        assert_eq!(doc.values("subject"), ["http://vocab.example/c1"]);
        assert_eq!(doc.values("fullrecord"), [payload]);
        assert!(doc.values("empty").is_empty());
    }

    #[test]
    fn xml_driver_rejects_bad_payload() {
        assert!(XmlDriver.transform("src", "r1", "<broken").is_err());
    }

    #[test]
    fn json_sink_writes_actions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.ndjson");
        let sink = JsonFileSink::create(&path).unwrap();

        let mut doc = FlatDocument::new();
        doc.append("title", "Atlas");
        assert_eq!(sink.upsert("src", "r1", &doc).unwrap(), 1);
        assert_eq!(sink.delete("src", "r2").unwrap(), 0);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["action"], "upsert");
        assert_eq!(lines[0]["doc"]["title"][0], "Atlas");
        assert_eq!(lines[1]["action"], "delete");
        assert_eq!(lines[1]["id"], "r2");
    }

    fn test_context(dir: &Path) -> Arc<PipelineContext> {
        Arc::new(PipelineContext {
            enrich: EnrichConfig::default(),
            enrich_fields: vec!["subject".into()],
            cache: MemoryLabelCache::default(),
            vocab: Fetcher::new(1, Duration::ZERO, "test"),
            driver: Box::new(XmlDriver),
            sink: Box::new(JsonFileSink::create(&dir.join("out.ndjson")).unwrap()),
        })
    }

    #[test]
    fn run_fn_indexes_upserts_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let run = make_run_fn(test_context(dir.path()));

        let upsert = serde_json::to_value(WorkRequest {
            source: "src".into(),
            id: "r1".into(),
            deleted: false,
            payload: Some("<doc><title>Atlas</title></doc>".into()),
        })
        .unwrap();
        assert_eq!(run(upsert).unwrap(), json!(1));

        let delete = serde_json::to_value(WorkRequest {
            source: "src".into(),
            id: "r2".into(),
            deleted: true,
            payload: None,
        })
        .unwrap();
        assert_eq!(run(delete).unwrap(), json!(0));
    }

    #[test]
    fn run_fn_records_vocabulary_uris_without_whitelist() {
        // The empty default whitelist rejects every URI: no fetch happens,
        // but the URI is still recorded in the companion field.
        let dir = tempfile::tempdir().unwrap();
        let run = make_run_fn(test_context(dir.path()));

        let request = serde_json::to_value(WorkRequest {
            source: "src".into(),
            id: "r1".into(),
            deleted: false,
            payload: Some("<doc><subject>http://vocab.example/c1</subject></doc>".into()),
        })
        .unwrap();
        assert_eq!(run(request).unwrap(), json!(1));

        let content = std::fs::read_to_string(dir.path().join("out.ndjson")).unwrap();
        let line: Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(line["doc"]["subject_uri_str_mv"][0], "http://vocab.example/c1");
    }
}
