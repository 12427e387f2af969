//! Harvest state-machine scenarios against a scripted OAI backend.

use std::cell::RefCell;
use std::collections::VecDeque;

use metaline_core::FetchError;
use metaline_oai::{
    HarvestError, HarvestState, Harvester, MemoryState, OaiBackend, RecordEnvelope, SourceConfig,
};

/// Backend replaying canned responses and recording every request.
struct ScriptedBackend {
    responses: RefCell<VecDeque<Vec<u8>>>,
    requests: RefCell<Vec<String>>,
}

impl ScriptedBackend {
    fn new(pages: &[String]) -> Self {
        Self {
            responses: RefCell::new(pages.iter().map(|p| p.clone().into_bytes()).collect()),
            requests: RefCell::new(Vec::new()),
        }
    }

    fn requests(&self) -> Vec<String> {
        self.requests.borrow().clone()
    }
}

impl OaiBackend for ScriptedBackend {
    fn request(&self, params: &[(&str, &str)]) -> Result<Vec<u8>, FetchError> {
        let line = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        self.requests.borrow_mut().push(line);
        self.responses.borrow_mut().pop_front().ok_or(FetchError {
            status: None,
            message: "scripted backend exhausted".into(),
        })
    }
}

fn identify(granularity: &str) -> String {
    format!(
        r#"<?xml version="1.0"?>
<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
  <responseDate>2024-06-01T10:30:00Z</responseDate>
  <Identify><granularity>{granularity}</granularity></Identify>
</OAI-PMH>"#
    )
}

fn record(id: &str) -> String {
    format!(
        r#"<record>
      <header><identifier>{id}</identifier></header>
      <metadata><doc><title>item {id}</title></doc></metadata>
    </record>"#
    )
}

fn deleted_record(id: &str) -> String {
    format!(
        r#"<record>
      <header status="deleted"><identifier>{id}</identifier></header>
    </record>"#
    )
}

fn page(body: &str, token: Option<&str>) -> String {
    let token = match token {
        Some(t) => format!("<resumptionToken>{t}</resumptionToken>"),
        None => String::new(),
    };
    format!(
        r#"<?xml version="1.0"?>
<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
  <ListRecords>{body}{token}</ListRecords>
</OAI-PMH>"#
    )
}

fn error_page(code: &str) -> String {
    format!(
        r#"<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
  <error code="{code}">no matching records</error>
</OAI-PMH>"#
    )
}

fn base_config() -> SourceConfig {
    SourceConfig {
        url: "http://repo.example.org/oai".into(),
        ..Default::default()
    }
}

/// Run a harvest collecting every envelope; upserts count 1, deletes 0.
fn collect(
    config: &SourceConfig,
    backend: &ScriptedBackend,
    from: Option<&str>,
    state: &mut MemoryState,
) -> Result<(Vec<RecordEnvelope>, metaline_oai::Summary), HarvestError> {
    let seen = RefCell::new(Vec::new());
    let mut harvester = Harvester::new("test", config, backend)?;
    let summary = harvester.harvest(from, None, state, &mut |envelope: RecordEnvelope| {
        let n = if envelope.deleted { 0 } else { 1 };
        seen.borrow_mut().push(envelope);
        Ok(n)
    })?;
    Ok((seen.into_inner(), summary))
}

#[test]
fn date_bounded_happy_path() {
    let backend = ScriptedBackend::new(&[
        identify("YYYY-MM-DD"),
        page(
            &[record("a"), record("b"), record("c")].join("\n"),
            Some("t1"),
        ),
        page(&[record("d"), record("e")].join("\n"), None),
    ]);
    let config = base_config();
    let mut state = MemoryState::default();

    let (seen, summary) = collect(&config, &backend, Some("2024-01-01"), &mut state).unwrap();

    assert_eq!(seen.len(), 5);
    assert!(seen.iter().all(|e| !e.deleted));
    assert_eq!(summary.changed, 5);
    assert_eq!(summary.deleted, 0);
    assert_eq!(summary.harvested_until.as_deref(), Some("2024-06-01"));
    assert_eq!(
        state.last_harvested_date("test"),
        Some("2024-06-01".to_string())
    );
    assert_eq!(
        backend.requests(),
        vec![
            "verb=Identify",
            "verb=ListRecords&metadataPrefix=oai_dc&from=2024-01-01",
            "verb=ListRecords&resumptionToken=t1",
        ]
    );
}

#[test]
fn deletes_and_namespace_inheritance() {
    let body = format!(
        r#"{}
    <record>
      <header><identifier>live1</identifier></header>
      <metadata><marc:record xmlns:marc="http://www.loc.gov/MARC21/slim"><marc:leader/></marc:record></metadata>
    </record>"#,
        deleted_record("gone1")
    );
    // The default OAI namespace is declared only on the enclosing envelope.
    let backend = ScriptedBackend::new(&[identify("YYYY-MM-DD"), page(&body, None)]);
    let config = base_config();
    let mut state = MemoryState::default();

    let (seen, summary) = collect(&config, &backend, None, &mut state).unwrap();

    assert_eq!(seen.len(), 2);
    let delete = &seen[0];
    assert!(delete.deleted);
    assert_eq!(delete.id, "gone1");
    assert_eq!(delete.payload, None);

    let upsert = &seen[1];
    assert!(!upsert.deleted);
    let payload = upsert.payload.as_deref().unwrap();
    assert!(payload.starts_with("<marc:record"));
    assert!(payload.contains(r#"xmlns:marc="http://www.loc.gov/MARC21/slim""#));
    assert!(payload.contains(r#"xmlns="http://www.openarchives.org/OAI/2.0/""#));

    assert_eq!(summary.deleted, 1);
    assert_eq!(summary.changed, 1);
}

#[test]
fn id_rewrite_pipeline() {
    let backend = ScriptedBackend::new(&[
        identify("YYYY-MM-DD"),
        page(&record("oai:foo.org:abc123"), None),
    ]);
    let mut config = base_config();
    config.id_prefix = Some("oai:foo.org:".into());
    config.id_search = vec!["/^abc/".into()];
    config.id_replace = vec!["xyz".into()];
    let mut state = MemoryState::default();

    let (seen, _) = collect(&config, &backend, None, &mut state).unwrap();
    assert_eq!(seen[0].id, "xyz123");
}

#[test]
fn stuck_token_safeguard_trips() {
    let backend = ScriptedBackend::new(&[
        identify("YYYY-MM-DD"),
        page(&record("a"), Some("t1")),
        page(&record("b"), Some("t1")),
        page(&record("c"), Some("t1")),
    ]);
    let mut config = base_config();
    config.same_resumption_token_limit = 3;
    let mut state = MemoryState::default();

    let err = collect(&config, &backend, None, &mut state).unwrap_err();
    match err {
        HarvestError::StuckResumptionToken { token, seen } => {
            assert_eq!(token, "t1");
            assert_eq!(seen, 3);
        }
        other => panic!("expected StuckResumptionToken, got {other}"),
    }
    assert_eq!(state.last_harvested_date("test"), None);
}

#[test]
fn changing_tokens_reset_the_safeguard() {
    let backend = ScriptedBackend::new(&[
        identify("YYYY-MM-DD"),
        page(&record("a"), Some("t1")),
        page(&record("b"), Some("t2")),
        page(&record("c"), Some("t1")),
        page(&record("d"), None),
    ]);
    let mut config = base_config();
    config.same_resumption_token_limit = 2;
    let mut state = MemoryState::default();

    // t1, t2, t1: never two identical sightings in a row.
    let (seen, _) = collect(&config, &backend, None, &mut state).unwrap();
    assert_eq!(seen.len(), 4);
}

#[test]
fn empty_resumption_token_terminates_and_persists() {
    let backend = ScriptedBackend::new(&[
        identify("YYYY-MM-DD"),
        page(&record("a"), Some("")),
    ]);
    let config = base_config();
    let mut state = MemoryState::default();

    let (seen, _) = collect(&config, &backend, None, &mut state).unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(
        state.last_harvested_date("test"),
        Some("2024-06-01".to_string())
    );
}

#[test]
fn no_records_match_is_fatal_without_tolerance() {
    let backend = ScriptedBackend::new(&[identify("YYYY-MM-DD"), error_page("noRecordsMatch")]);
    let config = base_config();
    let mut state = MemoryState::default();

    let err = collect(&config, &backend, None, &mut state).unwrap_err();
    assert!(matches!(err, HarvestError::Oai { code, .. } if code == "noRecordsMatch"));
    assert_eq!(state.last_harvested_date("test"), None);
}

#[test]
fn no_records_match_tolerated_when_configured() {
    let backend = ScriptedBackend::new(&[identify("YYYY-MM-DD"), error_page("noRecordsMatch")]);
    let mut config = base_config();
    config.ignore_no_records_match = true;
    let mut state = MemoryState::default();

    let (seen, summary) = collect(&config, &backend, None, &mut state).unwrap();
    assert!(seen.is_empty());
    assert_eq!(summary.changed, 0);
    assert_eq!(
        state.last_harvested_date("test"),
        Some("2024-06-01".to_string())
    );
}

#[test]
fn no_records_match_tolerated_mid_pagination() {
    let backend = ScriptedBackend::new(&[
        identify("YYYY-MM-DD"),
        page(&record("a"), Some("t1")),
        error_page("noRecordsMatch"),
    ]);
    let config = base_config();
    let mut state = MemoryState::default();

    let (seen, _) = collect(&config, &backend, None, &mut state).unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(
        state.last_harvested_date("test"),
        Some("2024-06-01".to_string())
    );
}

#[test]
fn configured_token_skips_the_first_page() {
    let backend = ScriptedBackend::new(&[identify("YYYY-MM-DD"), page(&record("a"), None)]);
    let mut config = base_config();
    config.resumption_token = Some("t9".into());
    let mut state = MemoryState::default();

    let (seen, _) = collect(&config, &backend, None, &mut state).unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(
        backend.requests(),
        vec!["verb=Identify", "verb=ListRecords&resumptionToken=t9"]
    );
}

#[test]
fn auto_granularity_negotiates_seconds() {
    let backend = ScriptedBackend::new(&[
        identify("YYYY-MM-DDThh:mm:ssZ"),
        page(&record("a"), None),
    ]);
    let config = base_config();
    let mut state = MemoryState::default();

    collect(&config, &backend, Some("2024-01-01"), &mut state).unwrap();

    assert_eq!(
        state.last_harvested_date("test"),
        Some("2024-06-01T10:30:00Z".to_string())
    );
    // The from parameter is widened to the negotiated precision.
    assert!(backend.requests()[1].contains("from=2024-01-01T00:00:00Z"));
}

#[test]
fn set_filter_is_passed_through() {
    let backend = ScriptedBackend::new(&[identify("YYYY-MM-DD"), page("", None)]);
    let mut config = base_config();
    config.set = Some("maps".into());
    let mut state = MemoryState::default();

    collect(&config, &backend, None, &mut state).unwrap();
    assert!(backend.requests()[1].contains("set=maps"));
}

#[test]
fn record_without_header_is_skipped() {
    let body = format!("<record><about>stray</about></record>\n{}", record("keep"));
    let backend = ScriptedBackend::new(&[identify("YYYY-MM-DD"), page(&body, None)]);
    let config = base_config();
    let mut state = MemoryState::default();

    let (seen, summary) = collect(&config, &backend, None, &mut state).unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].id, "keep");
    assert_eq!(summary.changed, 1);
}

#[test]
fn record_without_metadata_is_skipped() {
    let body = r#"<record><header><identifier>bare</identifier></header></record>"#;
    let backend = ScriptedBackend::new(&[identify("YYYY-MM-DD"), page(body, None)]);
    let config = base_config();
    let mut state = MemoryState::default();

    let (seen, _) = collect(&config, &backend, None, &mut state).unwrap();
    assert!(seen.is_empty());
}

#[test]
fn callback_failure_is_fatal_and_skips_persist() {
    let backend = ScriptedBackend::new(&[identify("YYYY-MM-DD"), page(&record("a"), None)]);
    let config = base_config();
    let mut state = MemoryState::default();

    let mut harvester = Harvester::new("test", &config, &backend).unwrap();
    let err = harvester
        .harvest(None, None, &mut state, &mut |_| {
            anyhow::bail!("indexer offline")
        })
        .unwrap_err();
    assert!(matches!(err, HarvestError::Sink(_)));
    assert_eq!(state.last_harvested_date("test"), None);
}

#[test]
fn transport_failure_propagates() {
    // Script runs dry after Identify: the ListRecords call fails upstream.
    let backend = ScriptedBackend::new(&[identify("YYYY-MM-DD")]);
    let config = base_config();
    let mut state = MemoryState::default();

    let err = collect(&config, &backend, None, &mut state).unwrap_err();
    assert!(matches!(err, HarvestError::Transport(_)));
    assert_eq!(state.last_harvested_date("test"), None);
}

#[test]
fn list_identifiers_walks_headers() {
    let body = r#"<?xml version="1.0"?>
<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
  <ListIdentifiers>
    <header><identifier>a</identifier></header>
    <header status="deleted"><identifier>b</identifier></header>
  </ListIdentifiers>
</OAI-PMH>"#;
    let backend = ScriptedBackend::new(&[identify("YYYY-MM-DD"), body.to_string()]);
    let config = base_config();

    let seen = RefCell::new(Vec::new());
    let mut harvester = Harvester::new("test", &config, &backend).unwrap();
    let summary = harvester
        .list_identifiers(None, None, &mut |envelope: RecordEnvelope| {
            seen.borrow_mut().push(envelope);
            Ok(0)
        })
        .unwrap();

    let seen = seen.into_inner();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|e| e.payload.is_none()));
    assert_eq!(seen[0].id, "a");
    assert!(!seen[0].deleted);
    assert_eq!(seen[1].id, "b");
    assert!(seen[1].deleted);
    assert_eq!(summary.deleted, 1);
    assert_eq!(summary.harvested_until, None);
    assert!(backend.requests()[1].starts_with("verb=ListIdentifiers"));
}
