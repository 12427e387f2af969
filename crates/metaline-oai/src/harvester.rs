//! Incremental OAI-PMH harvest driver.
//!
//! One request in flight at a time: the resumption token is a server-issued
//! opaque cursor, so pages cannot be fetched in parallel. The driver
//! persists the *server's* response date on clean completion rather than the
//! client clock, so diverging clocks cost overlap instead of records.

use std::time::Instant;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};

use metaline_core::{FetchError, Fetcher, is_shutdown_requested};

use crate::config::{GranularitySetting, SourceConfig};
use crate::dom::{self, Element};
use crate::error::HarvestError;
use crate::ident::IdNormalizer;
use crate::response::{self, ResponseTransform};
use crate::state::HarvestState;

/// One harvested record handed to the downstream callback.
///
/// `deleted` implies `payload` is `None`; otherwise `payload` is a
/// standalone XML fragment rooted at the metadata element with inherited
/// namespace bindings.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordEnvelope {
    pub source: String,
    pub id: String,
    pub deleted: bool,
    pub payload: Option<String>,
}

/// Record consumer; the returned count accumulates into `changed`.
pub type RecordHandler<'a> = dyn FnMut(RecordEnvelope) -> anyhow::Result<usize> + 'a;

/// Harvest run summary.
#[derive(Debug)]
pub struct Summary {
    pub changed: u64,
    pub deleted: u64,
    pub pages: u64,
    /// Server date persisted on completion (listing runs leave this unset).
    pub harvested_until: Option<String>,
    pub elapsed: std::time::Duration,
}

/// Transport used for OAI requests; scripted implementations drive the
/// state-machine tests.
pub trait OaiBackend {
    fn request(&self, params: &[(&str, &str)]) -> Result<Vec<u8>, FetchError>;
}

/// HTTP transport against a configured base URL.
pub struct HttpBackend<'a> {
    base_url: &'a str,
    fetcher: &'a Fetcher,
}

impl<'a> HttpBackend<'a> {
    pub fn new(base_url: &'a str, fetcher: &'a Fetcher) -> Self {
        Self { base_url, fetcher }
    }
}

impl OaiBackend for HttpBackend<'_> {
    fn request(&self, params: &[(&str, &str)]) -> Result<Vec<u8>, FetchError> {
        let query: Vec<String> = params
            .iter()
            .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
            .collect();
        let separator = if self.base_url.contains('?') { '&' } else { '?' };
        let url = format!("{}{separator}{}", self.base_url, query.join("&"));
        let (_status, body) = self.fetcher.get(&url, &[])?;
        Ok(body)
    }
}

/// Negotiated date precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Date,
    Seconds,
}

impl Granularity {
    /// Parse the `<granularity>` value from an Identify response.
    pub fn from_identify(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.eq_ignore_ascii_case("YYYY-MM-DD") {
            Some(Self::Date)
        } else if text.eq_ignore_ascii_case("YYYY-MM-DDThh:mm:ssZ") {
            Some(Self::Seconds)
        } else {
            None
        }
    }

    pub fn format(&self, dt: &DateTime<Utc>) -> String {
        match self {
            Self::Date => dt.format("%Y-%m-%d").to_string(),
            Self::Seconds => dt.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        }
    }

    /// Re-format a caller-supplied date boundary to this precision.
    pub fn normalize_param(&self, value: &str) -> Result<String, HarvestError> {
        let dt = parse_oai_date(value).ok_or_else(|| HarvestError::BadDate(value.to_string()))?;
        Ok(self.format(&dt))
    }
}

/// Parse an OAI date or datetime string.
fn parse_oai_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .map(|d| d.and_time(NaiveTime::MIN).and_utc())
}

/// Stateful driver for one harvest session.
pub struct Harvester<'a, B: OaiBackend> {
    source: String,
    config: &'a SourceConfig,
    backend: &'a B,
    normalizer: IdNormalizer,
    transform: Option<Box<dyn ResponseTransform>>,
    granularity: Granularity,
    server_date: Option<DateTime<Utc>>,
    last_token: Option<String>,
    token_repeats: u32,
    changed: u64,
    deleted: u64,
    pages: u64,
}

impl<'a, B: OaiBackend> Harvester<'a, B> {
    pub fn new(
        source: impl Into<String>,
        config: &'a SourceConfig,
        backend: &'a B,
    ) -> Result<Self, HarvestError> {
        let normalizer =
            IdNormalizer::new(config.id_prefix.as_deref(), &config.id_search, &config.id_replace)
                .map_err(|e| HarvestError::Config(format!("{e:#}")))?;
        let granularity = match config.date_granularity {
            GranularitySetting::Seconds => Granularity::Seconds,
            // Auto is resolved by Identify; Date is also the protocol default.
            GranularitySetting::Auto | GranularitySetting::Date => Granularity::Date,
        };
        Ok(Self {
            source: source.into(),
            config,
            backend,
            normalizer,
            transform: None,
            granularity,
            server_date: None,
            last_token: None,
            token_repeats: 0,
            changed: 0,
            deleted: 0,
            pages: 0,
        })
    }

    pub fn with_transform(mut self, transform: Box<dyn ResponseTransform>) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Harvest full records, invoking `callback` per record in server order.
    ///
    /// On clean completion the server's response date, formatted to the
    /// negotiated granularity, is written to `state`. Nothing is persisted
    /// on failure or cancellation.
    pub fn harvest(
        &mut self,
        from: Option<&str>,
        until: Option<&str>,
        state: &mut dyn HarvestState,
        callback: &mut RecordHandler<'_>,
    ) -> Result<Summary, HarvestError> {
        let start = Instant::now();
        self.identify()?;

        let mut token = match self.config.resume_token() {
            Some(t) => {
                log::info!("{}: resuming from configured token", self.source);
                self.check_token(t)?;
                Some(t.to_string())
            }
            None => {
                let doc = self.first_page("ListRecords", from, until)?;
                self.process_records(&doc, callback)?;
                self.take_token(&doc)?
            }
        };

        while let Some(t) = token {
            if is_shutdown_requested() {
                return Err(HarvestError::Cancelled);
            }
            let doc = self.token_page("ListRecords", &t)?;
            self.process_records(&doc, callback)?;
            token = self.take_token(&doc)?;
        }

        let stamp = self.finalize(state)?;
        Ok(self.summary(Some(stamp), start))
    }

    /// List identifiers only, invoking `callback` per header.
    ///
    /// The reduced machine runs the same token loop but never persists a
    /// harvest date.
    pub fn list_identifiers(
        &mut self,
        from: Option<&str>,
        until: Option<&str>,
        callback: &mut RecordHandler<'_>,
    ) -> Result<Summary, HarvestError> {
        let start = Instant::now();
        self.identify()?;

        let mut token = match self.config.resume_token() {
            Some(t) => {
                self.check_token(t)?;
                Some(t.to_string())
            }
            None => {
                let doc = self.first_page("ListIdentifiers", from, until)?;
                self.process_headers(&doc, callback)?;
                self.take_token(&doc)?
            }
        };

        while let Some(t) = token {
            if is_shutdown_requested() {
                return Err(HarvestError::Cancelled);
            }
            let doc = self.token_page("ListIdentifiers", &t)?;
            self.process_headers(&doc, callback)?;
            token = self.take_token(&doc)?;
        }

        Ok(self.summary(None, start))
    }

    /// Fetch Identify: capture the server date and, under `auto`, the
    /// advertised granularity.
    fn identify(&mut self) -> Result<(), HarvestError> {
        let doc = self.request(&[("verb", "Identify")], false)?;
        let response_date = doc
            .first_descendant("responseDate")
            .map(|e| e.text().trim().to_string())
            .unwrap_or_default();
        self.server_date = Some(
            parse_oai_date(&response_date)
                .ok_or_else(|| HarvestError::BadDate(response_date.clone()))?,
        );

        if self.config.date_granularity == GranularitySetting::Auto {
            match doc
                .first_descendant("granularity")
                .and_then(|e| Granularity::from_identify(&e.text()))
            {
                Some(g) => {
                    log::debug!("{}: server granularity {g:?}", self.source);
                    self.granularity = g;
                }
                None => {
                    log::warn!(
                        "{}: server did not advertise a usable granularity, assuming day precision",
                        self.source
                    );
                }
            }
        }
        Ok(())
    }

    fn first_page(
        &mut self,
        verb: &str,
        from: Option<&str>,
        until: Option<&str>,
    ) -> Result<Element, HarvestError> {
        let from = from
            .map(|v| self.granularity.normalize_param(v))
            .transpose()?;
        let until = until
            .map(|v| self.granularity.normalize_param(v))
            .transpose()?;

        let mut params: Vec<(&str, &str)> = vec![
            ("verb", verb),
            ("metadataPrefix", self.config.metadata_prefix.as_str()),
        ];
        if let Some(set) = &self.config.set {
            params.push(("set", set.as_str()));
        }
        if let Some(from) = &from {
            params.push(("from", from.as_str()));
        }
        if let Some(until) = &until {
            params.push(("until", until.as_str()));
        }
        self.request(&params, false)
    }

    fn token_page(&mut self, verb: &str, token: &str) -> Result<Element, HarvestError> {
        self.request(&[("verb", verb), ("resumptionToken", token)], true)
    }

    fn request(
        &mut self,
        params: &[(&str, &str)],
        token_request: bool,
    ) -> Result<Element, HarvestError> {
        let raw = self
            .backend
            .request(params)
            .map_err(HarvestError::Transport)?;
        let doc = response::process(
            &self.source,
            &raw,
            token_request,
            self.config.ignore_no_records_match,
            self.transform.as_deref(),
        )?;
        self.pages += 1;
        Ok(doc)
    }

    /// Extract the next resumption token, running the stuck-token safeguard.
    fn take_token(&mut self, doc: &Element) -> Result<Option<String>, HarvestError> {
        let token = doc
            .first_descendant("resumptionToken")
            .map(|e| e.text().trim().to_string())
            .filter(|t| !t.is_empty());
        match token {
            Some(t) => {
                self.check_token(&t)?;
                Ok(Some(t))
            }
            None => Ok(None),
        }
    }

    /// Count consecutive sightings of an identical token; real servers are
    /// known to hand the same token out forever.
    fn check_token(&mut self, token: &str) -> Result<(), HarvestError> {
        if self.last_token.as_deref() == Some(token) {
            self.token_repeats += 1;
        } else {
            self.last_token = Some(token.to_string());
            self.token_repeats = 1;
        }
        if self.token_repeats >= self.config.same_resumption_token_limit {
            return Err(HarvestError::StuckResumptionToken {
                token: token.to_string(),
                seen: self.token_repeats,
            });
        }
        Ok(())
    }

    /// Walk immediate `<record>` children of the ListRecords container.
    fn process_records(
        &mut self,
        doc: &Element,
        callback: &mut RecordHandler<'_>,
    ) -> Result<(), HarvestError> {
        let Some(list) = doc.first_descendant("ListRecords") else {
            return Ok(());
        };
        let mut page_scope = Vec::new();
        dom::merge_namespace_scope(&mut page_scope, doc);
        dom::merge_namespace_scope(&mut page_scope, list);

        for record in list.child_elements("record") {
            let Some(header) = record.first_child("header") else {
                log::warn!("{}: record without header, skipped", self.source);
                continue;
            };
            let Some(identifier) = header.first_child("identifier") else {
                log::warn!("{}: record header without identifier, skipped", self.source);
                continue;
            };
            let id = self.normalizer.normalize(identifier.text().trim());
            let is_deleted = header
                .attr("status")
                .is_some_and(|s| s.eq_ignore_ascii_case("deleted"));

            if is_deleted {
                self.deleted += 1;
                let n = callback(RecordEnvelope {
                    source: self.source.clone(),
                    id,
                    deleted: true,
                    payload: None,
                })
                .map_err(HarvestError::Sink)?;
                self.changed += n as u64;
                continue;
            }

            let Some(metadata) = record.first_child("metadata") else {
                log::warn!("{}: record {id} without metadata, skipped", self.source);
                continue;
            };
            let Some(payload_root) = metadata.first_element_child() else {
                log::warn!("{}: record {id} has empty metadata, skipped", self.source);
                continue;
            };

            let mut scope = page_scope.clone();
            dom::merge_namespace_scope(&mut scope, record);
            dom::merge_namespace_scope(&mut scope, metadata);
            let standalone = dom::with_inherited_namespaces(payload_root, &scope);

            let n = callback(RecordEnvelope {
                source: self.source.clone(),
                id,
                deleted: false,
                payload: Some(standalone.serialize()),
            })
            .map_err(HarvestError::Sink)?;
            self.changed += n as u64;
        }
        Ok(())
    }

    /// Walk immediate `<header>` children of the ListIdentifiers container.
    fn process_headers(
        &mut self,
        doc: &Element,
        callback: &mut RecordHandler<'_>,
    ) -> Result<(), HarvestError> {
        let Some(list) = doc.first_descendant("ListIdentifiers") else {
            return Ok(());
        };
        for header in list.child_elements("header") {
            let Some(identifier) = header.first_child("identifier") else {
                log::warn!("{}: header without identifier, skipped", self.source);
                continue;
            };
            let id = self.normalizer.normalize(identifier.text().trim());
            let is_deleted = header
                .attr("status")
                .is_some_and(|s| s.eq_ignore_ascii_case("deleted"));
            if is_deleted {
                self.deleted += 1;
            }
            let n = callback(RecordEnvelope {
                source: self.source.clone(),
                id,
                deleted: is_deleted,
                payload: None,
            })
            .map_err(HarvestError::Sink)?;
            self.changed += n as u64;
        }
        Ok(())
    }

    fn finalize(&mut self, state: &mut dyn HarvestState) -> Result<String, HarvestError> {
        let server_date = self
            .server_date
            .ok_or_else(|| HarvestError::BadDate("missing responseDate".into()))?;
        let stamp = self.granularity.format(&server_date);
        state
            .set_last_harvested_date(&self.source, &stamp)
            .map_err(HarvestError::State)?;
        log::info!(
            "{}: harvested through {stamp} ({} changed, {} deleted, {} pages)",
            self.source,
            self.changed,
            self.deleted,
            self.pages
        );
        Ok(stamp)
    }

    fn summary(&self, harvested_until: Option<String>, start: Instant) -> Summary {
        Summary {
            changed: self.changed,
            deleted: self.deleted,
            pages: self.pages,
            harvested_until,
            elapsed: start.elapsed(),
        }
    }
}
