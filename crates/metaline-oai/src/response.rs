//! OAI-PMH response processing: parse, repair, transform, error scan.

use crate::dom::{self, Element};
use crate::error::HarvestError;

/// Hook applied to each parsed response before record extraction.
///
/// Stands in for per-source response rewriting (the original system ran an
/// XSL document here); implementations are registered by the embedding
/// application.
pub trait ResponseTransform: Send + Sync {
    fn apply(&self, doc: Element) -> anyhow::Result<Element>;
}

/// Parse a raw OAI-PMH response body.
///
/// A failed parse is retried once after round-tripping the bytes through
/// lossy UTF-8, which repairs the common case of wrongly labeled encodings.
/// If that also fails the raw payload is written to a deterministic temp
/// path for inspection.
///
/// A server `<error>` is tolerated iff its code is `noRecordsMatch` and
/// either this was a resumption-token request or the source is configured to
/// ignore the condition; the page then simply yields no records.
pub fn process(
    source: &str,
    raw: &[u8],
    token_request: bool,
    ignore_no_records_match: bool,
    transform: Option<&dyn ResponseTransform>,
) -> Result<Element, HarvestError> {
    let doc = parse_with_repair(source, raw)?;
    let doc = match transform {
        Some(t) => t.apply(doc).map_err(HarvestError::Transform)?,
        None => doc,
    };

    if let Some(error) = doc.first_descendant("error") {
        let code = error.attr("code").unwrap_or("").to_string();
        let tolerated = code == "noRecordsMatch" && (token_request || ignore_no_records_match);
        if tolerated {
            log::info!("{source}: server reported noRecordsMatch, treating page as empty");
        } else {
            return Err(HarvestError::Oai {
                code,
                message: error.text().trim().to_string(),
            });
        }
    }

    Ok(doc)
}

fn parse_with_repair(source: &str, raw: &[u8]) -> Result<Element, HarvestError> {
    let first_attempt = std::str::from_utf8(raw)
        .map_err(|e| e.to_string())
        .and_then(dom::parse);
    let first_err = match first_attempt {
        Ok(doc) => return Ok(doc),
        Err(e) => e,
    };

    log::warn!("{source}: response failed to parse ({first_err}), retrying after encoding repair");
    let repaired = String::from_utf8_lossy(raw);
    match dom::parse(&repaired) {
        Ok(doc) => Ok(doc),
        Err(second_err) => {
            let dump = std::env::temp_dir().join(format!("metaline-{source}-response.xml"));
            if let Err(e) = std::fs::write(&dump, raw) {
                log::error!("{source}: could not dump raw response to {}: {e}", dump.display());
            }
            Err(HarvestError::Malformed {
                errors: format!("{first_err}; after repair: {second_err}"),
                dump,
            })
        }
    }
}
