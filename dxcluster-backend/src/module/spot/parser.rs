///! DX cluster spot line parser
///!
///! Understands the two shapes a DX Spider / AR-Cluster node emits:
///!
///!   DX de W3LPL:     14025.0  JA1ABC       CW 599                     1234Z JN45
///!   14025.0  JA1ABC      12-Jan-2025 1234Z  CW 599                   <W3LPL>
///!
///! The first is the live broadcast, the second is a `sh/dx` listing row.

use chrono::{DateTime, NaiveTime, Utc};
use regex::Regex;
use std::sync::LazyLock;

use dxcluster_common::{Spot, SpotSource};

use super::band::band_for_khz;
use crate::error::ParseError;

static DX_DE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^DX\s+de\s+(?P<spotter>[^\s:]+):\s*(?P<freq>\S+)\s+(?P<dx>\S+)(?:\s+(?P<rest>.*?))?\s+(?P<time>\d{3,4})Z\b",
    )
    .expect("DX de regex is valid")
});

static SHOW_DX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<freq>\S+)\s+(?P<dx>\S+)\s+(?P<date>\d{1,2}-[A-Za-z]{3}-\d{4})\s+(?P<time>\d{4})Z\s+(?:via\s+(?P<via>\S+)\s+)?(?P<message>.*?)\s*<(?P<spotter>[^>\s]+)>$",
    )
    .expect("sh/dx regex is valid")
});

/// Parse one upstream line (terminators already stripped) into a [`Spot`].
///
/// `received_at` becomes the spot's timestamp; the HHMMZ time printed by the
/// node is kept only as [`Spot::upstream_time`].
pub fn parse_spot(line: &str, received_at: DateTime<Utc>) -> Result<Spot, ParseError> {
    let line = line.trim();

    if let Some(caps) = DX_DE_RE.captures(line) {
        let frequency = parse_frequency(&caps["freq"])?;
        let remarks = caps
            .name("rest")
            .map(|m| clean_remarks(m.as_str()))
            .unwrap_or_default();

        return Ok(Spot {
            frequency,
            band: band_for_khz(frequency),
            dx_callsign: caps["dx"].to_string(),
            spotter_callsign: caps["spotter"].to_string(),
            source: SpotSource::from_remarks(&remarks),
            remarks,
            received_at,
            upstream_time: parse_upstream_time(&caps["time"]),
            enrichment: None,
            spotter_enrichment: None,
        });
    }

    if let Some(caps) = SHOW_DX_RE.captures(line) {
        let frequency = parse_frequency(&caps["freq"])?;
        let mut remarks = clean_remarks(&caps["message"]);
        if let Some(via) = caps.name("via") {
            remarks = format!("{} via {}", remarks, via.as_str()).trim().to_string();
        }

        return Ok(Spot {
            frequency,
            band: band_for_khz(frequency),
            dx_callsign: caps["dx"].to_string(),
            spotter_callsign: caps["spotter"].to_string(),
            remarks,
            received_at,
            upstream_time: parse_upstream_time(&caps["time"]),
            source: SpotSource::Cluster,
            enrichment: None,
            spotter_enrichment: None,
        });
    }

    Err(ParseError::NoMatch)
}

/// Build a spot that did not come from the feed.
///
/// Validation matches the parser: the frequency must be a positive number
/// and the DX callsign must be present.
pub fn local_spot(
    frequency: &str,
    dx_callsign: &str,
    remarks: &str,
    spotter_callsign: &str,
    received_at: DateTime<Utc>,
) -> Result<Spot, ParseError> {
    let frequency = parse_frequency(frequency)?;
    let dx_callsign = dx_callsign.trim();
    if dx_callsign.is_empty() {
        return Err(ParseError::MissingCallsign);
    }

    Ok(Spot {
        frequency,
        band: band_for_khz(frequency),
        dx_callsign: dx_callsign.to_string(),
        spotter_callsign: spotter_callsign.to_string(),
        remarks: remarks.to_string(),
        received_at,
        upstream_time: None,
        source: SpotSource::Local,
        enrichment: None,
        spotter_enrichment: None,
    })
}

/// Frequency field in kHz; must be finite and strictly positive.
pub fn parse_frequency(raw: &str) -> Result<f64, ParseError> {
    let raw = raw.trim();
    match raw.parse::<f64>() {
        Ok(khz) if khz.is_finite() && khz > 0.0 => Ok(khz),
        _ => Err(ParseError::InvalidFrequency(raw.to_string())),
    }
}

/// "1234" / "934" → 12:34 / 09:34. Out-of-range values are dropped.
fn parse_upstream_time(raw: &str) -> Option<NaiveTime> {
    let (hours, minutes) = match raw.len() {
        3 => (&raw[..1], &raw[1..]),
        4 => (&raw[..2], &raw[2..]),
        _ => return None,
    };
    NaiveTime::from_hms_opt(hours.parse().ok()?, minutes.parse().ok()?, 0)
}

fn clean_remarks(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
