use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Amateur radio band, serialised as its label ("20m", "70cm", ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Band {
    #[serde(rename = "2200m")]
    M2200,
    #[serde(rename = "630m")]
    M630,
    #[serde(rename = "160m")]
    M160,
    #[serde(rename = "80m")]
    M80,
    #[serde(rename = "60m")]
    M60,
    #[serde(rename = "40m")]
    M40,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "20m")]
    M20,
    #[serde(rename = "17m")]
    M17,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "12m")]
    M12,
    #[serde(rename = "10m")]
    M10,
    #[serde(rename = "6m")]
    M6,
    #[serde(rename = "4m")]
    M4,
    #[serde(rename = "2m")]
    M2,
    #[serde(rename = "70cm")]
    Cm70,
    #[serde(rename = "23cm")]
    Cm23,
    #[serde(rename = "3cm")]
    Cm3,
    #[serde(rename = "unknown")]
    Unknown,
}

impl Band {
    pub fn as_str(&self) -> &'static str {
        match self {
            Band::M2200 => "2200m",
            Band::M630 => "630m",
            Band::M160 => "160m",
            Band::M80 => "80m",
            Band::M60 => "60m",
            Band::M40 => "40m",
            Band::M30 => "30m",
            Band::M20 => "20m",
            Band::M17 => "17m",
            Band::M15 => "15m",
            Band::M12 => "12m",
            Band::M10 => "10m",
            Band::M6 => "6m",
            Band::M4 => "4m",
            Band::M2 => "2m",
            Band::Cm70 => "70cm",
            Band::Cm23 => "23cm",
            Band::Cm3 => "3cm",
            Band::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Band {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Band {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "2200m" => Ok(Band::M2200),
            "630m" => Ok(Band::M630),
            "160m" => Ok(Band::M160),
            "80m" => Ok(Band::M80),
            "60m" => Ok(Band::M60),
            "40m" => Ok(Band::M40),
            "30m" => Ok(Band::M30),
            "20m" => Ok(Band::M20),
            "17m" => Ok(Band::M17),
            "15m" => Ok(Band::M15),
            "12m" => Ok(Band::M12),
            "10m" => Ok(Band::M10),
            "6m" => Ok(Band::M6),
            "4m" => Ok(Band::M4),
            "2m" => Ok(Band::M2),
            "70cm" => Ok(Band::Cm70),
            "23cm" => Ok(Band::Cm23),
            "3cm" => Ok(Band::Cm3),
            "unknown" => Ok(Band::Unknown),
            _ => Err(format!("Unknown band: {}", s)),
        }
    }
}

/// Where a spot came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpotSource {
    #[default]
    Cluster,
    Pota,
    Cq,
    /// Submitted locally, never seen on the upstream feed
    Local,
}

impl SpotSource {
    /// Classify an upstream spot by its remarks
    pub fn from_remarks(remarks: &str) -> Self {
        let lower = remarks.to_lowercase();
        if lower.contains("pota") {
            SpotSource::Pota
        } else if lower.contains("cq") {
            SpotSource::Cq
        } else {
            SpotSource::Cluster
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SpotSource::Cluster => "cluster",
            SpotSource::Pota => "pota",
            SpotSource::Cq => "cq",
            SpotSource::Local => "local",
        }
    }
}

/// Callsign metadata resolved from the lookup service.
///
/// Every descriptive field may be absent; an empty response is still a valid result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentResult {
    /// DXCC entity name, e.g. "Fed. Rep. Of Germany"
    pub entity: Option<String>,
    pub dxcc_id: Option<String>,
    /// Continent code, e.g. "EU"
    pub continent: Option<String>,
    pub flag: Option<String>,
    pub cq_zone: Option<u8>,
    pub lotw_user: Option<bool>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// When the lookup succeeded
    pub resolved_at: DateTime<Utc>,
}

/// One DX spot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spot {
    /// Frequency in kHz, always > 0
    pub frequency: f64,
    pub band: Band,
    /// Station being spotted
    pub dx_callsign: String,
    /// Station reporting the spot
    pub spotter_callsign: String,
    pub remarks: String,
    /// Local receipt time; authoritative for ordering
    pub received_at: DateTime<Utc>,
    /// Advisory HHMMZ time announced by the cluster node
    pub upstream_time: Option<NaiveTime>,
    pub source: SpotSource,
    /// Metadata for `dx_callsign`
    pub enrichment: Option<EnrichmentResult>,
    /// Metadata for `spotter_callsign`
    pub spotter_enrichment: Option<EnrichmentResult>,
}

impl Spot {
    /// Same spot with every field except the receipt time
    pub fn same_report(&self, other: &Spot) -> bool {
        self.frequency == other.frequency
            && self.band == other.band
            && self.dx_callsign == other.dx_callsign
            && self.spotter_callsign == other.spotter_callsign
            && self.remarks == other.remarks
            && self.upstream_time == other.upstream_time
            && self.source == other.source
    }
}

/// Lifecycle state of the upstream cluster connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    AwaitingLogin,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::AwaitingLogin => "awaiting_login",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Point-in-time view of connection and cache health
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub state: ConnectionState,
    pub connected: bool,
    pub connected_since: Option<DateTime<Utc>>,
    pub total_spots_received: u64,
    pub total_parse_failures: u64,
    pub synthetic_spots: u64,
    pub cache_size: usize,
    pub last_reconnect_attempt: Option<DateTime<Utc>>,
    pub reconnect_count: u64,
    pub enrichment_lookups: u64,
    pub enrichment_failures: u64,
    pub enrichment_cached: usize,
    pub taken_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_labels_round_trip_through_from_str() {
        for band in [Band::M160, Band::M20, Band::Cm70, Band::Cm3, Band::Unknown] {
            assert_eq!(band.as_str().parse::<Band>().unwrap(), band);
        }
        assert_eq!("20M".parse::<Band>().unwrap(), Band::M20);
        assert!("11m".parse::<Band>().is_err());
    }

    #[test]
    fn test_band_serializes_as_label() {
        assert_eq!(serde_json::to_string(&Band::M20).unwrap(), "\"20m\"");
        assert_eq!(serde_json::to_string(&Band::Unknown).unwrap(), "\"unknown\"");
        let band: Band = serde_json::from_str("\"70cm\"").unwrap();
        assert_eq!(band, Band::Cm70);
    }

    #[test]
    fn test_source_from_remarks() {
        assert_eq!(SpotSource::from_remarks("POTA K-1234 SSB"), SpotSource::Pota);
        assert_eq!(SpotSource::from_remarks("FT8 CQ DX"), SpotSource::Cq);
        assert_eq!(SpotSource::from_remarks("CW 599"), SpotSource::Cluster);
        assert_eq!(serde_json::to_string(&SpotSource::Local).unwrap(), "\"local\"");
    }

    #[test]
    fn test_connection_state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ConnectionState::AwaitingLogin).unwrap(),
            "\"awaiting_login\""
        );
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }
}
