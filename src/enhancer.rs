use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::cache::Cache;
use crate::config::OpenAiConfig;
use crate::error::{ApiError, Result};
use crate::matcher::UnclassifiedAlert;

const DEFAULT_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Enhanced alerts live for a day regardless of the road refresh cadence.
pub const ENHANCED_ALERT_TTL_HOURS: i64 = 24;

/// Hard cap applied to the condensed summary after generation.
const SUMMARY_MAX_CHARS: usize = 147;

const SYSTEM_PROMPT: &str = "You summarize road incident reports for travelers. \
Extract the requested fields from the incident text. Be factual and concise; \
never invent details that are not in the report. The condensed summary must \
fit in 120 characters.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Impact {
    None,
    Light,
    Moderate,
    Severe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportedRoadStatus {
    Open,
    Restricted,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    None,
    R1,
    R2,
    ActiveUnspecified,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhancedLocation {
    pub description: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredAlert {
    pub time_reported: Option<String>,
    pub details: String,
    pub condensed_summary: String,
    pub location: EnhancedLocation,
    pub last_update: Option<String>,
    pub impact: Impact,
    pub road_status: ReportedRoadStatus,
    pub restriction_details: Option<String>,
    pub chain_status: ChainStatus,
    pub additional_info: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhancedAlert {
    pub original_description: String,
    pub structured: StructuredAlert,
    pub processed_at: DateTime<Utc>,
}

/// Wire shape of the model output. Enum-valued fields arrive as plain
/// strings so post-validation can force them onto the closed enums; any
/// field the schema does not know is a hard rejection.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStructured {
    #[serde(default)]
    time_reported: Option<String>,
    #[serde(default)]
    details: Option<String>,
    #[serde(default)]
    condensed_summary: Option<String>,
    #[serde(default)]
    location: Option<RawLocation>,
    #[serde(default)]
    last_update: Option<String>,
    #[serde(default)]
    impact: Option<String>,
    #[serde(default)]
    road_status: Option<String>,
    #[serde(default)]
    restriction_details: Option<String>,
    #[serde(default)]
    chain_status: Option<String>,
    #[serde(default)]
    additional_info: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLocation {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

struct Normalizer {
    time_re: Regex,
    date_re: Regex,
    punct_re: Regex,
    ws_re: Regex,
    abbreviations: Vec<(Regex, &'static str)>,
}

fn normalizer() -> &'static Normalizer {
    static NORMALIZER: OnceLock<Normalizer> = OnceLock::new();
    NORMALIZER.get_or_init(|| Normalizer {
        time_re: Regex::new(r"\bat \d{1,2}:\d{2}\b").expect("static regex"),
        date_re: Regex::new(r"\b\d{1,2}/\d{1,2}/\d{4}\b").expect("static regex"),
        punct_re: Regex::new(r"[.,;:!?()\-]").expect("static regex"),
        ws_re: Regex::new(r"\s+").expect("static regex"),
        abbreviations: [
            ("hwy", "highway"),
            ("nb", "northbound"),
            ("sb", "southbound"),
            ("eb", "eastbound"),
            ("wb", "westbound"),
            ("closure", "closed"),
            ("incident", "inc"),
        ]
        .into_iter()
        .map(|(abbr, full)| {
            (
                Regex::new(&format!(r"\b{abbr}\b")).expect("static regex"),
                full,
            )
        })
        .collect(),
    })
}

/// Deterministic text normalization so semantically equivalent incident
/// reports hash identically: lowercase, time/date tokens and punctuation
/// stripped, common roadway abbreviations expanded, whitespace collapsed.
pub fn normalize(text: &str) -> String {
    let n = normalizer();
    let mut out = text.to_lowercase();
    out = n.time_re.replace_all(&out, " ").to_string();
    out = n.date_re.replace_all(&out, " ").to_string();
    out = n.punct_re.replace_all(&out, " ").to_string();
    for (re, replacement) in &n.abbreviations {
        out = re.replace_all(&out, *replacement).to_string();
    }
    n.ws_re.replace_all(out.trim(), " ").to_string()
}

/// Content-addressed identity of an incident for enhancement dedup.
pub fn content_hash(title: &str, description: &str, location: &str, style_tag: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize(title).as_bytes());
    hasher.update(b"|");
    hasher.update(normalize(description).as_bytes());
    hasher.update(b"|");
    hasher.update(normalize(location).as_bytes());
    hasher.update(b"|");
    hasher.update(style_tag.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Converts raw incident text into a traveler-friendly structured record via
/// a schema-constrained model call, deduplicated by content hash.
pub struct Enhancer {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    timeout: StdDuration,
    max_retries: u32,
    cache: Arc<Cache>,
    in_flight: DashMap<String, Arc<Mutex<()>>>,
}

impl Enhancer {
    pub fn new(config: &OpenAiConfig, cache: Arc<Cache>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: DEFAULT_API_URL.to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            timeout: StdDuration::from_secs(config.timeout_secs),
            max_retries: config.max_retries,
            cache,
            in_flight: DashMap::new(),
        }
    }

    /// At most one upstream call per content hash: a cached record is
    /// returned directly, and concurrent misses for the same hash wait on a
    /// per-hash gate while distinct hashes proceed independently.
    pub async fn enhance(&self, alert: &UnclassifiedAlert) -> Result<EnhancedAlert> {
        let location_text = format!("{:.4}, {:.4}", alert.location.lat, alert.location.lon);
        let hash = content_hash(
            &alert.title,
            &alert.description,
            &location_text,
            &alert.style_tag,
        );

        if let Some(hit) = self.cache.get_enhanced_alert(&hash) {
            return Ok(hit);
        }

        let gate = self
            .in_flight
            .entry(hash.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = gate.lock().await;

        // A concurrent enhancement may have landed while we waited.
        if let Some(hit) = self.cache.get_enhanced_alert(&hash) {
            drop(_guard);
            self.in_flight.remove(&hash);
            return Ok(hit);
        }

        let outcome = self.call_model(alert, &location_text).await;
        drop(_guard);
        self.in_flight.remove(&hash);

        let raw = outcome?;
        let enhanced = EnhancedAlert {
            original_description: alert.description.clone(),
            structured: post_validate(raw, alert, &location_text),
            processed_at: Utc::now(),
        };

        if let Err(e) = self.cache.set_enhanced_alert(
            &hash,
            &enhanced,
            Duration::hours(ENHANCED_ALERT_TTL_HOURS),
        ) {
            tracing::warn!("caching enhanced alert {hash} failed: {e}");
        }

        Ok(enhanced)
    }

    async fn call_model(
        &self,
        alert: &UnclassifiedAlert,
        location_text: &str,
    ) -> Result<RawStructured> {
        let user_prompt = format!(
            "Incident title: {}\nIncident type tag: {}\nCoordinates: {}\nReport text:\n{}",
            alert.title, alert.style_tag, location_text, alert.description
        );

        let body = json!({
            "model": self.model,
            "temperature": 0.3,
            "max_tokens": 1000,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": user_prompt },
            ],
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": "enhanced_road_alert",
                    "strict": true,
                    "schema": response_schema(),
                }
            }
        });

        let mut last_error = ApiError::Provider("enhancement not attempted".to_string());
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(StdDuration::from_millis(500 * attempt as u64)).await;
            }

            match self.request_once(&body).await {
                Ok(raw) => return Ok(raw),
                Err(e @ (ApiError::Schema(_) | ApiError::Auth(_) | ApiError::Validation(_))) => {
                    return Err(e)
                }
                Err(e) => {
                    tracing::warn!("enhancement attempt {} failed: {e}", attempt + 1);
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    async fn request_once(&self, body: &serde_json::Value) -> Result<RawStructured> {
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(ApiError::from_status(status, "enhancement"));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Parse(format!("enhancement response: {e}")))?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ApiError::Schema("model returned no content".to_string()))?;

        serde_json::from_str(&content)
            .map_err(|e| ApiError::Schema(format!("model output: {e}")))
    }
}

/// Strict response contract sent with every model call.
fn response_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": [
            "time_reported", "details", "condensed_summary", "location",
            "last_update", "impact", "road_status", "restriction_details",
            "chain_status", "additional_info"
        ],
        "properties": {
            "time_reported": { "type": ["string", "null"] },
            "details": { "type": "string" },
            "condensed_summary": { "type": "string", "maxLength": 120 },
            "location": {
                "type": "object",
                "additionalProperties": false,
                "required": ["description", "latitude", "longitude"],
                "properties": {
                    "description": { "type": "string" },
                    "latitude": { "type": "number" },
                    "longitude": { "type": "number" }
                }
            },
            "last_update": { "type": ["string", "null"] },
            "impact": { "enum": ["none", "light", "moderate", "severe"] },
            "road_status": { "enum": ["open", "restricted", "closed"] },
            "restriction_details": { "type": ["string", "null"] },
            "chain_status": { "enum": ["none", "r1", "r2", "active_unspecified"] },
            "additional_info": {
                "type": "object",
                "patternProperties": { "^[A-Za-z0-9._-]+$": { "type": "string" } },
                "additionalProperties": false
            }
        }
    })
}

fn additional_info_key_re() -> &'static Regex {
    static KEY_RE: OnceLock<Regex> = OnceLock::new();
    KEY_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("static regex"))
}

/// Forces model output onto the closed field domains, substituting the
/// original report values where the model produced nothing usable.
fn post_validate(
    raw: RawStructured,
    alert: &UnclassifiedAlert,
    location_text: &str,
) -> StructuredAlert {
    let details = match raw.details {
        Some(d) if !d.trim().is_empty() => d,
        _ => alert.description.clone(),
    };

    let condensed_summary = truncate_summary(
        raw.condensed_summary
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| details.clone()),
    );

    let location = match raw.location {
        Some(loc) => EnhancedLocation {
            description: loc
                .description
                .filter(|d| !d.trim().is_empty())
                .unwrap_or_else(|| location_text.to_string()),
            latitude: loc.latitude.unwrap_or(alert.location.lat),
            longitude: loc.longitude.unwrap_or(alert.location.lon),
        },
        None => EnhancedLocation {
            description: location_text.to_string(),
            latitude: alert.location.lat,
            longitude: alert.location.lon,
        },
    };

    let impact = match raw.impact.as_deref() {
        Some("none") => Impact::None,
        Some("light") => Impact::Light,
        Some("moderate") => Impact::Moderate,
        Some("severe") => Impact::Severe,
        _ => Impact::None,
    };

    let road_status = match raw.road_status.as_deref() {
        Some("open") => ReportedRoadStatus::Open,
        Some("restricted") => ReportedRoadStatus::Restricted,
        Some("closed") => ReportedRoadStatus::Closed,
        _ => ReportedRoadStatus::Open,
    };

    let chain_status = match raw.chain_status.as_deref() {
        Some("r1") => ChainStatus::R1,
        Some("r2") => ChainStatus::R2,
        Some("active_unspecified") => ChainStatus::ActiveUnspecified,
        _ => ChainStatus::None,
    };

    let additional_info = raw
        .additional_info
        .unwrap_or_default()
        .into_iter()
        .filter(|(key, _)| additional_info_key_re().is_match(key))
        .collect();

    StructuredAlert {
        time_reported: raw.time_reported.filter(|s| !s.trim().is_empty()),
        details,
        condensed_summary,
        location,
        last_update: raw.last_update.filter(|s| !s.trim().is_empty()),
        impact,
        road_status,
        restriction_details: raw.restriction_details.filter(|s| !s.trim().is_empty()),
        chain_status,
        additional_info,
    }
}

fn truncate_summary(summary: String) -> String {
    if summary.chars().count() <= SUMMARY_MAX_CHARS {
        return summary;
    }
    let truncated: String = summary.chars().take(SUMMARY_MAX_CHARS - 3).collect();
    format!("{truncated}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Coordinate;
    use crate::matcher::AlertType;

    fn sample_alert() -> UnclassifiedAlert {
        UnclassifiedAlert {
            id: "a_1".to_string(),
            title: "Lane closure on Hwy 4 EB near Angels Camp".to_string(),
            description: "One lane closed for repairs.".to_string(),
            style_tag: "lcs".to_string(),
            alert_type: AlertType::Closure,
            location: Coordinate { lat: 38.0675, lon: -120.5436 },
            affected_polyline: None,
        }
    }

    #[test]
    fn normalization_is_case_insensitive() {
        assert_eq!(
            normalize("Lane closure on Hwy 4 EB near Angels Camp"),
            normalize("LANE CLOSURE ON HWY 4 EB NEAR ANGELS CAMP"),
        );
    }

    #[test]
    fn normalization_expands_abbreviations() {
        assert_eq!(
            normalize("closure on hwy 4 eb"),
            "closed on highway 4 eastbound"
        );
        assert_eq!(normalize("incident nb of town"), "inc northbound of town");
    }

    #[test]
    fn normalization_strips_times_dates_and_punctuation() {
        assert_eq!(
            normalize("Crash reported at 14:30 on 1/15/2026, right lane blocked!"),
            "crash reported on right lane blocked"
        );
    }

    #[test]
    fn equivalent_reports_share_a_content_hash() {
        let a = content_hash(
            "Lane closure on Hwy 4 EB near Angels Camp",
            "One lane closed.",
            "38.0675, -120.5436",
            "lcs",
        );
        let b = content_hash(
            "LANE CLOSURE ON HWY 4 EB NEAR ANGELS CAMP",
            "One lane closed.",
            "38.0675, -120.5436",
            "lcs",
        );
        assert_eq!(a, b);

        let c = content_hash(
            "Lane closure on Hwy 4 WB near Angels Camp",
            "One lane closed.",
            "38.0675, -120.5436",
            "lcs",
        );
        assert_ne!(a, c);
    }

    #[test]
    fn post_validate_falls_back_to_original_values() {
        let raw = RawStructured {
            time_reported: Some(String::new()),
            details: Some("   ".to_string()),
            condensed_summary: None,
            location: Some(RawLocation {
                description: None,
                latitude: None,
                longitude: None,
            }),
            last_update: None,
            impact: Some("catastrophic".to_string()),
            road_status: Some("blocked".to_string()),
            restriction_details: None,
            chain_status: Some("r9".to_string()),
            additional_info: None,
        };

        let alert = sample_alert();
        let structured = post_validate(raw, &alert, "38.0675, -120.5436");

        assert_eq!(structured.details, alert.description);
        assert_eq!(structured.location.description, "38.0675, -120.5436");
        assert_eq!(structured.location.latitude, alert.location.lat);
        assert_eq!(structured.impact, Impact::None);
        assert_eq!(structured.road_status, ReportedRoadStatus::Open);
        assert_eq!(structured.chain_status, ChainStatus::None);
        assert!(structured.time_reported.is_none());
    }

    #[test]
    fn post_validate_filters_bad_additional_info_keys() {
        let mut info = HashMap::new();
        info.insert("lanes.blocked".to_string(), "1".to_string());
        info.insert("bad key!".to_string(), "x".to_string());

        let raw = RawStructured {
            time_reported: None,
            details: Some("details".to_string()),
            condensed_summary: Some("summary".to_string()),
            location: None,
            last_update: None,
            impact: Some("moderate".to_string()),
            road_status: Some("restricted".to_string()),
            restriction_details: Some("one-way traffic".to_string()),
            chain_status: Some("r1".to_string()),
            additional_info: Some(info),
        };

        let structured = post_validate(raw, &sample_alert(), "loc");
        assert_eq!(structured.additional_info.len(), 1);
        assert!(structured.additional_info.contains_key("lanes.blocked"));
        assert_eq!(structured.impact, Impact::Moderate);
        assert_eq!(structured.road_status, ReportedRoadStatus::Restricted);
        assert_eq!(structured.chain_status, ChainStatus::R1);
    }

    #[test]
    fn long_summaries_truncate_with_ellipsis() {
        let long = "x".repeat(200);
        let truncated = truncate_summary(long);
        assert_eq!(truncated.chars().count(), SUMMARY_MAX_CHARS);
        assert!(truncated.ends_with("..."));

        let short = "all clear".to_string();
        assert_eq!(truncate_summary(short.clone()), short);
    }

    #[test]
    fn unknown_fields_rejected_by_wire_shape() {
        let err = serde_json::from_str::<RawStructured>(
            r#"{ "details": "d", "surprise": true }"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn response_schema_is_strict() {
        let schema = response_schema();
        assert_eq!(schema["additionalProperties"], serde_json::json!(false));
        let required = schema["required"].as_array().unwrap();
        let properties = schema["properties"].as_object().unwrap();
        assert_eq!(required.len(), properties.len());
        for key in properties.keys() {
            assert!(required.iter().any(|r| r == key), "{key} missing from required");
        }
    }

    #[tokio::test]
    async fn cached_enhancement_short_circuits_upstream() {
        let cache = Arc::new(Cache::new());
        let config = OpenAiConfig {
            api_key: "test".to_string(),
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 1,
            max_retries: 0,
        };
        let enhancer = Enhancer::new(&config, cache.clone());

        let alert = sample_alert();
        let location_text = format!("{:.4}, {:.4}", alert.location.lat, alert.location.lon);
        let hash = content_hash(
            &alert.title,
            &alert.description,
            &location_text,
            &alert.style_tag,
        );

        let canned = EnhancedAlert {
            original_description: alert.description.clone(),
            structured: StructuredAlert {
                time_reported: None,
                details: "One lane closed for repairs.".to_string(),
                condensed_summary: "Lane closed near Angels Camp".to_string(),
                location: EnhancedLocation {
                    description: "Hwy 4 near Angels Camp".to_string(),
                    latitude: alert.location.lat,
                    longitude: alert.location.lon,
                },
                last_update: None,
                impact: Impact::Light,
                road_status: ReportedRoadStatus::Restricted,
                restriction_details: None,
                chain_status: ChainStatus::None,
                additional_info: HashMap::new(),
            },
            processed_at: Utc::now(),
        };
        cache
            .set_enhanced_alert(&hash, &canned, Duration::hours(ENHANCED_ALERT_TTL_HOURS))
            .unwrap();
        assert!(cache.is_enhanced_alert_cached(&hash));

        // No upstream is reachable in tests; a cache hit must resolve the
        // call without attempting one.
        let enhanced = enhancer.enhance(&alert).await.unwrap();
        assert_eq!(enhanced.structured.condensed_summary, canned.structured.condensed_summary);

        // A semantically identical retitle hits the same entry.
        let mut shouty = alert.clone();
        shouty.title = alert.title.to_uppercase();
        let enhanced = enhancer.enhance(&shouty).await.unwrap();
        assert_eq!(enhanced.structured.details, canned.structured.details);
    }

    #[test]
    fn enhanced_alert_ttl_expires() {
        let cache = Cache::new();
        let canned = EnhancedAlert {
            original_description: "d".to_string(),
            structured: StructuredAlert {
                time_reported: None,
                details: "d".to_string(),
                condensed_summary: "s".to_string(),
                location: EnhancedLocation {
                    description: "loc".to_string(),
                    latitude: 38.0,
                    longitude: -120.0,
                },
                last_update: None,
                impact: Impact::None,
                road_status: ReportedRoadStatus::Open,
                restriction_details: None,
                chain_status: ChainStatus::None,
                additional_info: HashMap::new(),
            },
            processed_at: Utc::now(),
        };

        cache
            .set_enhanced_alert("abc123", &canned, Duration::hours(ENHANCED_ALERT_TTL_HOURS))
            .unwrap();
        assert!(cache.get_enhanced_alert("abc123").is_some());

        cache.backdate("enhanced_alert:abc123", Duration::hours(25));
        assert!(cache.get_enhanced_alert("abc123").is_none());
        assert!(!cache.is_enhanced_alert_cached("abc123"));
    }
}
