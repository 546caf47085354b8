use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::FeedConfig;
use crate::error::{ApiError, Result};
use crate::geo::{self, Coordinate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedKind {
    LaneClosure,
    ChpIncident,
    ChainControl,
}

/// One incident parsed out of a feed placemark. At least one of `point` /
/// `affected_geometry` is always present; placemarks with neither are
/// dropped during parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawIncident {
    pub kind: FeedKind,
    pub title: String,
    pub description_html: String,
    pub description_text: String,
    pub style_tag: String,
    pub point: Option<Coordinate>,
    pub affected_geometry: Option<Vec<Coordinate>>,
    pub parsed_status: Option<String>,
    pub parsed_dates: Vec<String>,
    pub fetched_at: DateTime<Utc>,
}

impl RawIncident {
    /// Representative location: the point when present, else the first
    /// geometry vertex.
    pub fn location(&self) -> Option<Coordinate> {
        self.point
            .or_else(|| self.affected_geometry.as_ref().and_then(|g| g.first().copied()))
    }
}

#[derive(Debug, Default)]
struct PlacemarkBuilder {
    name: String,
    description: String,
    style_url: String,
    point: Option<Coordinate>,
    line_coords: Vec<Coordinate>,
    polygon_coords: Vec<Coordinate>,
}

/// Parses placemark feeds (nested Document/Folder/Placemark) into typed
/// incident records.
pub struct FeedParser {
    tag_re: Regex,
    slash_date_re: Regex,
    name_date_re: Regex,
    ws_re: Regex,
}

impl Default for FeedParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedParser {
    pub fn new() -> Self {
        Self {
            tag_re: Regex::new(r"<[^>]*>").expect("static regex"),
            slash_date_re: Regex::new(r"\b\d{1,2}/\d{1,2}/\d{4}\b").expect("static regex"),
            name_date_re: Regex::new(
                r"\b(?:Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Oct|Nov|Dec)[a-z]* \d{1,2}, \d{4}\b",
            )
            .expect("static regex"),
            ws_re: Regex::new(r"\s+").expect("static regex"),
        }
    }

    pub fn parse(
        &self,
        xml: &str,
        kind: FeedKind,
        fetched_at: DateTime<Utc>,
    ) -> Result<Vec<RawIncident>> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut incidents = Vec::new();
        let mut stack: Vec<String> = Vec::new();
        let mut current: Option<PlacemarkBuilder> = None;

        loop {
            match reader.read_event() {
                Err(e) => {
                    return Err(ApiError::Parse(format!(
                        "feed XML at offset {}: {e}",
                        reader.buffer_position()
                    )))
                }
                Ok(Event::Eof) => break,
                Ok(Event::Start(e)) => {
                    let local = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                    if local == "Placemark" {
                        current = Some(PlacemarkBuilder::default());
                    }
                    stack.push(local);
                }
                Ok(Event::End(e)) => {
                    let local = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                    if local == "Placemark" {
                        if let Some(builder) = current.take() {
                            if let Some(incident) =
                                self.build_incident(builder, kind, fetched_at)
                            {
                                incidents.push(incident);
                            }
                        }
                    }
                    stack.pop();
                }
                Ok(Event::Text(t)) => {
                    let text = t
                        .unescape()
                        .map_err(|e| ApiError::Parse(format!("feed text: {e}")))?
                        .to_string();
                    self.apply_text(&mut current, &stack, &text);
                }
                Ok(Event::CData(t)) => {
                    let text = String::from_utf8_lossy(&t.into_inner()).to_string();
                    self.apply_text(&mut current, &stack, &text);
                }
                Ok(_) => {}
            }
        }

        Ok(incidents)
    }

    fn apply_text(&self, current: &mut Option<PlacemarkBuilder>, stack: &[String], text: &str) {
        let builder = match current {
            Some(b) => b,
            None => return,
        };
        let element = match stack.last() {
            Some(e) => e.as_str(),
            None => return,
        };

        match element {
            "name" => builder.name.push_str(text),
            "description" => builder.description.push_str(text),
            "styleUrl" => builder
                .style_url
                .push_str(text.trim().trim_start_matches('#')),
            "coordinates" => {
                let coords = parse_coordinate_list(text);
                if coords.is_empty() {
                    return;
                }
                if stack.iter().any(|e| e == "Point") {
                    if builder.point.is_none() {
                        builder.point = Some(coords[0]);
                    }
                } else if stack.iter().any(|e| e == "LineString") {
                    builder.line_coords.extend(coords);
                } else if stack.iter().any(|e| e == "outerBoundaryIs") {
                    builder.polygon_coords.extend(coords);
                }
                // Inner polygon rings are ignored.
            }
            _ => {}
        }
    }

    fn build_incident(
        &self,
        builder: PlacemarkBuilder,
        kind: FeedKind,
        fetched_at: DateTime<Utc>,
    ) -> Option<RawIncident> {
        let affected_geometry = if builder.line_coords.len() >= 2 {
            Some(builder.line_coords)
        } else if builder.polygon_coords.len() >= 2 {
            Some(builder.polygon_coords)
        } else {
            None
        };

        if builder.point.is_none() && affected_geometry.is_none() {
            tracing::debug!("dropping placemark {:?} without geometry", builder.name);
            return None;
        }

        let description_text = self.strip_html(&builder.description);
        let searchable = format!("{} {}", builder.name, description_text);

        Some(RawIncident {
            kind,
            title: builder.name.trim().to_string(),
            description_html: builder.description,
            description_text: description_text.clone(),
            style_tag: builder.style_url,
            point: builder.point,
            affected_geometry,
            parsed_status: self.infer_status(&searchable),
            parsed_dates: self.scrape_dates(&description_text),
            fetched_at,
        })
    }

    /// Tag-strips and entity-decodes an HTML fragment, collapsing whitespace
    /// runs to single spaces.
    pub fn strip_html(&self, html: &str) -> String {
        let stripped = self.tag_re.replace_all(html, " ");
        let decoded = stripped
            .replace("&nbsp;", " ")
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&quot;", "\"")
            .replace("&#39;", "'")
            .replace("&apos;", "'")
            .replace("&amp;", "&");
        self.ws_re.replace_all(decoded.trim(), " ").to_string()
    }

    fn infer_status(&self, text: &str) -> Option<String> {
        let lower = text.to_lowercase();
        for (pattern, status) in [
            ("closed", "Closed"),
            ("chain control in effect", "Chain Control In Effect"),
            ("restrictions", "Restrictions"),
            ("incident", "Incident"),
            ("construction", "Construction"),
        ] {
            if lower.contains(pattern) {
                return Some(status.to_string());
            }
        }
        None
    }

    fn scrape_dates(&self, text: &str) -> Vec<String> {
        let mut found: Vec<(usize, String)> = Vec::new();
        for m in self.slash_date_re.find_iter(text) {
            found.push((m.start(), m.as_str().to_string()));
        }
        for m in self.name_date_re.find_iter(text) {
            found.push((m.start(), m.as_str().to_string()));
        }
        found.sort_by_key(|(pos, _)| *pos);

        let mut dates = Vec::new();
        for (_, date) in found {
            if !dates.contains(&date) {
                dates.push(date);
            }
        }
        dates
    }
}

/// Splits a `lon,lat,alt lon,lat,alt ...` coordinate block, ignoring
/// altitude and skipping malformed or out-of-range tuples.
fn parse_coordinate_list(text: &str) -> Vec<Coordinate> {
    text.split_whitespace()
        .filter_map(|triple| {
            let mut parts = triple.split(',');
            let lon = parts.next()?.trim().parse::<f64>().ok()?;
            let lat = parts.next()?.trim().parse::<f64>().ok()?;
            Coordinate::new(lat, lon).ok()
        })
        .collect()
}

/// Fetches and parses the configured incident feeds.
pub struct FeedClient {
    client: reqwest::Client,
    parser: FeedParser,
    lane_closure_url: String,
    chp_incident_url: String,
    chain_control_url: String,
    enable_chain_control: bool,
}

impl FeedClient {
    pub fn new(config: &FeedConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            parser: FeedParser::new(),
            lane_closure_url: config.lane_closure_url.clone(),
            chp_incident_url: config.chp_incident_url.clone(),
            chain_control_url: config.chain_control_url.clone(),
            enable_chain_control: config.enable_chain_control,
        }
    }

    async fn fetch_feed(&self, url: &str, kind: FeedKind) -> Result<Vec<RawIncident>> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(ApiError::from_status(status, "incident feed"));
        }

        let body = response.text().await?;
        self.parser.parse(&body, kind, Utc::now())
    }

    /// Lane closures and CHP incidents, concatenated. A failing feed is
    /// recovered locally so one bad upstream does not blank the other.
    pub async fn fetch_incidents(&self) -> Result<Vec<RawIncident>> {
        let mut incidents = Vec::new();

        match self.fetch_feed(&self.lane_closure_url, FeedKind::LaneClosure).await {
            Ok(mut parsed) => incidents.append(&mut parsed),
            Err(e) => tracing::warn!("lane closure feed failed: {e}"),
        }

        match self.fetch_feed(&self.chp_incident_url, FeedKind::ChpIncident).await {
            Ok(mut parsed) => incidents.append(&mut parsed),
            Err(e) => tracing::warn!("CHP incident feed failed: {e}"),
        }

        if self.enable_chain_control {
            match self
                .fetch_feed(&self.chain_control_url, FeedKind::ChainControl)
                .await
            {
                Ok(mut parsed) => incidents.append(&mut parsed),
                Err(e) => tracing::warn!("chain control feed failed: {e}"),
            }
        }

        Ok(incidents)
    }

    /// Incidents whose point lies within `radius_m` of any of the given
    /// route coordinates.
    pub async fn fetch_with_geographic_filter(
        &self,
        route_coords: &[Coordinate],
        radius_m: f64,
    ) -> Result<Vec<RawIncident>> {
        let incidents = self.fetch_incidents().await?;
        Ok(filter_by_radius(incidents, route_coords, radius_m))
    }
}

pub fn filter_by_radius(
    incidents: Vec<RawIncident>,
    route_coords: &[Coordinate],
    radius_m: f64,
) -> Vec<RawIncident> {
    incidents
        .into_iter()
        .filter(|incident| {
            let location = match incident.location() {
                Some(loc) => loc,
                None => return false,
            };
            route_coords.iter().any(|coord| {
                geo::point_to_point(location, *coord)
                    .map(|d| d <= radius_m)
                    .unwrap_or(false)
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_kml() -> &'static str {
        r#"<?xml version="1.0" encoding="UTF-8"?>
<kml xmlns="http://www.opengis.net/kml/2.2">
  <Document>
    <Folder>
      <Placemark>
        <name>Lane closure on Hwy 4 EB near Angels Camp</name>
        <styleUrl>#lcs-full-closure</styleUrl>
        <description><![CDATA[<b>One lane closed</b> for repairs starting 01/15/2026.&nbsp;Expect delays.]]></description>
        <Point><coordinates>-120.5436,38.0675,0</coordinates></Point>
      </Placemark>
      <Placemark>
        <name>Full closure segment</name>
        <styleUrl>#lcs-line</styleUrl>
        <description>Road closed between mileposts. Reopens Mar 3, 2026.</description>
        <LineString>
          <coordinates>
            -120.5436,38.0675,0 -120.5000,38.1000,0 -120.4561,38.1391,0
          </coordinates>
        </LineString>
      </Placemark>
      <Placemark>
        <name>No geometry here</name>
        <description>Should be dropped.</description>
      </Placemark>
      <Placemark>
        <name>Snow zone</name>
        <Polygon>
          <outerBoundaryIs>
            <LinearRing>
              <coordinates>-120.5,38.0,0 -120.4,38.0,0 -120.4,38.1,0 -120.5,38.0,0</coordinates>
            </LinearRing>
          </outerBoundaryIs>
        </Polygon>
      </Placemark>
      <Placemark>
        <name>Multi geometry incident</name>
        <MultiGeometry>
          <Point><coordinates>-120.45,38.05,12</coordinates></Point>
          <LineString><coordinates>-120.45,38.05,0 -120.44,38.06,0</coordinates></LineString>
        </MultiGeometry>
      </Placemark>
    </Folder>
  </Document>
</kml>"#
    }

    #[test]
    fn parses_points_lines_polygons_and_drops_empty() {
        let parser = FeedParser::new();
        let incidents = parser
            .parse(sample_kml(), FeedKind::LaneClosure, Utc::now())
            .unwrap();

        assert_eq!(incidents.len(), 4);

        let point_incident = &incidents[0];
        assert_eq!(point_incident.title, "Lane closure on Hwy 4 EB near Angels Camp");
        assert_eq!(point_incident.style_tag, "lcs-full-closure");
        let point = point_incident.point.unwrap();
        assert!((point.lat - 38.0675).abs() < 1e-9);
        assert!((point.lon - -120.5436).abs() < 1e-9);

        let line_incident = &incidents[1];
        assert!(line_incident.point.is_none());
        assert_eq!(line_incident.affected_geometry.as_ref().unwrap().len(), 3);

        let polygon_incident = &incidents[2];
        assert_eq!(polygon_incident.title, "Snow zone");
        assert_eq!(polygon_incident.affected_geometry.as_ref().unwrap().len(), 4);

        let multi = &incidents[3];
        assert!(multi.point.is_some());
        assert_eq!(multi.affected_geometry.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn description_html_is_stripped_and_decoded() {
        let parser = FeedParser::new();
        let incidents = parser
            .parse(sample_kml(), FeedKind::LaneClosure, Utc::now())
            .unwrap();

        let text = &incidents[0].description_text;
        assert_eq!(
            text,
            "One lane closed for repairs starting 01/15/2026. Expect delays."
        );
    }

    #[test]
    fn strip_html_decodes_entities_and_collapses_whitespace() {
        let parser = FeedParser::new();
        assert_eq!(
            parser.strip_html("<p>Chains &amp; cables\n\n  required</p>"),
            "Chains & cables required"
        );
        assert_eq!(parser.strip_html("a &lt;b&gt; c"), "a <b> c");
    }

    #[test]
    fn status_inference_matches_known_patterns() {
        let parser = FeedParser::new();
        assert_eq!(
            parser.infer_status("Road CLOSED at milepost 12"),
            Some("Closed".to_string())
        );
        assert_eq!(
            parser.infer_status("Chain Control in Effect on Hwy 4"),
            Some("Chain Control In Effect".to_string())
        );
        assert_eq!(
            parser.infer_status("One-way traffic restrictions"),
            Some("Restrictions".to_string())
        );
        assert_eq!(parser.infer_status("Nothing notable"), None);
    }

    #[test]
    fn date_scraping_dedupes_in_first_seen_order() {
        let parser = FeedParser::new();
        let dates = parser.scrape_dates(
            "Starts 01/15/2026, resumes Mar 3, 2026, again 01/15/2026 and ends 3/9/2026.",
        );
        assert_eq!(dates, vec!["01/15/2026", "Mar 3, 2026", "3/9/2026"]);
    }

    #[test]
    fn coordinate_triples_ignore_altitude_and_bad_tuples() {
        let coords = parse_coordinate_list("-120.5,38.0,1234 garbage -120.4,38.1");
        assert_eq!(coords.len(), 2);
        assert!((coords[0].lat - 38.0).abs() < 1e-9);
        assert!((coords[1].lon - -120.4).abs() < 1e-9);

        // lat/lon swapped out of range → skipped
        let coords = parse_coordinate_list("38.0,-120.5,0");
        assert!(coords.is_empty());
    }

    #[test]
    fn geographic_filter_keeps_nearby_incidents_only() {
        let parser = FeedParser::new();
        let incidents = parser
            .parse(sample_kml(), FeedKind::LaneClosure, Utc::now())
            .unwrap();

        let route = [Coordinate { lat: 38.0675, lon: -120.5436 }];
        let kept = filter_by_radius(incidents.clone(), &route, 1_000.0);
        // The point incident sits on the route coordinate; the line incident
        // starts there too.
        assert!(kept.iter().any(|i| i.title.contains("Lane closure")));
        assert!(kept.iter().all(|i| i.location().is_some()));

        let far_route = [Coordinate { lat: 40.0, lon: -122.0 }];
        let kept = filter_by_radius(incidents, &far_route, 1_000.0);
        assert!(kept.is_empty());
    }
}
