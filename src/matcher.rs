use serde::{Deserialize, Serialize};

use crate::error::{ApiError, Result};
use crate::feed::{FeedKind, RawIncident};
use crate::geo::{self, Coordinate};

/// Distance inside which an incident counts as on the road itself.
pub const ON_ROUTE_THRESHOLD_M: f64 = 100.0;

/// Default Nearby threshold when a route does not override it.
pub const DEFAULT_MAX_DISTANCE_M: f64 = 5_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    Closure,
    Incident,
    Weather,
    Construction,
    Unknown,
}

impl AlertType {
    /// Display ordering: closures first, unknown last.
    pub fn priority(self) -> u8 {
        match self {
            AlertType::Closure => 0,
            AlertType::Construction => 1,
            AlertType::Incident => 2,
            AlertType::Weather => 3,
            AlertType::Unknown => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    OnRoute,
    Nearby,
    Distant,
}

/// A monitored road's per-cycle geometry. Rebuilt every refresh from the
/// traffic polyline (or the two-point fallback) and passed to the
/// classifier explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    pub polyline: Vec<Coordinate>,
    pub max_distance_m: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnclassifiedAlert {
    pub id: String,
    pub title: String,
    pub description: String,
    pub style_tag: String,
    pub alert_type: AlertType,
    pub location: Coordinate,
    pub affected_polyline: Option<Vec<Coordinate>>,
}

impl UnclassifiedAlert {
    /// Maps a parsed incident into an alert. Incidents without any location
    /// are unusable and yield None.
    pub fn from_incident(incident: &RawIncident) -> Option<Self> {
        let location = incident.location()?;

        let searchable = format!(
            "{} {} {}",
            incident.style_tag,
            incident.parsed_status.as_deref().unwrap_or(""),
            incident.title
        )
        .to_lowercase();

        let alert_type = if incident.kind == FeedKind::ChainControl {
            AlertType::Weather
        } else if searchable.contains("construction") {
            AlertType::Construction
        } else {
            match incident.kind {
                FeedKind::LaneClosure => AlertType::Closure,
                FeedKind::ChpIncident => AlertType::Incident,
                FeedKind::ChainControl => AlertType::Weather,
            }
        };

        Some(UnclassifiedAlert {
            id: format!("{}_{}", incident.title, incident.fetched_at.timestamp()),
            title: incident.title.clone(),
            description: incident.description_text.clone(),
            style_tag: incident.style_tag.clone(),
            alert_type,
            location,
            affected_polyline: incident
                .affected_geometry
                .as_ref()
                .filter(|g| g.len() >= 2)
                .cloned(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedAlert {
    #[serde(flatten)]
    pub alert: UnclassifiedAlert,
    pub classification: Classification,
    pub route_id: String,
    pub distance_to_route_m: f64,
}

fn alert_distance_to_route(alert: &UnclassifiedAlert, route: &Route) -> Result<f64> {
    match alert.affected_polyline.as_deref() {
        Some(points) if points.len() >= 2 => {
            let mut min = f64::INFINITY;
            for point in points {
                let d = geo::point_to_polyline(*point, &route.polyline)?;
                if d < min {
                    min = d;
                }
            }
            Ok(min)
        }
        _ => geo::point_to_polyline(alert.location, &route.polyline),
    }
}

/// Classifies an alert against a set of routes, returning the result for
/// the best-matching (minimum-distance) route.
pub fn classify(alert: &UnclassifiedAlert, routes: &[Route]) -> Result<ClassifiedAlert> {
    if routes.is_empty() {
        return Err(ApiError::Validation(
            "classification requires at least one route".to_string(),
        ));
    }

    let mut best: Option<(f64, &Route)> = None;
    for route in routes {
        let distance = alert_distance_to_route(alert, route)?;
        if best.map(|(d, _)| distance < d).unwrap_or(true) {
            best = Some((distance, route));
        }
    }

    let (distance, route) = best.expect("routes is non-empty");
    let classification = if distance <= ON_ROUTE_THRESHOLD_M {
        Classification::OnRoute
    } else if distance <= route.max_distance_m {
        Classification::Nearby
    } else {
        Classification::Distant
    };

    Ok(ClassifiedAlert {
        alert: alert.clone(),
        classification,
        route_id: route.id.clone(),
        distance_to_route_m: distance,
    })
}

/// Drops Nearby classifications of any alert that is OnRoute somewhere
/// else, so one incident never appears twice with conflicting prominence.
pub fn dedup_on_route(alerts: Vec<ClassifiedAlert>) -> Vec<ClassifiedAlert> {
    let on_route_ids: Vec<String> = alerts
        .iter()
        .filter(|a| a.classification == Classification::OnRoute)
        .map(|a| a.alert.id.clone())
        .collect();

    alerts
        .into_iter()
        .filter(|a| {
            a.classification != Classification::Nearby || !on_route_ids.contains(&a.alert.id)
        })
        .collect()
}

/// Per-road display order: OnRoute before Nearby, then ascending distance,
/// then type priority.
pub fn sort_alerts(alerts: &mut [ClassifiedAlert]) {
    alerts.sort_by(|a, b| {
        let rank = |c: Classification| match c {
            Classification::OnRoute => 0u8,
            Classification::Nearby => 1,
            Classification::Distant => 2,
        };
        rank(a.classification)
            .cmp(&rank(b.classification))
            .then(
                a.distance_to_route_m
                    .partial_cmp(&b.distance_to_route_m)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(a.alert.alert_type.priority().cmp(&b.alert.alert_type.priority()))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn coord(lat: f64, lon: f64) -> Coordinate {
        Coordinate { lat, lon }
    }

    fn highway_route() -> Route {
        Route {
            id: "hwy-4".to_string(),
            polyline: vec![coord(38.0675, -120.5436), coord(38.1391, -120.4561)],
            max_distance_m: 10_000.0,
        }
    }

    fn alert_at(id: &str, location: Coordinate) -> UnclassifiedAlert {
        UnclassifiedAlert {
            id: id.to_string(),
            title: id.to_string(),
            description: String::new(),
            style_tag: String::new(),
            alert_type: AlertType::Incident,
            location,
            affected_polyline: None,
        }
    }

    #[test]
    fn incident_between_route_points_is_nearby() {
        let classified =
            classify(&alert_at("a", coord(38.1000, -120.5100)), &[highway_route()]).unwrap();
        assert_eq!(classified.classification, Classification::Nearby);
        assert!(classified.distance_to_route_m > 0.0);
        assert!(classified.distance_to_route_m <= 10_000.0);
        assert_eq!(classified.route_id, "hwy-4");
    }

    #[test]
    fn incident_on_route_origin_is_on_route() {
        let classified =
            classify(&alert_at("a", coord(38.0675, -120.5436)), &[highway_route()]).unwrap();
        assert_eq!(classified.classification, Classification::OnRoute);
        assert!(classified.distance_to_route_m < 100.0);
    }

    #[test]
    fn far_incident_is_distant() {
        let classified = classify(&alert_at("a", coord(39.5, -121.5)), &[highway_route()]).unwrap();
        assert_eq!(classified.classification, Classification::Distant);
        assert!(classified.distance_to_route_m > 10_000.0);
    }

    #[test]
    fn affected_polyline_uses_minimum_point_distance() {
        let mut alert = alert_at("a", coord(39.5, -121.5));
        // Location alone is distant, but the affected geometry touches the
        // route origin.
        alert.affected_polyline = Some(vec![coord(39.5, -121.5), coord(38.0675, -120.5436)]);
        let classified = classify(&alert, &[highway_route()]).unwrap();
        assert_eq!(classified.classification, Classification::OnRoute);
    }

    #[test]
    fn best_route_wins_across_multiple_routes() {
        let far_route = Route {
            id: "hwy-108".to_string(),
            polyline: vec![coord(38.30, -120.20), coord(38.35, -120.10)],
            max_distance_m: 10_000.0,
        };
        let classified = classify(
            &alert_at("a", coord(38.0675, -120.5436)),
            &[far_route, highway_route()],
        )
        .unwrap();
        assert_eq!(classified.route_id, "hwy-4");
        assert_eq!(classified.classification, Classification::OnRoute);
    }

    #[test]
    fn on_route_beats_nearby_globally() {
        let alert = alert_at("incident-1", coord(38.0675, -120.5436));
        let on_route = ClassifiedAlert {
            alert: alert.clone(),
            classification: Classification::OnRoute,
            route_id: "r1".to_string(),
            distance_to_route_m: 40.0,
        };
        let nearby = ClassifiedAlert {
            alert,
            classification: Classification::Nearby,
            route_id: "r2".to_string(),
            distance_to_route_m: 800.0,
        };
        let other_nearby = ClassifiedAlert {
            alert: alert_at("incident-2", coord(38.1, -120.5)),
            classification: Classification::Nearby,
            route_id: "r2".to_string(),
            distance_to_route_m: 500.0,
        };

        let kept = dedup_on_route(vec![on_route, nearby, other_nearby]);
        assert_eq!(kept.len(), 2);
        assert!(kept
            .iter()
            .any(|a| a.alert.id == "incident-1" && a.classification == Classification::OnRoute));
        assert!(kept.iter().any(|a| a.alert.id == "incident-2"));
    }

    #[test]
    fn ordering_on_route_then_distance_then_type() {
        let mk = |id: &str, class: Classification, dist: f64, ty: AlertType| ClassifiedAlert {
            alert: UnclassifiedAlert {
                id: id.to_string(),
                title: id.to_string(),
                description: String::new(),
                style_tag: String::new(),
                alert_type: ty,
                location: coord(38.0, -120.5),
                affected_polyline: None,
            },
            classification: class,
            route_id: "r".to_string(),
            distance_to_route_m: dist,
        };

        let mut alerts = vec![
            mk("d", Classification::Nearby, 400.0, AlertType::Incident),
            mk("b", Classification::OnRoute, 50.0, AlertType::Weather),
            mk("a", Classification::OnRoute, 50.0, AlertType::Closure),
            mk("c", Classification::OnRoute, 90.0, AlertType::Incident),
        ];
        sort_alerts(&mut alerts);
        let ids: Vec<&str> = alerts.iter().map(|a| a.alert.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn alert_type_from_feed_kind_and_style() {
        let incident = RawIncident {
            kind: FeedKind::LaneClosure,
            title: "Overnight work".to_string(),
            description_html: String::new(),
            description_text: String::new(),
            style_tag: "lcs-construction".to_string(),
            point: Some(coord(38.0, -120.5)),
            affected_geometry: None,
            parsed_status: None,
            parsed_dates: vec![],
            fetched_at: Utc::now(),
        };
        let alert = UnclassifiedAlert::from_incident(&incident).unwrap();
        assert_eq!(alert.alert_type, AlertType::Construction);

        let incident = RawIncident {
            style_tag: "lcs-full".to_string(),
            ..incident
        };
        let alert = UnclassifiedAlert::from_incident(&incident).unwrap();
        assert_eq!(alert.alert_type, AlertType::Closure);
        assert!(alert.id.starts_with("Overnight work_"));
    }
}
