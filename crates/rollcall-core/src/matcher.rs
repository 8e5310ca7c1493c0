//! Roster matching: nearest enrolled template under a distance threshold.

use crate::types::{Descriptor, DimensionMismatch, IdentityId, MatchDecision, Template};
use std::collections::BTreeMap;

/// The enrolled templates considered during one recognition pass.
///
/// Ordered by identity id so that matching is deterministic.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    templates: BTreeMap<IdentityId, Template>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the template for its identity.
    pub fn insert(&mut self, template: Template) -> Option<Template> {
        self.templates.insert(template.identity_id.clone(), template)
    }

    pub fn get(&self, id: &IdentityId) -> Option<&Template> {
        self.templates.get(id)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &IdentityId> {
        self.templates.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Template> {
        self.templates.values()
    }

    /// Check every template against the expected descriptor dimension.
    pub fn validate(&self, descriptor_len: usize) -> Result<(), DimensionMismatch> {
        self.iter()
            .try_for_each(|t| t.descriptor.check_len(descriptor_len))
    }
}

impl FromIterator<Template> for Roster {
    fn from_iter<I: IntoIterator<Item = Template>>(iter: I) -> Self {
        let mut roster = Roster::new();
        for template in iter {
            roster.insert(template);
        }
        roster
    }
}

/// Strategy for comparing a live descriptor against a roster.
pub trait Matcher: Send + Sync {
    fn compare(&self, probe: &Descriptor, roster: &Roster, threshold: f32) -> MatchDecision;
}

/// Confidence derived from distance: 1 at distance 0, 0 at or past the threshold.
pub fn confidence(distance: f32, threshold: f32) -> f32 {
    if threshold <= 0.0 || !distance.is_finite() {
        return 0.0;
    }
    (1.0 - distance / threshold).max(0.0)
}

/// Euclidean nearest-neighbour matcher.
///
/// Always visits every roster entry; ties keep the first entry in roster
/// order. A nearest neighbour beyond the threshold is reported as unknown,
/// never as a best guess. Templates of a different length than the probe
/// are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Descriptor, roster: &Roster, threshold: f32) -> MatchDecision {
        let mut best_sq = f32::INFINITY;
        let mut best: Option<&Template> = None;

        for template in roster.iter() {
            let sq = match probe.squared_distance(&template.descriptor) {
                Ok(sq) => sq,
                Err(mismatch) => {
                    tracing::warn!(identity = %template.identity_id, error = %mismatch, "template skipped");
                    continue;
                }
            };
            if sq < best_sq {
                best_sq = sq;
                best = Some(template);
            }
        }

        let Some(template) = best else {
            return MatchDecision::unknown();
        };

        let distance = best_sq.sqrt();
        let confidence = confidence(distance, threshold);
        if distance <= threshold {
            MatchDecision {
                identity_id: Some(template.identity_id.clone()),
                distance,
                confidence,
                accepted: true,
            }
        } else {
            MatchDecision {
                identity_id: None,
                distance,
                confidence,
                accepted: false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn template(id: &str, values: Vec<f32>) -> Template {
        Template {
            identity_id: IdentityId::from(id),
            descriptor: Descriptor::new(values),
            created_at: Utc::now(),
            source_capture_count: 3,
        }
    }

    fn ab_roster() -> Roster {
        [
            template("A", vec![1.0, 0.0, 0.0]),
            template("B", vec![0.0, 1.0, 0.0]),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_exact_match() {
        let roster = ab_roster();
        let probe = Descriptor::new(vec![0.0, 1.0, 0.0]);
        let d = EuclideanMatcher.compare(&probe, &roster, 0.5);
        assert!(d.accepted);
        assert_eq!(d.identity_id, Some(IdentityId::from("B")));
        assert_eq!(d.distance, 0.0);
        assert_eq!(d.confidence, 1.0);
    }

    #[test]
    fn test_near_match_accepted() {
        let roster = ab_roster();
        let probe = Descriptor::new(vec![0.95, 0.1, 0.0]);
        let d = EuclideanMatcher.compare(&probe, &roster, 0.3);
        assert!(d.accepted);
        assert_eq!(d.identity_id, Some(IdentityId::from("A")));
        assert!((d.distance - 0.1118).abs() < 1e-3, "distance {}", d.distance);
        assert!(d.confidence > 0.6 && d.confidence < 0.7);
    }

    #[test]
    fn test_equidistant_probe_beyond_threshold_is_unknown() {
        let roster = ab_roster();
        let probe = Descriptor::new(vec![0.5, 0.5, 0.0]);
        let d = EuclideanMatcher.compare(&probe, &roster, 0.3);
        assert!(!d.accepted);
        assert_eq!(d.identity_id, None);
        assert!((d.distance - 0.7071).abs() < 1e-3);
        assert_eq!(d.confidence, 0.0);
    }

    #[test]
    fn test_nearest_beyond_threshold_not_guessed() {
        let roster: Roster = [template("only", vec![0.0, 0.0, 1.0])].into_iter().collect();
        let probe = Descriptor::new(vec![0.0, 0.0, 0.2]);
        let d = EuclideanMatcher.compare(&probe, &roster, 0.6);
        assert!(!d.accepted);
        assert_eq!(d.identity_id, None);
        assert!((d.distance - 0.8).abs() < 1e-5);
    }

    #[test]
    fn test_distance_equal_to_threshold_is_accepted() {
        let roster: Roster = [template("A", vec![0.0, 0.0])].into_iter().collect();
        let probe = Descriptor::new(vec![0.5, 0.0]);
        let d = EuclideanMatcher.compare(&probe, &roster, 0.5);
        assert!(d.accepted);
        assert_eq!(d.confidence, 0.0);
    }

    #[test]
    fn test_wrong_length_template_never_matches() {
        let probe = Descriptor::new(vec![1.0, 0.0]);
        let d = EuclideanMatcher.compare(&probe, &ab_roster(), 0.5);
        assert_eq!(d, MatchDecision::unknown());

        let roster: Roster = [
            template("A", vec![1.0, 0.0, 0.0]),
            template("short", vec![1.0, 0.0]),
        ]
        .into_iter()
        .collect();
        let d = EuclideanMatcher.compare(&Descriptor::new(vec![0.9, 0.0, 0.0]), &roster, 0.5);
        assert!(d.accepted);
        assert_eq!(d.identity_id, Some(IdentityId::from("A")));
    }

    #[test]
    fn test_empty_roster() {
        let probe = Descriptor::new(vec![1.0, 0.0, 0.0]);
        let d = EuclideanMatcher.compare(&probe, &Roster::new(), 0.5);
        assert!(!d.accepted);
        assert_eq!(d.identity_id, None);
        assert!(d.distance.is_infinite());
        assert_eq!(d.confidence, 0.0);
    }

    #[test]
    fn test_best_match_last_in_roster() {
        let roster: Roster = [
            template("a-decoy", vec![0.0, 1.0, 0.0]),
            template("b-decoy", vec![0.0, 0.0, 1.0]),
            template("c-match", vec![1.0, 0.0, 0.0]),
        ]
        .into_iter()
        .collect();
        let probe = Descriptor::new(vec![1.0, 0.0, 0.0]);
        let d = EuclideanMatcher.compare(&probe, &roster, 0.5);
        assert_eq!(d.identity_id, Some(IdentityId::from("c-match")));
    }

    #[test]
    fn test_tie_keeps_first_identity() {
        let roster: Roster = [
            template("first", vec![1.0, 0.0]),
            template("second", vec![1.0, 0.0]),
        ]
        .into_iter()
        .collect();
        let d = EuclideanMatcher.compare(&Descriptor::new(vec![1.0, 0.1]), &roster, 0.5);
        assert_eq!(d.identity_id, Some(IdentityId::from("first")));
    }

    #[test]
    fn test_roster_validate() {
        let roster: Roster = [
            template("A", vec![1.0, 0.0, 0.0]),
            template("B", vec![1.0, 0.0]),
        ]
        .into_iter()
        .collect();
        assert_eq!(
            roster.validate(3),
            Err(DimensionMismatch { expected: 3, actual: 2 })
        );
    }

    #[test]
    fn test_confidence_monotonic() {
        let t = 0.6;
        let mut prev = confidence(0.0, t);
        for step in 1..20 {
            let c = confidence(step as f32 * 0.05, t);
            assert!(c <= prev);
            prev = c;
        }
        assert_eq!(confidence(1.0, t), 0.0);
    }
}
