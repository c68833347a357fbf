use crate::mapping::{Candidate, MappingStatus};
use crate::reconcile::service::ServiceCandidate;
use crate::spec::ReconciliationSpec;

/// Classify ranked candidates by the best score.
///
/// `score >= auto_accept` is matched, `review <= score < auto_accept` needs
/// review, anything lower (or no candidate) is unmatched.
pub fn classify(candidates: &[ServiceCandidate], spec: &ReconciliationSpec) -> (MappingStatus, Option<Candidate>) {
    let Some(best) = candidates.iter().max_by(|a, b| a.score.total_cmp(&b.score)) else {
        return (MappingStatus::Unmatched, None);
    };
    let candidate = Candidate {
        external_id: best.external_id.clone(),
        label: best.label.clone(),
        score: best.score,
    };

    let status = if best.score >= spec.auto_accept_threshold {
        MappingStatus::Matched
    } else if best.score >= spec.review_threshold {
        MappingStatus::NeedsReview
    } else {
        MappingStatus::Unmatched
    };
    (status, Some(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(score: f64) -> Vec<ServiceCandidate> {
        vec![ServiceCandidate {
            external_id: "Q1".to_string(),
            label: "x".to_string(),
            score,
            exact: false,
        }]
    }

    #[test]
    fn test_threshold_boundaries() {
        let spec = ReconciliationSpec::new("site", "site_name", "site");
        assert_eq!(classify(&scored(97.0), &spec).0, MappingStatus::Matched);
        assert_eq!(classify(&scored(95.0), &spec).0, MappingStatus::Matched);
        assert_eq!(classify(&scored(85.0), &spec).0, MappingStatus::NeedsReview);
        assert_eq!(classify(&scored(80.0), &spec).0, MappingStatus::NeedsReview);
        assert_eq!(classify(&scored(79.9), &spec).0, MappingStatus::Unmatched);
        assert_eq!(classify(&[], &spec), (MappingStatus::Unmatched, None));
    }
}
