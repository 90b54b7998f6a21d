//! Audit-trail invariants over persisted records.

use std::collections::BTreeMap;

use crate::core::records::{CorrectionRecord, VerificationRecord};

/// Check audit invariants for one task's records:
/// - Correction attempt numbers per step index form `1..=N` in order
/// - Verification count per step index is correction count + 1
///
/// Returns a list of stable error messages (sorted by step index).
pub fn check_audit_trail(
    verifications: &[VerificationRecord],
    corrections: &[CorrectionRecord],
) -> Vec<String> {
    let mut errors = Vec::new();

    let mut attempts: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    for record in corrections {
        attempts
            .entry(record.step_index)
            .or_default()
            .push(record.attempt_number);
    }
    for (step_index, numbers) in &attempts {
        let expected: Vec<u32> = (1..=numbers.len() as u32).collect();
        if numbers != &expected {
            errors.push(format!(
                "step {}: correction attempts {:?} are not contiguous from 1",
                step_index, numbers
            ));
        }
    }

    let mut verification_counts: BTreeMap<u32, usize> = BTreeMap::new();
    for record in verifications {
        *verification_counts.entry(record.step_index).or_default() += 1;
    }
    for step_index in attempts.keys() {
        verification_counts.entry(*step_index).or_default();
    }
    for (step_index, verified) in &verification_counts {
        let corrected = attempts.get(step_index).map_or(0, Vec::len);
        if *verified != corrected + 1 {
            errors.push(format!(
                "step {}: {} verifications for {} corrections (expected {})",
                step_index,
                verified,
                corrected,
                corrected + 1
            ));
        }
    }

    errors
}
