//! Scoring shared by the instruction-level and call-stack-aware engines:
//! digest histograms and the information-theoretic measures computed from
//! them, assuming a uniform input distribution over testcases.

use std::collections::HashMap;

use crate::core::types::{image_address_id, instruction_id, TestcaseId, TraceEntry};
use crate::util::hash::AccessDigest;

/// Extracts `(instruction_id, memory_address_id)` from a memory-access
/// entry. Heap and image accesses pack the container id into the high half;
/// stack accesses use the offset alone.
pub(crate) fn memory_access_ids(entry: &TraceEntry) -> Option<(u64, u64)> {
    match *entry {
        TraceEntry::ImageMemoryAccess {
            instruction_image_id,
            instruction_offset,
            memory_image_id,
            memory_offset,
            ..
        } => Some((
            instruction_id(instruction_image_id, instruction_offset),
            image_address_id(memory_image_id, memory_offset),
        )),
        TraceEntry::HeapMemoryAccess {
            instruction_image_id,
            instruction_offset,
            heap_block_id,
            memory_offset,
            ..
        } => Some((
            instruction_id(instruction_image_id, instruction_offset),
            ((heap_block_id as u32 as u64) << 32) | memory_offset as u64,
        )),
        TraceEntry::StackMemoryAccess {
            instruction_image_id,
            instruction_offset,
            memory_offset,
            ..
        } => Some((
            instruction_id(instruction_image_id, instruction_offset),
            memory_offset as u64,
        )),
        _ => None,
    }
}

/// Aggregated digest multiplicities for one program point.
#[derive(Default)]
pub(crate) struct DigestHistogram {
    pub testcase_count: u32,
    pub hash_counts: HashMap<AccessDigest, u32>,
    /// Only populated when the full-data dump is enabled.
    pub hash_testcases: Option<HashMap<AccessDigest, Vec<TestcaseId>>>,
}

impl DigestHistogram {
    pub fn record(&mut self, digest: AccessDigest, testcase_id: TestcaseId, keep_testcases: bool) {
        self.testcase_count += 1;
        *self.hash_counts.entry(digest).or_insert(0) += 1;
        if keep_testcases {
            self.hash_testcases
                .get_or_insert_with(HashMap::new)
                .entry(digest)
                .or_default()
                .push(testcase_id);
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct LeakageStatistics {
    /// Bits of information the digest reveals about the input.
    pub mutual_information: f64,
    /// `log2` of the number of distinct digests.
    pub min_entropy: f64,
    /// Expected number of guesses, in guesses.
    pub conditional_guessing_entropy: f64,
    /// Best-case (for the attacker) guess count over all digests.
    pub min_conditional_guessing_entropy: f64,
    /// The digest attaining the minimum above.
    pub min_guess_digest: AccessDigest,
}

impl LeakageStatistics {
    /// True when the measured MI is so close to its ceiling that more
    /// testcases are needed for a meaningful estimate.
    pub fn saturates(&self, testcase_count: u32) -> bool {
        self.mutual_information > (testcase_count as f64).log2() - 0.9
    }
}

pub(crate) fn score_histogram(histogram: &DigestHistogram) -> LeakageStatistics {
    let n = histogram.testcase_count as f64;

    // Sorted iteration keeps the argmin digest deterministic.
    let mut entries: Vec<(&AccessDigest, &u32)> = histogram.hash_counts.iter().collect();
    entries.sort_by_key(|(digest, _)| **digest);

    let mut mutual_information = 0.0;
    let mut conditional_guessing_entropy = 0.0;
    let mut min_conditional_guessing_entropy = f64::INFINITY;
    let mut min_guess_digest = AccessDigest::default();

    for (digest, &count) in entries {
        let probability = count as f64 / n;
        mutual_information += probability * (n / count as f64).log2();
        let guesses = (count as f64 + 1.0) / 2.0;
        conditional_guessing_entropy += probability * guesses;
        if guesses < min_conditional_guessing_entropy {
            min_conditional_guessing_entropy = guesses;
            min_guess_digest = *digest;
        }
    }

    LeakageStatistics {
        mutual_information,
        min_entropy: (histogram.hash_counts.len() as f64).log2(),
        conditional_guessing_entropy,
        min_conditional_guessing_entropy,
        min_guess_digest,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn histogram(counts: &[u32]) -> DigestHistogram {
        let mut histogram = DigestHistogram::default();
        for (i, &count) in counts.iter().enumerate() {
            let mut digest = AccessDigest::default();
            digest.update(0x1000 + i as u64);
            for _ in 0..count {
                histogram.record(digest, 0, false);
            }
        }
        histogram
    }

    #[test]
    fn constant_behavior_scores_zero() {
        // One digest shared by both testcases: nothing leaks.
        let stats = score_histogram(&histogram(&[2]));
        assert_eq!(stats.mutual_information, 0.0);
        assert_eq!(stats.min_entropy, 0.0);
        assert_eq!(stats.conditional_guessing_entropy, 1.5);
        assert_eq!(stats.min_conditional_guessing_entropy, 1.5);
    }

    #[test]
    fn fully_input_dependent_behavior_scores_log_n() {
        // Four testcases, four distinct digests.
        let stats = score_histogram(&histogram(&[1, 1, 1, 1]));
        assert_eq!(stats.mutual_information, 2.0);
        assert_eq!(stats.min_entropy, 2.0);
        assert_eq!(stats.conditional_guessing_entropy, 1.0);
        assert_eq!(stats.min_conditional_guessing_entropy, 1.0);
    }

    #[test]
    fn min_entropy_is_log2_of_distinct_digests() {
        let stats = score_histogram(&histogram(&[4, 2, 2]));
        assert_eq!(stats.min_entropy, (3.0f64).log2());
    }

    #[test]
    fn skewed_histogram_scores_between_extremes() {
        // Counts 3 + 1 over N = 4.
        let stats = score_histogram(&histogram(&[3, 1]));
        let expected_mi = 0.75 * (4.0f64 / 3.0).log2() + 0.25 * 2.0;
        assert!((stats.mutual_information - expected_mi).abs() < 1e-12);
        assert_eq!(stats.conditional_guessing_entropy, 0.75 * 2.0 + 0.25 * 1.0);
        assert_eq!(stats.min_conditional_guessing_entropy, 1.0);
    }

    #[test]
    fn saturation_flags_too_few_testcases() {
        let stats = score_histogram(&histogram(&[1, 1, 1, 1]));
        assert!(stats.saturates(4)); // 2.0 > log2(4) - 0.9
        let stats = score_histogram(&histogram(&[2, 2]));
        assert!(!stats.saturates(4)); // 1.0 < 2.0 - 0.9
    }

    #[test]
    fn doubling_agreeing_testcases_cannot_decrease_mi() {
        let small = score_histogram(&histogram(&[1, 1]));
        let large = score_histogram(&histogram(&[1, 1, 1, 1]));
        assert!(large.mutual_information >= small.mutual_information);
    }
}
