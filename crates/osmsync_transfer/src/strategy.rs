//! Upload strategies and chunk planning.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

/// How an edit set is split into requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum UploadStrategy {
    /// One request per edit.
    IndividualObjects,
    /// Fixed-size chunks. `None` means the size is not specified and must be
    /// taken from the server capabilities.
    Chunked {
        /// Edits per request.
        chunk_size: Option<usize>,
    },
    /// Everything in one request.
    SingleRequest,
}

impl Default for UploadStrategy {
    fn default() -> Self {
        UploadStrategy::SingleRequest
    }
}

impl UploadStrategy {
    /// Chunked strategy; a size of 0 means unspecified.
    pub fn chunked(chunk_size: usize) -> Self {
        UploadStrategy::Chunked {
            chunk_size: (chunk_size > 0).then_some(chunk_size),
        }
    }

    /// Configuration name.
    pub fn name(&self) -> &'static str {
        match self {
            UploadStrategy::IndividualObjects => "individualobjects",
            UploadStrategy::Chunked { .. } => "chunked",
            UploadStrategy::SingleRequest => "singlerequest",
        }
    }

    /// Number of requests needed for `n` edits.
    ///
    /// Returns 0 for `n <= 0`, and for a chunked strategy without a chunk size.
    pub fn request_count_for(&self, n: i64) -> u64 {
        if n <= 0 {
            return 0;
        }
        let n = n as u64;
        match self {
            UploadStrategy::IndividualObjects => n,
            UploadStrategy::SingleRequest => 1,
            UploadStrategy::Chunked {
                chunk_size: Some(size),
            } => n.div_ceil(*size as u64),
            UploadStrategy::Chunked { chunk_size: None } => 0,
        }
    }

    /// Edits per request for a set of `len` edits.
    ///
    /// `advertised_size` is used when a chunked strategy has no size of its own;
    /// without either, everything goes into one request.
    pub fn effective_chunk_size(&self, len: usize, advertised_size: Option<usize>) -> usize {
        let size = match self {
            UploadStrategy::IndividualObjects => 1,
            UploadStrategy::SingleRequest => len,
            UploadStrategy::Chunked {
                chunk_size: Some(size),
            } => *size,
            UploadStrategy::Chunked { chunk_size: None } => advertised_size.unwrap_or(len),
        };
        size.max(1)
    }

    /// Plans the chunks covering `start..end`.
    pub fn plan(&self, start: usize, end: usize, advertised_size: Option<usize>) -> ChunkPlan {
        ChunkPlan::new(
            start,
            end,
            self.effective_chunk_size(end.saturating_sub(start), advertised_size),
        )
    }
}

impl fmt::Display for UploadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lazy, one-pass sequence of index ranges over an edit set.
///
/// Ranges are contiguous, in order and never empty. Once halted, or once the
/// end is reached, the plan yields nothing more.
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    next: usize,
    end: usize,
    size: usize,
    halted: bool,
}

impl ChunkPlan {
    /// Plans chunks of `size` over `start..end`.
    pub fn new(start: usize, end: usize, size: usize) -> Self {
        Self {
            next: start,
            end,
            size: size.max(1),
            halted: false,
        }
    }

    /// Chunk size.
    pub fn chunk_size(&self) -> usize {
        self.size
    }

    /// Stops producing chunks.
    pub fn halt(&mut self) {
        self.halted = true;
    }

    /// Returns true once halted.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Indices not yet handed out.
    pub fn remaining(&self) -> Range<usize> {
        self.next.min(self.end)..self.end
    }
}

impl Iterator for ChunkPlan {
    type Item = Range<usize>;

    fn next(&mut self) -> Option<Range<usize>> {
        if self.halted || self.next >= self.end {
            return None;
        }
        let start = self.next;
        let stop = start.saturating_add(self.size).min(self.end);
        self.next = stop;
        Some(start..stop)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.halted {
            return (0, Some(0));
        }
        let count = self.remaining().len().div_ceil(self.size);
        (count, Some(count))
    }
}

impl std::iter::FusedIterator for ChunkPlan {}

/// What to do when the server closes a changeset because it is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaxChangesetSizeExceededPolicy {
    /// Fail the upload.
    #[default]
    Abort,
    /// Stop and hand the remaining edits back to the caller.
    FillOneChangesetAndReturnToUploadDialog,
    /// Open a new changeset with the same tags and continue.
    AutomaticallyOpenNewChangesets,
}

impl MaxChangesetSizeExceededPolicy {
    /// Configuration name.
    pub fn name(&self) -> &'static str {
        match self {
            MaxChangesetSizeExceededPolicy::Abort => "abort",
            MaxChangesetSizeExceededPolicy::FillOneChangesetAndReturnToUploadDialog => {
                "fill_one_changeset_and_return_to_upload_dialog"
            }
            MaxChangesetSizeExceededPolicy::AutomaticallyOpenNewChangesets => {
                "automatically_open_new_changesets"
            }
        }
    }
}

impl FromStr for MaxChangesetSizeExceededPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(Self::Abort),
            "fill" | "fill_one_changeset_and_return_to_upload_dialog" => {
                Ok(Self::FillOneChangesetAndReturnToUploadDialog)
            }
            "auto" | "automatically_open_new_changesets" => {
                Ok(Self::AutomaticallyOpenNewChangesets)
            }
            other => Err(format!("unknown changeset size policy '{}'", other)),
        }
    }
}

/// What happens to the chunk the server rejected because its changeset
/// was full, once a new changeset was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedChunkPolicy {
    /// Send the chunk again into the new changeset.
    #[default]
    RetryInNewChangeset,
    /// Report the chunk as skipped and continue with the next one.
    Skip,
}

/// Complete upload configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadStrategySpec {
    /// Request splitting.
    pub strategy: UploadStrategy,
    /// Reaction to a full changeset.
    pub policy: MaxChangesetSizeExceededPolicy,
    /// Fate of the chunk that hit the full changeset.
    pub failed_chunk_policy: FailedChunkPolicy,
    /// Close the changeset after the last chunk.
    pub close_changeset_after_upload: bool,
}

impl Default for UploadStrategySpec {
    fn default() -> Self {
        Self {
            strategy: UploadStrategy::default(),
            policy: MaxChangesetSizeExceededPolicy::default(),
            failed_chunk_policy: FailedChunkPolicy::default(),
            close_changeset_after_upload: true,
        }
    }
}

impl UploadStrategySpec {
    /// Creates a spec with default policies.
    pub fn new(strategy: UploadStrategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    /// Sets the full-changeset policy.
    pub fn with_policy(mut self, policy: MaxChangesetSizeExceededPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the failed-chunk policy.
    pub fn with_failed_chunk_policy(mut self, policy: FailedChunkPolicy) -> Self {
        self.failed_chunk_policy = policy;
        self
    }

    /// Sets whether to close the changeset after the upload.
    pub fn with_close_changeset(mut self, close: bool) -> Self {
        self.close_changeset_after_upload = close;
        self
    }

    /// Number of requests needed for `n` edits.
    pub fn request_count_for(&self, n: i64) -> u64 {
        self.strategy.request_count_for(n)
    }
}

/// Parses a strategy name plus optional chunk size.
pub fn parse_strategy(name: &str, chunk_size: Option<usize>) -> Result<UploadStrategy, String> {
    match name.trim().to_ascii_lowercase().as_str() {
        "individualobjects" => Ok(UploadStrategy::IndividualObjects),
        "chunked" => Ok(UploadStrategy::chunked(chunk_size.unwrap_or(0))),
        "singlerequest" => Ok(UploadStrategy::SingleRequest),
        other => Err(format!("unknown upload strategy '{}'", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn strategies() -> impl Strategy<Value = UploadStrategy> {
        prop_oneof![
            Just(UploadStrategy::IndividualObjects),
            Just(UploadStrategy::SingleRequest),
            Just(UploadStrategy::Chunked { chunk_size: None }),
            (1usize..500).prop_map(UploadStrategy::chunked),
        ]
    }

    proptest! {
        #[test]
        fn no_requests_for_empty_sets(strategy in strategies(), n in -1000i64..=0) {
            prop_assert_eq!(strategy.request_count_for(n), 0);
        }

        #[test]
        fn single_request_is_one(n in 1i64..1_000_000) {
            prop_assert_eq!(UploadStrategy::SingleRequest.request_count_for(n), 1);
        }

        #[test]
        fn individual_is_n(n in 1i64..1_000_000) {
            prop_assert_eq!(UploadStrategy::IndividualObjects.request_count_for(n), n as u64);
        }

        #[test]
        fn chunked_is_ceiling(n in 1i64..1_000_000, size in 1usize..1000) {
            let expected = (n as u64 + size as u64 - 1) / size as u64;
            prop_assert_eq!(UploadStrategy::chunked(size).request_count_for(n), expected);
        }

        #[test]
        fn plan_covers_range_in_order(len in 0usize..300, size in 1usize..40) {
            let ranges: Vec<_> = UploadStrategy::chunked(size).plan(0, len, None).collect();
            prop_assert_eq!(ranges.len() as u64, UploadStrategy::chunked(size).request_count_for(len as i64));
            let mut expected_start = 0;
            for range in &ranges {
                prop_assert_eq!(range.start, expected_start);
                prop_assert!(!range.is_empty() && range.len() <= size);
                expected_start = range.end;
            }
            prop_assert_eq!(expected_start, len);
        }
    }

    #[test]
    fn unspecified_chunk_size_cannot_plan_count() {
        assert_eq!(
            UploadStrategy::Chunked { chunk_size: None }.request_count_for(10),
            0
        );
        assert_eq!(UploadStrategy::chunked(0), UploadStrategy::Chunked { chunk_size: None });
    }

    #[test]
    fn unspecified_chunk_size_uses_advertised_size() {
        let strategy = UploadStrategy::Chunked { chunk_size: None };
        let ranges: Vec<_> = strategy.plan(0, 10, Some(4)).collect();
        assert_eq!(ranges, vec![0..4, 4..8, 8..10]);
        let ranges: Vec<_> = strategy.plan(0, 10, None).collect();
        assert_eq!(ranges, vec![0..10]);
    }

    #[test]
    fn halted_plan_is_fused() {
        let mut plan = UploadStrategy::IndividualObjects.plan(2, 6, None);
        assert_eq!(plan.next(), Some(2..3));
        plan.halt();
        assert_eq!(plan.next(), None);
        assert_eq!(plan.remaining(), 3..6);
        assert_eq!(plan.size_hint(), (0, Some(0)));
    }

    #[test]
    fn names_and_parsing() {
        for strategy in [
            UploadStrategy::IndividualObjects,
            UploadStrategy::chunked(50),
            UploadStrategy::SingleRequest,
        ] {
            assert_eq!(parse_strategy(strategy.name(), Some(50)), Ok(strategy));
        }
        assert!(parse_strategy("parallel", None).is_err());
        assert_eq!(
            "auto".parse::<MaxChangesetSizeExceededPolicy>(),
            Ok(MaxChangesetSizeExceededPolicy::AutomaticallyOpenNewChangesets)
        );
    }

    #[test]
    fn spec_serializes() {
        let spec = UploadStrategySpec::new(UploadStrategy::chunked(100))
            .with_policy(MaxChangesetSizeExceededPolicy::AutomaticallyOpenNewChangesets);
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("\"kind\":\"chunked\""));
        let back: UploadStrategySpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }
}
