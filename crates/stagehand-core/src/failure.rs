//! User-facing pipeline failures and their aggregation across parallel branches.
//!
//! A branch finishes with either a value or a [`BranchFailure`]. Failures that
//! describe an expected condition (a missing input, an unmet precondition) are
//! [`PipelineError`]s and are shown to the user without internals. When several
//! branches fail together their pipeline errors are rolled into a single
//! [`SummaryError`]. Anything else, including [`BranchFailure::Fatal`], is never
//! summarised and propagates unchanged.

use crate::error::Error;
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use thiserror::Error;

const SUMMARY_HEADER: &str =
    "One or more parallel stages aborted. The following messages were reported:";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PipelineErrorKind {
    General,
    InputMissing { input_type: String },
}

/// An expected failure that is reported to the user as-is.
#[derive(Debug, Clone, Error)]
#[error("{description}")]
pub struct PipelineError {
    description: String,
    context: Option<String>,
    kind: PipelineErrorKind,
    summary: bool,
}

impl PipelineError {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            context: None,
            kind: PipelineErrorKind::General,
            summary: false,
        }
    }

    /// A required input of the given category could not be found.
    pub fn input_missing(input_type: impl Into<String>, description: impl Into<String>) -> Self {
        let input_type = input_type.into();
        let description = description.into();
        let mut message = format!("Input type {} was missing", input_type);
        if !description.is_empty() {
            message.push_str(": ");
            message.push_str(&description);
        }
        Self {
            description: message,
            context: None,
            kind: PipelineErrorKind::InputMissing { input_type },
            summary: false,
        }
    }

    /// Attach the stage or branch the failure originated from.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    pub fn kind(&self) -> &PipelineErrorKind {
        &self.kind
    }

    /// Whether this error has already been reported as part of a summary.
    pub fn is_summary(&self) -> bool {
        self.summary
    }

    pub fn mark_summary(&mut self) {
        self.summary = true;
    }
}

// The summary flag is bookkeeping; two reports of the same failure are equal.
impl PartialEq for PipelineError {
    fn eq(&self, other: &Self) -> bool {
        self.description == other.description
            && self.context == other.context
            && self.kind == other.kind
    }
}

impl Eq for PipelineError {}

impl Hash for PipelineError {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.description.hash(state);
        self.context.hash(state);
        self.kind.hash(state);
    }
}

/// Pipeline errors from several parallel branches, flattened and de-duplicated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryError {
    errors: Vec<PipelineError>,
}

impl SummaryError {
    /// Combine branch failures into one summary.
    ///
    /// Nested summaries contribute their children. The first failure that is
    /// neither a pipeline error nor a summary is returned as the error and
    /// aggregation stops there.
    pub fn from_failures(
        failures: impl IntoIterator<Item = BranchFailure>,
    ) -> std::result::Result<Self, BranchFailure> {
        let mut summary = SummaryError { errors: Vec::new() };
        let mut seen = HashSet::new();
        for failure in failures {
            match failure {
                BranchFailure::Summary(child) => {
                    for error in child.errors {
                        summary.push(error, &mut seen);
                    }
                }
                BranchFailure::Pipeline(error) => summary.push(error, &mut seen),
                other => return Err(other),
            }
        }
        Ok(summary)
    }

    fn push(&mut self, mut error: PipelineError, seen: &mut HashSet<PipelineError>) {
        if seen.insert(error.clone()) {
            error.mark_summary();
            self.errors.push(error);
        }
    }

    pub fn errors(&self) -> &[PipelineError] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for SummaryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", SUMMARY_HEADER)?;
        writeln!(f)?;
        for error in &self.errors {
            let mut lines = error.description.lines();
            let first = lines.next().unwrap_or_default();
            match &error.context {
                Some(ctx) => writeln!(f, "  * {}: {}", ctx, first)?,
                None => writeln!(f, "  * {}", first)?,
            }
            for line in lines {
                writeln!(f, "    {}", line)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for SummaryError {}

/// Raised in dry-run mode when outputs a pipeline needs would not be produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestAbort {
    message: String,
    missing_outputs: Vec<String>,
}

impl TestAbort {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            missing_outputs: Vec::new(),
        }
    }

    pub fn with_missing_outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for output in outputs {
            let output = output.into();
            if !self.missing_outputs.contains(&output) {
                self.missing_outputs.push(output);
            }
        }
        self
    }

    /// Fold another abort's missing outputs into this one.
    pub fn merge(self, other: TestAbort) -> Self {
        self.with_missing_outputs(other.missing_outputs)
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn missing_outputs(&self) -> &[String] {
        &self.missing_outputs
    }
}

impl fmt::Display for TestAbort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        if self.missing_outputs.is_empty() {
            return Ok(());
        }
        write!(f, "\n\nto create outputs:\n\n")?;
        for output in &self.missing_outputs {
            writeln!(f, "    {}", output)?;
        }
        Ok(())
    }
}

impl std::error::Error for TestAbort {}

/// A branch was stopped because the pipeline was paused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{description}")]
pub struct PipelinePaused {
    pub description: String,
    pub context: Option<String>,
}

impl PipelinePaused {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            context: None,
        }
    }
}

/// How a branch failed.
#[derive(Debug, Error)]
pub enum BranchFailure {
    #[error("{0}")]
    Pipeline(PipelineError),

    #[error("{0}")]
    Summary(SummaryError),

    #[error("{0}")]
    TestAbort(TestAbort),

    #[error("{0}")]
    Paused(PipelinePaused),

    /// An unanticipated fault. Never summarised.
    #[error(transparent)]
    Fatal(#[from] Error),
}

impl BranchFailure {
    /// Whether the failure is safe to show without internal detail.
    pub fn is_user_facing(&self) -> bool {
        !matches!(self, BranchFailure::Fatal(_))
    }
}

impl From<PipelineError> for BranchFailure {
    fn from(err: PipelineError) -> Self {
        BranchFailure::Pipeline(err)
    }
}

impl From<SummaryError> for BranchFailure {
    fn from(err: SummaryError) -> Self {
        BranchFailure::Summary(err)
    }
}

impl From<TestAbort> for BranchFailure {
    fn from(err: TestAbort) -> Self {
        BranchFailure::TestAbort(err)
    }
}

impl From<PipelinePaused> for BranchFailure {
    fn from(err: PipelinePaused) -> Self {
        BranchFailure::Paused(err)
    }
}

/// Join the results of branches that ran in parallel.
///
/// A lone failure is returned as it is. Among several, a fatal fault wins,
/// then a pause. Pipeline errors become a [`SummaryError`] and any dry-run
/// aborts next to them are dropped. When every failure is a [`TestAbort`],
/// their missing outputs are merged into a single abort.
pub fn join_branches<T>(
    results: impl IntoIterator<Item = std::result::Result<T, BranchFailure>>,
) -> std::result::Result<Vec<T>, BranchFailure> {
    let mut values = Vec::new();
    let mut failures = Vec::new();
    for result in results {
        match result {
            Ok(value) => values.push(value),
            Err(failure) => failures.push(failure),
        }
    }

    if failures.is_empty() {
        return Ok(values);
    }
    if failures.len() == 1 {
        return Err(failures.remove(0));
    }

    if let Some(i) = failures.iter().position(|f| matches!(f, BranchFailure::Fatal(_))) {
        return Err(failures.swap_remove(i));
    }
    if let Some(i) = failures.iter().position(|f| matches!(f, BranchFailure::Paused(_))) {
        return Err(failures.swap_remove(i));
    }

    let (aborts, errors): (Vec<_>, Vec<_>) = failures
        .into_iter()
        .partition(|f| matches!(f, BranchFailure::TestAbort(_)));
    if !errors.is_empty() {
        return Err(SummaryError::from_failures(errors)?.into());
    }

    aborts
        .into_iter()
        .filter_map(|f| match f {
            BranchFailure::TestAbort(abort) => Some(abort),
            _ => None,
        })
        .reduce(TestAbort::merge)
        .map_or(Ok(values), |abort| Err(BranchFailure::TestAbort(abort)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn e(msg: &str) -> BranchFailure {
        PipelineError::new(msg).into()
    }

    #[test]
    fn test_duplicates_are_coalesced() {
        let summary = SummaryError::from_failures(vec![e("E1"), e("E1"), e("E2")]).unwrap();
        let descriptions: Vec<_> = summary.errors().iter().map(|e| e.description()).collect();
        assert_eq!(descriptions, vec!["E1", "E2"]);
    }

    #[test]
    fn test_nested_summary_is_flattened() {
        let inner = SummaryError::from_failures(vec![e("E1")]).unwrap();
        let outer =
            SummaryError::from_failures(vec![BranchFailure::Summary(inner), e("E2")]).unwrap();
        let expected = SummaryError::from_failures(vec![e("E1"), e("E2")]).unwrap();
        assert_eq!(outer, expected);
        assert_eq!(outer.to_string().matches(SUMMARY_HEADER).count(), 1);
    }

    #[test]
    fn test_fatal_is_not_summarised() {
        let result = SummaryError::from_failures(vec![
            e("E1"),
            BranchFailure::Fatal(Error::Internal("boom".to_string())),
            e("E2"),
        ]);
        match result {
            Err(BranchFailure::Fatal(Error::Internal(msg))) => assert_eq!(msg, "boom"),
            other => panic!("expected fatal, got {:?}", other),
        }
    }

    #[test]
    fn test_paused_is_not_summarised() {
        let result = SummaryError::from_failures(vec![
            e("E1"),
            PipelinePaused::new("paused by user").into(),
        ]);
        assert!(matches!(result, Err(BranchFailure::Paused(_))));
    }

    #[test]
    fn test_summary_flag_does_not_affect_equality() {
        let mut flagged = PipelineError::new("same");
        flagged.mark_summary();
        assert_eq!(flagged, PipelineError::new("same"));
        assert!(flagged.is_summary());
    }

    #[test]
    fn test_input_missing_message() {
        let err = PipelineError::input_missing("bam", "no .bam file from a previous stage");
        assert_eq!(
            err.to_string(),
            "Input type bam was missing: no .bam file from a previous stage"
        );
        assert_eq!(
            err.kind(),
            &PipelineErrorKind::InputMissing {
                input_type: "bam".to_string()
            }
        );
    }

    #[test]
    fn test_summary_rendering_lists_each_error_once() {
        let summary = SummaryError::from_failures(vec![
            PipelineError::new("input X missing").with_context("align").into(),
            e("input Y missing"),
            e("input Y missing"),
        ])
        .unwrap();
        let rendered = summary.to_string();
        assert!(rendered.starts_with(SUMMARY_HEADER));
        assert!(rendered.contains("  * align: input X missing\n"));
        assert_eq!(rendered.matches("input Y missing").count(), 1);
    }

    #[test]
    fn test_join_single_failure_is_not_wrapped() {
        let results: Vec<std::result::Result<(), BranchFailure>> = vec![Ok(()), Err(e("only"))];
        match join_branches(results) {
            Err(BranchFailure::Pipeline(err)) => assert_eq!(err.description(), "only"),
            other => panic!("expected plain pipeline error, got {:?}", other),
        }
    }

    #[test]
    fn test_join_all_success() {
        let results: Vec<std::result::Result<u32, BranchFailure>> = vec![Ok(1), Ok(2)];
        assert_eq!(join_branches(results).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_join_merges_test_aborts() {
        let results: Vec<std::result::Result<(), BranchFailure>> = vec![
            Err(TestAbort::new("Would execute").with_missing_outputs(["a.txt"]).into()),
            Err(TestAbort::new("Would execute").with_missing_outputs(["b.txt", "a.txt"]).into()),
        ];
        match join_branches(results) {
            Err(BranchFailure::TestAbort(abort)) => {
                assert_eq!(abort.missing_outputs(), &["a.txt".to_string(), "b.txt".to_string()]);
            }
            other => panic!("expected test abort, got {:?}", other),
        }
    }

    #[test]
    fn test_abort_lists_outputs_once() {
        let abort = TestAbort::new("Pipeline was run in test mode")
            .with_missing_outputs(["out1.txt", "out2.txt", "out1.txt"]);
        let rendered = abort.to_string();
        assert!(rendered.contains("to create outputs:"));
        assert_eq!(rendered.matches("    out1.txt\n").count(), 1);
        assert_eq!(rendered.matches("    out2.txt\n").count(), 1);
    }

    #[test]
    fn test_join_precedence_ignores_branch_order() {
        let results: Vec<std::result::Result<(), BranchFailure>> = vec![
            Err(PipelinePaused::new("paused by user").into()),
            Err(BranchFailure::Fatal(Error::Internal("boom".to_string()))),
        ];
        assert!(matches!(join_branches(results), Err(BranchFailure::Fatal(_))));

        let results: Vec<std::result::Result<(), BranchFailure>> = vec![
            Err(TestAbort::new("Would execute").with_missing_outputs(["a.txt"]).into()),
            Err(e("E1")),
            Err(e("E2")),
        ];
        match join_branches(results) {
            Err(BranchFailure::Summary(summary)) => assert_eq!(summary.len(), 2),
            other => panic!("expected summary, got {:?}", other),
        }
    }
}
