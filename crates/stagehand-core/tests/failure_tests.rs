//! Joining failures from parallel branches, as callers see them.

use pretty_assertions::assert_eq;
use stagehand_core::failure::join_branches;
use stagehand_core::{BranchFailure, Error, PipelineError, PipelinePaused, TestAbort};

fn missing(stage: &str, input: &str) -> BranchFailure {
    PipelineError::input_missing("bam", format!("{} not found", input))
        .with_context(stage)
        .into()
}

#[test]
fn test_fan_out_of_identical_failures_is_reported_once() {
    let results: Vec<Result<(), BranchFailure>> = vec![
        Err(missing("align", "x.bam")),
        Err(missing("call", "y.bam")),
        Err(missing("call", "y.bam")),
        Ok(()),
    ];
    let failure = join_branches(results).unwrap_err();
    assert_eq!(
        failure.to_string(),
        "One or more parallel stages aborted. The following messages were reported:\n\
         \n  * align: Input type bam was missing: x.bam not found\
         \n  * call: Input type bam was missing: y.bam not found\n"
    );
}

#[test]
fn test_joining_twice_does_not_nest() {
    let inner = join_branches::<()>(vec![Err(missing("a", "1.bam")), Err(missing("b", "2.bam"))])
        .unwrap_err();
    let outer = join_branches::<()>(vec![Err(inner), Err(missing("c", "3.bam"))]).unwrap_err();
    let BranchFailure::Summary(summary) = &outer else {
        panic!("expected a summary, got {outer:?}");
    };
    assert_eq!(summary.len(), 3);
    assert_eq!(outer.to_string().matches("One or more parallel stages").count(), 1);
}

#[test]
fn test_unexpected_fault_is_not_summarized() {
    let results: Vec<Result<(), BranchFailure>> = vec![
        Err(missing("a", "1.bam")),
        Err(Error::Internal("lost the pool".to_string()).into()),
        Err(missing("b", "2.bam")),
    ];
    let failure = join_branches(results).unwrap_err();
    assert!(matches!(failure, BranchFailure::Fatal(Error::Internal(_))));
    assert!(!failure.is_user_facing());
}

#[test]
fn test_pause_wins_over_pipeline_errors() {
    let results: Vec<Result<(), BranchFailure>> = vec![
        Err(missing("a", "1.bam")),
        Err(PipelinePaused::new("paused by user").into()),
    ];
    assert!(matches!(join_branches(results), Err(BranchFailure::Paused(_))));
}

#[test]
fn test_dry_run_aborts_merge_their_outputs() {
    let results: Vec<Result<(), BranchFailure>> = vec![
        Err(TestAbort::new("would run align").with_missing_outputs(["out1.txt", "out2.txt"]).into()),
        Err(TestAbort::new("would run call").with_missing_outputs(["out2.txt"]).into()),
    ];
    let failure = join_branches(results).unwrap_err();
    assert_eq!(
        failure.to_string(),
        "would run align\n\nto create outputs:\n\n    out1.txt\n    out2.txt\n"
    );
}
