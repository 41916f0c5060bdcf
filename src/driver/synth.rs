//! Stand-in outputs for the simulated pipeline.

use crate::model::{
    CoverageFile, CoverageSummary, EdgeCaseCategories, PrInfo, RunOptions, TestRunOutput,
    TestStyle,
};

pub(super) fn inferred_spec(symbol: &str) -> String {
    format!("Function {symbol} appears to perform mathematical operations.")
}

pub(super) fn edge_cases(categories: &EdgeCaseCategories) -> Vec<String> {
    let mut cases: Vec<String> = ["zero values", "negative numbers", "large numbers"]
        .into_iter()
        .map(String::from)
        .collect();
    for name in categories.enabled() {
        let case = match name {
            "empty" => "empty inputs",
            "large" => "very large inputs",
            "unicode" => "unicode strings",
            "floats" => "floating point precision",
            "timezones" => "timezone-aware datetimes",
            _ => continue,
        };
        cases.push(case.to_string());
    }
    cases
}

pub(super) fn generated_tests(symbol: &str, style: TestStyle) -> String {
    match style {
        TestStyle::PropertyBased => format!(
            r#"import pytest
from hypothesis import given, strategies as st
from your_module import {symbol}

@given(st.integers(), st.integers())
def test_{symbol}_property_based(a, b):
    """Property-based test for {symbol}"""
    result = {symbol}(a, b)
    assert isinstance(result, (int, float))

def test_{symbol}_edge_cases():
    """Edge case tests for {symbol}"""
    assert {symbol}(0, 0) == 0

    result = {symbol}(-1, -2)
    assert result is not None

    result = {symbol}(1000000, 2000000)
    assert isinstance(result, (int, float))
"#
        ),
        TestStyle::Unit => format!(
            r#"import pytest
from your_module import {symbol}

def test_{symbol}_basic():
    """Basic functionality test"""
    result = {symbol}(1, 2)
    assert result is not None
    assert isinstance(result, (int, float))

def test_{symbol}_zero():
    """Test with zero values"""
    result = {symbol}(0, 0)
    assert result == 0

def test_{symbol}_negative():
    """Test with negative values"""
    result = {symbol}(-1, -2)
    assert isinstance(result, (int, float))

def test_{symbol}_large_numbers():
    """Test with large numbers"""
    result = {symbol}(1000000, 2000000)
    assert isinstance(result, (int, float))

def test_{symbol}_edge_cases():
    """Edge case tests"""
    try:
        {symbol}(None, None)
    except (TypeError, ValueError):
        pass
"#
        ),
    }
}

pub(super) fn test_run_output() -> TestRunOutput {
    TestRunOutput {
        stdout: "test_basic PASSED\ntest_zero PASSED\ntest_negative PASSED\n".into(),
        stderr: String::new(),
        exit_code: 0,
    }
}

pub(super) fn coverage() -> CoverageSummary {
    CoverageSummary {
        lines: 87.0,
        branches: 82.0,
        functions: 90.0,
        files: vec![
            CoverageFile {
                filename: "your_module.py".into(),
                percent: 87.0,
                lines: 50,
                branches: 45,
            },
            CoverageFile {
                filename: "utils.py".into(),
                percent: 75.0,
                lines: 30,
                branches: 25,
            },
        ],
    }
}

/// Path of the generated test file inside the run's artifact directory.
pub(super) fn test_file_path(artifacts_path: &str, symbol: &str) -> String {
    format!("{artifacts_path}/test_{symbol}.py")
}

/// Unified diff that adds the generated test file. Empty when there is nothing to add.
pub(super) fn patch_diff(test_path: &str, tests: &str) -> String {
    let lines: Vec<&str> = tests.lines().collect();
    if lines.is_empty() {
        return String::new();
    }
    let mut out = format!(
        "diff --git a/{test_path} b/{test_path}\nnew file mode 100644\nindex 0000000..1234567\n--- /dev/null\n+++ b/{test_path}\n@@ -0,0 +1,{} @@\n",
        lines.len()
    );
    for line in lines {
        out.push('+');
        out.push_str(line);
        out.push('\n');
    }
    out
}

pub(super) fn pr_info(
    symbol: &str,
    options: &RunOptions,
    coverage: &CoverageSummary,
    tests: &str,
    artifacts_path: &str,
) -> PrInfo {
    let test_count = tests.matches("def test_").count();
    let note = if options.repo_url.is_some() {
        "Note: generated offline, no pull request was opened."
    } else {
        "Error: Repository URL not provided. Cannot create PR."
    };
    PrInfo {
        title: format!("Add tests for {symbol}"),
        body: format!(
            "This PR adds comprehensive test coverage for `{symbol}`.\n\n\
             - Coverage: {}% lines, {}% branches\n\
             - Generated {test_count} test cases\n\
             - Output location: `{artifacts_path}/`\n\
             - Target branch: `{}`\n\n{note}",
            coverage.lines, coverage.branches, options.branch
        ),
        url: None,
        changed_files: vec![test_file_path(artifacts_path, symbol)],
    }
}
