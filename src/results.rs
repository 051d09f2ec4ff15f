//! Results classification and verdict aggregation.
//!
//! One raw XML results document plus its (package, environment) context
//! turns into a [`PackageResults`]: every test case classified as
//! significant or insignificant. Each document then contributes at most one
//! boolean judgment ("all relevant cases passed"), and the judgments fold
//! into the testrun [`Verdict`].
//!
//! # Pipeline
//!
//! ```text
//! raw XML ──validate+walk──► PackageResults ──judge──► Option<bool> ──fold──► Verdict
//!            (xml module)                     │
//!                                             └─ None = no relevant cases,
//!                                                excluded from the fold
//! ```
//!
//! The fold is commutative: documents may be judged in any arrival order.

pub mod xml;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::environment::Environment;

pub use xml::SchemaValidationError;

/// Outcome of a single test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseVerdict {
    /// The case passed.
    Pass,
    /// The case failed.
    Fail,
    /// The case produced no usable outcome. Counts as not-passed.
    NotApplicable,
}

impl CaseVerdict {
    /// Whether this outcome counts as a pass.
    pub fn passed(self) -> bool {
        matches!(self, CaseVerdict::Pass)
    }
}

impl FromStr for CaseVerdict {
    type Err = ();

    /// Parses the `result` attribute tokens, ASCII case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("pass") {
            Ok(CaseVerdict::Pass)
        } else if s.eq_ignore_ascii_case("fail") {
            Ok(CaseVerdict::Fail)
        } else if s.eq_ignore_ascii_case("n/a") {
            Ok(CaseVerdict::NotApplicable)
        } else {
            Err(())
        }
    }
}

/// One classified test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseResult {
    /// Case name from the document.
    pub name: String,
    /// The case outcome.
    pub verdict: CaseVerdict,
    /// Whether the document flagged the case as insignificant.
    pub insignificant: bool,
}

/// All classified cases for one (package, environment) pair.
///
/// A case belongs to exactly one of the two lists, decided by its
/// `insignificant` flag; both lists preserve document order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageResults {
    package: String,
    environment: Environment,
    significant: Vec<CaseResult>,
    insignificant: Vec<CaseResult>,
}

impl PackageResults {
    /// Creates an empty result set for a (package, environment) pair.
    pub fn new(package: impl Into<String>, environment: Environment) -> Self {
        Self {
            package: package.into(),
            environment,
            significant: Vec::new(),
            insignificant: Vec::new(),
        }
    }

    /// The covered test package.
    pub fn package(&self) -> &str {
        &self.package
    }

    /// The environment the package ran in.
    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// Appends a case to the list its flag selects.
    pub fn push(&mut self, case: CaseResult) {
        if case.insignificant {
            self.insignificant.push(case);
        } else {
            self.significant.push(case);
        }
    }

    /// Cases that always count toward the verdict.
    pub fn significant(&self) -> &[CaseResult] {
        &self.significant
    }

    /// Cases that count only when the caller opts in.
    pub fn insignificant(&self) -> &[CaseResult] {
        &self.insignificant
    }

    /// Total number of classified cases.
    pub fn case_count(&self) -> usize {
        self.significant.len() + self.insignificant.len()
    }

    /// Judges this document: did every relevant case pass?
    ///
    /// Relevant means all significant cases, plus the insignificant ones iff
    /// `insignificant_tests_matter`. Returns `None` when there are zero
    /// relevant cases; such a document contributes nothing to the
    /// aggregate, neither pass nor fail.
    pub fn judge(&self, insignificant_tests_matter: bool) -> Option<bool> {
        let relevant: Vec<&CaseResult> = if insignificant_tests_matter {
            self.significant.iter().chain(&self.insignificant).collect()
        } else {
            self.significant.iter().collect()
        };

        if relevant.is_empty() {
            return None;
        }
        Some(relevant.iter().all(|case| case.verdict.passed()))
    }
}

/// Terminal go/no-go outcome of a testrun.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// No document contributed any relevant cases.
    NoCases,
    /// Every contributing document passed.
    Pass,
    /// At least one contributing document failed.
    Fail,
}

impl Verdict {
    /// Folds per-document judgments into the aggregate verdict.
    ///
    /// `None` judgments (documents with no relevant cases) are excluded.
    /// The fold is order-independent.
    pub fn aggregate(judgments: impl IntoIterator<Item = Option<bool>>) -> Self {
        let mut contributed = false;
        let mut all_passed = true;
        for judgment in judgments.into_iter().flatten() {
            contributed = true;
            all_passed &= judgment;
        }

        match (contributed, all_passed) {
            (false, _) => Verdict::NoCases,
            (true, true) => Verdict::Pass,
            (true, false) => Verdict::Fail,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::NoCases => "NO_CASES",
            Verdict::Pass => "PASS",
            Verdict::Fail => "FAIL",
        };
        f.write_str(s)
    }
}

/// A results document processed through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedDocument {
    /// The classified cases.
    pub results: PackageResults,
    /// This document's contribution to the aggregate, if any.
    pub judgment: Option<bool>,
}

/// The per-document validation/classification/judgment pipeline.
///
/// Holds no state between documents; invoke [`process`](Self::process) once
/// per received document and fold the judgments with [`Verdict::aggregate`].
#[derive(Debug, Clone, Copy)]
pub struct ResultsPipeline {
    insignificant_tests_matter: bool,
}

impl ResultsPipeline {
    /// Creates a pipeline with the given insignificant-case policy.
    pub fn new(insignificant_tests_matter: bool) -> Self {
        Self {
            insignificant_tests_matter,
        }
    }

    /// Whether insignificant cases count toward judgments.
    pub fn insignificant_tests_matter(&self) -> bool {
        self.insignificant_tests_matter
    }

    /// Validates, walks and judges one raw XML document.
    ///
    /// # Errors
    ///
    /// [`SchemaValidationError`] if the document does not conform to the
    /// results schema. A failed document is a hard per-document error: it is
    /// excluded from aggregation entirely, it does not count as a failure
    /// in the fold.
    pub fn process(
        &self,
        package: &str,
        environment: &Environment,
        document: &str,
    ) -> Result<ProcessedDocument, SchemaValidationError> {
        let results = xml::parse_document(package, environment, document)?;
        let judgment = results.judge(self.insignificant_tests_matter);
        Ok(ProcessedDocument { results, judgment })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn case(name: &str, verdict: CaseVerdict, insignificant: bool) -> CaseResult {
        CaseResult {
            name: name.into(),
            verdict,
            insignificant,
        }
    }

    fn results(cases: &[CaseResult]) -> PackageResults {
        let mut r = PackageResults::new("pkg", Environment::new("hardware"));
        for c in cases {
            r.push(c.clone());
        }
        r
    }

    #[test]
    fn test_classification_by_flag() {
        let r = results(&[
            case("a", CaseVerdict::Pass, false),
            case("b", CaseVerdict::Fail, true),
            case("c", CaseVerdict::Pass, false),
        ]);
        assert_eq!(r.significant().len(), 2);
        assert_eq!(r.insignificant().len(), 1);
        assert_eq!(r.case_count(), 3);
    }

    #[test]
    fn test_judge_significant_only() {
        let r = results(&[
            case("a", CaseVerdict::Pass, false),
            case("b", CaseVerdict::Fail, true),
        ]);
        // Insignificant failure ignored by default
        assert_eq!(r.judge(false), Some(true));
        // ... but counted when opted in
        assert_eq!(r.judge(true), Some(false));
    }

    #[test]
    fn test_judge_not_applicable_is_not_a_pass() {
        let r = results(&[case("a", CaseVerdict::NotApplicable, false)]);
        assert_eq!(r.judge(false), Some(false));
    }

    #[test]
    fn test_judge_no_relevant_cases() {
        let empty = results(&[]);
        assert_eq!(empty.judge(false), None);
        assert_eq!(empty.judge(true), None);

        let only_insignificant = results(&[case("a", CaseVerdict::Pass, true)]);
        assert_eq!(only_insignificant.judge(false), None);
        assert_eq!(only_insignificant.judge(true), Some(true));
    }

    #[test]
    fn test_aggregate_empty_is_no_cases() {
        assert_eq!(Verdict::aggregate([]), Verdict::NoCases);
        assert_eq!(Verdict::aggregate([None, None]), Verdict::NoCases);
    }

    #[test]
    fn test_aggregate_all_pass() {
        assert_eq!(Verdict::aggregate([Some(true), Some(true)]), Verdict::Pass);
    }

    #[test]
    fn test_aggregate_any_fail() {
        assert_eq!(Verdict::aggregate([Some(true), Some(false)]), Verdict::Fail);
    }

    #[test]
    fn test_aggregate_excludes_non_contributing() {
        assert_eq!(
            Verdict::aggregate([Some(true), None, Some(true)]),
            Verdict::Pass
        );
        assert_eq!(Verdict::aggregate([None, Some(false)]), Verdict::Fail);
    }

    #[test]
    fn test_aggregate_is_commutative() {
        let forward = Verdict::aggregate([Some(true), Some(false), None]);
        let backward = Verdict::aggregate([None, Some(false), Some(true)]);
        assert_eq!(forward, backward);
    }
}
