//! Key naming for a single test run.

use std::fmt;

/// Identifies the run a topic or state belongs to.
///
/// Instances of the same test case in the same run share keys; anything else
/// is isolated by prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunScope {
    pub run: String,
    pub plan: String,
    pub case: String,
}

impl RunScope {
    pub fn new(run: impl Into<String>, plan: impl Into<String>, case: impl Into<String>) -> Self {
        Self {
            run: run.into(),
            plan: plan.into(),
            case: case.into(),
        }
    }

    /// Key of a state counter within this run.
    pub fn state_key(&self, state: &str) -> String {
        format!("{self}:states:{state}")
    }

    /// Key of a topic within this run.
    pub fn topic_key(&self, topic: &str) -> String {
        format!("{self}:topics:{topic}")
    }
}

impl fmt::Display for RunScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run:{}:plan:{}:case:{}", self.run, self.plan, self.case)
    }
}
