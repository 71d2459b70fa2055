//! Per-bundle test registry.
//!
//! A bundle builds one [`Registry`] at startup, adds every test it ships, and
//! treats it as read-only afterwards. Lookups hand out clones so callers
//! never share mutable state with the registry.

use crate::expr::{AttrExpr, ExprError};
use crate::test_def::{Test, TestInstance};
use regex::Regex;
use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid test name {name}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("test {name} uses reserved attribute {attr:?}")]
    ReservedAttr { name: String, attr: String },

    #[error("test {name} sets a precondition in both the test and its parameter")]
    DuplicatePrecondition { name: String },

    #[error("test {0} already registered")]
    DuplicateName(String),

    #[error("glob {pattern:?} has invalid character {ch:?}")]
    InvalidGlob { pattern: String, ch: char },

    #[error("failed to compile glob {pattern:?}: {source}")]
    GlobRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("bad attribute expression {expr:?}: {source}")]
    BadExpr {
        expr: String,
        #[source]
        source: ExprError,
    },
}

/// Registered tests of one bundle, in insertion order.
#[derive(Debug)]
pub struct Registry {
    bundle: String,
    tests: Vec<TestInstance>,
    names: HashSet<String>,
}

impl Registry {
    pub fn new(bundle: impl Into<String>) -> Self {
        Self {
            bundle: bundle.into(),
            tests: Vec::new(),
            names: HashSet::new(),
        }
    }

    pub fn bundle(&self) -> &str {
        &self.bundle
    }

    /// Validate `test`, expand its parameters and add every variant.
    ///
    /// Variants are added one at a time; when a later variant fails the
    /// earlier ones stay registered.
    pub fn add_test(&mut self, test: Test) -> Result<(), RegistryError> {
        if test.params.is_empty() {
            let instance = test.instantiate(&self.bundle, None)?;
            return self.insert(instance);
        }
        for param in &test.params {
            let instance = test.instantiate(&self.bundle, Some(param))?;
            self.insert(instance)?;
        }
        Ok(())
    }

    fn insert(&mut self, instance: TestInstance) -> Result<(), RegistryError> {
        if !self.names.insert(instance.name.clone()) {
            return Err(RegistryError::DuplicateName(instance.name));
        }
        debug!(bundle = %self.bundle, test = %instance.name, "Registered test");
        self.tests.push(instance);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    pub fn all_tests(&self) -> Vec<TestInstance> {
        self.tests.clone()
    }

    /// Tests whose names match any of `patterns`.
    ///
    /// Patterns may use letters, digits, `.`, `_` and the `*` wildcard. Each
    /// test appears once, in order of the first pattern that matched it.
    pub fn tests_for_globs(&self, patterns: &[String]) -> Result<Vec<TestInstance>, RegistryError> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for pattern in patterns {
            let re = compile_name_glob(pattern)?;
            for test in &self.tests {
                if re.is_match(&test.name) && seen.insert(test.name.clone()) {
                    out.push(test.clone());
                }
            }
        }
        Ok(out)
    }

    /// Tests whose attributes satisfy `expr`.
    pub fn tests_for_attr_expr(&self, expr: &str) -> Result<Vec<TestInstance>, RegistryError> {
        let parsed = AttrExpr::parse(expr).map_err(|source| RegistryError::BadExpr {
            expr: expr.to_string(),
            source,
        })?;
        Ok(self
            .tests
            .iter()
            .filter(|t| parsed.matches(&t.attr))
            .cloned()
            .collect())
    }

    /// Resolve the patterns a user typed on the command line.
    ///
    /// No patterns selects everything. A single pattern wrapped in
    /// parentheses is an attribute expression; anything else is a list of
    /// name globs.
    pub fn select_tests(&self, patterns: &[String]) -> Result<Vec<TestInstance>, RegistryError> {
        match patterns {
            [] => Ok(self.all_tests()),
            [single] if single.starts_with('(') && single.ends_with(')') => {
                self.tests_for_attr_expr(&single[1..single.len() - 1])
            }
            _ => self.tests_for_globs(patterns),
        }
    }
}

fn compile_name_glob(pattern: &str) -> Result<Regex, RegistryError> {
    if let Some(ch) = pattern
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '*')))
    {
        return Err(RegistryError::InvalidGlob {
            pattern: pattern.to_string(),
            ch,
        });
    }
    let body = pattern.replace('.', r"\.").replace('*', ".*");
    Regex::new(&format!("^{body}$")).map_err(|source| RegistryError::GlobRegex {
        pattern: pattern.to_string(),
        source,
    })
}
