#![allow(dead_code)]
use std::path::PathBuf;

use writ::{FromWrit, ResultSet, Writ};

/// A `Writ` plus assertion helpers. Helpers panic on any error, so tests
/// read as a list of expectations.
pub struct WritTest {
    pub writ: Writ,
}

impl WritTest {
    pub fn new() -> Self {
        Self { writ: Writ::new() }
    }

    #[track_caller]
    pub fn load_str(&mut self, policy: &str) {
        if let Err(e) = self.writ.load_str(policy) {
            panic!("policy failed to load: {}", e);
        }
    }

    pub fn fixture(name: &str) -> PathBuf {
        [env!("CARGO_MANIFEST_DIR"), "tests", "fixtures", name]
            .iter()
            .collect()
    }

    pub fn load_file(&mut self, name: &str) -> writ::Result<()> {
        self.writ.load_files(vec![Self::fixture(name)])
    }

    /// Every answer to `q`.
    #[track_caller]
    pub fn query(&mut self, q: &str) -> Vec<ResultSet> {
        let answers: writ::Result<Vec<ResultSet>> = self.writ.query(q).and_then(|answers| answers.collect());
        answers.unwrap_or_else(|e| panic!("query `{}` failed: {}", q, e))
    }

    /// The message of the first error `q` produces.
    #[track_caller]
    pub fn query_err(&mut self, q: &str) -> String {
        match self.writ.query(q).map(|mut answers| answers.next()) {
            Err(e) | Ok(Some(Err(e))) => e.to_string(),
            Ok(Some(Ok(answer))) => panic!("query `{}` succeeded with {:?}", q, answer),
            Ok(None) => panic!("query `{}` failed without an error", q),
        }
    }

    /// The value of `var` in each answer to `q`.
    #[track_caller]
    pub fn qvar<T: FromWrit>(&mut self, q: &str, var: &str) -> Vec<T> {
        let mut values = vec![];
        for answer in self.query(q) {
            match answer.get_typed(var) {
                Ok(value) => values.push(value),
                Err(e) => panic!("query `{}` bound `{}` badly: {}", q, var, e),
            }
        }
        values
    }

    #[track_caller]
    pub fn qvar_one<T>(&mut self, q: &str, var: &str, expected: T)
    where
        T: FromWrit + PartialEq + std::fmt::Debug,
    {
        assert_eq!(self.qvar::<T>(q, var), vec![expected], "answers to `{}`", q);
    }

    /// `q` has at least one answer.
    #[track_caller]
    pub fn qeval(&mut self, q: &str) {
        match self.writ.query(q).map(|mut answers| answers.next()) {
            Ok(Some(Ok(_))) => {}
            other => panic!("query `{}` has no answers: {:?}", q, other.map(|_| ())),
        }
    }

    /// `q` has no answers.
    #[track_caller]
    pub fn qnull(&mut self, q: &str) {
        let answers = self.query(q);
        assert!(answers.is_empty(), "query `{}` has answers: {:?}", q, answers);
    }
}

pub fn setup() {
    let _ = tracing_subscriber::fmt::try_init();
}
