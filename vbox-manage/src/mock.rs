//! Scripted command runner for tests.
//!
//! Rules are matched by prefix against the rendered argument list; each rule
//! holds a queue of responses where the last entry is sticky, so a probe that
//! should keep reporting the same VM state only needs one entry. Unmatched
//! invocations succeed with empty output. Every call is recorded for
//! sequence assertions.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use vbox_core::error::Result;

use crate::command::{CommandRunner, RawOutput};

#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    /// Zero exit with the given combined output.
    Success(String),
    /// Non-zero exit; embed a `(0x…)` code in the output to simulate a
    /// hypervisor error.
    Failure(String),
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub args: Vec<String>,
    pub rendered: String,
    pub timeout: Option<Duration>,
}

struct Rule {
    prefix: String,
    responses: VecDeque<ScriptedResponse>,
}

#[derive(Default)]
pub struct MockRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for invocations whose rendered arguments start with
    /// `prefix`. Responses are consumed in order; the last one repeats.
    pub fn script(&self, prefix: &str, response: ScriptedResponse) {
        let mut rules = self.rules.lock().expect("mock rules lock");
        if let Some(rule) = rules.iter_mut().find(|r| r.prefix == prefix) {
            rule.responses.push_back(response);
        } else {
            rules.push(Rule {
                prefix: prefix.to_string(),
                responses: VecDeque::from([response]),
            });
        }
    }

    pub fn succeed_with(&self, prefix: &str, output: &str) {
        self.script(prefix, ScriptedResponse::Success(output.to_string()));
    }

    pub fn fail_with(&self, prefix: &str, output: &str) {
        self.script(prefix, ScriptedResponse::Failure(output.to_string()));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("mock calls lock").clone()
    }

    /// Rendered argument strings, in invocation order.
    pub fn rendered_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .map(|call| call.rendered)
            .collect()
    }

    /// Rendered calls whose arguments start with `prefix`.
    pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.rendered_calls()
            .into_iter()
            .filter(|call| call.starts_with(prefix))
            .collect()
    }

    fn next_response(&self, rendered: &str) -> ScriptedResponse {
        let mut rules = self.rules.lock().expect("mock rules lock");
        // Longest matching prefix wins so "snapshot" and "snapshot list" can
        // coexist as separate rules.
        let best = rules
            .iter_mut()
            .filter(|rule| rendered.starts_with(&rule.prefix))
            .max_by_key(|rule| rule.prefix.len());
        match best {
            Some(rule) => {
                if rule.responses.len() > 1 {
                    rule.responses.pop_front().expect("non-empty queue")
                } else {
                    rule.responses
                        .front()
                        .cloned()
                        .unwrap_or_else(|| ScriptedResponse::Success(String::new()))
                }
            }
            None => ScriptedResponse::Success(String::new()),
        }
    }
}

impl CommandRunner for MockRunner {
    fn run(&self, args: &[String], timeout: Option<Duration>) -> Result<RawOutput> {
        let rendered = args.join(" ");
        self.calls.lock().expect("mock calls lock").push(RecordedCall {
            args: args.to_vec(),
            rendered: rendered.clone(),
            timeout,
        });
        let raw = match self.next_response(&rendered) {
            ScriptedResponse::Success(text) => RawOutput {
                success: true,
                text,
            },
            ScriptedResponse::Failure(text) => RawOutput {
                success: false,
                text,
            },
        };
        Ok(raw)
    }
}
