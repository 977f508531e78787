//! Recording mock invoker for tests.

use std::{
    sync::{Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;

use crate::NestcoreResult;

use super::{CommandOutput, CommandSpec, Invoke};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

type Effect = Box<dyn Fn(&CommandSpec) + Send + Sync>;

/// An invoker that records every call and replays canned outputs.
///
/// Rules are matched by substring against the joined argv; the most recently
/// added matching rule wins, and `_once` rules are consumed. Calls with no
/// matching rule succeed with empty output.
#[derive(Default)]
pub struct MockInvoker {
    rules: Mutex<Vec<MockRule>>,
    calls: Mutex<Vec<CommandSpec>>,
}

struct MockRule {
    matcher: String,
    exit_code: i32,
    stdout: String,
    stderr: String,
    remaining: Option<usize>,
    effect: Option<Effect>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MockInvoker {
    /// Creates a mock invoker where every call succeeds with empty output.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an unlimited canned response for commands whose argv contains `matcher`.
    pub fn respond(&self, matcher: &str, exit_code: i32, stdout: &str, stderr: &str) {
        self.push_rule(matcher, exit_code, stdout, stderr, None, None);
    }

    /// Adds a canned response that is consumed after one use.
    pub fn respond_once(&self, matcher: &str, exit_code: i32, stdout: &str, stderr: &str) {
        self.push_rule(matcher, exit_code, stdout, stderr, Some(1), None);
    }

    /// Adds a canned response with a side effect, e.g. a mock bootstrap that
    /// materializes a rootfs skeleton at the target directory.
    pub fn respond_with(
        &self,
        matcher: &str,
        exit_code: i32,
        stdout: &str,
        stderr: &str,
        effect: impl Fn(&CommandSpec) + Send + Sync + 'static,
    ) {
        self.push_rule(matcher, exit_code, stdout, stderr, None, Some(Box::new(effect)));
    }

    /// Returns the argv of every recorded call, in order.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.lock_calls().iter().map(|c| c.get_argv().clone()).collect()
    }

    /// Returns the argv of recorded calls whose joined argv contains `matcher`.
    pub fn calls_matching(&self, matcher: &str) -> Vec<Vec<String>> {
        self.lock_calls()
            .iter()
            .map(|c| c.get_argv().clone())
            .filter(|argv| argv.join(" ").contains(matcher))
            .collect()
    }

    fn push_rule(
        &self,
        matcher: &str,
        exit_code: i32,
        stdout: &str,
        stderr: &str,
        remaining: Option<usize>,
        effect: Option<Effect>,
    ) {
        self.rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(MockRule {
                matcher: matcher.to_string(),
                exit_code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
                remaining,
                effect,
            });
    }

    fn lock_calls(&self) -> std::sync::MutexGuard<'_, Vec<CommandSpec>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl Invoke for MockInvoker {
    async fn run(&self, spec: CommandSpec) -> NestcoreResult<CommandOutput> {
        let joined = spec.get_argv().join(" ");

        let response = {
            let mut rules = self.rules.lock().unwrap_or_else(PoisonError::into_inner);
            let hit = rules
                .iter_mut()
                .rev()
                .find(|rule| rule.remaining != Some(0) && joined.contains(&rule.matcher));

            match hit {
                Some(rule) => {
                    if let Some(remaining) = rule.remaining.as_mut() {
                        *remaining -= 1;
                    }
                    if let Some(effect) = &rule.effect {
                        effect(&spec);
                    }
                    (rule.exit_code, rule.stdout.clone(), rule.stderr.clone())
                }
                None => (0, String::new(), String::new()),
            }
        };

        self.lock_calls().push(spec);

        Ok(CommandOutput::for_test(response.0, response.1, response.2))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

impl CommandOutput {
    /// Builds a canned output for mock responses.
    pub(crate) fn for_test(exit_code: i32, stdout: String, stderr: String) -> Self {
        Self::from_parts(Some(exit_code), stdout, stderr, Duration::from_millis(0))
    }
}
