//! Questions for the person running the migration.

use anyhow::Result;
use std::collections::VecDeque;
use std::io::{BufRead, Write, stdin, stdout};
use std::sync::Mutex;
use tracing::info;

pub trait Operator: Send + Sync {
    /// Free-text answer; an empty reply takes `default`.
    fn ask_text(&self, prompt: &str, default: &str) -> Result<String>;

    fn ask_yes_no(&self, prompt: &str) -> Result<bool>;

    /// Something the operator has to read, such as manual follow-up steps.
    fn notify(&self, message: &str);
}

/// Prompts on the controlling terminal.
pub struct ConsoleOperator;

impl Operator for ConsoleOperator {
    fn ask_text(&self, prompt: &str, default: &str) -> Result<String> {
        if default.is_empty() {
            print!("{}: ", prompt);
        } else {
            print!("{} [{}]: ", prompt, default);
        }
        stdout().flush()?;

        let mut input = String::new();
        stdin().lock().read_line(&mut input)?;
        let answer = input.trim();

        Ok(if answer.is_empty() {
            default.to_string()
        } else {
            answer.to_string()
        })
    }

    fn ask_yes_no(&self, prompt: &str) -> Result<bool> {
        print!("{} [y/N] ", prompt);
        stdout().flush()?;

        let mut input = String::new();
        stdin().lock().read_line(&mut input)?;
        let answer = input.trim();

        Ok(answer.eq_ignore_ascii_case("y") || answer.eq_ignore_ascii_case("yes"))
    }

    fn notify(&self, message: &str) {
        println!();
        println!("{}", message);
        println!();
    }
}

/// Answers from a queue, for unattended runs and tests.
///
/// Once the queue runs dry, text prompts take their default and yes/no
/// prompts are answered yes.
pub struct ScriptedOperator {
    answers: Mutex<VecDeque<String>>,
    notices: Mutex<Vec<String>>,
}

impl ScriptedOperator {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: Mutex::new(answers.into_iter().map(Into::into).collect()),
            notices: Mutex::new(Vec::new()),
        }
    }

    pub fn notices(&self) -> Vec<String> {
        self.notices.lock().map(|n| n.clone()).unwrap_or_default()
    }

    fn next_answer(&self) -> Option<String> {
        self.answers.lock().ok()?.pop_front()
    }
}

impl Operator for ScriptedOperator {
    fn ask_text(&self, prompt: &str, default: &str) -> Result<String> {
        let answer = self
            .next_answer()
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| default.to_string());
        info!(prompt, answer = %answer, "Scripted answer");
        Ok(answer)
    }

    fn ask_yes_no(&self, prompt: &str) -> Result<bool> {
        let answer = match self.next_answer() {
            Some(a) => matches!(a.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
            None => true,
        };
        info!(prompt, answer, "Scripted answer");
        Ok(answer)
    }

    fn notify(&self, message: &str) {
        if let Ok(mut notices) = self.notices.lock() {
            notices.push(message.to_string());
        }
    }
}
