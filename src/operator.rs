use std::io::{self, BufRead, Write};

/// Blocking questions put to whoever runs the unit.
pub trait Operator {
    /// `true` only for an explicit `y`.
    fn confirm(&self, question: &str) -> io::Result<bool>;

    fn ask(&self, question: &str) -> io::Result<String>;
}

/// Prompts on stderr, answers from stdin.
#[derive(Clone, Debug, Default)]
pub struct Console;

impl Console {
    fn read_answer(question: &str) -> io::Result<String> {
        let mut err = io::stderr().lock();
        write!(err, "{question} ")?;
        err.flush()?;

        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        Ok(line.trim().to_string())
    }
}

impl Operator for Console {
    fn confirm(&self, question: &str) -> io::Result<bool> {
        Ok(is_yes(&Console::read_answer(&format!("{question} (y to yes)"))?))
    }

    fn ask(&self, question: &str) -> io::Result<String> {
        Console::read_answer(question)
    }
}

pub fn is_yes(answer: &str) -> bool {
    answer.trim().eq_ignore_ascii_case("y")
}
