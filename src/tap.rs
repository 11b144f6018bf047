//! A streaming, line-oriented parser for the dialect of the Test Anything
//! Protocol this harness consumes from a test case's standard output.
//!
//! Unlike a whole-document TAP14 parser, [`Parser`] consumes one line at a
//! time and carries state (the declared plan, the running test-number
//! counter) across calls, so it can be fed lines as they arrive from a
//! child process rather than requiring the full output up front.

use std::fmt;
use std::io::BufRead;

use pest::Parser as _;
use pest_derive::Parser;

use crate::error::{PlanErrorKind, TapError};

#[derive(Parser)]
#[grammar = "tap.pest"]
struct LineGrammar;

/// Whether a directive marks a `TestLine` as expected-to-fail (`TODO`) or
/// intentionally not run (`SKIP`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveKind {
    Todo,
    Skip,
}

/// A `# TODO`/`# SKIP` annotation trailing a `TestLine`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub kind: DirectiveKind,
    pub description: Option<String>,
}

/// One event produced by parsing a single line of TAP output.
#[derive(Debug, Clone, PartialEq)]
pub enum TapEvent {
    Plan {
        number: u32,
        diagnostic: Option<String>,
    },
    TestLine {
        ok: bool,
        number: u32,
        description: Option<String>,
        directive: Option<Directive>,
    },
    Diagnostic(String),
}

impl TapEvent {
    pub fn as_test_line(&self) -> Option<(bool, u32, Option<&Directive>)> {
        match self {
            TapEvent::TestLine {
                ok,
                number,
                directive,
                ..
            } => Some((*ok, *number, directive.as_ref())),
            _ => None,
        }
    }
}

impl fmt::Display for TapEvent {
    /// Renders an event back into the TAP line it was parsed from.
    ///
    /// ```
    /// use mistest::tap::TapEvent;
    ///
    /// assert_eq!(TapEvent::Plan { number: 3, diagnostic: None }.to_string(), "1..3");
    /// ```
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TapEvent::Plan { number, diagnostic } => {
                write!(f, "1..{number}")?;
                if let Some(d) = diagnostic {
                    write!(f, " # {d}")?;
                }
                Ok(())
            }
            TapEvent::TestLine {
                ok,
                number,
                description,
                directive,
            } => {
                write!(f, "{} {number}", if *ok { "ok" } else { "not ok" })?;
                if let Some(d) = description {
                    write!(f, " {d}")?;
                }
                if let Some(dir) = directive {
                    write!(
                        f,
                        " # {}",
                        match dir.kind {
                            DirectiveKind::Todo => "TODO",
                            DirectiveKind::Skip => "SKIP",
                        }
                    )?;
                    if let Some(desc) = &dir.description {
                        write!(f, " {desc}")?;
                    }
                }
                Ok(())
            }
            TapEvent::Diagnostic(text) => write!(f, "# {text}"),
        }
    }
}

/// Per-invocation TAP lexer/parser state: the declared plan (if any) and the
/// running count of `TestLine`s seen so far.
#[derive(Debug, Default)]
pub struct Parser {
    planned: Option<u32>,
    test_number: u32,
}

impl Parser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn planned(&self) -> Option<u32> {
        self.planned
    }

    /// Parses one line (without its trailing newline) and either yields the
    /// event it produced or a typed [`TapError`].
    ///
    /// ```
    /// use mistest::tap::{Parser, TapEvent};
    ///
    /// let mut parser = Parser::new();
    /// assert_eq!(
    ///     parser.parse_line("1..1").unwrap(),
    ///     TapEvent::Plan { number: 1, diagnostic: None },
    /// );
    /// assert_eq!(
    ///     parser.parse_line("ok 1 hello").unwrap(),
    ///     TapEvent::TestLine { ok: true, number: 1, description: Some("hello".into()), directive: None },
    /// );
    /// ```
    pub fn parse_line(&mut self, line: &str) -> Result<TapEvent, TapError> {
        let pair = Self::line_pair(line)?;
        match pair.as_rule() {
            Rule::bail_out => {
                let reason = pair
                    .into_inner()
                    .next()
                    .map(|p| p.as_str().trim().to_string())
                    .filter(|s| !s.is_empty());
                Err(TapError::BailOut(reason))
            }
            Rule::plan => self.handle_plan(pair),
            Rule::test_line => self.handle_test_line(pair),
            Rule::diagnostic => {
                let text = pair
                    .into_inner()
                    .next()
                    .map(|p| p.as_str().trim().to_string())
                    .unwrap_or_default();
                Ok(TapEvent::Diagnostic(text))
            }
            rule => unreachable!("unexpected top-level rule {rule:?}"),
        }
    }

    /// Call once the input stream has ended; raises `Plan::Short` if fewer
    /// `TestLine`s were seen than were planned.
    pub fn finish(&self) -> Result<(), TapError> {
        if let Some(planned) = self.planned {
            if self.test_number < planned {
                return Err(TapError::Plan(PlanErrorKind::Short {
                    ran: self.test_number,
                    planned,
                }));
            }
        }
        Ok(())
    }

    fn line_pair(line: &str) -> Result<pest::iterators::Pair<'_, Rule>, TapError> {
        let mut pairs = LineGrammar::parse(Rule::line, line)
            .map_err(|_| TapError::NotTap(line.trim().to_string()))?;
        Ok(pairs
            .next()
            .expect("line rule always produces one inner pair on success")
            .into_inner()
            .next()
            .expect("line always wraps exactly one top-level construct"))
    }

    fn handle_plan(&mut self, pair: pest::iterators::Pair<'_, Rule>) -> Result<TapEvent, TapError> {
        if self.planned.is_some() {
            return Err(TapError::NotTap("Duplicate plan".to_string()));
        }
        let mut inner = pair.into_inner();
        let count: u32 = inner
            .next()
            .expect("plan always has a count")
            .as_str()
            .parse()
            .expect("count is all ASCII digits");
        let diagnostic = inner.next().map(|p| p.as_str().trim().to_string());
        if self.test_number > count {
            return Err(TapError::Plan(PlanErrorKind::Exceeded { planned: count }));
        }
        self.planned = Some(count);
        Ok(TapEvent::Plan {
            number: count,
            diagnostic,
        })
    }

    fn handle_test_line(
        &mut self,
        pair: pest::iterators::Pair<'_, Rule>,
    ) -> Result<TapEvent, TapError> {
        let mut ok = true;
        let mut number = None;
        let mut description = None;
        let mut directive = None;

        for field in pair.into_inner() {
            match field.as_rule() {
                Rule::result => ok = !field.as_str().to_ascii_lowercase().starts_with("not"),
                Rule::number => {
                    number = Some(field.as_str().parse::<u32>().expect("digits only"))
                }
                Rule::description => description = Some(field.as_str().trim().to_string()),
                Rule::directive => {
                    let mut inner = field.into_inner();
                    let key = inner
                        .next()
                        .expect("directive always has a key")
                        .as_str()
                        .to_ascii_lowercase();
                    let kind = if key == "todo" {
                        DirectiveKind::Todo
                    } else {
                        DirectiveKind::Skip
                    };
                    let description = inner
                        .next()
                        .map(|p| p.as_str().trim().to_string())
                        .filter(|s| !s.is_empty());
                    directive = Some(Directive { kind, description });
                }
                rule => unreachable!("unexpected test_line field {rule:?}"),
            }
        }

        self.test_number += 1;
        let running = self.test_number;
        if let Some(planned) = self.planned {
            if running > planned {
                return Err(TapError::Plan(PlanErrorKind::Exceeded { planned }));
            }
        }
        let final_number = match number {
            Some(n) if n != running => {
                return Err(TapError::Numbering {
                    expected: running,
                    found: n,
                })
            }
            Some(n) => n,
            None => running,
        };

        Ok(TapEvent::TestLine {
            ok,
            number: final_number,
            description: description.filter(|s| !s.is_empty()),
            directive,
        })
    }
}

/// Adapts a byte stream (a child process's stdout, typically) into a lazy
/// sequence of [`TapEvent`]s, re-lexing one line at a time and surfacing
/// [`TapError`] on malformed input or a failed end-of-stream plan check.
///
/// Bytes are decoded leniently (`String::from_utf8_lossy`) rather than
/// rejected outright, matching the "malformed bytes passed through as-is"
/// contract.
pub struct EventStream<R> {
    reader: R,
    buf: Vec<u8>,
    parser: Parser,
    done: bool,
}

impl<R: BufRead> EventStream<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            parser: Parser::new(),
            done: false,
        }
    }

    pub fn planned(&self) -> Option<u32> {
        self.parser.planned()
    }
}

impl<R: BufRead> Iterator for EventStream<R> {
    type Item = Result<TapEvent, TapError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf) {
            Ok(0) => {
                self.done = true;
                self.parser.finish().err().map(Err)
            }
            Ok(_) => {
                let mut line = String::from_utf8_lossy(&self.buf).into_owned();
                while matches!(line.chars().last(), Some('\n') | Some('\r')) {
                    line.pop();
                }
                match self.parser.parse_line(&line) {
                    Ok(event) => Some(Ok(event)),
                    Err(err) => {
                        self.done = true;
                        Some(Err(err))
                    }
                }
            }
            Err(_) => {
                self.done = true;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(input: &str) -> Result<Vec<TapEvent>, TapError> {
        EventStream::new(input.as_bytes()).collect()
    }

    #[test]
    fn plan_with_diagnostic_and_all_ok() {
        let result = events("1..4 # all of them\nok\nok\nok\nok").unwrap();
        assert_eq!(
            result[0],
            TapEvent::Plan {
                number: 4,
                diagnostic: Some("all of them".into())
            }
        );
        assert_eq!(result.len(), 5);
    }

    #[test]
    fn numbered_lines_with_descriptions() {
        let result = events("1..3\nok 1 Hello\nok 2 drat\nnot ok Sometimes\n").unwrap();
        assert_eq!(
            result[1],
            TapEvent::TestLine {
                ok: true,
                number: 1,
                description: Some("Hello".into()),
                directive: None
            }
        );
        assert_eq!(
            result[2],
            TapEvent::TestLine {
                ok: true,
                number: 2,
                description: Some("drat".into()),
                directive: None
            }
        );
        assert_eq!(
            result[3],
            TapEvent::TestLine {
                ok: false,
                number: 3,
                description: Some("Sometimes".into()),
                directive: None
            }
        );
    }

    #[test]
    fn todo_directive() {
        let result = events("ok # ToDo the directive").unwrap();
        assert_eq!(
            result[0],
            TapEvent::TestLine {
                ok: true,
                number: 1,
                description: None,
                directive: Some(Directive {
                    kind: DirectiveKind::Todo,
                    description: Some("the directive".into())
                })
            }
        );
    }

    #[test]
    fn skip_directive_without_description() {
        let result = events("not ok # skip").unwrap();
        assert_eq!(
            result[0],
            TapEvent::TestLine {
                ok: false,
                number: 1,
                description: None,
                directive: Some(Directive {
                    kind: DirectiveKind::Skip,
                    description: None
                })
            }
        );
    }

    #[test]
    fn non_tap_input() {
        let err = events("a wtf").unwrap_err();
        assert_eq!(err.to_string(), "Non-TAP input was encountered: \"a wtf\"");
    }

    #[test]
    fn plan_exceeded() {
        let err = events("1..1\nok 1\nok 2\n").unwrap_err();
        assert_eq!(err.to_string(), "Number of planned tests (1) exceeded");
    }

    #[test]
    fn plan_short() {
        let err = events("1..3\nok 1\nok 2\n").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Number of executed tests (2) less than the number of planned (3)"
        );
    }

    #[test]
    fn unexpected_number() {
        let err = events("ok\nok 3\n").unwrap_err();
        assert_eq!(err.to_string(), "Unexpected test number 3 expecting 2");
    }

    #[test]
    fn bail_out() {
        let err = events("Bail out!").unwrap_err();
        assert_eq!(err.to_string(), "Bail out!");
    }

    #[test]
    fn bail_out_with_reason() {
        let err = events("Bail out! no more disk space").unwrap_err();
        assert_eq!(err.to_string(), "Bail out! no more disk space");
    }

    #[test]
    fn duplicate_plan_is_not_tap() {
        let err = events("1..1\n1..2\n").unwrap_err();
        assert_eq!(err.to_string(), "Non-TAP input was encountered: \"Duplicate plan\"");
    }

    #[test]
    fn plan_of_zero_with_no_test_lines() {
        let result = events("1..0\n").unwrap();
        assert_eq!(
            result,
            vec![TapEvent::Plan {
                number: 0,
                diagnostic: None
            }]
        );
    }

    #[test]
    fn implicit_number_after_explicit_numbered_line() {
        let result = events("ok 1\nok\n").unwrap();
        assert_eq!(result[1].as_test_line().unwrap().1, 2);
    }

    #[test]
    fn missing_trailing_newline() {
        let result = events("1..1\nok 1").unwrap();
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn display_round_trips_simple_events() {
        let plan = TapEvent::Plan {
            number: 2,
            diagnostic: None,
        };
        assert_eq!(Parser::new().parse_line(&plan.to_string()).unwrap(), plan);

        let mut p = Parser::new();
        let line = TapEvent::TestLine {
            ok: true,
            number: 1,
            description: Some("hi".into()),
            directive: Some(Directive {
                kind: DirectiveKind::Todo,
                description: Some("later".into()),
            }),
        };
        assert_eq!(p.parse_line(&line.to_string()).unwrap(), line);
    }
}
