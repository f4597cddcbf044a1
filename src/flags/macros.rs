//! The `CMD(..)` / `ENV(..)` / `GETPATH(..)` macro language used in flag
//! strings.
//
//  Grammar (informal):
//
//      text     ::= segment*
//      segment  ::= 'CMD(' body ')' | 'ENV(' body ')' | 'GETPATH(' body ')' | literal
//      body     ::= balanced parentheses, not evaluated further
//
//  Evaluation is a single pass: the output of a CMD or the value of an ENV
//  is spliced in verbatim and never rescanned for macros. A keyword without
//  a matching `)` is plain text.

use crate::error::Result;
use crate::process::Output;

use super::FlagCompositor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    /// Replaced by the captured stdout of running the command.
    Command(String),
    /// Replaced by the environment variable's value, empty when unset.
    Env(String),
    /// Replaced by a configured directory.
    PathAlias(String),
}

const KEYWORDS: &[(&str, fn(String) -> Segment)] = &[
    ("CMD(", Segment::Command),
    ("ENV(", Segment::Env),
    ("GETPATH(", Segment::PathAlias),
];

/// Split `src` into literal text and macro invocations.
pub fn parse(src: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut rest = src;

    'outer: while !rest.is_empty() {
        for (keyword, make) in KEYWORDS {
            if let Some(after) = rest.strip_prefix(keyword) {
                if let Some(close) = matching_paren(after) {
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(make(after[..close].to_string()));
                    rest = &after[close + 1..];
                    continue 'outer;
                }
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            literal.push(c);
        }
        rest = chars.as_str();
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    segments
}

/// Byte offset of the `)` closing an already opened parenthesis.
fn matching_paren(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' if depth == 0 => return Some(i),
            ')' => depth -= 1,
            _ => {}
        }
    }
    None
}

impl FlagCompositor<'_> {
    /// Expand every macro in `src`.
    pub fn evaluate(&self, src: &str) -> Result<String> {
        let mut out = String::with_capacity(src.len());
        for segment in parse(src) {
            match segment {
                Segment::Literal(text) => out.push_str(&text),
                Segment::Env(name) => {
                    out.push_str(&self.env.var(name.trim()).unwrap_or_default());
                }
                Segment::PathAlias(name) => {
                    let path = self.config.resolve_path_alias(name.trim());
                    out.push_str(&path.display().to_string());
                }
                Segment::Command(cmd) => out.push_str(&self.command_output(&cmd)?),
            }
        }
        Ok(out)
    }

    fn command_output(&self, cmd: &str) -> Result<String> {
        let words = self.platform.split_flags(cmd)?;
        let Some((exe, args)) = words.split_first() else {
            return Ok(String::new());
        };
        let stdout = self.runner.run(exe, args, Output::Capture)?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::platform::Posix;
    use crate::process::mock::{MockResponse, MockRunner};
    use std::collections::BTreeMap;

    #[test]
    fn parses_segments() {
        assert_eq!(
            parse("-I ENV(HOME)/inc CMD(pkg-config --libs gsl) -lm"),
            vec![
                Segment::Literal("-I ".into()),
                Segment::Env("HOME".into()),
                Segment::Literal("/inc ".into()),
                Segment::Command("pkg-config --libs gsl".into()),
                Segment::Literal(" -lm".into()),
            ]
        );
    }

    #[test]
    fn nested_parentheses_stay_in_body() {
        assert_eq!(
            parse("CMD(echo (a) b)x"),
            vec![
                Segment::Command("echo (a) b".into()),
                Segment::Literal("x".into())
            ]
        );
    }

    #[test]
    fn unterminated_macro_is_literal() {
        assert_eq!(parse("ENV(HOME"), vec![Segment::Literal("ENV(HOME".into())]);
    }

    #[test]
    fn evaluates_each_kind() {
        let cfg = Config::default();
        let runner = MockRunner::new();
        runner.respond("echo", MockResponse::ok("X\n"));
        let env = BTreeMap::from([("NCRYSTAL".to_string(), "/opt/nc".to_string())]);
        let comp = FlagCompositor::new(&cfg, &Posix, &runner, &env);

        assert_eq!(comp.evaluate("CMD(echo X)").unwrap(), "X");
        assert_eq!(comp.evaluate("-IENV(NCRYSTAL)/include").unwrap(), "-I/opt/nc/include");
        assert_eq!(comp.evaluate("[ENV(UNSET_VAR)]").unwrap(), "[]");
        assert_eq!(
            comp.evaluate("-LGETPATH(libdir)").unwrap(),
            format!("-L{}", cfg.libdir.display())
        );
        assert_eq!(runner.calls()[0].args, vec!["X".to_string()]);
    }

    #[test]
    fn evaluation_is_single_pass() {
        let cfg = Config::default();
        let runner = MockRunner::new();
        let env = BTreeMap::from([("A".to_string(), "ENV(B)".to_string())]);
        let comp = FlagCompositor::new(&cfg, &Posix, &runner, &env);

        assert_eq!(comp.evaluate("ENV(A)").unwrap(), "ENV(B)");
    }

    #[test]
    fn failing_command_propagates() {
        let cfg = Config::default();
        let runner = MockRunner::new();
        runner.respond("pkg-config", MockResponse::fail(1));
        let env = BTreeMap::new();
        let comp = FlagCompositor::new(&cfg, &Posix, &runner, &env);

        let err = comp.evaluate("CMD(pkg-config --cflags nope)").unwrap_err();
        assert_eq!(err.exit_code(), Some(1));
    }

    #[cfg(unix)]
    #[test]
    fn real_echo() {
        let cfg = Config::default();
        let env = BTreeMap::new();
        let comp = FlagCompositor::new(&cfg, &Posix, &crate::process::SystemRunner, &env);
        assert_eq!(comp.evaluate("CMD(echo X)").unwrap(), "X");
    }
}
