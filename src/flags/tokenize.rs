//! Shell-word splitting for flag strings.
//!
//! Flags are assembled as text (configuration constants, environment
//! overrides, directives in generated code) but handed to the compiler as an
//! argument vector with no shell in between, so quoting has to be resolved
//! here.
//
//  POSIX rules (as `sh` word splitting, without expansion):
//
//      'text'     literal, no escapes
//      "text"     `\"` and `\\` are escapes, everything else literal
//      \c         outside quotes: literal c
//
//  Windows rules (as the C runtime's argv parser):
//
//      "text"     quoted run, may be left open at end of input
//      2n `\` + " → n backslashes, quote toggles
//      2n+1 `\` + " → n backslashes and a literal "
//      `\` not before a quote is literal

use std::iter::Peekable;
use std::str::Chars;

struct Words<'a> {
    chars: Peekable<Chars<'a>>,
    words: Vec<String>,
    current: String,
    in_word: bool,
}

impl<'a> Words<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            chars: src.chars().peekable(),
            words: Vec::new(),
            current: String::new(),
            in_word: false,
        }
    }

    fn push(&mut self, c: char) {
        self.current.push(c);
        self.in_word = true;
    }

    fn end_word(&mut self) {
        if self.in_word {
            self.words.push(std::mem::take(&mut self.current));
            self.in_word = false;
        }
    }
}

/// Split with POSIX shell quoting rules. Fails on an unterminated quote.
pub fn split_posix(src: &str) -> Result<Vec<String>, String> {
    let mut w = Words::new(src);

    while let Some(c) = w.chars.next() {
        match c {
            c if c.is_whitespace() => w.end_word(),
            '\\' => match w.chars.next() {
                Some(n) => w.push(n),
                None => return Err("trailing backslash".into()),
            },
            '\'' => {
                w.in_word = true;
                loop {
                    match w.chars.next() {
                        Some('\'') => break,
                        Some(n) => w.current.push(n),
                        None => return Err("no closing quotation".into()),
                    }
                }
            }
            '"' => {
                w.in_word = true;
                loop {
                    match w.chars.next() {
                        Some('"') => break,
                        Some('\\') => match w.chars.peek() {
                            Some(&n) if n == '"' || n == '\\' => {
                                w.current.push(n);
                                w.chars.next();
                            }
                            _ => w.current.push('\\'),
                        },
                        Some(n) => w.current.push(n),
                        None => return Err("no closing quotation".into()),
                    }
                }
            }
            c => w.push(c),
        }
    }
    w.end_word();
    Ok(w.words)
}

/// Split with the Windows C runtime's argument rules. Never fails.
pub fn split_windows(src: &str) -> Vec<String> {
    let mut w = Words::new(src);
    let mut quoted = false;

    while let Some(c) = w.chars.next() {
        match c {
            c if c.is_whitespace() && !quoted => w.end_word(),
            '\\' => {
                let mut count = 1;
                while w.chars.peek() == Some(&'\\') {
                    w.chars.next();
                    count += 1;
                }
                if w.chars.peek() == Some(&'"') {
                    for _ in 0..count / 2 {
                        w.push('\\');
                    }
                    if count % 2 == 1 {
                        w.chars.next();
                        w.push('"');
                    }
                } else {
                    for _ in 0..count {
                        w.push('\\');
                    }
                }
            }
            '"' => {
                w.in_word = true;
                quoted = !quoted;
            }
            c => w.push(c),
        }
    }
    w.end_word();
    w.words
}
