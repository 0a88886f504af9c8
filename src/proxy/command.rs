//! Client command syntax.
//!
//! Commands are words separated by blanks and terminated by a newline or
//! `;`. A word is either bare, `{braced}` (taken literally, braces nest),
//! or `"quoted"` (backslash escapes are processed). A backslash before a
//! newline continues the command on the next line.
//!
//! The client stream is read line by line, so a braced argument spanning
//! several lines reaches the dispatcher in pieces; [`is_complete`] tells
//! whether the accumulated text forms whole commands yet.

use std::io;

use bitflags::bitflags;
use thiserror::Error;

use crate::core::engine::EngineError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyntaxError {
    #[error("missing close-brace")]
    UnclosedBrace,

    #[error("missing \"")]
    UnclosedQuote,

    #[error("backslash at end of input")]
    TrailingBackslash,

    #[error("extra characters after close-brace")]
    ExtraAfterBrace,

    #[error("extra characters after close-quote")]
    ExtraAfterQuote,
}

impl SyntaxError {
    /// True when more input could still make the text valid.
    pub fn is_incomplete(&self) -> bool {
        matches!(
            self,
            SyntaxError::UnclosedBrace | SyntaxError::UnclosedQuote | SyntaxError::TrailingBackslash
        )
    }
}

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("invalid command name \"{0}\"")]
    Unknown(String),

    #[error("wrong # args: should be \"{0}\"")]
    Usage(&'static str),

    #[error("expected number but got \"{0}\"")]
    BadNumber(String),

    #[error("expected boolean value but got \"{0}\"")]
    BadBoolean(String),

    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Syntax(#[from] SyntaxError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, CommandError>;

/// Whether `text` holds only whole commands.
pub fn is_complete(text: &str) -> bool {
    match split_commands(text) {
        Ok(_) => true,
        Err(e) => !e.is_incomplete(),
    }
}

/// Split `text` into commands, each a list of words.
pub fn split_commands(text: &str) -> std::result::Result<Vec<Vec<String>>, SyntaxError> {
    let mut scanner = Scanner::new(text, true);
    let mut commands = Vec::new();
    let mut words = Vec::new();
    loop {
        match scanner.next_token()? {
            Token::Word(word) => words.push(word),
            Token::End => {
                if !words.is_empty() {
                    commands.push(std::mem::take(&mut words));
                }
            }
            Token::Eof => {
                if !words.is_empty() {
                    commands.push(words);
                }
                return Ok(commands);
            }
        }
    }
}

/// Split a list value (newlines are plain blanks) into its elements.
pub fn split_list(text: &str) -> std::result::Result<Vec<String>, SyntaxError> {
    let mut scanner = Scanner::new(text, false);
    let mut items = Vec::new();
    loop {
        match scanner.next_token()? {
            Token::Word(word) => items.push(word),
            Token::End => {}
            Token::Eof => return Ok(items),
        }
    }
}

enum Token {
    Word(String),
    End,
    Eof,
}

struct Scanner {
    chars: Vec<char>,
    pos: usize,
    commands: bool,
    at_command_start: bool,
}

impl Scanner {
    fn new(text: &str, commands: bool) -> Self {
        Self {
            chars: text.chars().collect(),
            pos: 0,
            commands,
            at_command_start: true,
        }
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn is_separator(&self, c: char) -> bool {
        self.commands && (c == '\n' || c == ';')
    }

    fn next_token(&mut self) -> std::result::Result<Token, SyntaxError> {
        loop {
            let Some(c) = self.peek(0) else {
                return Ok(Token::Eof);
            };
            match c {
                ' ' | '\t' | '\r' => self.pos += 1,
                '\n' if !self.commands => self.pos += 1,
                c if self.is_separator(c) => {
                    self.pos += 1;
                    self.at_command_start = true;
                    return Ok(Token::End);
                }
                '\\' if self.peek(1) == Some('\n') => {
                    if self.pos + 2 >= self.chars.len() {
                        return Err(SyntaxError::TrailingBackslash);
                    }
                    self.pos += 2;
                }
                '#' if self.commands && self.at_command_start => self.skip_comment()?,
                '{' => return self.braced().map(Token::Word),
                '"' => return self.quoted().map(Token::Word),
                _ => return self.bare().map(Token::Word),
            }
        }
    }

    fn skip_comment(&mut self) -> std::result::Result<(), SyntaxError> {
        while let Some(c) = self.peek(0) {
            match c {
                '\\' => {
                    if self.peek(1).is_none() {
                        return Err(SyntaxError::TrailingBackslash);
                    }
                    self.pos += 2;
                }
                '\n' => return Ok(()),
                _ => self.pos += 1,
            }
        }
        Ok(())
    }

    fn braced(&mut self) -> std::result::Result<String, SyntaxError> {
        self.at_command_start = false;
        self.pos += 1;
        let mut depth = 1;
        let mut word = String::new();
        while let Some(c) = self.peek(0) {
            match c {
                '\\' => {
                    let Some(next) = self.peek(1) else {
                        return Err(SyntaxError::UnclosedBrace);
                    };
                    word.push(c);
                    word.push(next);
                    self.pos += 2;
                    continue;
                }
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        self.pos += 1;
                        return self.expect_word_end(SyntaxError::ExtraAfterBrace).map(|_| word);
                    }
                }
                _ => {}
            }
            word.push(c);
            self.pos += 1;
        }
        Err(SyntaxError::UnclosedBrace)
    }

    fn quoted(&mut self) -> std::result::Result<String, SyntaxError> {
        self.at_command_start = false;
        self.pos += 1;
        let mut word = String::new();
        while let Some(c) = self.peek(0) {
            match c {
                '"' => {
                    self.pos += 1;
                    return self.expect_word_end(SyntaxError::ExtraAfterQuote).map(|_| word);
                }
                '\\' => {
                    let Some(next) = self.peek(1) else {
                        return Err(SyntaxError::UnclosedQuote);
                    };
                    word.push(unescape(next));
                    self.pos += 2;
                }
                _ => {
                    word.push(c);
                    self.pos += 1;
                }
            }
        }
        Err(SyntaxError::UnclosedQuote)
    }

    fn bare(&mut self) -> std::result::Result<String, SyntaxError> {
        self.at_command_start = false;
        let mut word = String::new();
        while let Some(c) = self.peek(0) {
            match c {
                ' ' | '\t' | '\r' => break,
                '\n' => break,
                c if self.is_separator(c) => break,
                '\\' => {
                    let Some(next) = self.peek(1) else {
                        return Err(SyntaxError::TrailingBackslash);
                    };
                    if next == '\n' {
                        break;
                    }
                    word.push(unescape(next));
                    self.pos += 2;
                }
                _ => {
                    word.push(c);
                    self.pos += 1;
                }
            }
        }
        Ok(word)
    }

    fn expect_word_end(&self, err: SyntaxError) -> std::result::Result<(), SyntaxError> {
        match self.peek(0) {
            None | Some(' ' | '\t' | '\r' | '\n') => Ok(()),
            Some(c) if self.is_separator(c) => Ok(()),
            Some('\\') if self.peek(1) == Some('\n') => Ok(()),
            Some(_) => Err(err),
        }
    }
}

fn unescape(c: char) -> char {
    match c {
        'n' => '\n',
        't' => '\t',
        'r' => '\r',
        '\n' => ' ',
        other => other,
    }
}

bitflags! {
    /// Options a command accepts besides `-defer` and `-push`.
    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    pub struct Accepts: u8 {
        /// `-model name`
        const MODEL = 0x01;
        /// `-ghost` / `-normal`
        const GHOST = 0x02;
        /// `-size n`
        const SIZE = 0x04;
    }
}

/// Render scheduling requested by `-defer` / `-push`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Update {
    pub defer: bool,
    pub push: bool,
}

/// A command's words after option processing.
#[derive(Debug, Default)]
pub struct Invocation<'a> {
    pub update: Update,
    pub model: Option<&'a str>,
    pub ghost: bool,
    pub size: Option<&'a str>,
    pub positional: Vec<&'a str>,
}

impl<'a> Invocation<'a> {
    /// Parse the words following the verb.
    ///
    /// Options may appear anywhere. Words that are not recognised options
    /// (including negative numbers) are positional.
    pub fn parse(args: &'a [String], accepts: Accepts, usage: &'static str) -> Result<Self> {
        let mut inv = Invocation::default();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-defer" => inv.update.defer = true,
                "-push" => inv.update.push = true,
                "-model" if accepts.contains(Accepts::MODEL) => {
                    inv.model = Some(iter.next().map(String::as_str).ok_or(CommandError::Usage(usage))?);
                }
                "-ghost" if accepts.contains(Accepts::GHOST) => inv.ghost = true,
                "-normal" if accepts.contains(Accepts::GHOST) => inv.ghost = false,
                "-size" if accepts.contains(Accepts::SIZE) => {
                    inv.size = Some(iter.next().map(String::as_str).ok_or(CommandError::Usage(usage))?);
                }
                _ => inv.positional.push(arg.as_str()),
            }
        }
        Ok(inv)
    }

    pub fn model_or_all(&self) -> &'a str {
        self.model.unwrap_or("all")
    }

    /// Require between `min` and `max` positional arguments.
    pub fn arity(&self, min: usize, max: usize, usage: &'static str) -> Result<()> {
        if (min..=max).contains(&self.positional.len()) {
            Ok(())
        } else {
            Err(CommandError::Usage(usage))
        }
    }
}

pub fn parse_f64(word: &str) -> Result<f64> {
    match word.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(CommandError::BadNumber(word.to_string())),
    }
}

pub fn parse_i32(word: &str) -> Result<i32> {
    word.trim()
        .parse::<i32>()
        .map_err(|_| CommandError::BadNumber(word.to_string()))
}

/// Boolean in the client's vocabulary: numbers, true/false, yes/no, on/off.
pub fn parse_bool(word: &str) -> Result<bool> {
    if let Ok(n) = word.trim().parse::<i64>() {
        return Ok(n != 0);
    }
    match word.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" => Ok(true),
        "false" | "no" | "off" => Ok(false),
        _ => Err(CommandError::BadBoolean(word.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_split_simple_commands() {
        let commands = split_commands("rotate 10 0 0\npan -1 2; zoom 1.5\n").unwrap();

        assert_eq!(
            commands,
            vec![
                words(&["rotate", "10", "0", "0"]),
                words(&["pan", "-1", "2"]),
                words(&["zoom", "1.5"]),
            ]
        );
    }

    #[test]
    fn test_braced_word_spans_lines() {
        let text = "loadpdb {ATOM 1\nATOM 2\n} protein 1\n";
        let commands = split_commands(text).unwrap();

        assert_eq!(commands, vec![words(&["loadpdb", "ATOM 1\nATOM 2\n", "protein", "1"])]);
    }

    #[test]
    fn test_nested_braces_and_escapes() {
        let commands = split_commands("raw {a {b} \\} c}\n").unwrap();
        assert_eq!(commands[0][1], "a {b} \\} c");

        let commands = split_commands("raw \"say \\\"hi\\\"\\n\"\n").unwrap();
        assert_eq!(commands[0][1], "say \"hi\"\n");
    }

    #[test]
    fn test_completeness() {
        assert!(is_complete("rotate 1 2 3\n"));
        assert!(is_complete(""));
        assert!(!is_complete("loadpdb {ATOM 1\n"));
        assert!(!is_complete("loadpdb {a {b}\n"));
        assert!(!is_complete("raw \"unterminated\n"));
        assert!(!is_complete("rotate 1 \\\n"));
        assert!(is_complete("rotate 1 \\\n 2 3\n"));
        // Escaped braces do not count
        assert!(is_complete("raw {a \\{ b}\n"));
        // Complete but malformed text is handed to the dispatcher
        assert!(is_complete("raw {a}b\n"));
    }

    #[test]
    fn test_line_continuation() {
        let commands = split_commands("rotate 1 \\\n 2 3\n").unwrap();
        assert_eq!(commands, vec![words(&["rotate", "1", "2", "3"])]);
    }

    #[test]
    fn test_extra_characters_after_brace() {
        assert_eq!(split_commands("raw {a}b\n"), Err(SyntaxError::ExtraAfterBrace));
        assert_eq!(split_commands("raw \"a\"b\n"), Err(SyntaxError::ExtraAfterQuote));
    }

    #[test]
    fn test_comment_lines() {
        let commands = split_commands("# set up\nreset\n").unwrap();
        assert_eq!(commands, vec![words(&["reset"])]);
    }

    #[test]
    fn test_split_list() {
        let items = split_list("user joe\n session {a b} \"c d\"").unwrap();
        assert_eq!(items, words(&["user", "joe", "session", "a b", "c d"]));
    }

    #[test]
    fn test_invocation_options() {
        let args = words(&["-defer", "-model", "ligand", "-ghost", "0.3"]);
        let inv = Invocation::parse(&args, Accepts::MODEL | Accepts::GHOST, "x").unwrap();

        assert!(inv.update.defer);
        assert!(!inv.update.push);
        assert_eq!(inv.model, Some("ligand"));
        assert!(inv.ghost);
        assert_eq!(inv.positional, vec!["0.3"]);
    }

    #[test]
    fn test_invocation_negative_numbers_are_positional() {
        let args = words(&["-10", "-push", "0", "-0.5"]);
        let inv = Invocation::parse(&args, Accepts::empty(), "x").unwrap();

        assert!(inv.update.push);
        assert_eq!(inv.positional, vec!["-10", "0", "-0.5"]);
    }

    #[test]
    fn test_invocation_missing_option_value() {
        let args = words(&["-model"]);
        assert!(matches!(
            Invocation::parse(&args, Accepts::MODEL, "atomscale ?-model name? scale"),
            Err(CommandError::Usage(_))
        ));
    }

    #[test]
    fn test_unaccepted_option_is_positional() {
        let args = words(&["-model", "x"]);
        let inv = Invocation::parse(&args, Accepts::empty(), "x").unwrap();
        assert_eq!(inv.positional, vec!["-model", "x"]);
    }

    #[test]
    fn test_number_parsing() {
        assert_eq!(parse_f64("0.25").unwrap(), 0.25);
        assert_eq!(parse_f64("-10").unwrap(), -10.0);
        assert!(matches!(parse_f64("1.5x"), Err(CommandError::BadNumber(_))));
        assert!(matches!(parse_f64("nan"), Err(CommandError::BadNumber(_))));
        assert_eq!(parse_i32("400").unwrap(), 400);
        assert!(parse_i32("4.5").is_err());
    }

    #[test]
    fn test_bool_parsing() {
        for word in ["1", "true", "Yes", "on", "5"] {
            assert!(parse_bool(word).unwrap(), "{}", word);
        }
        for word in ["0", "false", "no", "OFF"] {
            assert!(!parse_bool(word).unwrap(), "{}", word);
        }
        assert!(matches!(parse_bool("maybe"), Err(CommandError::BadBoolean(_))));
    }
}
