use std::iter::Peekable;
use std::str::{CharIndices, FromStr};

use super::error::ParseError;
use super::terms::Symbol;

/// `(start, token, end)` byte offsets into the source.
pub type Spanned = Result<(usize, Token, usize), ParseError>;

#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    Symbol(Symbol),
    Colon,     // :
    Comma,     // ,
    LB,        // [
    RB,        // ]
    LP,        // (
    RP,        // )
    LCB,       // {
    RCB,       // }
    Dot,       // .
    New,       // new
    Mul,       // *
    Div,       // /
    Mod,       // mod
    Rem,       // rem, %
    Add,       // +
    Sub,       // -
    Eq,        // ==
    Neq,       // !=
    Leq,       // <=
    Geq,       // >=
    Lt,        // <
    Gt,        // >
    Unify,     // =
    Assign,    // :=
    SemiColon, // ;
    Query,     // ?=
    In,        // in
    Cut,       // cut
    Debug,     // debug
    Print,     // print
    ForAll,    // forall
    If,        // if
    And,       // and
    Or,        // or
    Not,       // not
    Matches,   // matches
    Type,      // type
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        use Token::*;
        let s = match self {
            Integer(i) => return write!(f, "{}", i),
            Float(x) => return write!(f, "{}", x),
            String(s) => return write!(f, "\"{}\"", s),
            Boolean(b) => return write!(f, "{}", b),
            Symbol(sym) => return write!(f, "{}", sym),
            Colon => ":",
            Comma => ",",
            LB => "[",
            RB => "]",
            LP => "(",
            RP => ")",
            LCB => "{",
            RCB => "}",
            Dot => ".",
            New => "new",
            Mul => "*",
            Div => "/",
            Mod => "mod",
            Rem => "rem",
            Add => "+",
            Sub => "-",
            Eq => "==",
            Neq => "!=",
            Leq => "<=",
            Geq => ">=",
            Lt => "<",
            Gt => ">",
            Unify => "=",
            Assign => ":=",
            SemiColon => ";",
            Query => "?=",
            In => "in",
            Cut => "cut",
            Debug => "debug",
            Print => "print",
            ForAll => "forall",
            If => "if",
            And => "and",
            Or => "or",
            Not => "not",
            Matches => "matches",
            Type => "type",
        };
        write!(f, "{}", s)
    }
}

fn keyword(word: &str) -> Option<Token> {
    Some(match word {
        "true" => Token::Boolean(true),
        "false" => Token::Boolean(false),
        "new" => Token::New,
        "in" => Token::In,
        "cut" => Token::Cut,
        "debug" => Token::Debug,
        "print" => Token::Print,
        "forall" => Token::ForAll,
        "if" => Token::If,
        "and" => Token::And,
        "or" => Token::Or,
        "not" => Token::Not,
        "matches" => Token::Matches,
        "type" => Token::Type,
        "mod" => Token::Mod,
        "rem" => Token::Rem,
        _ => return None,
    })
}

fn starts_symbol(c: char) -> bool {
    c == '_' || c.is_alphabetic()
}

fn continues_symbol(c: char) -> bool {
    c == '_' || c.is_alphanumeric()
}

pub struct Lexer<'source> {
    src: &'source str,
    chars: Peekable<CharIndices<'source>>,
    buf: String,
}

impl<'source> Lexer<'source> {
    pub fn new(src: &'source str) -> Self {
        Self {
            src,
            chars: src.char_indices().peekable(),
            buf: String::new(),
        }
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    /// Offset just past the last consumed character.
    fn offset(&mut self) -> usize {
        self.chars.peek().map_or(self.src.len(), |&(i, _)| i)
    }

    fn skip_trivia(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.chars.next();
            } else if c == '#' {
                while !matches!(self.peek_char(), None | Some('\n')) {
                    self.chars.next();
                }
            } else {
                break;
            }
        }
    }

    /// Identifiers, keywords and `::`-namespaced names.
    fn scan_symbol(&mut self, start: usize) -> Spanned {
        self.buf.clear();
        loop {
            match self.peek_char() {
                Some(c) if continues_symbol(c) => {
                    self.buf.push(c);
                    self.chars.next();
                }
                Some(':') if self.src[self.offset()..].starts_with("::") => {
                    self.chars.next();
                    self.chars.next();
                    match self.peek_char() {
                        Some(c) if starts_symbol(c) => self.buf.push_str("::"),
                        c => {
                            return Err(ParseError::InvalidTokenCharacter {
                                token: format!("{}::", self.buf),
                                c: c.unwrap_or('\0'),
                                loc: self.offset(),
                            })
                        }
                    }
                }
                _ => break,
            }
        }
        let token = keyword(&self.buf).unwrap_or_else(|| Token::Symbol(Symbol::new(&self.buf)));
        Ok((start, token, self.offset()))
    }

    fn scan_string(&mut self, start: usize) -> Spanned {
        self.buf.clear();
        self.chars.next();
        loop {
            match self.chars.next() {
                None => return Err(ParseError::UnrecognizedEOF { loc: self.src.len() }),
                Some((i, '\n')) => {
                    return Err(ParseError::InvalidTokenCharacter {
                        token: self.buf.clone(),
                        c: '\n',
                        loc: i,
                    })
                }
                Some((_, '"')) => break,
                Some((i, '\\')) => {
                    let escaped = match self.chars.next() {
                        Some((_, 'n')) => '\n',
                        Some((_, 't')) => '\t',
                        Some((_, 'r')) => '\r',
                        Some((_, '"')) => '"',
                        Some((_, '\\')) => '\\',
                        Some((_, c)) => {
                            return Err(ParseError::InvalidEscape {
                                token: c.to_string(),
                                loc: i,
                            })
                        }
                        None => return Err(ParseError::UnrecognizedEOF { loc: self.src.len() }),
                    };
                    self.buf.push(escaped);
                }
                Some((_, c)) => self.buf.push(c),
            }
        }
        Ok((start, Token::String(self.buf.clone()), self.offset()))
    }

    fn take_digits(&mut self) {
        while let Some(c) = self.peek_char().filter(char::is_ascii_digit) {
            self.buf.push(c);
            self.chars.next();
        }
    }

    fn scan_number(&mut self, start: usize) -> Spanned {
        self.buf.clear();
        self.take_digits();
        let mut is_float = false;

        // `1.foo` is a field lookup on 1. A digit or an exponent after the
        // dot makes a float, so `1.e` is a malformed float.
        let rest = &self.src[self.offset()..];
        if rest.starts_with('.')
            && rest[1..].starts_with(|c: char| c.is_ascii_digit() || c == 'e' || c == 'E')
        {
            is_float = true;
            self.buf.push('.');
            self.chars.next();
            self.take_digits();
        }

        if let Some(e @ ('e' | 'E')) = self.peek_char() {
            is_float = true;
            self.buf.push(e);
            self.chars.next();
            if let Some(sign @ ('+' | '-')) = self.peek_char() {
                self.buf.push(sign);
                self.chars.next();
            }
            self.take_digits();
        }

        let end = self.offset();
        let token = if is_float {
            f64::from_str(&self.buf)
                .map(Token::Float)
                .map_err(|_| ParseError::InvalidFloat {
                    token: self.buf.clone(),
                    loc: start,
                })?
        } else {
            i64::from_str(&self.buf)
                .map(Token::Integer)
                .map_err(|_| ParseError::IntegerOverflow {
                    token: self.buf.clone(),
                    loc: start,
                })?
        };
        Ok((start, token, end))
    }

    /// `first` alone, or `second` when followed by `next`.
    fn scan_op(&mut self, start: usize, first: Option<Token>, next: char, second: Token) -> Spanned {
        let c = self.chars.next().map_or('\0', |(_, c)| c);
        if self.peek_char() == Some(next) {
            self.chars.next();
            return Ok((start, second, start + 2));
        }
        match first {
            Some(token) => Ok((start, token, start + 1)),
            None => Err(ParseError::InvalidTokenCharacter {
                token: c.to_string(),
                c: self.peek_char().unwrap_or('\0'),
                loc: start + 1,
            }),
        }
    }

    fn single(&mut self, start: usize, token: Token) -> Spanned {
        self.chars.next();
        Ok((start, token, start + 1))
    }
}

impl<'source> Iterator for Lexer<'source> {
    type Item = Spanned;

    fn next(&mut self) -> Option<Self::Item> {
        self.skip_trivia();
        let (i, c) = *self.chars.peek()?;
        Some(match c {
            c if starts_symbol(c) => self.scan_symbol(i),
            '0'..='9' => self.scan_number(i),
            '"' => self.scan_string(i),
            ':' => self.scan_op(i, Some(Token::Colon), '=', Token::Assign),
            '=' => self.scan_op(i, Some(Token::Unify), '=', Token::Eq),
            '<' => self.scan_op(i, Some(Token::Lt), '=', Token::Leq),
            '>' => self.scan_op(i, Some(Token::Gt), '=', Token::Geq),
            '!' => self.scan_op(i, None, '=', Token::Neq),
            '?' => self.scan_op(i, None, '=', Token::Query),
            ',' => self.single(i, Token::Comma),
            '[' => self.single(i, Token::LB),
            ']' => self.single(i, Token::RB),
            '{' => self.single(i, Token::LCB),
            '}' => self.single(i, Token::RCB),
            '(' => self.single(i, Token::LP),
            ')' => self.single(i, Token::RP),
            '.' => self.single(i, Token::Dot),
            '+' => self.single(i, Token::Add),
            '-' => self.single(i, Token::Sub),
            '*' => self.single(i, Token::Mul),
            '/' => self.single(i, Token::Div),
            '%' => self.single(i, Token::Rem),
            ';' => self.single(i, Token::SemiColon),
            c => {
                self.chars.next();
                Err(ParseError::InvalidTokenCharacter {
                    token: String::new(),
                    c,
                    loc: i,
                })
            }
        })
    }
}
