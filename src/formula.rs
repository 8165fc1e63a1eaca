//! Arithmetic expression compiler for algebraic conversions.
//!
//! MDF algebraic conversion blocks carry a textual MCD-2 MC formula over the
//! raw value, e.g. `(x - 40) * 1.5 ^ 2`. Formulas are compiled once per
//! channel into an [`Expr`] tree and evaluated per sample without
//! re-parsing. The grammar is deliberately small: numbers, the variable
//! `x`/`X`, `+ - * / ^` and parentheses. `^` is the power operator,
//! right-associative and binding tighter than unary minus.

use crate::{MdfError, MdfResult};

/// A compiled formula over one variable.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(f64),
    X,
    Neg(Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
    Pow(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn eval(&self, x: f64) -> f64 {
        match self {
            Expr::Num(n) => *n,
            Expr::X => x,
            Expr::Neg(e) => -e.eval(x),
            Expr::Add(a, b) => a.eval(x) + b.eval(x),
            Expr::Sub(a, b) => a.eval(x) - b.eval(x),
            Expr::Mul(a, b) => a.eval(x) * b.eval(x),
            Expr::Div(a, b) => a.eval(x) / b.eval(x),
            Expr::Pow(a, b) => a.eval(x).powf(b.eval(x)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Num(f64),
    X,
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
}

fn tokenize(src: &str) -> MdfResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let bytes = src.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '^' => {
                tokens.push(Token::Caret);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            'x' | 'X' => {
                tokens.push(Token::X);
                i += 1;
            }
            '0'..='9' | '.' => {
                let start = i;
                while i < bytes.len() && matches!(bytes[i] as char, '0'..='9' | '.') {
                    i += 1;
                }
                // Exponent suffix, e.g. 1.5e-3.
                if i < bytes.len() && matches!(bytes[i] as char, 'e' | 'E') {
                    let mut j = i + 1;
                    if j < bytes.len() && matches!(bytes[j] as char, '+' | '-') {
                        j += 1;
                    }
                    if j < bytes.len() && (bytes[j] as char).is_ascii_digit() {
                        i = j;
                        while i < bytes.len() && (bytes[i] as char).is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text = &src[start..i];
                let value = text
                    .parse::<f64>()
                    .map_err(|_| MdfError::BadFormula(format!("bad number `{text}`")))?;
                tokens.push(Token::Num(value));
            }
            other => {
                return Err(MdfError::BadFormula(format!(
                    "unexpected character `{other}` in formula `{src}`"
                )))
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    src: &'a str,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.peek();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn err(&self, what: &str) -> MdfError {
        MdfError::BadFormula(format!("{what} in formula `{}`", self.src))
    }

    fn primary(&mut self) -> MdfResult<Expr> {
        match self.bump() {
            Some(Token::Num(n)) => Ok(Expr::Num(n)),
            Some(Token::X) => Ok(Expr::X),
            Some(Token::Minus) => {
                // Unary minus binds looser than `^`: -x^2 is -(x^2).
                let operand = self.expr(5)?;
                Ok(Expr::Neg(Box::new(operand)))
            }
            Some(Token::LParen) => {
                let inner = self.expr(0)?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.err("missing `)`")),
                }
            }
            _ => Err(self.err("expected a value")),
        }
    }

    /// Precedence-climbing loop; `min_bp` is the smallest left binding power
    /// this call may consume.
    fn expr(&mut self, min_bp: u8) -> MdfResult<Expr> {
        let mut lhs = self.primary()?;
        loop {
            let (l_bp, r_bp, op) = match self.peek() {
                Some(Token::Plus) => (1, 2, Token::Plus),
                Some(Token::Minus) => (1, 2, Token::Minus),
                Some(Token::Star) => (3, 4, Token::Star),
                Some(Token::Slash) => (3, 4, Token::Slash),
                Some(Token::Caret) => (8, 7, Token::Caret),
                _ => break,
            };
            if l_bp < min_bp {
                break;
            }
            self.bump();
            let rhs = self.expr(r_bp)?;
            lhs = match op {
                Token::Plus => Expr::Add(Box::new(lhs), Box::new(rhs)),
                Token::Minus => Expr::Sub(Box::new(lhs), Box::new(rhs)),
                Token::Star => Expr::Mul(Box::new(lhs), Box::new(rhs)),
                Token::Slash => Expr::Div(Box::new(lhs), Box::new(rhs)),
                Token::Caret => Expr::Pow(Box::new(lhs), Box::new(rhs)),
                _ => unreachable!(),
            };
        }
        Ok(lhs)
    }
}

/// Compile formula text into an evaluable expression.
pub fn compile(src: &str) -> MdfResult<Expr> {
    let tokens = tokenize(src)?;
    if tokens.is_empty() {
        return Err(MdfError::BadFormula("empty formula".into()));
    }
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        src,
    };
    let expr = parser.expr(0)?;
    if parser.pos != tokens.len() {
        return Err(parser.err("trailing tokens"));
    }
    Ok(expr)
}
