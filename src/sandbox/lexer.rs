//! 词法分析：源码 -> Token 序列（带行号）
//!
//! 圆括号/方括号内部的换行被忽略，其余换行作为语句分隔符。

use crate::sandbox::SandboxError;

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Tok {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    If,
    Else,
    For,
    In,
    True,
    False,
    Null,
    Tools,
    Agents,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Assign,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Bang,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Semi,
    Newline,
    Eof,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Token {
    pub tok: Tok,
    pub line: usize,
}

/// 保留字：不能作为变量名
pub(crate) const RESERVED: &[&str] = &[
    "if", "else", "for", "in", "true", "false", "null", "tools", "agents",
];

fn keyword(word: &str) -> Option<Tok> {
    Some(match word {
        "if" => Tok::If,
        "else" => Tok::Else,
        "for" => Tok::For,
        "in" => Tok::In,
        "true" => Tok::True,
        "false" => Tok::False,
        "null" => Tok::Null,
        "tools" => Tok::Tools,
        "agents" => Tok::Agents,
        _ => return None,
    })
}

pub(crate) fn tokenize(src: &str) -> Result<Vec<Token>, SandboxError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut line = 1;
    let mut depth: usize = 0;
    let mut i = 0;

    let syntax = |line: usize, message: String| SandboxError::Syntax { line, message };

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' => {
                if depth == 0 {
                    tokens.push(Token { tok: Tok::Newline, line });
                }
                line += 1;
                i += 1;
            }
            c if c.is_whitespace() => i += 1,
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '"' | '\'' => {
                let quote = c;
                let start_line = line;
                let mut s = String::new();
                i += 1;
                loop {
                    let Some(&ch) = chars.get(i) else {
                        return Err(syntax(start_line, "unterminated string literal".into()));
                    };
                    i += 1;
                    match ch {
                        ch if ch == quote => break,
                        '\\' => {
                            let Some(&esc) = chars.get(i) else {
                                return Err(syntax(line, "unterminated escape".into()));
                            };
                            i += 1;
                            s.push(match esc {
                                'n' => '\n',
                                't' => '\t',
                                'r' => '\r',
                                '0' => '\0',
                                other => other,
                            });
                        }
                        '\n' => {
                            line += 1;
                            s.push('\n');
                        }
                        other => s.push(other),
                    }
                }
                tokens.push(Token { tok: Tok::Str(s), line: start_line });
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '_') {
                    i += 1;
                }
                let mut is_float = false;
                if i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit() {
                    is_float = true;
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        is_float = true;
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text: String = chars[start..i].iter().filter(|ch| **ch != '_').collect();
                let tok = if is_float {
                    Tok::Float(
                        text.parse()
                            .map_err(|_| syntax(line, format!("invalid number: {text}")))?,
                    )
                } else {
                    match text.parse::<i64>() {
                        Ok(n) => Tok::Int(n),
                        Err(_) => Tok::Float(
                            text.parse()
                                .map_err(|_| syntax(line, format!("invalid number: {text}")))?,
                        ),
                    }
                };
                tokens.push(Token { tok, line });
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let tok = keyword(&word).unwrap_or(Tok::Ident(word));
                tokens.push(Token { tok, line });
            }
            _ => {
                let next = chars.get(i + 1).copied();
                let (tok, width) = match (c, next) {
                    ('=', Some('=')) => (Tok::EqEq, 2),
                    ('!', Some('=')) => (Tok::NotEq, 2),
                    ('<', Some('=')) => (Tok::Le, 2),
                    ('>', Some('=')) => (Tok::Ge, 2),
                    ('&', Some('&')) => (Tok::AndAnd, 2),
                    ('|', Some('|')) => (Tok::OrOr, 2),
                    ('=', _) => (Tok::Assign, 1),
                    ('!', _) => (Tok::Bang, 1),
                    ('<', _) => (Tok::Lt, 1),
                    ('>', _) => (Tok::Gt, 1),
                    ('+', _) => (Tok::Plus, 1),
                    ('-', _) => (Tok::Minus, 1),
                    ('*', _) => (Tok::Star, 1),
                    ('/', _) => (Tok::Slash, 1),
                    ('%', _) => (Tok::Percent, 1),
                    ('(', _) => (Tok::LParen, 1),
                    (')', _) => (Tok::RParen, 1),
                    ('[', _) => (Tok::LBracket, 1),
                    (']', _) => (Tok::RBracket, 1),
                    ('{', _) => (Tok::LBrace, 1),
                    ('}', _) => (Tok::RBrace, 1),
                    (',', _) => (Tok::Comma, 1),
                    (':', _) => (Tok::Colon, 1),
                    ('.', _) => (Tok::Dot, 1),
                    (';', _) => (Tok::Semi, 1),
                    (other, _) => {
                        return Err(syntax(line, format!("unexpected character '{other}'")));
                    }
                };
                match tok {
                    Tok::LParen | Tok::LBracket => depth += 1,
                    Tok::RParen | Tok::RBracket => depth = depth.saturating_sub(1),
                    _ => {}
                }
                tokens.push(Token { tok, line });
                i += width;
            }
        }
    }
    tokens.push(Token { tok: Tok::Eof, line });
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Tok> {
        tokenize(src).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn test_numbers_and_operators() {
        assert_eq!(
            toks("x = 25*4.5"),
            vec![
                Tok::Ident("x".into()),
                Tok::Assign,
                Tok::Int(25),
                Tok::Star,
                Tok::Float(4.5),
                Tok::Eof
            ]
        );
    }

    #[test]
    fn test_newlines_inside_parens_are_skipped() {
        let t = toks("f(1,\n2)\ny");
        assert_eq!(t.iter().filter(|t| **t == Tok::Newline).count(), 1);
    }

    #[test]
    fn test_string_escapes_and_comments() {
        assert_eq!(
            toks("'a\\n\"b' # note"),
            vec![Tok::Str("a\n\"b".into()), Tok::Eof]
        );
    }

    #[test]
    fn test_keywords() {
        assert_eq!(toks("tools agents")[..2], [Tok::Tools, Tok::Agents]);
    }

    #[test]
    fn test_unterminated_string_reports_line() {
        let err = tokenize("x = 1\ny = \"abc").unwrap_err();
        assert!(matches!(err, SandboxError::Syntax { line: 2, .. }));
    }
}
