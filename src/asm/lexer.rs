use logos::Logos;

use super::{AsmError, Span, codes};

#[derive(Logos, Debug, PartialEq, Clone)]
#[logos(skip r"[ \t\r]+")]
#[logos(skip(r";[^\n]*", allow_greedy = true))]
pub enum Token {
    /// `.func`, `.end`, `.line`, `.native`; stored without the dot.
    #[regex(r"\.[a-z]+", |lex| lex.slice()[1..].to_string())]
    Directive(String),

    #[regex(r"-?[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    #[regex(r"-?0[xX][0-9a-fA-F]+", |lex| parse_hex(lex.slice()))]
    Int(i64),
    #[regex(r"-?[0-9]+\.[0-9]+([eE][+-]?[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    Float(f64),
    #[regex(r#""([^"\\\n]|\\.)*""#, |lex| unescape(lex.slice()))]
    Str(String),

    /// Mnemonics, registers, labels and function names alike; the parser
    /// tells them apart by position and shape.
    #[regex(r"[A-Za-z_][A-Za-z0-9_.]*", |lex| lex.slice().to_string())]
    Ident(String),

    #[token(",")]
    Comma,
    #[token(":")]
    Colon,
    #[token("#")]
    Hash,
    #[token("@")]
    At,
    #[token("&")]
    Amp,
    #[token("~")]
    Tilde,

    #[token("\n")]
    Newline,
}

impl Token {
    pub fn describe(&self) -> String {
        match self {
            Token::Directive(d) => format!("directive `.{d}`"),
            Token::Int(v) => format!("integer `{v}`"),
            Token::Float(v) => format!("float `{v:?}`"),
            Token::Str(s) => format!("string {s:?}"),
            Token::Ident(s) => format!("`{s}`"),
            Token::Comma => "`,`".into(),
            Token::Colon => "`:`".into(),
            Token::Hash => "`#`".into(),
            Token::At => "`@`".into(),
            Token::Amp => "`&`".into(),
            Token::Tilde => "`~`".into(),
            Token::Newline => "end of line".into(),
        }
    }
}

fn parse_hex(text: &str) -> Option<i64> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let v = i64::from_str_radix(&digits[2..], 16).ok()?;
    Some(if negative { -v } else { v })
}

fn unescape(quoted: &str) -> Option<String> {
    let inner = &quoted[1..quoted.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            '0' => out.push('\0'),
            '\\' => out.push('\\'),
            '"' => out.push('"'),
            _ => return None,
        }
    }
    Some(out)
}

pub type Spanned = (Token, Span);

/// Lex assembly text into tokens with byte spans.
pub fn lex(source: &str) -> Result<Vec<Spanned>, AsmError> {
    let mut lexer = Token::lexer(source);
    let mut tokens = Vec::new();
    while let Some(result) = lexer.next() {
        let range = lexer.span();
        let span = Span { start: range.start, end: range.end };
        match result {
            Ok(token) => tokens.push((token, span)),
            Err(()) => {
                let snippet = &source[range];
                let hint = if snippet.starts_with('"') {
                    Some("string escapes are \\n \\t \\0 \\\\ and \\\"".to_string())
                } else {
                    None
                };
                return Err(AsmError {
                    span,
                    message: format!("unexpected input `{snippet}`"),
                    code: codes::LEX,
                    hint,
                });
            }
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<Token> {
        lex(src).unwrap().into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn instruction_line() {
        assert_eq!(
            kinds("add_ri d0, d1, -5 ; trailing comment\n"),
            vec![
                Token::Ident("add_ri".into()),
                Token::Ident("d0".into()),
                Token::Comma,
                Token::Ident("d1".into()),
                Token::Comma,
                Token::Int(-5),
                Token::Newline,
            ]
        );
    }

    #[test]
    fn literals() {
        assert_eq!(kinds("0x1F"), vec![Token::Int(31)]);
        assert_eq!(kinds("#1.5"), vec![Token::Hash, Token::Float(1.5)]);
        assert_eq!(kinds(r#"#"a\"b\n""#), vec![Token::Hash, Token::Str("a\"b\n".into())]);
        assert_eq!(kinds("f2:3"), vec![Token::Ident("f2".into()), Token::Colon, Token::Int(3)]);
    }

    #[test]
    fn directives_and_dotted_names() {
        assert_eq!(
            kinds(".func Actor.Tick"),
            vec![Token::Directive("func".into()), Token::Ident("Actor.Tick".into())]
        );
    }

    #[test]
    fn bad_character_reports_span() {
        let err = lex("li d0, $3").unwrap_err();
        assert_eq!(err.span, Span { start: 7, end: 8 });
        assert_eq!(err.code, codes::LEX);
    }
}
