use crate::token::{Tok, TokKind};
use capsule_ast::span::Span;
use std::iter::Peekable;
use std::str::CharIndices;

/// On-demand tokenizer. Malformed input becomes a `TokKind::Error` token and
/// the parser decides how to report it.
pub struct Lexer<'a> {
    src: &'a str,
    chars: Peekable<CharIndices<'a>>,
}

fn keyword(word: &str) -> Option<TokKind> {
    let kind = match word {
        "fn" => TokKind::KwFn,
        "let" => TokKind::KwLet,
        "mut" => TokKind::KwMut,
        "if" => TokKind::KwIf,
        "else" => TokKind::KwElse,
        "while" => TokKind::KwWhile,
        "return" => TokKind::KwReturn,
        "true" => TokKind::KwTrue,
        "false" => TokKind::KwFalse,
        "nil" => TokKind::KwNil,
        _ => return None,
    };
    Some(kind)
}

fn pair(first: char, second: char) -> Option<TokKind> {
    let kind = match (first, second) {
        ('|', '|') => TokKind::OrOr,
        ('&', '&') => TokKind::AndAnd,
        ('=', '=') => TokKind::EqEq,
        ('!', '=') => TokKind::BangEq,
        ('<', '=') => TokKind::Le,
        ('>', '=') => TokKind::Ge,
        ('-', '>') => TokKind::Arrow,
        _ => return None,
    };
    Some(kind)
}

fn single(c: char) -> Option<TokKind> {
    let kind = match c {
        '(' => TokKind::LParen,
        ')' => TokKind::RParen,
        '{' => TokKind::LBrace,
        '}' => TokKind::RBrace,
        ',' => TokKind::Comma,
        ':' => TokKind::Colon,
        ';' => TokKind::Semicolon,
        '|' => TokKind::Pipe,
        '=' => TokKind::Eq,
        '+' => TokKind::Plus,
        '-' => TokKind::Minus,
        '*' => TokKind::Star,
        '/' => TokKind::Slash,
        '<' => TokKind::Lt,
        '>' => TokKind::Gt,
        '!' => TokKind::Bang,
        _ => return None,
    };
    Some(kind)
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self {
            src,
            chars: src.char_indices().peekable(),
        }
    }

    /// Byte offset of the next unread character.
    fn offset(&mut self) -> usize {
        self.chars.peek().map(|&(i, _)| i).unwrap_or(self.src.len())
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    fn finish(&mut self, kind: TokKind, start: usize) -> Tok {
        let end = self.offset();
        Tok {
            kind,
            span: Span {
                start: start as u32,
                end: end as u32,
            },
        }
    }

    fn skip_trivia(&mut self) {
        loop {
            while self.peek().is_some_and(char::is_whitespace) {
                self.chars.next();
            }
            let rest = self.offset();
            if !self.src[rest..].starts_with("//") {
                return;
            }
            while self.peek().is_some_and(|c| c != '\n') {
                self.chars.next();
            }
        }
    }

    /// Consumes characters while `pred` holds and returns the text from `start`.
    fn take_while(&mut self, start: usize, pred: impl Fn(char) -> bool) -> &'a str {
        while self.peek().is_some_and(&pred) {
            self.chars.next();
        }
        let end = self.offset();
        let src: &'a str = self.src;
        &src[start..end]
    }

    pub fn next_tok(&mut self) -> Tok {
        self.skip_trivia();
        let Some((start, c)) = self.chars.next() else {
            let end = self.src.len();
            return self.finish(TokKind::Eof, end);
        };

        if let Some(kind) = self.peek().and_then(|next| pair(c, next)) {
            self.chars.next();
            return self.finish(kind, start);
        }
        if let Some(kind) = single(c) {
            return self.finish(kind, start);
        }

        let kind = match c {
            '"' => self.string(),
            '0'..='9' => {
                let digits = self.take_while(start, |d| d.is_ascii_digit());
                digits
                    .parse::<i64>()
                    .map(TokKind::Int)
                    .unwrap_or_else(|_| {
                        TokKind::Error(format!("integer literal out of range: {}", digits))
                    })
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let word = self.take_while(start, |w| w.is_ascii_alphanumeric() || w == '_');
                keyword(word).unwrap_or_else(|| TokKind::Ident(word.to_string()))
            }
            other => TokKind::Error(format!("unexpected character '{}'", other)),
        };
        self.finish(kind, start)
    }

    /// Body of a string literal after the opening quote.
    fn string(&mut self) -> TokKind {
        let mut text = String::new();
        while let Some((_, c)) = self.chars.next() {
            match c {
                '"' => return TokKind::Str(text),
                '\\' => match self.chars.next() {
                    Some((_, 'n')) => text.push('\n'),
                    Some((_, 't')) => text.push('\t'),
                    Some((_, other)) => text.push(other),
                    None => break,
                },
                c => text.push(c),
            }
        }
        TokKind::Error("unterminated string literal".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokKind> {
        let mut lex = Lexer::new(src);
        std::iter::from_fn(|| Some(lex.next_tok()))
            .map(|t| t.kind)
            .take_while(|k| *k != TokKind::Eof)
            .collect()
    }

    #[test]
    fn pipes_and_or() {
        assert_eq!(
            kinds("|x| || a || b"),
            vec![
                TokKind::Pipe,
                TokKind::Ident("x".into()),
                TokKind::Pipe,
                TokKind::OrOr,
                TokKind::Ident("a".into()),
                TokKind::OrOr,
                TokKind::Ident("b".into()),
            ]
        );
    }

    #[test]
    fn generic_brackets_and_arrow() {
        assert_eq!(
            kinds("fn id<T>(x: T) -> T"),
            vec![
                TokKind::KwFn,
                TokKind::Ident("id".into()),
                TokKind::Lt,
                TokKind::Ident("T".into()),
                TokKind::Gt,
                TokKind::LParen,
                TokKind::Ident("x".into()),
                TokKind::Colon,
                TokKind::Ident("T".into()),
                TokKind::RParen,
                TokKind::Arrow,
                TokKind::Ident("T".into()),
            ]
        );
    }

    #[test]
    fn comments_and_spans() {
        let mut lex = Lexer::new("// note\n  mut // trailing\nx");
        let t = lex.next_tok();
        assert_eq!(t.kind, TokKind::KwMut);
        assert_eq!((t.span.start, t.span.end), (10, 13));
        let t = lex.next_tok();
        assert_eq!(t.kind, TokKind::Ident("x".into()));
        assert_eq!(lex.next_tok().kind, TokKind::Eof);
    }

    #[test]
    fn overflowing_int_is_error_token() {
        let toks = kinds("99999999999999999999");
        assert!(matches!(toks[0], TokKind::Error(_)));
    }

    #[test]
    fn unterminated_string_is_error_token() {
        let toks = kinds("\"open");
        assert_eq!(toks, vec![TokKind::Error("unterminated string literal".into())]);
    }

    #[test]
    fn unknown_char_is_error_token() {
        let toks = kinds("let @");
        assert_eq!(toks[0], TokKind::KwLet);
        assert!(matches!(toks[1], TokKind::Error(_)));
    }
}
