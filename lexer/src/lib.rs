pub mod scanner;
pub mod token;

pub use scanner::{ImportGraph, ScanError, Scanner};
pub use token::{Token, TokenKind};

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn scan(src: &str) -> Vec<Token> {
        let mut imports = ImportGraph::new();
        Scanner::new(src, Rc::from("<test>"), &mut imports)
            .scan_all()
            .expect("scan should succeed")
    }

    fn kinds(src: &str) -> Vec<TokenKind> {
        scan(src).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn scans_arithmetic() {
        use TokenKind::*;
        assert_eq!(
            kinds("1 + 2 * 3"),
            vec![Number, Plus, Number, Star, Number, Eof]
        );
    }

    #[test]
    fn scans_keywords_not_identifiers() {
        use TokenKind::*;
        assert_eq!(kinds("if while class"), vec![If, While, Class, Eof]);
    }

    #[test]
    fn string_allows_embedded_newline_and_advances_line() {
        let tokens = scan("\"a\nb\" true");
        assert_eq!(tokens[0].kind, TokenKind::String);
        assert_eq!(tokens[0].lexeme.as_ref(), "a\nb");
        assert_eq!(tokens[1].line, 2);
    }

    #[test]
    fn number_followed_by_letter_is_an_error() {
        let mut imports = ImportGraph::new();
        let err = Scanner::new("1a", Rc::from("<test>"), &mut imports)
            .scan_all()
            .unwrap_err();
        assert!(err.message.contains("Invalid number"));
    }

    #[test]
    fn line_comment_is_skipped() {
        let tokens = scan("1 // comment\n+ 2");
        assert_eq!(
            tokens.iter().map(|t| t.kind).collect::<Vec<_>>(),
            vec![TokenKind::Number, TokenKind::Plus, TokenKind::Number, TokenKind::Eof]
        );
    }

    #[test]
    fn block_comment_is_skipped() {
        let tokens = kinds("1 /* block\nspanning lines */ + 2");
        use TokenKind::*;
        assert_eq!(tokens, vec![Number, Plus, Number, Eof]);
    }
}
