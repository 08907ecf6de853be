use kos::{
    parse_numeric, ErrorKind, Keyword, Lexer, NextTokenMode, Numeric, Op, Sep, StringEscape,
    Token, TokenKind,
};

/// Collect all significant tokens of a source string.
fn lex(source: &str) -> Vec<Token> {
    let mut lexer = Lexer::new(source);
    let mut tokens = Vec::new();
    loop {
        let token = lexer.next_token(NextTokenMode::Any).expect("lex error");
        match token.kind {
            TokenKind::Whitespace | TokenKind::Eol | TokenKind::Comment => continue,
            TokenKind::Eof => break,
            _ => tokens.push(token),
        }
    }
    tokens
}

fn lex_error(source: &str) -> kos::Error {
    let mut lexer = Lexer::new(source);
    loop {
        match lexer.next_token(NextTokenMode::Any) {
            Ok(token) if token.is_eof() => panic!("expected a lex error"),
            Ok(_) => continue,
            Err(err) => return err,
        }
    }
}

#[test]
fn test_tokens_basic() {
    let tokens = lex("var x = 1 + 2;");
    let kinds: Vec<TokenKind> = tokens.iter().map(|t| t.kind).collect();
    assert_eq!(
        kinds,
        vec![
            TokenKind::Keyword(Keyword::Var),
            TokenKind::Identifier,
            TokenKind::Operator(Op::Set),
            TokenKind::Numeric,
            TokenKind::Operator(Op::Add),
            TokenKind::Numeric,
            TokenKind::Separator(Sep::Semicolon),
        ]
    );
    assert_eq!(tokens[1].text("var x = 1 + 2;"), "x");
}

#[test]
fn test_tokens_keywords_vs_identifiers() {
    let src = "fun funny _ __line__ constructor construct";
    let tokens = lex(src);
    assert_eq!(tokens[0].kind, TokenKind::Keyword(Keyword::Fun));
    assert_eq!(tokens[1].kind, TokenKind::Identifier);
    assert_eq!(tokens[2].kind, TokenKind::Keyword(Keyword::Underscore));
    assert_eq!(tokens[3].kind, TokenKind::Keyword(Keyword::Line));
    assert_eq!(tokens[4].kind, TokenKind::Keyword(Keyword::Constructor));
    assert_eq!(tokens[5].kind, TokenKind::Identifier);
}

#[test]
fn test_tokens_operators_longest_match() {
    let tokens = lex("a >>>= b >>> c >> d > e");
    let ops: Vec<TokenKind> = tokens
        .iter()
        .filter(|t| matches!(t.kind, TokenKind::Operator(_)))
        .map(|t| t.kind)
        .collect();
    assert_eq!(
        ops,
        vec![
            TokenKind::Operator(Op::SetShru),
            TokenKind::Operator(Op::Shru),
            TokenKind::Operator(Op::Shr),
            TokenKind::Operator(Op::Gt),
        ]
    );
}

#[test]
fn test_tokens_two_dots_are_two_tokens() {
    let tokens = lex("a..b");
    let kinds: Vec<TokenKind> = tokens.iter().map(|t| t.kind).collect();
    assert_eq!(
        kinds,
        vec![
            TokenKind::Identifier,
            TokenKind::Operator(Op::Dot),
            TokenKind::Operator(Op::Dot),
            TokenKind::Identifier,
        ]
    );

    let tokens = lex("a...b");
    assert_eq!(tokens[1].kind, TokenKind::Operator(Op::More));
}

#[test]
fn test_tokens_tab_is_an_error() {
    let err = lex_error("var\tx = 1;");
    assert_eq!(err.kind, ErrorKind::ScanningFailed);
    assert_eq!(
        err.message,
        "unexpected tab character, tabs are not allowed"
    );
    assert_eq!((err.pos.line, err.pos.column), (1, 4));
}

#[test]
fn test_tokens_invalid_characters() {
    let err = lex_error("var $x = 1;");
    assert_eq!(err.message, "invalid character");

    let err = lex_error("var \u{00E9} = 1;");
    assert_eq!(err.message, "unexpected character");
}

#[test]
fn test_tokens_strings() {
    let tokens = lex(r#""hello" r"raw\n" "esc\t\x41\x{1F600}""#);
    assert_eq!(tokens[0].kind, TokenKind::String(StringEscape::Cooked));
    assert_eq!(tokens[1].kind, TokenKind::String(StringEscape::Raw));
    assert_eq!(tokens[2].kind, TokenKind::String(StringEscape::Cooked));
}

#[test]
fn test_tokens_string_errors() {
    assert_eq!(
        lex_error("\"abc").message,
        "unexpected end of file, unfinished string literal, expected '\"'"
    );
    assert_eq!(
        lex_error("\"abc\ndef\"").message,
        "unexpected end of line, unfinished string literal, expected '\"'"
    );
    assert_eq!(lex_error("\"\\q\"").message, "invalid escape sequence");
    assert_eq!(
        lex_error("\"\\x{}\"").message,
        "invalid escape sequence, no hex digits specified"
    );
    assert_eq!(
        lex_error("\"\\x{1234567}\"").message,
        "invalid escape sequence, more than 6 hex digits specified"
    );
}

#[test]
fn test_tokens_string_interpolation_handoff() {
    let src = "\"x=\\(1) y\"";
    let mut lexer = Lexer::new(src);

    let open = lexer.next_token(NextTokenMode::Any).unwrap();
    assert_eq!(open.kind, TokenKind::StringOpen);
    assert_eq!(open.text(src), "\"x=\\(");

    let num = lexer.next_token(NextTokenMode::Any).unwrap();
    assert_eq!(num.kind, TokenKind::Numeric);

    let close = lexer.next_token(NextTokenMode::Any).unwrap();
    assert_eq!(close.kind, TokenKind::Separator(Sep::ParenClose));

    // The parser pushes the `)` back and asks for a continuation.
    lexer.unget_token(&close);
    let rest = lexer.next_token(NextTokenMode::ContinueString).unwrap();
    assert_eq!(rest.kind, TokenKind::String(StringEscape::Cooked));
    assert_eq!(rest.text(src), ") y\"");
}

#[test]
fn test_tokens_numeric_forms() {
    let tokens = lex("0 42 1_000 0x1F 0b1010 1.5 1.5e3 2e-4 1p3 7.");
    assert!(tokens
        .iter()
        .take(10)
        .all(|t| t.kind == TokenKind::Numeric));
}

#[test]
fn test_tokens_numeric_errors() {
    assert_eq!(lex_error("01").message, "invalid decimal literal");
    assert_eq!(lex_error("1e01").message, "invalid decimal literal");
    assert_eq!(lex_error("12abc").message, "invalid decimal literal");
    assert_eq!(lex_error("0xZ").message, "hexadecimal digit expected");
    assert_eq!(
        lex_error("0b2").message,
        "unexpected character, binary digit expected"
    );
}

#[test]
fn test_tokens_comments() {
    let tokens = lex("1 # comment\n2 // another\n3 /* block\nstill */ 4");
    assert_eq!(tokens.len(), 4);
    assert!(tokens.iter().all(|t| t.kind == TokenKind::Numeric));
}

#[test]
fn test_tokens_bom_is_skipped() {
    let src = "\u{FEFF}var";
    let tokens = lex(src);
    assert_eq!(tokens[0].kind, TokenKind::Keyword(Keyword::Var));
    assert_eq!((tokens[0].pos.line, tokens[0].pos.column), (1, 1));
}

#[test]
fn test_tokens_length_limit() {
    let ok = "a".repeat(65535);
    let tokens = lex(&ok);
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].span.len(), 65535);

    let too_long = "a".repeat(65536);
    let err = lex_error(&too_long);
    assert_eq!(err.message, "token length exceeds 65535 bytes");
}

#[test]
fn test_tokens_positions_across_newlines() {
    let tokens = lex("a\nbb\r\nccc");
    assert_eq!((tokens[0].pos.line, tokens[0].pos.column), (1, 1));
    assert_eq!((tokens[1].pos.line, tokens[1].pos.column), (2, 1));
    assert_eq!((tokens[2].pos.line, tokens[2].pos.column), (3, 1));
}

#[test]
fn test_parse_numeric_values() {
    assert_eq!(parse_numeric("42"), Ok(Numeric::Integer(42)));
    assert_eq!(parse_numeric("1_000"), Ok(Numeric::Integer(1000)));
    assert_eq!(parse_numeric("0x1F"), Ok(Numeric::Integer(31)));
    assert_eq!(parse_numeric("0b1010"), Ok(Numeric::Integer(10)));
    assert_eq!(parse_numeric("1.5"), Ok(Numeric::Float(1.5)));
    assert_eq!(parse_numeric("1.5e3"), Ok(Numeric::Float(1500.0)));
    assert_eq!(parse_numeric("1p3"), Ok(Numeric::Float(1000.0)));
    assert_eq!(
        parse_numeric("9223372036854775807"),
        Ok(Numeric::Integer(i64::MAX))
    );
    assert_eq!(
        parse_numeric("9223372036854775808"),
        Err("number out of range")
    );
}
