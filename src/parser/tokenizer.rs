//! Lowest layer of the streaming parser: turns a byte buffer into tag/text
//! tokens without requiring a complete document. Comments and processing
//! instructions are skipped; nothing here interprets element semantics.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Open {
        name: String,
        attrs: Vec<(String, String)>,
        self_closing: bool,
    },
    Close {
        name: String,
    },
    Text(String),
}

/// Result of attempting to pull the next token out of `buf`.
pub enum Step {
    /// Not enough buffered data to make progress; wait for more bytes.
    Incomplete,
    /// Consumed `usize` bytes with no token to emit (a comment or PI).
    Skip(usize),
    /// Consumed `usize` bytes and produced a token.
    Emit(Token, usize),
}

/// Find the index of `needle` in `haystack[from..]` without crossing quoted
/// attribute values, returning an absolute index into `haystack`.
fn find_tag_end(haystack: &[u8], from: usize) -> Option<usize> {
    let mut in_quote: Option<u8> = None;
    let mut i = from;
    while i < haystack.len() {
        let b = haystack[i];
        match in_quote {
            Some(q) if b == q => in_quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'\'' => in_quote = Some(b),
            None if b == b'>' => return Some(i),
            None => {}
        }
        i += 1;
    }
    None
}

fn parse_attrs(rest: &str) -> Vec<(String, String)> {
    let mut attrs = Vec::new();
    let mut chars = rest.char_indices().peekable();
    loop {
        // skip whitespace
        while matches!(chars.peek(), Some((_, c)) if c.is_whitespace()) {
            chars.next();
        }
        let name_start = match chars.peek() {
            Some((i, _)) => *i,
            None => break,
        };
        let mut name_end = name_start;
        while let Some((i, c)) = chars.peek() {
            if *c == '=' || c.is_whitespace() {
                break;
            }
            name_end = i + c.len_utf8();
            chars.next();
        }
        if name_end == name_start {
            break;
        }
        let name = &rest[name_start..name_end];
        while matches!(chars.peek(), Some((_, c)) if c.is_whitespace()) {
            chars.next();
        }
        if !matches!(chars.peek(), Some((_, '='))) {
            // attribute with no value; skip it and move on
            continue;
        }
        chars.next(); // consume '='
        while matches!(chars.peek(), Some((_, c)) if c.is_whitespace()) {
            chars.next();
        }
        let quote = match chars.peek() {
            Some((_, c)) if *c == '"' || *c == '\'' => *c,
            _ => continue,
        };
        chars.next();
        let val_start = match chars.peek() {
            Some((i, _)) => *i,
            None => break,
        };
        let mut val_end = val_start;
        for (i, c) in chars.by_ref() {
            if c == quote {
                val_end = i;
                break;
            }
            val_end = i + c.len_utf8();
        }
        attrs.push((name.to_string(), rest[val_start..val_end].to_string()));
    }
    attrs
}

pub fn next_step(buf: &[u8]) -> Step {
    if buf.is_empty() {
        return Step::Incomplete;
    }
    if buf[0] == b'<' {
        let end = match find_tag_end(buf, 1) {
            Some(e) => e,
            None => return Step::Incomplete,
        };
        let inner = String::from_utf8_lossy(&buf[1..end]).into_owned();
        let consumed = end + 1;
        if inner.starts_with('!') || inner.starts_with('?') {
            return Step::Skip(consumed);
        }
        if let Some(name) = inner.strip_prefix('/') {
            return Step::Emit(
                Token::Close {
                    name: name.trim().to_string(),
                },
                consumed,
            );
        }
        let self_closing = inner.trim_end().ends_with('/');
        let body = if self_closing {
            inner.trim_end().trim_end_matches('/')
        } else {
            inner.as_str()
        };
        let name_end = body
            .find(|c: char| c.is_whitespace())
            .unwrap_or(body.len());
        let name = body[..name_end].trim().to_string();
        let attrs = parse_attrs(&body[name_end..]);
        if name.is_empty() {
            return Step::Skip(consumed);
        }
        Step::Emit(
            Token::Open {
                name,
                attrs,
                self_closing,
            },
            consumed,
        )
    } else {
        match buf.iter().position(|&b| b == b'<') {
            Some(idx) => {
                let text = String::from_utf8_lossy(&buf[..idx]).into_owned();
                Step::Emit(Token::Text(text), idx)
            }
            None => Step::Incomplete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emit(buf: &[u8]) -> (Token, usize) {
        match next_step(buf) {
            Step::Emit(t, n) => (t, n),
            Step::Skip(_) => panic!("unexpected skip"),
            Step::Incomplete => panic!("unexpected incomplete"),
        }
    }

    #[test]
    fn parses_open_tag_with_attrs() {
        let (tok, n) = emit(br#"<traceentry pid="100" time="2000">rest"#);
        assert_eq!(
            tok,
            Token::Open {
                name: "traceentry".into(),
                attrs: vec![
                    ("pid".into(), "100".into()),
                    ("time".into(), "2000".into())
                ],
                self_closing: false,
            }
        );
        assert_eq!(n, br#"<traceentry pid="100" time="2000">"#.len());
    }

    #[test]
    fn parses_close_tag() {
        let (tok, _) = emit(b"</traceentry>junk");
        assert_eq!(
            tok,
            Token::Close {
                name: "traceentry".into()
            }
        );
    }

    #[test]
    fn incomplete_tag_waits_for_more_bytes() {
        assert!(matches!(next_step(b"<traceentry pid=\"1"), Step::Incomplete));
    }

    #[test]
    fn incomplete_text_waits_for_more_bytes() {
        assert!(matches!(next_step(b"hello"), Step::Incomplete));
    }

    #[test]
    fn self_closing_tag_is_flagged() {
        let (tok, _) = emit(b"<key enabled=\"true\"/>");
        assert_eq!(
            tok,
            Token::Open {
                name: "key".into(),
                attrs: vec![("enabled".into(), "true".into())],
                self_closing: true,
            }
        );
    }
}
