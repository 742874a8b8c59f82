//! Lexical XML pretty-printer.
//!
//! Pure and total: any input produces some output, and input the
//! tokenizer cannot make sense of falls back to a naive line-break-only
//! reformat instead of erroring. The printer is structure-blind to tag
//! identity; it reacts only to the `<` / `</` / `/>` shape, so
//! mismatched tag names pass through unvalidated and extra closing tags
//! clamp the depth at zero.

use memchr::{memchr, memchr2, memmem};

use crate::config::FormatterConfig;

/// Options for [`format_xml`].
#[derive(Debug, Clone)]
pub struct FormatOptions {
    /// Spaces per indent level.
    pub indent_width: usize,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self { indent_width: 2 }
    }
}

impl From<&FormatterConfig> for FormatOptions {
    fn from(config: &FormatterConfig) -> Self {
        Self {
            indent_width: config.indent_width,
        }
    }
}

/// Reformat XML text: one token per line, two-phase (normalize then
/// reprint), with simple text-only elements collapsed onto one line.
pub fn format_xml(input: &str, options: &FormatOptions) -> String {
    let collapsed = collapse_inter_tag_whitespace(input);
    let tokens = tokenize(&collapsed);
    if tokens.is_empty() && !collapsed.trim().is_empty() {
        return fallback_format(input);
    }
    print_tokens(&tokens, options.indent_width)
}

/// Line-break-only reformat used when tokenization comes up empty for
/// non-empty input.
fn fallback_format(input: &str) -> String {
    input.trim().replace("><", ">\n<")
}

#[derive(Debug, Clone, Copy)]
enum Token<'a> {
    /// `<![CDATA[ ... ]]>`, payload untouched.
    Cdata(&'a str),
    /// `<!-- ... -->`, payload untouched.
    Comment(&'a str),
    /// `<` through the matching `>`, inclusive.
    Tag(&'a str),
    /// Maximal non-`<` run, already trimmed and non-empty.
    Text(&'a str),
}

/// Remove whitespace runs that sit directly between a `>` and the next
/// `<`. This erases pre-existing formatting without touching whitespace
/// inside text nodes, CDATA or comments.
fn collapse_inter_tag_whitespace(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'<' {
            if let Some(end) = opaque_span_end(input, i) {
                out.push_str(&input[i..end]);
                i = end;
                continue;
            }
        }
        if bytes[i] == b'>' {
            out.push('>');
            i += 1;
            let mut j = i;
            while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                j += 1;
            }
            if j > i && j < bytes.len() && bytes[j] == b'<' {
                i = j;
            }
            continue;
        }
        // Copy straight through to the next byte we care about.
        let next = memchr2(b'<', b'>', &bytes[i..])
            .map(|p| i + p)
            .unwrap_or(bytes.len());
        let next = next.max(i + 1);
        out.push_str(&input[i..next]);
        i = next;
    }

    out
}

/// End offset (exclusive) of a terminated CDATA section or comment
/// starting at `start`; `None` if `start` opens neither or the
/// terminator is missing.
fn opaque_span_end(input: &str, start: usize) -> Option<usize> {
    let rest = &input.as_bytes()[start..];
    if rest.starts_with(b"<![CDATA[") {
        memmem::find(&rest[9..], b"]]>").map(|p| start + 9 + p + 3)
    } else if rest.starts_with(b"<!--") {
        memmem::find(&rest[4..], b"-->").map(|p| start + 4 + p + 3)
    } else {
        None
    }
}

fn tokenize(input: &str) -> Vec<Token<'_>> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'<' {
            if let Some(end) = opaque_span_end(input, i) {
                let span = &input[i..end];
                if span.starts_with("<!--") {
                    tokens.push(Token::Comment(span));
                } else {
                    tokens.push(Token::Cdata(span));
                }
                i = end;
                continue;
            }
            // Plain tag; this branch is also the fallback for an
            // unterminated CDATA section or comment.
            match memchr(b'>', &bytes[i..]) {
                Some(gt) => {
                    let end = i + gt + 1;
                    tokens.push(Token::Tag(&input[i..end]));
                    i = end;
                }
                None => {
                    // No closing angle anywhere: the remainder is text.
                    let text = input[i..].trim();
                    if !text.is_empty() {
                        tokens.push(Token::Text(text));
                    }
                    break;
                }
            }
        } else {
            let end = memchr(b'<', &bytes[i..])
                .map(|p| i + p)
                .unwrap_or(bytes.len());
            let text = input[i..end].trim();
            if !text.is_empty() {
                tokens.push(Token::Text(text));
            }
            i = end;
        }
    }

    tokens
}

fn print_tokens(tokens: &[Token<'_>], indent_width: usize) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut depth: usize = 0;
    let mut i = 0;

    let indent = |depth: usize| " ".repeat(depth * indent_width);

    while i < tokens.len() {
        match tokens[i] {
            Token::Cdata(span) | Token::Comment(span) | Token::Text(span) => {
                lines.push(format!("{}{}", indent(depth), span));
                i += 1;
            }
            Token::Tag(tag) => {
                if tag.starts_with("<?") || tag.starts_with("<!") {
                    // Declarations and DOCTYPE: verbatim, column zero.
                    lines.push(tag.to_string());
                    i += 1;
                } else if tag.starts_with("</") {
                    depth = depth.saturating_sub(1);
                    lines.push(format!("{}{}", indent(depth), tag));
                    i += 1;
                } else if tag.ends_with("/>") {
                    lines.push(format!("{}{}", indent(depth), tag));
                    i += 1;
                } else {
                    // Simple element: opening tag, exactly one text
                    // token, then a closing tag collapse onto one line.
                    if let (Some(&Token::Text(text)), Some(&Token::Tag(close))) =
                        (tokens.get(i + 1), tokens.get(i + 2))
                    {
                        if close.starts_with("</") {
                            lines.push(format!("{}{}{}{}", indent(depth), tag, text, close));
                            i += 3;
                            continue;
                        }
                    }
                    lines.push(format!("{}{}", indent(depth), tag));
                    depth += 1;
                    i += 1;
                }
            }
        }
    }

    lines.retain(|line| !line.trim().is_empty());
    let mut out = String::new();
    for (idx, line) in lines.iter().enumerate() {
        if idx > 0 {
            out.push('\n');
        }
        out.push_str(line.trim_end());
    }
    out
}
