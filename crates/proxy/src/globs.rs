//! Module path matching against comma-separated glob lists

use glob::{MatchOptions, Pattern};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Reports whether any path prefix of `target` matches one of the glob
/// patterns in the comma-separated `globs` list.
///
/// A pattern with N slashes is matched against the first N+1 path elements
/// of `target`. `*` and `?` never match `/`, `\` escapes the next character
/// and `**` is the same as `*`. Empty and malformed patterns are skipped.
pub fn globs_match_path(globs: &str, target: &str) -> bool {
    globs
        .split(',')
        .filter(|glob| !glob.is_empty())
        .any(|glob| glob_matches_prefix(glob, target))
}

fn glob_matches_prefix(glob: &str, target: &str) -> bool {
    let Some(prefix) = path_prefix(target, glob.matches('/').count()) else {
        return false;
    };

    match compile(glob) {
        Some(pattern) => pattern.matches_with(prefix, MATCH_OPTIONS),
        None => false,
    }
}

/// First `slashes + 1` elements of `target`, or `None` when it has fewer.
fn path_prefix(target: &str, slashes: usize) -> Option<&str> {
    let mut remaining = slashes;
    for (i, b) in target.bytes().enumerate() {
        if b == b'/' {
            if remaining == 0 {
                return Some(&target[..i]);
            }
            remaining -= 1;
        }
    }

    if remaining > 0 {
        None
    } else {
        Some(target)
    }
}

fn compile(glob: &str) -> Option<Pattern> {
    Pattern::new(&translate(glob)?).ok()
}

/// Rewrite module-path glob syntax into the `glob` crate's dialect.
///
/// `\x` escapes become bracketed literals, runs of `*` collapse to one
/// (a star never crosses a `/`), and `[^...]` negation is spelled `[!...]`.
/// Returns `None` for a dangling escape or an unterminated or empty class.
fn translate(glob: &str) -> Option<String> {
    let mut out = String::with_capacity(glob.len());
    let mut chars = glob.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' => push_literal(&mut out, chars.next()?),
            '*' => {
                while chars.peek() == Some(&'*') {
                    chars.next();
                }
                out.push('*');
            }
            '[' => {
                let negated = matches!(chars.peek(), Some('^') | Some('!'));
                if negated {
                    chars.next();
                }

                let mut members = String::new();
                let mut close = false;
                let mut hyphen = false;
                loop {
                    match chars.next()? {
                        ']' => break,
                        '\\' => match chars.next()? {
                            ']' => close = true,
                            '-' => hyphen = true,
                            escaped => members.push(escaped),
                        },
                        member => members.push(member),
                    }
                }
                if members.is_empty() && !close && !hyphen {
                    return None;
                }

                // `]` is only literal first in a class and `-` only last
                out.push('[');
                if negated {
                    out.push('!');
                }
                if close {
                    out.push(']');
                }
                out.push_str(&members);
                if hyphen {
                    out.push('-');
                }
                out.push(']');
            }
            ']' => push_literal(&mut out, c),
            c => out.push(c),
        }
    }

    Some(out)
}

fn push_literal(out: &mut String, c: char) {
    match c {
        '*' | '?' | '[' | ']' => {
            out.push('[');
            out.push(c);
            out.push(']');
        }
        c => out.push(c),
    }
}
