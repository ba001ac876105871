//! Ivy-style repository layout patterns.
//!
//! A pattern such as `[organisation]/[module]/[revision]/[artifact]-[revision](-[classifier]).[ext]`
//! is turned into a concrete path (or a glob) for one artifact:
//!
//! - `[token]` is replaced by the token's value; tokens without a value are left intact
//! - `( ... )` is an optional group, dropped when none of its tokens has a value
//!
//! [`artifact_glob`] escapes substituted values so coordinates containing glob
//! metacharacters only ever match literally, while literal pattern text keeps
//! its glob meaning (`*`, `**`).

use crate::coordinates::ArtifactRevisionId;
use crate::error::{DepsCacheError, Result};
use std::borrow::Cow;
use std::collections::BTreeMap;

pub const ORGANISATION_PATH_TOKEN: &str = "organisation-path";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Piece<'a> {
    Literal(&'a str),
    Token(&'a str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part<'a> {
    Piece(Piece<'a>),
    Optional(Vec<Piece<'a>>),
}

fn push_piece<'a>(
    parts: &mut Vec<Part<'a>>,
    group: &mut Option<Vec<Piece<'a>>>,
    piece: Piece<'a>,
) {
    if let Piece::Literal("") = piece {
        return;
    }
    match group {
        Some(group) => group.push(piece),
        None => parts.push(Part::Piece(piece)),
    }
}

fn parse(pattern: &str) -> Result<Vec<Part<'_>>> {
    let invalid = |message: &str| DepsCacheError::InvalidPattern {
        pattern: pattern.to_owned(),
        message: message.to_owned(),
    };

    let mut parts = Vec::new();
    let mut group: Option<Vec<Piece<'_>>> = None;
    let mut literal_start = 0;
    let mut idx = 0;

    while idx < pattern.len() {
        match pattern.as_bytes()[idx] {
            b'[' => {
                let literal = Piece::Literal(&pattern[literal_start..idx]);
                push_piece(&mut parts, &mut group, literal);
                let end = pattern[idx..]
                    .find(']')
                    .map(|offset| idx + offset)
                    .ok_or_else(|| invalid("unterminated `[`"))?;
                let name = &pattern[idx + 1..end];
                if name.is_empty() {
                    return Err(invalid("empty token name"));
                }
                push_piece(&mut parts, &mut group, Piece::Token(name));
                idx = end + 1;
                literal_start = idx;
            }
            b'(' => {
                if group.is_some() {
                    return Err(invalid("nested optional groups are not supported"));
                }
                let literal = Piece::Literal(&pattern[literal_start..idx]);
                push_piece(&mut parts, &mut group, literal);
                group = Some(Vec::new());
                idx += 1;
                literal_start = idx;
            }
            b')' => {
                if group.is_none() {
                    return Err(invalid("unbalanced `)`"));
                }
                let literal = Piece::Literal(&pattern[literal_start..idx]);
                push_piece(&mut parts, &mut group, literal);
                if let Some(pieces) = group.take() {
                    parts.push(Part::Optional(pieces));
                }
                idx += 1;
                literal_start = idx;
            }
            _ => idx += 1,
        }
    }

    if group.is_some() {
        return Err(invalid("unterminated `(`"));
    }
    let literal = Piece::Literal(&pattern[literal_start..]);
    push_piece(&mut parts, &mut group, literal);
    Ok(parts)
}

fn render(
    parts: &[Part<'_>],
    tokens: &BTreeMap<String, String>,
    escape: impl Fn(&str) -> Cow<'_, str>,
) -> String {
    let value = |name: &str| tokens.get(name).filter(|value| !value.is_empty());

    let mut out = String::new();
    let render_piece = |piece: &Piece<'_>, out: &mut String| match *piece {
        Piece::Literal(text) => out.push_str(text),
        Piece::Token(name) => match value(name) {
            Some(value) => out.push_str(&escape(value.as_str())),
            None => out.push_str(&escape(&format!("[{name}]"))),
        },
    };

    for part in parts {
        match part {
            Part::Piece(piece) => render_piece(piece, &mut out),
            Part::Optional(group) => {
                let has_value = group
                    .iter()
                    .any(|piece| matches!(*piece, Piece::Token(name) if value(name).is_some()));
                if has_value {
                    for piece in group {
                        render_piece(piece, &mut out);
                    }
                }
            }
        }
    }
    out
}

/// Substitutes `tokens` into `pattern` without any escaping.
pub fn substitute(pattern: &str, tokens: &BTreeMap<String, String>) -> Result<String> {
    Ok(render(&parse(pattern)?, tokens, |value| Cow::Borrowed(value)))
}

/// The token values describing `artifact`.
pub fn artifact_tokens(artifact: &ArtifactRevisionId) -> BTreeMap<String, String> {
    let module = &artifact.module;
    let mut tokens = BTreeMap::new();
    for (key, value) in module
        .extra_attributes
        .iter()
        .chain(artifact.extra_attributes.iter())
    {
        tokens.insert(key.clone(), value.clone());
    }
    tokens.insert("organisation".into(), module.organisation.clone());
    tokens.insert("organization".into(), module.organisation.clone());
    tokens.insert("module".into(), module.name.clone());
    tokens.insert("revision".into(), module.revision.clone());
    tokens.insert("artifact".into(), artifact.name.clone());
    tokens.insert("type".into(), artifact.kind.clone());
    tokens.insert("ext".into(), artifact.ext.clone());
    tokens.insert(
        ORGANISATION_PATH_TOKEN.into(),
        module.organisation.replace('.', "/"),
    );
    tokens
}

/// The concrete (unescaped) path of `artifact` in a repository laid out by `pattern`.
pub fn artifact_path(pattern: &str, artifact: &ArtifactRevisionId) -> Result<String> {
    substitute(pattern, &artifact_tokens(artifact))
}

/// A glob matching the files of `artifact` in a tree laid out by `pattern`.
pub fn artifact_glob(pattern: &str, artifact: &ArtifactRevisionId) -> Result<String> {
    Ok(render(
        &parse(pattern)?,
        &artifact_tokens(artifact),
        escape_glob,
    ))
}

fn is_glob_meta(ch: char) -> bool {
    matches!(ch, '*' | '?' | '[' | ']' | '{' | '}' | '\\')
}

pub fn escape_glob(raw: &str) -> Cow<'_, str> {
    if !raw.chars().any(is_glob_meta) {
        return Cow::Borrowed(raw);
    }
    let mut out = String::with_capacity(raw.len() + 4);
    for ch in raw.chars() {
        if is_glob_meta(ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    Cow::Owned(out)
}

/// The longest directory prefix of `glob` that contains no glob syntax.
///
/// Returned with its trailing `/`, or empty when the first segment is already
/// a wildcard. Scans only need to start below this directory.
pub fn literal_dir_prefix(glob: &str) -> &str {
    let literal_end = glob.find(is_glob_meta).unwrap_or(glob.len());
    match glob[..literal_end].rfind('/') {
        Some(slash) => &glob[..=slash],
        None => "",
    }
}
