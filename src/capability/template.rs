//! Command-template tokenization and placeholder substitution.
//!
//! The template is split into argv tokens first (honouring single quotes,
//! double quotes and backslash escapes), and only then are `{{key}}`
//! placeholders replaced inside each token. Argument values are inserted as
//! literal text: they can never introduce new tokens, quotes or shell syntax,
//! and no shell is ever involved in running the result.

use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("template is empty")]
    Empty,

    #[error("unterminated quote in template")]
    UnterminatedQuote,

    #[error("unresolved placeholder(s): {}", .0.join(", "))]
    Unresolved(Vec<String>),
}

/// A fully resolved command: executable plus argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("static regex"))
}

fn brace_pair_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{.*?\}\}").expect("static regex"))
}

fn well_formed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\{\{\s*[A-Za-z0-9_.\-]+\s*\}\}$").expect("static regex"))
}

/// `{{...}}` spans whose key is not a valid placeholder name, plus any
/// unclosed `{{`. These can never be resolved by an argument.
pub fn malformed_placeholders(template: &str) -> Vec<String> {
    let mut malformed: Vec<String> = brace_pair_re()
        .find_iter(template)
        .map(|m| m.as_str())
        .filter(|span| !well_formed_re().is_match(span))
        .map(str::to_string)
        .collect();
    let rest = brace_pair_re().replace_all(template, "");
    if let Some(start) = rest.find("{{") {
        malformed.push(rest[start..].to_string());
    }
    malformed
}

/// Placeholder keys referenced by a template, sorted and de-duplicated.
pub fn placeholders(template: &str) -> BTreeSet<String> {
    placeholder_re()
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .collect()
}

/// Split a template into tokens without interpreting placeholders.
fn tokenize(template: &str) -> Result<Vec<String>, TemplateError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            // Placeholders are copied verbatim so `{{ key }}` survives splitting.
            '{' if chars.peek() == Some(&'{') => {
                in_token = true;
                current.push_str("{{");
                chars.next();
                let mut prev = '\0';
                for ch in chars.by_ref() {
                    current.push(ch);
                    if prev == '}' && ch == '}' {
                        break;
                    }
                    prev = ch;
                }
            }
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err(TemplateError::UnterminatedQuote),
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch) => current.push(ch),
                            None => return Err(TemplateError::UnterminatedQuote),
                        },
                        Some(ch) => current.push(ch),
                        None => return Err(TemplateError::UnterminatedQuote),
                    }
                }
            }
            '\\' => {
                in_token = true;
                if let Some(ch) = chars.next() {
                    current.push(ch);
                }
            }
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Resolve a template against caller-supplied arguments.
///
/// Every placeholder must be satisfied; a missing key is an error listing all
/// unresolved names, followed by any malformed placeholder text. Arguments no
/// placeholder refers to are ignored.
pub fn interpolate(
    template: &str,
    arguments: &HashMap<String, String>,
) -> Result<CommandLine, TemplateError> {
    if template.trim().is_empty() {
        return Err(TemplateError::Empty);
    }

    let mut missing: Vec<String> = placeholders(template)
        .into_iter()
        .filter(|key| !arguments.contains_key(key))
        .collect();
    missing.extend(malformed_placeholders(template));
    if !missing.is_empty() {
        return Err(TemplateError::Unresolved(missing));
    }

    for key in arguments.keys() {
        if !placeholder_re()
            .captures_iter(template)
            .any(|c| &c[1] == key.as_str())
        {
            log::debug!("Argument '{}' is not referenced by the template", key);
        }
    }

    let mut resolved = Vec::new();
    for token in tokenize(template)? {
        // replace_all with a closure never re-scans inserted text, so values
        // containing "{{x}}" stay literal.
        let value = placeholder_re().replace_all(&token, |caps: &regex::Captures| {
            arguments.get(&caps[1]).cloned().unwrap_or_default()
        });
        resolved.push(value.into_owned());
    }

    let mut iter = resolved.into_iter();
    let program = iter.next().filter(|p| !p.is_empty()).ok_or(TemplateError::Empty)?;
    Ok(CommandLine {
        program,
        args: iter.collect(),
    })
}
