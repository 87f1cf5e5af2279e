//! Shell-safe command interpolation
//!
//! The builder takes literal parts and interpolated values and renders
//! them for a target shell: with a shell active every value is quoted;
//! with the shell off, values carrying shell metacharacters are rejected
//! outright, since nothing downstream would neutralize them. A raw
//! variant skips escaping for callers that build their own quoting.

use std::borrow::Cow;

use super::Shell;
use crate::error::{Error, Result};

/// Quote a single value for the POSIX shell.
pub fn quote(value: &str) -> Cow<'_, str> {
    shell_words::quote(value)
}

/// Characters that change meaning if they reach a shell unescaped.
const METACHARACTERS: &[char] = &[
    '$', '`', ';', '|', '&', '<', '>', '(', ')', '\'', '"', '\n',
];

/// Refuse values that could not be interpolated literally without a
/// shell to honor quoting.
fn reject_metacharacters(value: &str) -> Result<()> {
    if let Some(c) = value.chars().find(|c| METACHARACTERS.contains(c)) {
        return Err(Error::Validation(format!(
            "interpolated value contains shell metacharacter {:?} but no shell is active: {:?}",
            c, value
        )));
    }
    Ok(())
}

fn check_arity(parts: &[&str], values: &[&str]) -> Result<()> {
    if parts.len() != values.len() + 1 {
        return Err(Error::Validation(format!(
            "template needs {} values, got {}",
            parts.len().saturating_sub(1),
            values.len()
        )));
    }
    Ok(())
}

/// Interpolate `values` between `parts` for the given shell.
///
/// `parts` has exactly one more element than `values`, like the segments
/// of a template literal around its interpolations. Values are quoted
/// when `shell` is active; with `Shell::Off` a value containing shell
/// metacharacters is a validation error.
pub fn interpolate(shell: &Shell, parts: &[&str], values: &[&str]) -> Result<String> {
    check_arity(parts, values)?;

    let mut out = String::new();
    for (i, part) in parts.iter().enumerate() {
        out.push_str(part);
        if let Some(value) = values.get(i) {
            match shell {
                Shell::Off => {
                    reject_metacharacters(value)?;
                    out.push_str(value);
                }
                _ => out.push_str(&quote(value)),
            }
        }
    }
    Ok(out)
}

/// Interpolate without escaping or checks. For advanced callers only.
pub fn interpolate_raw(parts: &[&str], values: &[&str]) -> Result<String> {
    check_arity(parts, values)?;

    let mut out = String::new();
    for (i, part) in parts.iter().enumerate() {
        out.push_str(part);
        if let Some(value) = values.get(i) {
            out.push_str(value);
        }
    }
    Ok(out)
}

/// A reusable named template: literal parts with `{}` placeholders.
#[derive(Debug, Clone)]
pub struct CommandTemplate {
    parts: Vec<String>,
}

impl CommandTemplate {
    /// Parse a template string; `{}` marks each interpolation point and
    /// `{{`/`}}` escape literal braces.
    pub fn parse(template: &str) -> Result<Self> {
        let mut parts = vec![String::new()];
        let mut chars = template.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    parts.last_mut().unwrap().push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    parts.last_mut().unwrap().push('}');
                }
                '{' if chars.peek() == Some(&'}') => {
                    chars.next();
                    parts.push(String::new());
                }
                '{' | '}' => {
                    return Err(Error::Validation(format!(
                        "unbalanced brace in template: {}",
                        template
                    )))
                }
                _ => parts.last_mut().unwrap().push(c),
            }
        }

        Ok(Self { parts })
    }

    /// Number of values the template expects.
    pub fn arity(&self) -> usize {
        self.parts.len() - 1
    }

    /// Render for the given shell: quoted values when a shell is active,
    /// metacharacter rejection when it is off.
    pub fn render(&self, shell: &Shell, values: &[&str]) -> Result<String> {
        let parts: Vec<&str> = self.parts.iter().map(String::as_str).collect();
        interpolate(shell, &parts, values)
    }

    /// Render without escaping.
    pub fn render_raw(&self, values: &[&str]) -> Result<String> {
        let parts: Vec<&str> = self.parts.iter().map(String::as_str).collect();
        interpolate_raw(&parts, values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpolate_quotes_values() {
        let line = interpolate(&Shell::Default, &["grep ", " /var/log"], &["two words"]).unwrap();
        assert_eq!(line, "grep 'two words' /var/log");
    }

    #[test]
    fn test_interpolate_escapes_metacharacters() {
        let line = interpolate(&Shell::Default, &["echo ", ""], &["$(rm -rf /)"]).unwrap();
        assert_eq!(line, "echo '$(rm -rf /)'");
    }

    #[test]
    fn test_shell_off_rejects_metacharacters() {
        for hostile in [
            "$(reboot)",
            "`id`",
            "a;b",
            "a|b",
            "a&b",
            "a>b",
            "a<b",
            "(sub)",
            "has'quote",
            "has\"quote",
            "line\nbreak",
        ] {
            let result = interpolate(&Shell::Off, &["run ", ""], &[hostile]);
            assert!(
                matches!(result, Err(Error::Validation(_))),
                "{:?} should be rejected without a shell",
                hostile
            );
        }
    }

    #[test]
    fn test_shell_off_passes_clean_values_unquoted() {
        let line = interpolate(&Shell::Off, &["run ", " done"], &["plain-value_1.2"]).unwrap();
        assert_eq!(line, "run plain-value_1.2 done");
    }

    #[test]
    fn test_interpolate_raw_passes_through() {
        let line = interpolate_raw(&["echo ", ""], &["$HOME"]).unwrap();
        assert_eq!(line, "echo $HOME");
    }

    #[test]
    fn test_arity_mismatch() {
        assert!(interpolate(&Shell::Default, &["a ", " b"], &[]).is_err());
        assert!(interpolate(&Shell::Default, &["a"], &["x"]).is_err());
        assert!(interpolate_raw(&["a ", " b"], &[]).is_err());
    }

    #[test]
    fn test_template_parse_and_render() {
        let template = CommandTemplate::parse("tar czf {} {}").unwrap();
        assert_eq!(template.arity(), 2);

        let line = template
            .render(&Shell::Default, &["out.tgz", "dir with spaces"])
            .unwrap();
        assert_eq!(line, "tar czf out.tgz 'dir with spaces'");
    }

    #[test]
    fn test_template_render_shell_off() {
        let template = CommandTemplate::parse("install {}").unwrap();

        assert_eq!(
            template.render(&Shell::Off, &["pkg-name"]).unwrap(),
            "install pkg-name"
        );
        assert!(template.render(&Shell::Off, &["pkg;rm -rf /"]).is_err());
    }

    #[test]
    fn test_template_literal_braces() {
        let template = CommandTemplate::parse("awk '{{print $1}}' {}").unwrap();
        assert_eq!(template.arity(), 1);
        assert_eq!(
            template.render(&Shell::Default, &["f.txt"]).unwrap(),
            "awk '{print $1}' f.txt"
        );
    }

    #[test]
    fn test_template_unbalanced_brace() {
        assert!(CommandTemplate::parse("echo {").is_err());
    }
}
