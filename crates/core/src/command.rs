//! Worker command templates.
//!
//! A template such as
//! `python3 workers/generation.py --prompt {prompt} --out {output_dir}`
//! is split into a program and arguments once, with shell-like quoting.
//! Placeholders are substituted per argument afterwards, so a substituted
//! value never re-splits into several arguments and no shell is involved.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::error::CoreError;
use crate::job_class::JobClass;
use crate::types::DbId;

/// Regex pattern matching `{placeholder_name}` tokens.
const PLACEHOLDER_PATTERN: &str = r"\{(\w+)\}";

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(PLACEHOLDER_PATTERN).expect("valid regex"));

/// Placeholders filled from the job and the runtime layout rather than from
/// params.
pub const BUILTIN_PLACEHOLDERS: [&str; 6] = [
    "job_id",
    "job_class",
    "output_dir",
    "scratch_dir",
    "progress_file",
    "params_json",
];

/// A parsed, not yet rendered, worker command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    pub program: String,
    pub args: Vec<String>,
}

/// Everything a template may reference for one job.
#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    pub job_id: DbId,
    pub job_class: JobClass,
    pub output_dir: &'a Path,
    pub scratch_dir: &'a Path,
    pub progress_file: &'a Path,
    pub params: &'a Value,
}

/// A fully substituted command ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a command line into program and arguments.
    ///
    /// Supports single quotes (literal), double quotes (with `\"` and `\\`
    /// escapes) and backslash escapes outside quotes.
    pub fn parse(line: &str) -> Result<Self, CoreError> {
        let mut words = split_words(line)?.into_iter();
        let program = words
            .next()
            .ok_or_else(|| CoreError::Validation("command template is empty".to_string()))?;
        Ok(Self {
            program,
            args: words.collect(),
        })
    }

    /// Sorted, de-duplicated placeholder names used anywhere in the command.
    pub fn placeholders(&self) -> Vec<String> {
        let mut names: Vec<String> = std::iter::once(&self.program)
            .chain(self.args.iter())
            .flat_map(|part| PLACEHOLDER_RE.captures_iter(part))
            .map(|caps| caps[1].to_string())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Check that every placeholder resolves for the given params.
    ///
    /// Run at submission so a job never reaches the queue with a command
    /// that cannot be rendered.
    pub fn check_resolvable(&self, params: &Value) -> Result<(), CoreError> {
        let missing: Vec<String> = self
            .placeholders()
            .into_iter()
            .filter(|name| !BUILTIN_PLACEHOLDERS.contains(&name.as_str()))
            .filter(|name| params.get(name).is_none_or(Value::is_null))
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(CoreError::Validation(format!(
                "params missing values for command placeholders: {}",
                missing.join(", ")
            )))
        }
    }

    /// Substitute every placeholder.
    pub fn render(&self, ctx: &TemplateContext<'_>) -> Result<RenderedCommand, CoreError> {
        Ok(RenderedCommand {
            program: substitute(&self.program, ctx)?,
            args: self
                .args
                .iter()
                .map(|arg| substitute(arg, ctx))
                .collect::<Result<_, _>>()?,
        })
    }
}

impl std::fmt::Display for CommandTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn substitute(part: &str, ctx: &TemplateContext<'_>) -> Result<String, CoreError> {
    let mut out = String::with_capacity(part.len());
    let mut last = 0;
    for caps in PLACEHOLDER_RE.captures_iter(part) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&part[last..whole.start()]);
        out.push_str(&resolve(&caps[1], ctx)?);
        last = whole.end();
    }
    out.push_str(&part[last..]);
    Ok(out)
}

fn resolve(name: &str, ctx: &TemplateContext<'_>) -> Result<String, CoreError> {
    let value = match name {
        "job_id" => ctx.job_id.to_string(),
        "job_class" => ctx.job_class.as_str().to_string(),
        "output_dir" => ctx.output_dir.display().to_string(),
        "scratch_dir" => ctx.scratch_dir.display().to_string(),
        "progress_file" => ctx.progress_file.display().to_string(),
        "params_json" => ctx.params.to_string(),
        other => match ctx.params.get(other) {
            None | Some(Value::Null) => {
                return Err(CoreError::Validation(format!(
                    "no value for command placeholder {{{other}}}"
                )))
            }
            Some(Value::String(s)) => s.clone(),
            // Numbers and bools format plainly; arrays and objects as JSON.
            Some(v) => v.to_string(),
        },
    };
    Ok(value)
}

fn split_words(line: &str) -> Result<Vec<String>, CoreError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Quote {
        None,
        Single,
        Double,
    }

    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote = Quote::None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match quote {
            Quote::Single => match c {
                '\'' => quote = Quote::None,
                _ => current.push(c),
            },
            Quote::Double => match c {
                '"' => quote = Quote::None,
                '\\' => match chars.next() {
                    Some(next @ ('"' | '\\')) => current.push(next),
                    Some(next) => {
                        current.push('\\');
                        current.push(next);
                    }
                    None => current.push('\\'),
                },
                _ => current.push(c),
            },
            Quote::None => match c {
                '\'' => {
                    quote = Quote::Single;
                    in_word = true;
                }
                '"' => {
                    quote = Quote::Double;
                    in_word = true;
                }
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                    in_word = true;
                }
                c if c.is_whitespace() => {
                    if in_word {
                        words.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                _ => {
                    current.push(c);
                    in_word = true;
                }
            },
        }
    }

    if quote != Quote::None {
        return Err(CoreError::Validation(format!(
            "unterminated quote in command template: {line}"
        )));
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::path::PathBuf;

    fn ctx<'a>(params: &'a Value, dirs: &'a (PathBuf, PathBuf, PathBuf)) -> TemplateContext<'a> {
        TemplateContext {
            job_id: 42,
            job_class: JobClass::Generation,
            output_dir: &dirs.0,
            scratch_dir: &dirs.1,
            progress_file: &dirs.2,
            params,
        }
    }

    fn dirs() -> (PathBuf, PathBuf, PathBuf) {
        (
            PathBuf::from("/out/generation/42"),
            PathBuf::from("/scratch/42"),
            PathBuf::from("/scratch/42/progress"),
        )
    }

    #[test]
    fn parse_respects_quotes() {
        let t = CommandTemplate::parse(r#"sh -c 'echo "hi there"' --name "a b" c\ d"#).unwrap();
        assert_eq!(t.program, "sh");
        assert_eq!(t.args, vec!["-c", r#"echo "hi there""#, "--name", "a b", "c d"]);
    }

    #[test]
    fn parse_keeps_empty_quoted_argument() {
        let t = CommandTemplate::parse(r#"worker "" x"#).unwrap();
        assert_eq!(t.args, vec!["", "x"]);
    }

    #[test]
    fn parse_rejects_empty_and_unterminated() {
        assert_matches!(CommandTemplate::parse("   "), Err(CoreError::Validation(_)));
        assert_matches!(CommandTemplate::parse("sh -c 'oops"), Err(CoreError::Validation(_)));
    }

    #[test]
    fn placeholders_sorted_and_unique() {
        let t = CommandTemplate::parse("run {prompt} --out {output_dir} --again {prompt}").unwrap();
        assert_eq!(t.placeholders(), vec!["output_dir", "prompt"]);
    }

    #[test]
    fn render_substitutes_without_resplitting() {
        let t = CommandTemplate::parse("gen --prompt {prompt} --n {num_images} --out {output_dir}/img")
            .unwrap();
        let params = json!({"prompt": "a red fox; rm -rf /", "num_images": 4});
        let d = dirs();
        let rendered = t.render(&ctx(&params, &d)).unwrap();
        assert_eq!(
            rendered.args,
            vec![
                "--prompt",
                "a red fox; rm -rf /",
                "--n",
                "4",
                "--out",
                "/out/generation/42/img"
            ]
        );
    }

    #[test]
    fn render_builtins() {
        let t = CommandTemplate::parse("w {job_id} {job_class} {scratch_dir} {progress_file} {params_json}")
            .unwrap();
        let params = json!({"prompt": "x"});
        let d = dirs();
        let rendered = t.render(&ctx(&params, &d)).unwrap();
        assert_eq!(
            rendered.args,
            vec![
                "42",
                "generation",
                "/scratch/42",
                "/scratch/42/progress",
                r#"{"prompt":"x"}"#
            ]
        );
    }

    #[test]
    fn arrays_render_as_json() {
        let t = CommandTemplate::parse("label --labels {labels}").unwrap();
        let params = json!({"labels": ["cat", "dog"]});
        let d = dirs();
        let rendered = t.render(&ctx(&params, &d)).unwrap();
        assert_eq!(rendered.args[1], r#"["cat","dog"]"#);
    }

    #[test]
    fn missing_param_is_validation_error() {
        let t = CommandTemplate::parse("gen --seed {seed}").unwrap();
        let params = json!({"prompt": "x"});
        assert_matches!(t.check_resolvable(&params), Err(CoreError::Validation(msg)) if msg.contains("seed"));
        let d = dirs();
        assert!(t.render(&ctx(&params, &d)).is_err());
    }

    #[test]
    fn builtins_always_resolvable() {
        let t = CommandTemplate::parse("gen {params_json} {output_dir}").unwrap();
        assert!(t.check_resolvable(&json!({})).is_ok());
    }
}
