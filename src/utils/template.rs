//! `{{name}}` placeholders in step templates.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use super::shell;

pub struct TemplateVars;

impl TemplateVars {
    pub const REVISION: &'static str = "revision";
    pub const RELEASE_PATH: &'static str = "release_path";
    pub const CURRENT_PATH: &'static str = "current_path";
    pub const SHARED_PATH: &'static str = "shared_path";
    pub const DEPLOY_PATH: &'static str = "deploy_path";
    pub const TARGET_ID: &'static str = "target_id";
    pub const REPOSITORY: &'static str = "repository";

    pub const ALL: [&'static str; 7] = [
        Self::REVISION,
        Self::RELEASE_PATH,
        Self::CURRENT_PATH,
        Self::SHARED_PATH,
        Self::DEPLOY_PATH,
        Self::TARGET_ID,
        Self::REPOSITORY,
    ];
}

static PLACEHOLDER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{([A-Za-z0-9_]+)\}\}").unwrap());

/// Substitute known placeholders with their raw values. For paths and other
/// values that never reach a shell.
pub fn render(template: &str, variables: &HashMap<String, String>) -> String {
    substitute(template, variables, false)
}

/// Substitute known placeholders as single-quoted shell words, so a value
/// with spaces or metacharacters stays one literal argument.
pub fn render_shell(template: &str, variables: &HashMap<String, String>) -> String {
    substitute(template, variables, true)
}

fn substitute(template: &str, variables: &HashMap<String, String>, quote: bool) -> String {
    PLACEHOLDER_PATTERN
        .replace_all(template, |caps: &Captures| match variables.get(&caps[1]) {
            Some(value) if quote => shell::quote_path(value),
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Placeholder names referenced by `template`, in order of appearance.
pub fn placeholders(template: &str) -> Vec<String> {
    PLACEHOLDER_PATTERN
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .collect()
}

/// Placeholders not in `known`.
pub fn unknown_placeholders(template: &str, known: &[&str]) -> Vec<String> {
    placeholders(template)
        .into_iter()
        .filter(|name| !known.contains(&name.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn render_replaces_every_occurrence() {
        let out = render(
            "{{release_path}}/conf/{{revision}}.conf",
            &vars(&[("release_path", "/srv/app/releases/abc"), ("revision", "abc")]),
        );
        assert_eq!(out, "/srv/app/releases/abc/conf/abc.conf");
    }

    #[test]
    fn shell_rendering_quotes_each_value() {
        let out = render_shell(
            "cd {{release_path}} && git fetch {{repository}}",
            &vars(&[
                ("release_path", "/srv/my app/releases/abc"),
                ("repository", "git@host:org/repo.git; rm -rf /"),
            ]),
        );
        assert_eq!(
            out,
            "cd '/srv/my app/releases/abc' && git fetch 'git@host:org/repo.git; rm -rf /'"
        );
    }

    #[test]
    fn values_are_not_rendered_twice_and_unknown_names_stay() {
        let out = render(
            "{{revision}} {{missing}}",
            &vars(&[("revision", "{{missing}}")]),
        );
        assert_eq!(out, "{{missing}} {{missing}}");
    }

    #[test]
    fn unknown_placeholders_are_reported() {
        let unknown = unknown_placeholders("{{revision}} {{relase_path}}", &TemplateVars::ALL);
        assert_eq!(unknown, vec!["relase_path".to_string()]);
    }

    #[test]
    fn shell_braces_are_not_placeholders() {
        assert!(placeholders("echo ${HOME} {a,b}").is_empty());
    }
}
