//! Parameter interpolation and condition expressions using minijinja.
//!
//! Parameters are a flat map of dotted names (`cds.run.number`,
//! `git.branch`). A [`ParameterScope`] exposes that map to templates as
//! nested attributes without materializing a tree, so a name may be both
//! a value and a prefix: `{{ cds.run }}` renders `4.0` while
//! `{{ cds.run.number }}` renders `4`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use minijinja::value::{Object, Value};
use minijinja::{Environment, UndefinedBehavior};

use crate::error::{AppError, AppResult};
use crate::workflow::Parameter;

/// Flat parameter map viewed from a dotted prefix.
#[derive(Debug, Clone)]
pub struct ParameterScope {
    params: Arc<BTreeMap<String, String>>,
    prefix: String,
}

impl ParameterScope {
    pub fn new(params: BTreeMap<String, String>) -> Self {
        Self {
            params: Arc::new(params),
            prefix: String::new(),
        }
    }

    pub fn from_parameters(params: &[Parameter]) -> Self {
        Self::new(
            params
                .iter()
                .map(|p| (p.name.clone(), p.value.clone()))
                .collect(),
        )
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    fn full_name(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", self.prefix, key)
        }
    }

    fn has_children(&self, name: &str) -> bool {
        let lower = format!("{}.", name);
        self.params
            .range(lower.clone()..)
            .next()
            .map_or(false, |(k, _)| k.starts_with(&lower))
    }

    fn lookup(&self, key: &str) -> Option<Value> {
        let name = self.full_name(key);
        if self.has_children(&name) {
            return Some(Value::from_object(ParameterScope {
                params: self.params.clone(),
                prefix: name,
            }));
        }
        self.params.get(&name).map(|v| Value::from(v.as_str()))
    }

    fn to_value(&self) -> Value {
        Value::from_object(self.clone())
    }
}

impl Object for ParameterScope {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        key.as_str().and_then(|k| self.lookup(k))
    }

    fn render(self: &Arc<Self>, f: &mut fmt::Formatter<'_>) -> fmt::Result
    where
        Self: Sized + 'static,
    {
        match self.params.get(&self.prefix) {
            Some(value) => f.write_str(value),
            None => write!(f, "<{}>", self.prefix),
        }
    }
}

/// Template renderer with the filters available to parameters.
pub struct TemplateRenderer {
    strict: Environment<'static>,
    lenient: Environment<'static>,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer {
    pub fn new() -> Self {
        let mut strict = Environment::new();
        strict.set_undefined_behavior(UndefinedBehavior::Strict);
        register_filters(&mut strict);

        let mut lenient = Environment::new();
        register_filters(&mut lenient);

        Self { strict, lenient }
    }

    /// Interpolate a parameter value. Unknown names are errors.
    pub fn interpolate(&self, template: &str, scope: &ParameterScope) -> AppResult<String> {
        if !contains_template_syntax(template) {
            return Ok(template.to_string());
        }
        let tmpl = self
            .strict
            .template_from_str(template)
            .map_err(|e| AppError::Template(e.to_string()))?;
        tmpl.render(scope.to_value())
            .map_err(|e| AppError::Template(e.to_string()))
    }

    /// Evaluate a condition expression. Unknown names render empty.
    pub fn evaluate_condition(&self, condition: &str, scope: &ParameterScope) -> AppResult<bool> {
        let template = if contains_template_syntax(condition) {
            condition.to_string()
        } else {
            format!("{{{{ {} }}}}", condition)
        };

        let tmpl = self
            .lenient
            .template_from_str(&template)
            .map_err(|e| AppError::Template(e.to_string()))?;
        let rendered = tmpl
            .render(scope.to_value())
            .map_err(|e| AppError::Template(e.to_string()))?;

        Ok(matches!(
            rendered.trim().to_lowercase().as_str(),
            "true" | "1" | "yes"
        ))
    }
}

/// Check if a string contains Jinja2 template syntax.
pub fn contains_template_syntax(s: &str) -> bool {
    (s.contains("{{") && s.contains("}}")) || (s.contains("{%") && s.contains("%}"))
}

fn register_filters(env: &mut Environment<'static>) {
    env.add_filter("short", filter_short);
    env.add_filter("slug", filter_slug);
}

/// First `n` characters, 7 by default (commit hashes).
fn filter_short(value: &Value, n: Option<usize>) -> String {
    value.to_string().chars().take(n.unwrap_or(7)).collect()
}

/// Lowercase with every non alphanumeric run collapsed to `-` (branch names).
fn filter_slug(value: &Value) -> String {
    let mut slug = String::new();
    for c in value.to_string().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> ParameterScope {
        ParameterScope::new(BTreeMap::from([
            ("cds.run".to_string(), "4.0".to_string()),
            ("cds.run.number".to_string(), "4".to_string()),
            ("cds.status".to_string(), "Success".to_string()),
            ("cds.env.url".to_string(), "https://api.example.com".to_string()),
            ("git.branch".to_string(), "feature/Login-Page".to_string()),
            (
                "git.hash".to_string(),
                "9f3c2a1b7d6e5f4a3b2c1d0e".to_string(),
            ),
        ]))
    }

    #[test]
    fn test_dotted_names_resolve() {
        let renderer = TemplateRenderer::new();
        let result = renderer
            .interpolate("{{ cds.env.url }}/v{{ cds.run.number }}", &scope())
            .unwrap();
        assert_eq!(result, "https://api.example.com/v4");
    }

    #[test]
    fn test_value_and_prefix_share_a_name() {
        let renderer = TemplateRenderer::new();
        assert_eq!(renderer.interpolate("{{ cds.run }}", &scope()).unwrap(), "4.0");
    }

    #[test]
    fn test_plain_text_untouched() {
        let renderer = TemplateRenderer::new();
        assert_eq!(renderer.interpolate("make all", &scope()).unwrap(), "make all");
    }

    #[test]
    fn test_unknown_name_is_an_error() {
        let renderer = TemplateRenderer::new();
        let err = renderer
            .interpolate("{{ cds.app.missing }}", &scope())
            .unwrap_err();
        assert!(matches!(err, AppError::Template(_)));
    }

    #[test]
    fn test_filters() {
        let renderer = TemplateRenderer::new();
        assert_eq!(
            renderer
                .interpolate("{{ git.branch | slug }}-{{ git.hash | short }}", &scope())
                .unwrap(),
            "feature-login-page-9f3c2a1"
        );
    }

    #[test]
    fn test_evaluate_condition() {
        let renderer = TemplateRenderer::new();
        let scope = scope();
        assert!(renderer
            .evaluate_condition("cds.status == 'Success'", &scope)
            .unwrap());
        assert!(!renderer
            .evaluate_condition("git.branch == 'main'", &scope)
            .unwrap());
        assert!(!renderer.evaluate_condition("missing", &scope).unwrap());
    }
}
