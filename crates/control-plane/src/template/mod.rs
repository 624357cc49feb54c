//! Template rendering module.
//!
//! Provides Jinja2-style interpolation of parameters and evaluation of
//! condition expressions.

pub mod jinja;

pub use jinja::{contains_template_syntax, ParameterScope, TemplateRenderer};
