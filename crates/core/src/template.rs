//! `${name}` placeholder substitution for URL path/header/body templates.
//!
//! Deliberately not a general templating language (no conditionals or
//! loops) — the config surface only ever needs flat variable
//! substitution, so a small hand-rolled scanner is enough and keeps
//! the grammar exactly what `spec.md` §4.3 describes.

use std::collections::BTreeMap;

use chrono::Utc;

use crate::error::ConnectError;

/// A resolved set of named variables available to one substitution
/// pass: pagination-derived (`offset`, `cursor`, `parent_value`) plus
/// whatever the config declares under `template.variables.*` and, if
/// enabled, environment lookups and date/time formatting.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    vars: BTreeMap<String, String>,
    env_enabled: bool,
    date_format: String,
    time_format: String,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self {
            vars: BTreeMap::new(),
            env_enabled: false,
            date_format: "%Y-%m-%d".to_string(),
            time_format: "%H:%M:%S".to_string(),
        }
    }

    pub fn with_env_enabled(mut self, enabled: bool) -> Self {
        self.env_enabled = enabled;
        self
    }

    pub fn with_date_format(mut self, fmt: impl Into<String>) -> Self {
        self.date_format = fmt.into();
        self
    }

    pub fn with_time_format(mut self, fmt: impl Into<String>) -> Self {
        self.time_format = fmt.into();
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    fn resolve(&self, name: &str) -> Option<String> {
        if let Some(v) = self.vars.get(name) {
            return Some(v.clone());
        }
        let now = Utc::now();
        match name {
            "date" => return Some(now.format(&self.date_format).to_string()),
            "time" => return Some(now.format(&self.time_format).to_string()),
            "now" => return Some(now.to_rfc3339()),
            _ => {}
        }
        if self.env_enabled {
            if let Some(rest) = name.strip_prefix("env.") {
                return std::env::var(rest).ok();
            }
        }
        None
    }
}

/// Substitute every `${name}` occurrence in `input` using `ctx`.
///
/// Unresolvable names are a `ConnectError::Config` (`spec.md` §7:
/// "unresolvable template" is a fatal config-class error), since a
/// template that references a variable the config never defines is a
/// configuration mistake, not a runtime condition to recover from.
pub fn substitute(input: &str, ctx: &TemplateContext) -> Result<String, ConnectError> {
    let mut out = String::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            let start = i + 2;
            match input[start..].find('}') {
                Some(rel_end) => {
                    let name = &input[start..start + rel_end];
                    let value = ctx.resolve(name).ok_or_else(|| {
                        ConnectError::Config(format!("unresolvable template variable: ${{{name}}}"))
                    })?;
                    out.push_str(&value);
                    i = start + rel_end + 1;
                }
                None => {
                    return Err(ConnectError::Config(format!(
                        "unterminated template placeholder in: {input}"
                    )));
                }
            }
        } else {
            out.push(bytes[i] as char);
            i += 1;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_vars() {
        let mut ctx = TemplateContext::new();
        ctx.set("offset", "42").set("parent_value", "org1");
        let result = substitute("/accounts?since=${offset}&parent=${parent_value}", &ctx).unwrap();
        assert_eq!(result, "/accounts?since=42&parent=org1");
    }

    #[test]
    fn no_placeholders_is_identity() {
        let ctx = TemplateContext::new();
        assert_eq!(substitute("/static/path", &ctx).unwrap(), "/static/path");
    }

    #[test]
    fn unresolved_var_is_config_error() {
        let ctx = TemplateContext::new();
        let err = substitute("/x?${missing}", &ctx).unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Config);
    }

    #[test]
    fn unterminated_placeholder_errors() {
        let ctx = TemplateContext::new();
        assert!(substitute("/x?${unterminated", &ctx).is_err());
    }

    #[test]
    fn env_lookup_when_enabled() {
        std::env::set_var("CONNECT_TEMPLATE_TEST_VAR", "hello");
        let ctx = TemplateContext::new().with_env_enabled(true);
        let result = substitute("${env.CONNECT_TEMPLATE_TEST_VAR}", &ctx).unwrap();
        assert_eq!(result, "hello");
        std::env::remove_var("CONNECT_TEMPLATE_TEST_VAR");
    }

    #[test]
    fn env_lookup_disabled_is_unresolved() {
        std::env::set_var("CONNECT_TEMPLATE_TEST_VAR2", "hello");
        let ctx = TemplateContext::new();
        assert!(substitute("${env.CONNECT_TEMPLATE_TEST_VAR2}", &ctx).is_err());
        std::env::remove_var("CONNECT_TEMPLATE_TEST_VAR2");
    }
}
