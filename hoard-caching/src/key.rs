//! Call arguments, key templates and the template registry
//!
//! A [`KeyTemplate`] is bound once when a computation is wrapped and turns
//! each call's [`CallArgs`] into a cache key:
//!
//! ```
//! use hoard_caching::key::{CallArgs, KeyTemplate};
//!
//! let template = KeyTemplate::parse("user:{id}:{0}").unwrap().with_prefix("soft");
//! let args = CallArgs::new().arg("profile").kwarg("id", 42);
//! assert_eq!(template.resolve(&args), "soft:user:42:profile");
//! ```

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::{CacheError, CacheResult};

/// Arguments of one call: ordered positional values plus named values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallArgs {
    positional: Vec<Value>,
    named: BTreeMap<String, Value>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Set a named argument
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.named.insert(name.into(), value.into());
        self
    }

    /// Positional argument at `index`
    pub fn positional(&self, index: usize) -> Option<&Value> {
        self.positional.get(index)
    }

    /// Named argument
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.named.get(name)
    }

    pub fn args(&self) -> &[Value] {
        &self.positional
    }

    pub fn kwargs(&self) -> &BTreeMap<String, Value> {
        &self.named
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Named(String),
    Index(usize),
}

/// Key template with `{name}` and `{index}` placeholders.
///
/// `{name}` reads a named argument first, then the positional argument whose
/// declared parameter name matches. `{0}` reads a positional argument by
/// index. `{{` and `}}` are literal braces. A missing argument renders as an
/// empty string; strings render without quotes and any other value as
/// compact JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTemplate {
    source: String,
    segments: Vec<Segment>,
    params: Vec<String>,
}

impl KeyTemplate {
    /// Parse a template string
    pub fn parse(template: impl Into<String>) -> CacheResult<Self> {
        let source = template.into();
        let segments = parse_segments(&source).map_err(|reason| CacheError::InvalidTemplate {
            template: source.clone(),
            reason,
        })?;

        Ok(Self {
            source,
            segments,
            params: Vec::new(),
        })
    }

    /// Derive `function:p1:{p1}:p2:{p2}` from a function name and its
    /// parameter names
    pub fn for_function<S: AsRef<str>>(function: &str, params: &[S]) -> Self {
        let mut template = Self {
            source: escape(function),
            segments: Vec::new(),
            params: Vec::new(),
        };
        push_literal(&mut template.segments, function);

        for param in params {
            let param = param.as_ref();
            template.source.push_str(&format!(":{}:{{{}}}", escape(param), param));
            push_literal(&mut template.segments, &format!(":{param}:"));
            template.segments.push(Segment::Named(param.to_string()));
        }

        template.with_params(params)
    }

    /// Declare positional parameter names so `{name}` can resolve them
    pub fn with_params<S: AsRef<str>>(mut self, params: &[S]) -> Self {
        self.params = params.iter().map(|p| p.as_ref().to_string()).collect();
        self
    }

    /// Prefix the template with `prefix:`; an empty prefix is a no-op
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        if prefix.is_empty() {
            return self;
        }

        self.source = format!("{}:{}", escape(prefix), self.source);
        let mut segments = Vec::with_capacity(self.segments.len() + 1);
        push_literal(&mut segments, &format!("{prefix}:"));
        for segment in self.segments {
            match segment {
                Segment::Literal(text) => push_literal(&mut segments, &text),
                other => segments.push(other),
            }
        }
        self.segments = segments;
        self
    }

    /// The template as written
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Render the key for one call
    pub fn resolve(&self, args: &CallArgs) -> String {
        let mut key = String::with_capacity(self.source.len() + 16);

        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => key.push_str(text),
                Segment::Named(name) => {
                    let value = args.get(name).or_else(|| {
                        self.params
                            .iter()
                            .position(|param| param == name)
                            .and_then(|index| args.positional(index))
                    });
                    render_value(&mut key, value);
                }
                Segment::Index(index) => render_value(&mut key, args.positional(*index)),
            }
        }

        key
    }

    /// Whether `key` could have been produced by this template
    pub fn matches(&self, key: &str) -> bool {
        match_from(&self.segments, key)
    }
}

impl fmt::Display for KeyTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// How a policy builder chooses its template
#[derive(Debug, Clone, Default)]
pub struct TemplateSpec {
    /// Explicit template; takes precedence over the function name
    pub key: Option<String>,
    /// Name of the wrapped function
    pub function: Option<String>,
    /// Positional parameter names of the wrapped function
    pub params: Vec<String>,
}

impl TemplateSpec {
    /// Build the prefixed template
    pub fn build(&self, prefix: &str) -> CacheResult<KeyTemplate> {
        let template = match (&self.key, &self.function) {
            (Some(key), _) => KeyTemplate::parse(key.as_str())?.with_params(self.params.as_slice()),
            (None, Some(function)) => KeyTemplate::for_function(function, self.params.as_slice()),
            (None, None) => {
                return Err(CacheError::InvalidConfiguration(
                    "a key template or a function name is required".to_string(),
                ))
            }
        };

        Ok(template.with_prefix(prefix))
    }

    /// Name the template is registered under
    pub fn registry_name(&self, template: &KeyTemplate) -> String {
        self.function
            .clone()
            .unwrap_or_else(|| template.as_str().to_string())
    }
}

/// Templates of every wrapped function, for introspection and invalidation
#[derive(Debug, Default)]
pub struct TemplateRegistry {
    templates: RwLock<BTreeMap<String, KeyTemplate>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the template of `function`, replacing any earlier one
    pub fn register(&self, function: impl Into<String>, template: KeyTemplate) {
        let function = function.into();
        log::debug!("Registered key template {} for {}", template, function);
        self.templates.write().insert(function, template);
    }

    pub fn template_for(&self, function: &str) -> Option<KeyTemplate> {
        self.templates.read().get(function).cloned()
    }

    /// All registered templates, ordered by function name
    pub fn templates(&self) -> Vec<(String, KeyTemplate)> {
        self.templates
            .read()
            .iter()
            .map(|(function, template)| (function.clone(), template.clone()))
            .collect()
    }

    /// Functions whose template could have produced `key`
    pub fn functions_for_key(&self, key: &str) -> Vec<String> {
        self.templates
            .read()
            .iter()
            .filter(|(_, template)| template.matches(key))
            .map(|(function, _)| function.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.templates.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.read().is_empty()
    }
}

fn parse_segments(template: &str) -> Result<Vec<Segment>, String> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                literal.push('}');
            }
            '}' => return Err("unmatched '}'".to_string()),
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some('{') => return Err("nested '{' in placeholder".to_string()),
                        Some(c) => name.push(c),
                        None => return Err("unterminated placeholder".to_string()),
                    }
                }

                let name = name.trim();
                if name.is_empty() {
                    return Err("empty placeholder".to_string());
                }

                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(match name.parse::<usize>() {
                    Ok(index) => Segment::Index(index),
                    Err(_) => Segment::Named(name.to_string()),
                });
            }
            c => literal.push(c),
        }
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

fn push_literal(segments: &mut Vec<Segment>, text: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(Segment::Literal(last)) = segments.last_mut() {
        last.push_str(text);
    } else {
        segments.push(Segment::Literal(text.to_string()));
    }
}

fn escape(text: &str) -> String {
    text.replace('{', "{{").replace('}', "}}")
}

fn render_value(key: &mut String, value: Option<&Value>) {
    match value {
        Some(Value::String(s)) => key.push_str(s),
        Some(other) => key.push_str(&other.to_string()),
        None => {}
    }
}

// Placeholders match any run of characters, including an empty one
fn match_from(segments: &[Segment], key: &str) -> bool {
    match segments.split_first() {
        None => key.is_empty(),
        Some((Segment::Literal(text), rest)) => key
            .strip_prefix(text.as_str())
            .is_some_and(|remaining| match_from(rest, remaining)),
        Some((_, rest)) => (0..=key.len())
            .filter(|index| key.is_char_boundary(*index))
            .any(|index| match_from(rest, &key[index..])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_named_and_positional_placeholders() {
        let template = KeyTemplate::parse("user:{id}:page:{1}").unwrap();
        let args = CallArgs::new().arg("ignored").arg(3).kwarg("id", "u-17");

        assert_eq!(template.resolve(&args), "user:u-17:page:3");
        // Resolution is deterministic
        assert_eq!(template.resolve(&args), template.resolve(&args.clone()));
    }

    #[test]
    fn test_params_resolve_positional_by_name() {
        let template = KeyTemplate::parse("report:{region}:{year}")
            .unwrap()
            .with_params(&["region", "year"]);

        let positional = CallArgs::new().arg("emea").arg(2024);
        let named = CallArgs::new().kwarg("year", 2024).kwarg("region", "emea");

        assert_eq!(template.resolve(&positional), "report:emea:2024");
        assert_eq!(template.resolve(&named), "report:emea:2024");
    }

    #[test]
    fn test_for_function_with_prefix() {
        let template = KeyTemplate::for_function("billing::invoice", &["customer", "month"])
            .with_prefix("soft");

        assert_eq!(
            template.as_str(),
            "soft:billing::invoice:customer:{customer}:month:{month}"
        );

        let args = CallArgs::new().arg("acme").kwarg("month", "2024-05");
        assert_eq!(
            template.resolve(&args),
            "soft:billing::invoice:customer:acme:month:2024-05"
        );
    }

    #[test]
    fn test_non_string_values_render_as_json() {
        let template = KeyTemplate::parse("q:{filter}:{missing}").unwrap();
        let args = CallArgs::new().kwarg("filter", json!({"active": true}));
        assert_eq!(template.resolve(&args), r#"q:{"active":true}:"#);
    }

    #[test]
    fn test_escaped_braces() {
        let template = KeyTemplate::parse("{{literal}}:{id}").unwrap();
        assert_eq!(template.resolve(&CallArgs::new().kwarg("id", 1)), "{literal}:1");
    }

    #[test]
    fn test_malformed_templates_are_rejected() {
        for bad in ["user:{id", "user:{}", "user:id}", "user:{a{b}}"] {
            assert!(
                matches!(KeyTemplate::parse(bad), Err(CacheError::InvalidTemplate { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_template_spec() {
        let spec = TemplateSpec {
            key: None,
            function: Some("load_user".to_string()),
            params: vec!["id".to_string()],
        };
        let template = spec.build("srate").unwrap();
        assert_eq!(template.as_str(), "srate:load_user:id:{id}");
        assert_eq!(spec.registry_name(&template), "load_user");

        assert!(TemplateSpec::default().build("soft").is_err());
    }

    #[test]
    fn test_registry_matches_keys() {
        let registry = TemplateRegistry::new();
        registry.register(
            "load_user",
            KeyTemplate::for_function("load_user", &["id"]).with_prefix("soft"),
        );
        registry.register("orders", KeyTemplate::parse("orders:{customer}").unwrap());

        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.functions_for_key("soft:load_user:id:42"),
            vec!["load_user".to_string()]
        );
        assert_eq!(registry.functions_for_key("orders:acme"), vec!["orders".to_string()]);
        assert!(registry.functions_for_key("unknown:1").is_empty());

        // Re-registering replaces the template
        registry.register("orders", KeyTemplate::parse("orders:v2:{customer}").unwrap());
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.template_for("orders").map(|t| t.to_string()),
            Some("orders:v2:{customer}".to_string())
        );
    }
}
