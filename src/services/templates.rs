//! Built-in plugin templates for the synthesis pipeline.
//!
//! A template is a placeholder-bearing source document plus the tags it
//! covers. Matching scores templates by overlap with the requirement;
//! filling substitutes the placeholders with derived values.

use std::collections::BTreeSet;

use crate::domain::models::capability::SynthesisRequirement;

/// What input shapes a template's generated code handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Number,
    Text,
    Any,
}

/// One fillable plugin template.
#[derive(Debug, Clone)]
pub struct PluginTemplate {
    pub id: &'static str,
    pub description: &'static str,
    /// Capability tags this template can serve
    pub capabilities: BTreeSet<String>,
    /// Plugin names generated code may depend on
    pub dependencies: BTreeSet<String>,
    /// Input shape the generated code expects
    pub input_kind: InputKind,
    /// Source document with `{{placeholder}}` slots
    pub source: &'static str,
}

impl PluginTemplate {
    /// Overlap score against a requirement. Tag overlap counts double;
    /// input-shape compatibility keeps generic templates in the running
    /// for novel capability names.
    pub fn score(&self, requirement: &SynthesisRequirement) -> usize {
        let mut wanted: BTreeSet<&str> = requirement
            .required_skills
            .iter()
            .map(String::as_str)
            .collect();
        wanted.insert(requirement.capability.as_str());

        let tag_overlap = wanted
            .iter()
            .filter(|tag| self.capabilities.contains(**tag))
            .count();
        let dep_overlap = requirement
            .allowed_dependencies
            .iter()
            .filter(|dep| self.dependencies.contains(*dep))
            .count();

        let mut score = tag_overlap * 2 + dep_overlap;
        if self.accepts_cases(requirement) {
            score += 1;
        }
        score
    }

    fn accepts_cases(&self, requirement: &SynthesisRequirement) -> bool {
        if requirement.test_cases.is_empty() {
            return matches!(self.input_kind, InputKind::Any);
        }
        requirement.test_cases.iter().all(|case| match self.input_kind {
            InputKind::Number => case.input.is_number(),
            InputKind::Text => case.input.is_string(),
            InputKind::Any => true,
        })
    }

    /// Substitute `{{key}}` placeholders in the source.
    pub fn fill(&self, substitutions: &[(&str, String)]) -> String {
        let mut filled = self.source.to_string();
        for (key, value) in substitutions {
            filled = filled.replace(&format!("{{{{{key}}}}}"), value);
        }
        filled
    }
}

/// The built-in template set.
pub struct TemplateLibrary {
    templates: Vec<PluginTemplate>,
}

impl TemplateLibrary {
    pub fn builtin() -> Self {
        let tags = |list: &[&str]| -> BTreeSet<String> {
            list.iter().map(|s| (*s).to_string()).collect()
        };
        Self {
            templates: vec![
                PluginTemplate {
                    id: "numeric-transform",
                    description: "Pointwise numeric mapping derived from examples",
                    capabilities: tags(&["transform", "map", "compute", "math", "numeric"]),
                    dependencies: BTreeSet::new(),
                    input_kind: InputKind::Number,
                    source: NUMERIC_TRANSFORM_SOURCE,
                },
                PluginTemplate {
                    id: "text-utility",
                    description: "String lookup and normalization utility",
                    capabilities: tags(&["utility", "format", "parse", "text", "lookup"]),
                    dependencies: BTreeSet::new(),
                    input_kind: InputKind::Text,
                    source: TEXT_UTILITY_SOURCE,
                },
                PluginTemplate {
                    id: "echo-service",
                    description: "Pass-through service scaffold",
                    capabilities: tags(&["service", "echo", "relay"]),
                    dependencies: BTreeSet::new(),
                    input_kind: InputKind::Any,
                    source: ECHO_SERVICE_SOURCE,
                },
            ],
        }
    }

    /// Best template for a requirement, highest score first; `None` when
    /// nothing scores above zero.
    pub fn best_match(&self, requirement: &SynthesisRequirement) -> Option<&PluginTemplate> {
        self.templates
            .iter()
            .map(|t| (t.score(requirement), t))
            .filter(|(score, _)| *score > 0)
            .max_by_key(|(score, _)| *score)
            .map(|(_, t)| t)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

const NUMERIC_TRANSFORM_SOURCE: &str = r#"{
  "plugin": "{{name}}",
  "template": "numeric-transform",
  "description": "{{description}}",
  "capability": "{{capability}}",
  "entry": "execute",
  "transform": {{transform}}
}
"#;

const TEXT_UTILITY_SOURCE: &str = r#"{
  "plugin": "{{name}}",
  "template": "text-utility",
  "description": "{{description}}",
  "capability": "{{capability}}",
  "entry": "execute",
  "transform": {{transform}}
}
"#;

const ECHO_SERVICE_SOURCE: &str = r#"{
  "plugin": "{{name}}",
  "template": "echo-service",
  "description": "{{description}}",
  "capability": "{{capability}}",
  "entry": "execute",
  "transform": {{transform}}
}
"#;
