//! Prompt templates with `{{placeholder}}` substitution.
//!
//! Built-in templates ship in the crate; a templates directory from the
//! configuration overrides them file by file. Templates are the tuning
//! surface: behavior changes without code changes.

use std::fs;
use std::path::Path;

/// The five template slots the engine renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    Tagger,
    Reflection,
    Injection,
    TaskGuidance,
    Migration,
}

impl TemplateKind {
    /// File name looked up in an override directory.
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Tagger => "tagger.txt",
            Self::Reflection => "reflection.txt",
            Self::Injection => "injection.txt",
            Self::TaskGuidance => "task_guidance.txt",
            Self::Migration => "migration.txt",
        }
    }
}

/// The loaded template set, cached for the life of the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptTemplates {
    tagger: String,
    reflection: String,
    injection: String,
    task_guidance: String,
    migration: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PromptTemplates {
    /// The templates compiled into the crate.
    pub fn builtin() -> Self {
        Self {
            tagger: include_str!("../templates/tagger.txt").to_string(),
            reflection: include_str!("../templates/reflection.txt").to_string(),
            injection: include_str!("../templates/injection.txt").to_string(),
            task_guidance: include_str!("../templates/task_guidance.txt").to_string(),
            migration: include_str!("../templates/migration.txt").to_string(),
        }
    }

    /// Built-ins overridden by any readable file in `dir`.
    pub fn load(dir: Option<&Path>) -> Self {
        let mut templates = Self::builtin();
        let Some(dir) = dir else {
            return templates;
        };
        for (kind, slot) in [
            (TemplateKind::Tagger, &mut templates.tagger),
            (TemplateKind::Reflection, &mut templates.reflection),
            (TemplateKind::Injection, &mut templates.injection),
            (TemplateKind::TaskGuidance, &mut templates.task_guidance),
            (TemplateKind::Migration, &mut templates.migration),
        ] {
            let path = dir.join(kind.file_name());
            match fs::read_to_string(&path) {
                Ok(text) => *slot = text,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "template override unreadable");
                }
            }
        }
        templates
    }

    pub fn get(&self, kind: TemplateKind) -> &str {
        match kind {
            TemplateKind::Tagger => &self.tagger,
            TemplateKind::Reflection => &self.reflection,
            TemplateKind::Injection => &self.injection,
            TemplateKind::TaskGuidance => &self.task_guidance,
            TemplateKind::Migration => &self.migration,
        }
    }

    /// Render a template, replacing each `{{name}}` with its value.
    /// Unknown placeholders are left in place so a broken override is
    /// visible in diagnostics instead of silently vanishing.
    pub fn render(&self, kind: TemplateKind, vars: &[(&str, &str)]) -> String {
        let mut out = self.get(kind).to_string();
        for (name, value) in vars {
            out = out.replace(&format!("{{{{{name}}}}}"), value);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_templates_have_placeholders() {
        let templates = PromptTemplates::builtin();
        assert!(templates.get(TemplateKind::Tagger).contains("{{prompt}}"));
        assert!(templates.get(TemplateKind::Tagger).contains("{{max_tags}}"));
        assert!(templates.get(TemplateKind::Reflection).contains("{{transcript}}"));
        assert!(templates.get(TemplateKind::Reflection).contains("{{playbook}}"));
        assert!(templates.get(TemplateKind::Injection).contains("{{key_points}}"));
        assert!(templates.get(TemplateKind::Migration).contains("{{text}}"));
    }

    #[test]
    fn test_render_replaces_all_occurrences() {
        let templates = PromptTemplates::builtin();
        let out = templates.render(
            TemplateKind::Tagger,
            &[
                ("prompt", "fix the build"),
                ("history", ""),
                ("max_tags", "8"),
            ],
        );
        assert!(out.contains("fix the build"));
        assert!(!out.contains("{{prompt}}"));
        assert!(!out.contains("{{max_tags}}"));
    }

    #[test]
    fn test_load_without_dir_is_builtin() {
        assert_eq!(PromptTemplates::load(None), PromptTemplates::builtin());
    }
}
