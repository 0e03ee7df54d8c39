//! Rendering of the injection payload handed back to the host.

use playbook_engine::Selected;
use playbook_llm::templates::{PromptTemplates, TemplateKind};

/// Render the selected key points as the block the host prepends to the
/// user prompt: preamble, one bullet per key point, guidance footer.
pub fn render_injection(templates: &PromptTemplates, picks: &[Selected<'_>]) -> String {
    let bullets = picks
        .iter()
        .map(|s| format!("- {}", s.kpt.text.render()))
        .collect::<Vec<_>>()
        .join("\n");
    let guidance = templates.get(TemplateKind::TaskGuidance).trim_end();
    templates
        .render(
            TemplateKind::Injection,
            &[("key_points", bullets.as_str()), ("guidance", guidance)],
        )
        .trim_end()
        .to_string()
}
