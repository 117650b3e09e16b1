//! Prompt templates for generation, evaluation, comparison and combining.
//!
//! Domain logic for rendering prompts. Provider-agnostic.

use crate::gateway::Message;

/// Rendered prompt ready for LLM.
#[derive(Debug, Clone)]
pub struct PromptInstance {
    pub template_slug: String,
    pub system: String,
    pub user: String,
}

impl PromptInstance {
    pub fn to_messages(&self) -> Vec<Message> {
        vec![Message::system(&self.system), Message::user(&self.user)]
    }
}

/// Escape XML special characters to prevent prompt injection via tag breaking.
fn escape_xml_chars(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// A prompt template with `{placeholder}` slots.
#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub slug: &'static str,
    pub system: &'static str,
    pub user: &'static str,
}

impl PromptTemplate {
    /// Substitute `vars` into both halves. Values are XML-escaped; slots with
    /// no matching var are left as-is.
    pub fn render(&self, vars: &[(&str, &str)]) -> PromptInstance {
        PromptInstance {
            template_slug: self.slug.to_string(),
            system: fill_slots(self.system, vars).trim().to_string(),
            user: fill_slots(self.user, vars).trim().to_string(),
        }
    }
}

/// Single pass, so substituted values are never scanned for slots again.
fn fill_slots(text: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let slot = after
            .find('}')
            .map(|close| &after[..close])
            .and_then(|name| vars.iter().find(|(key, _)| *key == name));
        match slot {
            Some((key, value)) => {
                out.push_str(&escape_xml_chars(value.trim()));
                rest = &after[key.len() + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

// =============================================================================
// Standard prompts
// =============================================================================

pub const GENERATE_V1: PromptTemplate = PromptTemplate {
    slug: "generate_v1",
    system: r#"You are an expert editor producing an improved version of a document.
Follow the strategy below exactly. Preserve the document's meaning and facts; do not invent content.
Return only the rewritten document, with no preamble or commentary.

<strategy name="{generator_name}">
{instructions}
</strategy>"#,
    user: r#"<document name="{document_name}">
{document}
</document>"#,
};

pub const EVALUATE_V1: PromptTemplate = PromptTemplate {
    slug: "evaluate_v1",
    system: r#"You are a strict evaluator of rewritten documents. Score the candidate against the source on these criteria:
<criteria>
{criteria}
</criteria>

Output only valid JSON: {"score": 0-10, "criteria": {"<criterion>": 0-10, ...}, "rationale": "<one or two sentences>"}.
Example:
{"score": 7.5, "criteria": {"clarity": 8, "faithfulness": 7}, "rationale": "Clear, but drops one caveat."}"#,
    user: r#"<source_document>
{document}
</source_document>

<candidate>
{candidate}
</candidate>

json:"#,
};

pub const COMPARE_V1: PromptTemplate = PromptTemplate {
    slug: "compare_v1",
    system: r#"You are an expert judge comparing two rewrites of the same source document on these criteria:
<criteria>
{criteria}
</criteria>

Decide which candidate is better overall. Use "tie" only if they are genuinely indistinguishable.
Output only valid JSON: {"winner": "A" | "B" | "tie", "rationale": "<one or two sentences>"}.
Example:
{"winner": "B", "rationale": "B keeps every fact and reads more naturally."}"#,
    user: r#"<source_document>
{document}
</source_document>

<candidate_A>
{candidate_a}
</candidate_A>

<candidate_B>
{candidate_b}
</candidate_B>

json:"#,
};

pub const COMBINE_V1: PromptTemplate = PromptTemplate {
    slug: "combine_v1",
    system: r#"You are a senior editor. You receive a source document, the best rewrite of it, and optionally runner-up rewrites.
Produce one final version that keeps the best rewrite's structure and voice, and folds in any clear improvements from the runner-ups.
Stay faithful to the source. Return only the final document, with no preamble or commentary."#,
    user: r#"<source_document name="{document_name}">
{document}
</source_document>

<best_rewrite>
{winner}
</best_rewrite>"#,
};

/// Wrap runner-up contents in numbered tags, appended to the combine prompt.
pub fn runner_up_block(contents: &[&str]) -> String {
    contents
        .iter()
        .enumerate()
        .map(|(idx, content)| {
            format!(
                "<runner_up index=\"{}\">\n{}\n</runner_up>",
                idx + 1,
                escape_xml_chars(content.trim())
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
