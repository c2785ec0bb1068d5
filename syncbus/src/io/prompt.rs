//! Prompt rendering for the command-backed generator.

use anyhow::{Context, Result};
use minijinja::{Environment, context};

use crate::core::routing::{GenerationContext, GenerationTarget};

const PACKET_TEMPLATE: &str = include_str!("prompts/packet.md");
const DIRECTIVE_TEMPLATE: &str = include_str!("prompts/directive.md");

/// Template engine wrapper around minijinja.
pub struct PromptBuilder {
    env: Environment<'static>,
}

impl PromptBuilder {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("packet", PACKET_TEMPLATE)
            .context("load packet template")?;
        env.add_template("directive", DIRECTIVE_TEMPLATE)
            .context("load directive template")?;
        Ok(Self { env })
    }

    /// Render the prompt for `ctx`. Output is a pure function of the context.
    pub fn render(&self, ctx: &GenerationContext) -> Result<String> {
        let inbox = ctx.inbox_excerpt.trim();
        let reference = ctx.reference_excerpt.trim();
        let rendered = match &ctx.target {
            GenerationTarget::Packet => self.env.get_template("packet")?.render(context! {
                inbox => inbox,
                reference => reference,
            }),
            GenerationTarget::Thread(thread) => {
                self.env.get_template("directive")?.render(context! {
                    thread => thread.as_str(),
                    packet => ctx.packet_body.trim(),
                    inbox => inbox,
                    reference => reference,
                })
            }
        }
        .context("render prompt")?;
        Ok(rendered.trim().to_string() + "\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ThreadKey;

    fn thread_ctx(inbox: &str, reference: &str) -> GenerationContext {
        GenerationContext {
            target: GenerationTarget::Thread(ThreadKey::new("risk_gate").expect("key")),
            packet_body: "### Sync Packet\n- item".to_string(),
            inbox_excerpt: inbox.to_string(),
            reference_excerpt: reference.to_string(),
        }
    }

    #[test]
    fn directive_prompt_orders_reference_inbox_packet() {
        let prompt = PromptBuilder::new()
            .expect("builder")
            .render(&thread_ctx("INBOX-TEXT", "REF-TEXT"))
            .expect("render");
        assert!(prompt.contains("`risk_gate` thread"));
        let r = prompt.find("REF-TEXT").expect("reference");
        let i = prompt.find("INBOX-TEXT").expect("inbox");
        let p = prompt.find("- item").expect("packet");
        assert!(r < i && i < p);
    }

    #[test]
    fn empty_sections_render_placeholders() {
        let prompt = PromptBuilder::new()
            .expect("builder")
            .render(&thread_ctx("", ""))
            .expect("render");
        assert!(!prompt.contains("## Reference"));
        assert!(prompt.contains("(nothing new for this thread)"));
    }

    #[test]
    fn packet_prompt_is_deterministic() {
        let ctx = GenerationContext {
            target: GenerationTarget::Packet,
            packet_body: String::new(),
            inbox_excerpt: "---\nSOURCE: a.md\n---\nhello".to_string(),
            reference_excerpt: String::new(),
        };
        let builder = PromptBuilder::new().expect("builder");
        let first = builder.render(&ctx).expect("render");
        assert_eq!(first, builder.render(&ctx).expect("render again"));
        assert!(first.contains("SOURCE: a.md"));
        assert!(first.contains("**Top 3 changes (planned)**"));
    }
}
