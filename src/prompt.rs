//! Layered system-prompt composition.
//!
//! Order is deterministic: platform prompt, then enabled scoped prompts by
//! priority descending, then the workflow prompt selected by the request.
//! Each layer may be a Handlebars template rendered with strict-undefined
//! semantics; a template failure substitutes the raw layer text and bumps a
//! metric; composition itself never fails.

use crate::config::PromptsConfig;
use crate::metrics::Metrics;
use handlebars::Handlebars;
use std::collections::HashMap;
use std::sync::Arc;

pub struct PromptComposer {
    registry: Handlebars<'static>,
    prompts: PromptsConfig,
    metrics: Arc<Metrics>,
}

impl PromptComposer {
    pub fn new(prompts: PromptsConfig, metrics: Arc<Metrics>) -> Self {
        let mut registry = Handlebars::new();
        // Missing variables are template errors, not silent empties.
        registry.set_strict_mode(true);
        Self {
            registry,
            prompts,
            metrics,
        }
    }

    /// Compose the system prompt for a request. An explicit override
    /// replaces the whole composition.
    pub fn compose(
        &self,
        workflow: Option<&str>,
        variables: &HashMap<String, String>,
        system_prompt_override: Option<&str>,
    ) -> String {
        if let Some(explicit) = system_prompt_override {
            return explicit.to_string();
        }

        let mut layers: Vec<(String, &str)> = Vec::new();
        layers.push(("platform".to_string(), self.prompts.platform.as_str()));

        let mut scoped: Vec<_> = self.prompts.scoped.iter().filter(|p| p.enabled).collect();
        scoped.sort_by_key(|p| std::cmp::Reverse(p.priority));
        for entry in scoped {
            layers.push((format!("scoped:{}", entry.name), entry.content.as_str()));
        }

        if let Some(workflow) = workflow {
            if let Some(content) = self.prompts.workflows.get(workflow) {
                layers.push((format!("workflow:{workflow}"), content.as_str()));
            }
        }

        let rendered: Vec<String> = layers
            .into_iter()
            .map(|(scope, content)| self.render_layer(&scope, content, variables))
            .filter(|layer| !layer.trim().is_empty())
            .collect();

        rendered.join("\n\n")
    }

    fn render_layer(
        &self,
        scope: &str,
        content: &str,
        variables: &HashMap<String, String>,
    ) -> String {
        match self.registry.render_template(content, variables) {
            Ok(rendered) => rendered,
            Err(e) => {
                tracing::warn!(scope, error = %e, "prompt template failed, using raw content");
                self.metrics
                    .prompt_render_errors_total
                    .with_label_values(&[scope])
                    .inc();
                content.to_string()
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
