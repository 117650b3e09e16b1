//! CombineStage: merge a document's winner and runner-ups into one output.

use crate::gateway::{CallKind, Message, ProviderError};
use crate::prompts::{runner_up_block, COMBINE_V1};

use super::gate::GatedCallError;
use super::types::{CombinedOutput, Variant};
use super::DocumentScope;

#[derive(Debug, thiserror::Error)]
pub enum CombineError {
    #[error("combine cancelled")]
    Cancelled,
    #[error("combine failed: {0}")]
    Provider(#[from] ProviderError),
    #[error("combine returned empty content")]
    EmptyContent { cost_nanodollars: i64 },
}

pub struct CombineStage<'a> {
    scope: DocumentScope<'a>,
}

impl<'a> CombineStage<'a> {
    pub fn new(scope: DocumentScope<'a>) -> Self {
        Self { scope }
    }

    pub async fn run(
        &self,
        winner: &Variant,
        runner_ups: &[&Variant],
    ) -> Result<CombinedOutput, CombineError> {
        let settings = self.scope.settings;
        let document = self.scope.document;
        let model = settings.combine_model();

        let prompt = COMBINE_V1.render(&[
            ("document_name", document.display_name()),
            ("document", document.content.as_str()),
            ("winner", winner.content.as_str()),
        ]);
        let mut messages = prompt.to_messages();
        if !runner_ups.is_empty() {
            let contents: Vec<&str> = runner_ups.iter().map(|v| v.content.as_str()).collect();
            messages.push(Message::user(runner_up_block(&contents)));
        }

        let req = self
            .scope
            .request(CallKind::Combine, model, messages)
            .temperature(0.3)
            .max_tokens(settings.max_combine_tokens);

        let resp = self.scope.gate.call(req).await.map_err(|e| match e {
            GatedCallError::Cancelled => CombineError::Cancelled,
            GatedCallError::Provider(e) => CombineError::Provider(e),
        })?;

        if resp.content.trim().is_empty() {
            return Err(CombineError::EmptyContent {
                cost_nanodollars: resp.cost_nanodollars,
            });
        }

        Ok(CombinedOutput {
            document_id: document.id.clone(),
            winner_variant_id: winner.variant_id.clone(),
            runner_up_ids: runner_ups.iter().map(|v| v.variant_id.clone()).collect(),
            model: model.to_string(),
            content: resp.content,
            input_tokens: resp.input_tokens,
            output_tokens: resp.output_tokens,
            cost_nanodollars: resp.cost_nanodollars,
        })
    }
}
