//! Prompt rendering for the producing agent and the reviewer.

use std::collections::BTreeMap;

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::classifier::{COMPLETE_KEYWORD, STOP_KEYWORD};
use crate::core::pool::ReviewerResponse;
use crate::core::types::Phase;

const ROUND_TEMPLATE: &str = include_str!("prompts/round.md");
const REVIEW_TEMPLATE: &str = include_str!("prompts/review.md");
const FINALIZE_TEMPLATE: &str = include_str!("prompts/finalize.md");
const ADJUDICATE_TEMPLATE: &str = include_str!("prompts/adjudicate.md");

/// Inputs for a producing-agent round prompt.
#[derive(Debug, Clone)]
pub struct RoundPromptInput<'a> {
    pub round: u32,
    pub phase: Phase,
    pub max_iterations: u32,
    pub plan_file: &'a str,
    pub plan_mutable: bool,
    pub start_branch: &'a str,
    pub base_ref: &'a str,
    pub summary_path: &'a str,
    pub feedback: Option<&'a str>,
}

/// Inputs for a prompt-form review request.
#[derive(Debug, Clone)]
pub struct ReviewPromptInput<'a> {
    pub round: u32,
    pub plan: &'a str,
    pub summary: &'a str,
    /// Goal tracker contents; present only on deep-audit rounds.
    pub audit_tracker: Option<&'a str>,
    pub result_path: &'a str,
}

#[derive(Debug, Serialize)]
struct AdjudicationReviewer<'a> {
    name: &'a str,
    bodies: Vec<&'a str>,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("round", ROUND_TEMPLATE)
            .expect("round template should be valid");
        env.add_template("review", REVIEW_TEMPLATE)
            .expect("review template should be valid");
        env.add_template("finalize", FINALIZE_TEMPLATE)
            .expect("finalize template should be valid");
        env.add_template("adjudicate", ADJUDICATE_TEMPLATE)
            .expect("adjudicate template should be valid");
        Self { env }
    }

    pub fn render_round(&self, input: &RoundPromptInput<'_>) -> Result<String> {
        let phase = match input.phase {
            Phase::Review => "review",
            _ => "implementation",
        };
        let rendered = self.env.get_template("round")?.render(context! {
            round => input.round,
            phase => phase,
            max_iterations => input.max_iterations,
            plan_file => input.plan_file,
            plan_mutable => input.plan_mutable,
            start_branch => input.start_branch,
            base_ref => input.base_ref,
            summary_path => input.summary_path,
            feedback => input.feedback.map(str::trim).filter(|s| !s.is_empty()),
        })?;
        Ok(rendered)
    }

    pub fn render_review(&self, input: &ReviewPromptInput<'_>) -> Result<String> {
        let rendered = self.env.get_template("review")?.render(context! {
            round => input.round,
            plan => input.plan.trim(),
            summary => input.summary.trim(),
            audit => input.audit_tracker.is_some(),
            tracker => input.audit_tracker.map(str::trim),
            result_path => input.result_path,
            complete_keyword => COMPLETE_KEYWORD,
            stop_keyword => STOP_KEYWORD,
        })?;
        Ok(rendered)
    }

    pub fn render_finalize(&self, round: u32, summary_path: &str) -> Result<String> {
        let rendered = self.env.get_template("finalize")?.render(context! {
            round => round,
            summary_path => summary_path,
        })?;
        Ok(rendered)
    }

    /// Prompt asking a reviewer to judge each pool member's responses.
    pub fn render_adjudication(&self, responses: &[ReviewerResponse]) -> Result<String> {
        let mut grouped: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for response in responses {
            grouped
                .entry(response.reviewer.as_str())
                .or_default()
                .push(response.body.trim());
        }
        let reviewers: Vec<AdjudicationReviewer<'_>> = grouped
            .into_iter()
            .map(|(name, bodies)| AdjudicationReviewer { name, bodies })
            .collect();
        let rendered = self
            .env
            .get_template("adjudicate")?
            .render(context! { reviewers => reviewers })?;
        Ok(rendered)
    }
}
