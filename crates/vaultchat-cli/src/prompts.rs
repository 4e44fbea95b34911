//! Interactive answers to pending prompts
//!
//! dialoguer blocks the calling thread, so callers run these through
//! `tokio::task::spawn_blocking`.

use std::collections::HashMap;

use console::style;
use dialoguer::{Input, MultiSelect, Select, theme::ColorfulTheme};
use vaultchat_core::session::{PendingPrompt, PromptPayload, PromptResponse, QuestionInfo};

const OTHER_ANSWER: &str = "Other...";

/// Ask the user to decide a pending prompt
pub fn ask(prompt: &PendingPrompt) -> anyhow::Result<PromptResponse> {
    match &prompt.payload {
        PromptPayload::ToolPermission { tool_name, input } => ask_permission(tool_name, input),
        PromptPayload::AskUserQuestion { questions } => {
            let mut answers = HashMap::new();
            for question in questions {
                answers.insert(question.question.clone(), ask_question(question)?);
            }
            Ok(PromptResponse::answers(answers))
        }
    }
}

fn ask_permission(tool_name: &str, input: &serde_json::Value) -> anyhow::Result<PromptResponse> {
    let theme = ColorfulTheme::default();
    println!();
    println!("{} {}", style("Permission requested:").yellow().bold(), style(tool_name).bold());
    println!(
        "{}",
        style(serde_json::to_string_pretty(input).unwrap_or_default()).dim()
    );

    let choice = Select::with_theme(&theme)
        .with_prompt("Allow this tool call?")
        .items(&["Allow", "Deny"])
        .default(0)
        .interact()?;
    if choice == 0 {
        return Ok(PromptResponse::allow());
    }

    let reason: String = Input::with_theme(&theme)
        .with_prompt("Reason (optional)")
        .allow_empty(true)
        .interact_text()?;
    Ok(if reason.trim().is_empty() {
        PromptResponse::ToolPermission {
            allow: false,
            message: None,
            updated_input: None,
        }
    } else {
        PromptResponse::deny(reason)
    })
}

fn ask_question(question: &QuestionInfo) -> anyhow::Result<String> {
    let theme = ColorfulTheme::default();
    println!();
    if let Some(header) = &question.header {
        println!("{}", style(header).cyan().bold());
    }

    if question.options.is_empty() {
        return Ok(Input::with_theme(&theme)
            .with_prompt(&question.question)
            .interact_text()?);
    }

    let mut labels: Vec<String> = question
        .options
        .iter()
        .map(|o| match &o.description {
            Some(description) => format!("{} - {}", o.label, description),
            None => o.label.clone(),
        })
        .collect();
    labels.push(OTHER_ANSWER.to_string());
    let other = labels.len() - 1;

    let selected = if question.multi_select {
        MultiSelect::with_theme(&theme)
            .with_prompt(&question.question)
            .items(&labels)
            .interact()?
    } else {
        vec![
            Select::with_theme(&theme)
                .with_prompt(&question.question)
                .items(&labels)
                .default(0)
                .interact()?,
        ]
    };

    let mut answers = Vec::new();
    for index in selected {
        if index == other {
            let custom: String = Input::with_theme(&theme)
                .with_prompt("Your answer")
                .interact_text()?;
            answers.push(custom);
        } else {
            answers.push(question.options[index].label.clone());
        }
    }
    Ok(answers.join(", "))
}
