//! Prompt text for the reviewer, strategist and oracle.

use super::context::{OracleContext, ReviewContext, StrategistContext};
use crate::state::Stage;

/// Stage-specific review checks.
pub fn stage_checklist(stage: Stage) -> &'static [&'static str] {
    match stage {
        Stage::Database => &[
            "Are migrations reversible where possible?",
            "Are indexes added for frequently queried columns?",
            "Are foreign key constraints properly defined?",
            "Is row-level security applied where the data requires it?",
        ],
        Stage::Backend => &[
            "Are API inputs validated?",
            "Is authentication and authorization handled correctly?",
            "Are database queries efficient (no N+1)?",
            "Do errors map to appropriate status codes?",
        ],
        Stage::Frontend => &[
            "Are components properly typed?",
            "Is state management appropriate?",
            "Are loading and error states handled?",
            "Is the UI accessible?",
        ],
        Stage::Testing => &[
            "Do tests cover the main use cases?",
            "Are edge cases tested?",
            "Are tests deterministic?",
            "Is test data isolated?",
        ],
    }
}

fn numbered(items: &[String]) -> String {
    items
        .iter()
        .enumerate()
        .map(|(i, item)| format!("{}. {}", i + 1, item))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn build_review_prompt(ctx: &ReviewContext, diff: &str) -> String {
    let task = &ctx.task;
    let description = if task.description.is_empty() {
        String::new()
    } else {
        format!("**Description:** {}\n", task.description)
    };
    let previous = if task.review_issues.is_empty() {
        String::new()
    } else {
        format!(
            "\n## Previous Review Issues (should be fixed)\n{}\n",
            numbered(&task.review_issues)
        )
    };
    let checklist = stage_checklist(task.stage)
        .iter()
        .map(|c| format!("- {}", c))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"# Code Review

You are reviewing one task of an automated multi-stage delivery pipeline.

## Task
**Task:** {id} - {title}
**Stage:** {stage}
**Spec:** {spec}
**Branch:** {branch}
**Review Attempt:** {attempt} of {max}
{description}{previous}
## Code Changes

```diff
{diff}
```

## Review Instructions

Review the change for correctness, error handling, security and obvious
performance problems.

### {stage} checks
{checklist}

## Output

Respond with ONLY a JSON object:

```json
{{
  "approved": true,
  "issues": ["problems that MUST be fixed before merging"],
  "suggestions": ["optional improvements that do not block the merge"]
}}
```

Approve when there are no critical issues. Style preferences are suggestions,
not issues.
"#,
        id = task.id,
        title = task.title,
        stage = task.stage,
        spec = ctx.spec_name,
        branch = task.branch.as_deref().unwrap_or("(none)"),
        attempt = ctx.attempt,
        max = ctx.max_attempts,
        description = description,
        previous = previous,
        diff = diff,
        checklist = checklist,
    )
}

pub fn build_strategist_prompt(ctx: &StrategistContext) -> String {
    let task = &ctx.task;
    let spec_text = ctx
        .spec_text
        .as_deref()
        .unwrap_or("No spec document available.");
    let code = if ctx.files.is_empty() {
        "No touched files available.".to_string()
    } else {
        ctx.files
            .iter()
            .map(|f| format!("### {}\n```\n{}\n```", f.path, f.content))
            .collect::<Vec<_>>()
            .join("\n\n")
    };
    let prior = if ctx.prior.is_empty() {
        String::new()
    } else {
        let lines = ctx
            .prior
            .iter()
            .map(|i| format!("- {} at {}: {}", i.decision, i.timestamp.to_rfc3339(), i.reasoning))
            .collect::<Vec<_>>()
            .join("\n");
        format!("\n## Previous Interventions\n{}\n", lines)
    };

    format!(
        r#"# Strategic Intervention

A task has failed review {max} times and needs a decision.

## Task
**Task:** {id} - {title}
**Stage:** {stage}
**Spec:** {spec}

## Review Issues
{issues}

## Spec Context
{spec_text}

## Current Code
{code}
{prior}
## Decision

Choose exactly one:

- DIFFERENT_APPROACH: the issues are solvable with another implementation strategy.
- SKIP_TASK: the task is not critical; skip it and record a backlog note. Only
  when downstream tasks will not break.
- MODIFY_SPEC: the requirements are unclear or contradictory.
- NEED_HUMAN: a business decision, credential or architectural choice only a
  human can make.

## Output

Respond with ONLY a JSON object:

```json
{{
  "decision": "DIFFERENT_APPROACH|SKIP_TASK|MODIFY_SPEC|NEED_HUMAN",
  "reasoning": "why",
  "action": {{
    "solution": "DIFFERENT_APPROACH: the approach to try",
    "files_to_change": ["DIFFERENT_APPROACH: files"],
    "code_changes": "DIFFERENT_APPROACH: specific guidance",
    "impact": "SKIP_TASK: what will be missing",
    "backlog_note": "SKIP_TASK: note for later",
    "spec_changes": "MODIFY_SPEC: what must change in the spec",
    "task_changes": "MODIFY_SPEC: how tasks should change",
    "what_is_needed": "NEED_HUMAN: what the human must do",
    "options_for_human": ["NEED_HUMAN: options"]
  }}
}}
```
"#,
        max = ctx.max_attempts,
        id = task.id,
        title = task.title,
        stage = task.stage,
        spec = ctx.spec_name,
        issues = numbered(&task.review_issues),
        spec_text = spec_text,
        code = code,
        prior = prior,
    )
}

pub fn build_oracle_prompt(ctx: &OracleContext) -> String {
    let task = &ctx.task;
    let mut details = vec![
        format!("- **Task:** {} - {}", task.id, task.title),
        format!("- **Stage:** {}", task.stage),
        format!("- **Spec:** {}", ctx.spec_name),
        format!(
            "- **Problem:** {}",
            task.stuck_reason.as_deref().unwrap_or("unknown")
        ),
        format!("- **Failed attempts:** {}", task.retry_count),
    ];
    if let Some(worker) = &ctx.worker {
        details.push(format!("- **Worker:** {}", worker));
    }
    if !task.description.is_empty() {
        details.push(format!("- **Description:** {}", task.description));
    }
    let history = if ctx.history.is_empty() {
        "No recorded activity.".to_string()
    } else {
        ctx.history
            .iter()
            .map(|h| format!("- {}", h))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        r#"# Stuck Task

A worker in an automated delivery pipeline failed the same task repeatedly
and gave up. Work out why and tell the next attempt how to succeed.

## Details
{details}

## Recent Activity
{history}

## Spec Context
{spec_text}

## Project Layout
```
{layout}
```

## Output

Respond with ONLY a JSON object:

```json
{{
  "analysis": "what is most likely causing the failures",
  "guidance": "step-by-step fix for the next attempt, with code where it helps",
  "escalate": false
}}
```

Set "escalate" to true only for problems no worker can solve: missing
credentials, unclear requirements or architectural decisions.
"#,
        details = details.join("\n"),
        history = history,
        spec_text = ctx.spec_text.as_deref().unwrap_or("No spec document available."),
        layout = ctx.layout.join("\n"),
    )
}
