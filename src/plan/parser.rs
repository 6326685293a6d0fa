//! Markdown parsing for spec directories.
//!
//! `tasks.md` lists open work as checklist items:
//!
//! ```markdown
//! ## Database
//! - [ ] Create users table
//!   Include email uniqueness.
//! - [x] Already done, ignored
//!
//! ## Backend
//! - [ ] Login endpoint
//! ```
//!
//! A `## <stage>` heading sets the stage of the items below it. Without one,
//! the stage is guessed from keywords in the title and otherwise carried over
//! from the previous item.

use regex::Regex;
use std::str::FromStr;
use std::sync::LazyLock;

use crate::state::Stage;

static OPEN_ITEM_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[-*]\s+\[ \]\s+(.+?)\s*$").unwrap());

static CLOSED_ITEM_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[-*]\s+\[[xX]\]\s+").unwrap());

static HEADING_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(#{1,6})\s+(.+?)\s*#*\s*$").unwrap());

static KEYWORD_STAGES: LazyLock<Vec<(Stage, Regex)>> = LazyLock::new(|| {
    vec![
        (
            Stage::Testing,
            Regex::new(r"(?i)\b(tests?|e2e|spec|coverage|fixtures?)\b").unwrap(),
        ),
        (
            Stage::Database,
            Regex::new(r"(?i)\b(migrations?|schema|database|tables?|index(es)?|seed)\b").unwrap(),
        ),
        (
            Stage::Frontend,
            Regex::new(r"(?i)\b(components?|pages?|forms?|ui|layout|styling|views?)\b").unwrap(),
        ),
        (
            Stage::Backend,
            Regex::new(r"(?i)\b(api|endpoints?|routes?|services?|handlers?|server)\b").unwrap(),
        ),
    ]
});

/// One open checklist item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTask {
    pub title: String,
    pub description: String,
    pub stage: Stage,
}

/// Stage named by a heading like `## Backend` or `### Stage 2: Frontend`.
fn heading_stage(text: &str) -> Option<Stage> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .find_map(|word| Stage::from_str(word).ok())
}

/// Guess a stage from words in a task title.
pub fn detect_stage(title: &str) -> Option<Stage> {
    KEYWORD_STAGES
        .iter()
        .find(|(_, re)| re.is_match(title))
        .map(|(stage, _)| *stage)
}

/// The first `# ` heading of a document.
pub fn parse_title(markdown: &str) -> Option<String> {
    markdown.lines().find_map(|line| {
        let cap = HEADING_REGEX.captures(line)?;
        (cap[1].len() == 1).then(|| cap[2].to_string())
    })
}

pub fn parse_tasks(markdown: &str) -> Vec<ParsedTask> {
    let mut tasks: Vec<ParsedTask> = Vec::new();
    let mut section: Option<Stage> = None;
    let mut last = Stage::Database;
    // Continuation lines attach to the item above until a blank line.
    let mut open = false;

    for line in markdown.lines() {
        if let Some(cap) = HEADING_REGEX.captures(line) {
            section = heading_stage(&cap[2]).or(section);
            open = false;
            continue;
        }
        if let Some(cap) = OPEN_ITEM_REGEX.captures(line) {
            let title = cap[1].to_string();
            let stage = section.or_else(|| detect_stage(&title)).unwrap_or(last);
            last = stage;
            tasks.push(ParsedTask {
                title,
                description: String::new(),
                stage,
            });
            open = true;
            continue;
        }
        if CLOSED_ITEM_REGEX.is_match(line) || line.trim().is_empty() {
            open = false;
            continue;
        }
        if open
            && line.starts_with([' ', '\t'])
            && let Some(task) = tasks.last_mut()
        {
            if !task.description.is_empty() {
                task.description.push(' ');
            }
            task.description.push_str(line.trim());
        }
    }
    tasks
}
