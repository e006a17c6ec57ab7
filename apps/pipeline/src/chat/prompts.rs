// Chat prompt templates.

pub const CHAT_SYSTEM: &str =
    "You are a helpful and encouraging resume assistant. Answer in plain prose, concisely.";

pub const CHAT_PROMPT_TEMPLATE: &str = r#"Answer the user's question based on the provided context.

If the question is about resume improvements, errors, or formatting, primarily use the "Resume Analysis Data".
If the question is about skills, experience, or career advice, primarily use the "Relevant Resume Excerpts".
If neither section helps, answer from general resume-writing knowledge and say so.

## Resume Analysis Data:
{analysis}

## Relevant Resume Excerpts:
{excerpts}

## User's Question:
"{question}"

Answer:"#;

/// Placeholder used when no passages were retrieved.
pub const NO_EXCERPTS: &str = "(no resume excerpts available)";

pub const EXCERPT_SEPARATOR: &str = "\n---\n";
