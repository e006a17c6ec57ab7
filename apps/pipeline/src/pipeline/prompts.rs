// Analysis prompt templates.

/// The output contract handed to the model. Parsing enforces the same rules.
pub const ANALYSIS_SCHEMA: &str = r#"{
  "atsScore": number between 0 and 100 (omit if the resume cannot be scored),
  "grammarErrors": [{"error": "string", "suggestion": "string"}],
  "spellingErrors": [{"word": "string", "suggestion": "string"}],
  "formattingIssues": [{"issue": "string", "suggestion": "string (optional)"}],
  "impactWords": ["string"],
  "missingKeywords": ["string"],
  "matchingKeywords": ["string"],
  "summary": "string (optional)"
}"#;

pub const ANALYSIS_PROMPT_TEMPLATE: &str = r#"You are a resume analysis assistant. Be precise, concise, and actionable.
Analyze the following resume for grammar, spelling, formatting, impact words, and ATS keyword match.

OUTPUT SCHEMA (return exactly this structure, no other keys):
{schema}

RULES:
1. atsScore must be a number from 0 to 100. Omit it rather than guessing.
2. Every array may be empty but must be present as an array.
3. impactWords lists strong action verbs already used in the resume, without duplicates.
4. Return ONLY the JSON object, nothing else, no code fences.

RESUME:
{resume_text}"#;
