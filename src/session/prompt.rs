//! System prompt and title helpers

const BASE_PROMPT: &str = "You are a friendly assistant! Keep your responses concise and helpful.";

const TOOLS_PROMPT: &str = "You can call tools when they help answer the user. \
When a tool returns an error, explain the problem to the user instead of retrying blindly.";

pub const TITLE_MAX_CHARS: usize = 80;

/// Optional location hints supplied with a request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestHints {
    pub latitude: Option<String>,
    pub longitude: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
}

impl RequestHints {
    pub fn is_empty(&self) -> bool {
        self.latitude.is_none()
            && self.longitude.is_none()
            && self.city.is_none()
            && self.country.is_none()
    }

    fn render(&self) -> String {
        let field = |v: &Option<String>| v.as_deref().unwrap_or("unknown").to_string();
        format!(
            "About the origin of user's request:\n- lat: {}\n- lon: {}\n- city: {}\n- country: {}",
            field(&self.latitude),
            field(&self.longitude),
            field(&self.city),
            field(&self.country),
        )
    }
}

/// Build the system prompt. Reasoning-only models get no tool guidance.
pub fn system_prompt(hints: &RequestHints, reasoning: bool) -> String {
    let mut prompt = BASE_PROMPT.to_string();
    if !hints.is_empty() {
        prompt.push_str("\n\n");
        prompt.push_str(&hints.render());
    }
    if !reasoning {
        prompt.push_str("\n\n");
        prompt.push_str(TOOLS_PROMPT);
    }
    prompt
}

/// Title for a new chat, derived from the first user text.
pub fn chat_title(first_text: &str) -> String {
    let line = first_text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let title = truncate_with_ellipsis(line.trim(), TITLE_MAX_CHARS);
    if title.is_empty() {
        "New chat".to_string()
    } else {
        title
    }
}

fn truncate_with_ellipsis(value: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }

    let mut chars = value.chars();
    let mut output = String::new();
    for _ in 0..max_chars {
        if let Some(ch) = chars.next() {
            output.push(ch);
        } else {
            return value.to_string();
        }
    }

    if chars.next().is_some() {
        format!("{output}...")
    } else {
        output
    }
}
