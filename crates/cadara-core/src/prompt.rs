use serde_json::Value;

use cadara_types::ChatMessage;

/// How many trailing history entries are forwarded to providers. Older
/// entries are dropped silently; callers own their full transcript.
pub const HISTORY_WINDOW: usize = 4;

const TUTOR_PROMPT: &str = "You are an expert CAD tutor assistant for CADara, an interactive 3D modeling learning platform.

CADara Features:
- Interactive 3D playground with cube, sphere, cylinder, cone shapes
- Transform tools: move, rotate, scale
- Boolean operations: union, subtract, intersect
- Guided tutorials and step-by-step challenges
- Real-time feedback and progress tracking

Your role:
- Answer questions about CAD concepts and 3D modeling
- Help troubleshoot modeling issues
- Explain challenge requirements
- Provide step-by-step guidance
- Suggest next learning steps

Be concise, helpful, and encouraging. Use simple language for beginners.";

const PLATFORM_CONTEXT: &str = "CADara is a 3D modeling education platform with React, Three.js, React Three Fiber. \nFeatures: Interactive 3D Environment, Progressive Learning, Challenge-based Learning, Transform Controls (move/rotate/scale). \nModes: Playground (free modeling), Challenge (structured learning), Tutorial (guided learning). \nTech: React, Three.js, Tailwind CSS, Webpack.";

pub fn system_prompt() -> String {
    format!("{TUTOR_PROMPT}\n\nContext: {PLATFORM_CONTEXT}")
}

/// Assembles the message sequence sent to a provider: system prompt, at
/// most the last [`HISTORY_WINDOW`] history entries, an optional
/// per-request context note, then the user message. Pure and
/// deterministic; emptiness of `message` is validated at the API boundary,
/// not here.
pub fn build_prompt(
    message: &str,
    context: Option<&Value>,
    history: &[ChatMessage],
) -> Vec<ChatMessage> {
    let tail = history.len().saturating_sub(HISTORY_WINDOW);
    let mut messages = Vec::with_capacity(history.len() - tail + 3);
    messages.push(ChatMessage::system(system_prompt()));
    messages.extend(history[tail..].iter().cloned());
    if let Some(context) = context {
        messages.push(ChatMessage::system(format!("Current context: {context}")));
    }
    messages.push(ChatMessage::user(message));
    messages
}
