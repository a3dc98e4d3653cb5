const BOOLEAN_HELP: &str = "Boolean operations let you combine shapes! Union merges objects, Subtract removes one from another, and Intersect keeps only overlapping parts. Try selecting two objects and clicking the operation button.";

const CHALLENGE_HELP: &str = "Complete your current challenge by meeting all requirements, then submit for AI evaluation. Once you pass, the next challenge unlocks automatically. Check the Mission Panel for current objectives.";

const TRANSFORM_HELP: &str = "To transform objects: 1) Select an object by clicking it, 2) Choose Move/Rotate/Scale from the toolbar, 3) Drag the colored arrows/circles to transform. Press ESC to deselect.";

const TROUBLESHOOTING_HELP: &str = "Common issues: 1) Objects not aligning - use grid snap, 2) Boolean operation failed - ensure objects overlap, 3) Can't select object - click directly on the mesh. What specific error are you seeing?";

const GENERIC_HELP: &str = "I'm here to help with CADara! I can assist with:
- 3D modeling techniques
- Challenge completion
- Tool usage (move, rotate, scale)
- Boolean operations
- Troubleshooting issues

What would you like to know?";

/// Synthesized reply used when every provider in the chain has failed.
/// The keyword precedence is fixed product behavior: the first matching
/// branch wins even when later keywords also appear in the message.
pub fn canned_fallback(message: &str) -> String {
    let text = message.to_lowercase();
    if contains_any(&text, &["boolean", "union", "subtract"]) {
        BOOLEAN_HELP
    } else if contains_any(&text, &["challenge", "next"]) {
        CHALLENGE_HELP
    } else if contains_any(&text, &["move", "rotate", "scale"]) {
        TRANSFORM_HELP
    } else if contains_any(&text, &["error", "fix", "problem"]) {
        TROUBLESHOOTING_HELP
    } else {
        GENERIC_HELP
    }
    .to_string()
}

fn contains_any(text: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| text.contains(needle))
}
