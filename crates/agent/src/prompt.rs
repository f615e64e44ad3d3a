use roundkeeper_core::GuardState;

const SYSTEM_PREAMBLE: &str = "You are a voice assistant. Answer briefly in plain spoken language.";

/// Builds the generation prompt from the round's state, bucket context and the scrubbed turn.
pub fn build_prompt(state: GuardState, context: &[String], text: &str) -> String {
    let mut prompt = String::from(SYSTEM_PREAMBLE);
    prompt.push('\n');
    prompt.push_str(state_guidance(state));
    prompt.push('\n');

    if !context.is_empty() {
        prompt.push_str("\nConversation memory:\n");
        for line in context {
            prompt.push_str("- ");
            prompt.push_str(line);
            prompt.push('\n');
        }
    }

    prompt.push_str("\nUser: ");
    prompt.push_str(text);
    prompt.push_str("\nAssistant:");
    prompt
}

fn state_guidance(state: GuardState) -> &'static str {
    match state {
        GuardState::Default | GuardState::Conversation => "Keep the conversation going naturally.",
        GuardState::Action => "Prefer concrete, locally executable steps and state what you will do.",
        GuardState::Research => "Outline what needs to be looked up; long research runs as a background job.",
    }
}
