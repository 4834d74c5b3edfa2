use serde::Serialize;

/// Speaker of a single message. Serialized lowercase to match the
/// chat-completions wire format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Ordered message sequence. Invariant: at most one system message,
/// always first. `push` silently drops system messages once one exists.
#[derive(Clone, Debug, Default)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) {
        match message.role {
            Role::System => {
                if self.messages.first().is_none_or(|m| m.role != Role::System) {
                    self.messages.insert(0, message);
                }
            }
            _ => self.messages.push(message),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Flatten into role-tagged lines ending with an assistant cue.
    /// This is the prompt shape the Ollama native endpoint expects.
    pub fn to_tagged_prompt(&self) -> String {
        let mut parts = Vec::with_capacity(self.messages.len() + 1);
        for msg in &self.messages {
            match msg.role {
                Role::System => parts.push(format!("System: {}", msg.content)),
                Role::User => parts.push(format!("\nUser: {}", msg.content)),
                Role::Assistant => parts.push(format!("\nAssistant: {}", msg.content)),
            }
        }
        parts.push("\nAssistant: ".to_string());
        parts.join("\n")
    }

    /// Flatten into the chat-ML shape used as the local backend's
    /// fallback when it has no chat-native path.
    pub fn to_chatml_prompt(&self) -> String {
        let mut out = String::new();
        for msg in &self.messages {
            let tag = match msg.role {
                Role::System => "<|system|>",
                Role::User => "<|user|>",
                Role::Assistant => "<|assistant|>",
            };
            out.push_str(tag);
            out.push('\n');
            out.push_str(&msg.content);
            out.push('\n');
        }
        out.push_str("<|assistant|>\n");
        out
    }
}

/// Sampling parameters for one request. Built from config defaults,
/// never mutated mid-request.
#[derive(Clone, Debug)]
pub struct GenerationParams {
    pub temperature: f64,
    pub max_tokens: u32,
    pub top_p: f64,
    pub top_k: u32,
    pub repeat_penalty: f64,
    pub stop_sequences: Vec<String>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 2048,
            top_p: 0.95,
            top_k: 40,
            repeat_penalty: 1.1,
            stop_sequences: vec![],
        }
    }
}

/// Assembles system prompt + trimmed history + current turn into the
/// conversation a provider adapter consumes.
pub struct ConversationBuilder {
    system_prompt: Option<String>,
    history: Vec<Message>,
    /// Most-recent history messages kept; the system prompt is not counted.
    max_history: usize,
}

impl ConversationBuilder {
    pub fn new(max_history: usize) -> Self {
        Self {
            system_prompt: None,
            history: Vec::new(),
            max_history,
        }
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// History messages are taken in order; system entries are skipped
    /// since the builder owns the single system slot.
    pub fn history(mut self, messages: impl IntoIterator<Item = Message>) -> Self {
        self.history
            .extend(messages.into_iter().filter(|m| m.role != Role::System));
        self
    }

    pub fn build(self, user_turn: impl Into<String>) -> Conversation {
        let mut conversation = Conversation::new();
        if let Some(prompt) = self.system_prompt {
            conversation.push(Message::system(prompt));
        }
        let skip = self.history.len().saturating_sub(self.max_history);
        for msg in self.history.into_iter().skip(skip) {
            conversation.push(msg);
        }
        conversation.push(Message::user(user_turn));
        conversation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_message_stays_first_and_single() {
        let mut conv = Conversation::new();
        conv.push(Message::user("hi"));
        conv.push(Message::system("you are helpful"));
        conv.push(Message::system("ignored duplicate"));

        assert_eq!(conv.len(), 2);
        assert_eq!(conv.messages()[0].role, Role::System);
        assert_eq!(conv.messages()[0].content, "you are helpful");
    }

    #[test]
    fn tagged_prompt_ends_with_assistant_cue() {
        let mut conv = Conversation::new();
        conv.push(Message::system("sys"));
        conv.push(Message::user("question"));
        let prompt = conv.to_tagged_prompt();

        assert!(prompt.starts_with("System: sys"));
        assert!(prompt.contains("User: question"));
        assert!(prompt.ends_with("Assistant: "), "got: {prompt:?}");
    }

    #[test]
    fn chatml_prompt_closes_with_assistant_tag() {
        let mut conv = Conversation::new();
        conv.push(Message::user("q"));
        let prompt = conv.to_chatml_prompt();
        assert!(prompt.ends_with("<|assistant|>\n"));
        assert!(prompt.contains("<|user|>\nq\n"));
    }

    #[test]
    fn builder_trims_oldest_history() {
        let history = vec![
            Message::user("one"),
            Message::assistant("two"),
            Message::user("three"),
            Message::assistant("four"),
        ];
        let conv = ConversationBuilder::new(2)
            .system_prompt("sys")
            .history(history)
            .build("now");

        let contents: Vec<&str> = conv.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["sys", "three", "four", "now"]);
    }

    #[test]
    fn builder_drops_system_entries_from_history() {
        let conv = ConversationBuilder::new(10)
            .system_prompt("authoritative")
            .history(vec![Message::system("stale"), Message::user("hi")])
            .build("next");

        assert_eq!(conv.messages()[0].content, "authoritative");
        assert!(conv.messages().iter().all(|m| m.content != "stale"));
    }
}
