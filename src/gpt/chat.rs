use tracing::debug;

use super::client::{
    ChatRequest, ChatResponse, GptClient, GptClientError, HandleResult, Message, OpenAIModel, Role,
};

/// Something that turns a chat request into a stream of [`ChatResponse`]s.
pub trait Completion {
    fn stream(
        &mut self,
        request: ChatRequest,
        f: &mut dyn FnMut(&ChatResponse) -> HandleResult,
    ) -> Result<(), GptClientError>;
}

impl Completion for GptClient {
    fn stream(
        &mut self,
        request: ChatRequest,
        f: &mut dyn FnMut(&ChatResponse) -> HandleResult,
    ) -> Result<(), GptClientError> {
        self.request_mut_fn(request, f)
    }
}

/// Append-only history of a session, sent in full on every turn.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Transcript {
    inner: Vec<Message>,
}
impl Transcript {
    pub fn new() -> Self {
        Self { inner: Vec::new() }
    }
    pub fn messages(&self) -> &[Message] {
        &self.inner
    }
    pub fn len(&self) -> usize {
        self.inner.len()
    }
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
    pub fn last_response(&self) -> Option<&str> {
        self.inner
            .iter()
            .rev()
            .find(|m| m.role() == Role::Assistant)
            .map(|m| m.content())
    }
    fn push_response(&mut self, message: impl Into<String>) {
        self.inner.push(Message::new(Role::Assistant, message));
    }
    fn push_request(&mut self, message: impl Into<String>) {
        self.inner.push(Message::new(Role::User, message));
    }
}

#[derive(Debug, Clone, Default)]
struct DeltaContentStore {
    inner: Vec<String>,
}

impl DeltaContentStore {
    fn new() -> Self {
        Self { inner: Vec::new() }
    }
    fn push(&mut self, message: &ChatResponse) {
        self.inner.push(message.delta_content().to_string());
    }
    fn all_content(&self) -> String {
        self.inner.join("")
    }
}

pub struct Conversation<C: Completion> {
    completion: C,
    model: OpenAIModel,
    transcript: Transcript,
}
impl<C: Completion> Conversation<C> {
    pub fn new(completion: C, model: OpenAIModel) -> Self {
        Self {
            completion,
            model,
            transcript: Transcript::new(),
        }
    }
    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }
    pub fn completion(&self) -> &C {
        &self.completion
    }
    /// Sends `prompt` along with the whole transcript and records the
    /// trimmed reply. Every delta is handed to `on_delta` as it arrives.
    pub fn submit<F: FnMut(&str)>(
        &mut self,
        prompt: impl Into<String>,
        mut on_delta: F,
    ) -> Result<String, GptClientError> {
        self.transcript.push_request(prompt);
        debug!(
            model = self.model.as_str(),
            turns = self.transcript.len(),
            "submit prompt"
        );
        let request = ChatRequest::new(self.model, self.transcript.messages().to_vec());
        let mut store = DeltaContentStore::new();
        self.completion.stream(request, &mut |res: &ChatResponse| {
            if !res.is_done() {
                on_delta(res.delta_content());
                store.push(res);
            }
            HandleResult::from(res)
        })?;
        let reply = store.all_content().trim().to_string();
        self.transcript.push_response(reply.as_str());
        Ok(reply)
    }
}
