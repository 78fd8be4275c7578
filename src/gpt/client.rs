use std::{
    fmt::{Debug, Display},
    io::{BufRead, BufReader},
    str::FromStr,
};

use reqwest::{
    blocking::{Client, ClientBuilder, Response},
    Certificate, Proxy,
};
use tracing::{debug, info};

#[derive(Debug, PartialEq, Clone, Copy, Eq)]
pub enum HandleResult {
    Progress,
    Done,
}
impl From<&ChatResponse> for HandleResult {
    fn from(res: &ChatResponse) -> Self {
        match res {
            ChatResponse::DeltaContent(_content) => HandleResult::Progress,
            ChatResponse::Done => HandleResult::Done,
        }
    }
}

#[derive(Debug, PartialEq, Clone, Default, Eq)]
pub struct GptClientOption {
    pub proxy: Option<String>,
    pub ca_path: Option<String>,
}
impl GptClientOption {
    pub fn from_env() -> Self {
        Self {
            proxy: proxy_from_env(),
            ca_path: root_ca_from_env(),
        }
    }
}

pub struct GptClient {
    key: OpenAIKey,
    url: String,
    http: Client,
}
impl GptClient {
    pub const URL: &'static str = "https://api.openai.com/v1/chat/completions";
    /// Proxy and extra root CA come only from `option`.
    pub fn new(key: OpenAIKey, option: GptClientOption) -> Result<Self> {
        let mut builder = Client::builder().no_proxy();
        if let Some(proxy) = option.proxy {
            builder = Self::with_proxy(builder, proxy)?;
        }
        if let Some(ca) = option.ca_path {
            builder = Self::with_root_ca(builder, ca)?;
        }
        let http = builder.build().map_err(|e| {
            GptClientError::new(
                "Cause Error at GptClient::new".to_string(),
                GptClientErrorKind::RequestError(e.to_string()),
            )
        })?;
        Ok(Self {
            key,
            url: Self::URL.to_string(),
            http,
        })
    }
    pub fn from_env() -> Result<Self> {
        let key = OpenAIKey::from_env()?;
        Self::new(key, GptClientOption::from_env())
    }
    /// Points the client at another chat completions endpoint.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
    pub fn request_mut_fn<F: FnMut(&ChatResponse) -> HandleResult>(
        &mut self,
        request: ChatRequest,
        mut f: F,
    ) -> Result<()> {
        let response = self.send(&request)?;
        read_stream(BufReader::new(response), &mut f)
    }
    fn send(&self, request: &ChatRequest) -> Result<Response> {
        debug!(
            model = request.model().as_str(),
            messages = request.messages().len(),
            "send chat request"
        );
        let response = self
            .http
            .post(&self.url)
            .bearer_auth(self.key.key())
            .json(request)
            .send()
            .map_err(|e| {
                GptClientError::new(
                    "Cause Error at GptClient::send".to_string(),
                    GptClientErrorKind::RequestError(e.to_string()),
                )
            })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            info!(status = status.as_u16(), "chat request rejected");
            return Err(GptClientError::from_error_body(status.as_u16(), &body));
        }
        Ok(response)
    }
    fn with_proxy(builder: ClientBuilder, proxy: String) -> Result<ClientBuilder> {
        let proxy = Proxy::all(proxy.as_str()).map_err(|_e| {
            GptClientError::new(
                "invalid proxy url".to_string(),
                GptClientErrorKind::InvalidUrl(proxy.clone()),
            )
        })?;
        Ok(builder.proxy(proxy))
    }
    fn with_root_ca(builder: ClientBuilder, ca: String) -> Result<ClientBuilder> {
        let cert = std::fs::read(&ca)
            .ok()
            .and_then(|pem| Certificate::from_pem(&pem).ok())
            .ok_or_else(|| {
                GptClientError::new(
                    "invalid ca".to_string(),
                    GptClientErrorKind::NotFoundCAFile(ca.clone()),
                )
            })?;
        Ok(builder.add_root_certificate(cert))
    }
}

/// Feeds every `data:` line of a server-sent event stream to `f` until it
/// reports `Done` or the stream ends. A body without a single `data:` line
/// is not an event stream and fails with `ParseError`.
pub(crate) fn read_stream<R: BufRead, F: FnMut(&ChatResponse) -> HandleResult>(
    reader: R,
    f: &mut F,
) -> Result<()> {
    let mut received = false;
    let mut first_line = None;
    for line in reader.lines() {
        let line = line.map_err(|e| {
            GptClientError::new(
                "Cause Error at read_stream".to_string(),
                GptClientErrorKind::ReadStreamError(e.to_string()),
            )
        })?;
        let Some(data) = line.strip_prefix("data:") else {
            if first_line.is_none() && !line.trim().is_empty() {
                first_line = Some(line);
            }
            continue;
        };
        received = true;
        let res = ChatResponse::from_data(data.trim())?;
        if f(&res) == HandleResult::Done {
            return Ok(());
        }
    }
    if !received {
        return Err(GptClientError::new(
            "Response is not an event stream".to_string(),
            GptClientErrorKind::ParseError(first_line.unwrap_or_default()),
        ));
    }
    debug!("chat stream closed without done event");
    Ok(())
}

fn root_ca_from_env() -> Option<String> {
    ["CA_BUNDLE", "ca_bundle"]
        .iter()
        .find_map(|name| std::env::var(name).ok())
}

fn proxy_from_env() -> Option<String> {
    ["HTTPS_PROXY", "https_proxy", "HTTP_PROXY", "http_proxy"]
        .iter()
        .find_map(|name| std::env::var(name).ok())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatResponse {
    Done,
    DeltaContent(String),
}
impl ChatResponse {
    const GPT_DONE: &'static str = "[DONE]";
    fn from_data(data: &str) -> Result<Self> {
        if data.starts_with(Self::GPT_DONE) {
            return Ok(Self::Done);
        };
        match serde_json::from_str::<StreamChat>(data) {
            Ok(chat) => Ok(Self::from(chat)),
            Err(e) => Err(GptClientError {
                message: format!("Failed to parse chat response: {}", e),
                kind: GptClientErrorKind::ParseError(data.to_string()),
            }),
        }
    }
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }
    pub fn delta_content(&self) -> &str {
        match self {
            Self::DeltaContent(s) => s.as_str(),
            _ => "",
        }
    }
}
#[derive(Debug, Clone, serde::Deserialize)]
pub(crate) struct StreamChat {
    choices: Vec<StreamChatChoices>,
}
impl StreamChat {
    fn last_response(mut self) -> Option<String> {
        self.choices.pop()?.delta.content
    }
}
#[derive(Debug, Clone, serde::Deserialize)]
struct StreamChatChoices {
    delta: StreamChatChoicesDelta,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct StreamChatChoicesDelta {
    content: Option<String>,
}
impl From<StreamChat> for ChatResponse {
    fn from(s: StreamChat) -> Self {
        s.last_response()
            .map_or_else(|| Self::DeltaContent(String::new()), Self::DeltaContent)
    }
}
impl<T: Into<String>> From<T> for ChatResponse {
    fn from(s: T) -> Self {
        Self::DeltaContent(s.into())
    }
}

#[derive(Debug, serde::Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorBody,
}
#[derive(Debug, serde::Deserialize)]
struct ApiErrorBody {
    message: String,
}

#[derive(Clone)]
pub struct OpenAIKey(String);

impl OpenAIKey {
    pub const ENV_NAME: &'static str = "OPENAI_API_KEY";
    pub fn from_env() -> Result<Self> {
        Self::from_env_var(Self::ENV_NAME)
    }
    fn from_env_var(name: &str) -> Result<Self> {
        match std::env::var(name) {
            Ok(key) if !key.is_empty() => Ok(Self(key)),
            _ => Err(GptClientError::new(
                format!("{} is not found", name),
                GptClientErrorKind::NotFoundEnvAPIKey,
            )),
        }
    }
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
    fn key(&self) -> &str {
        self.0.as_str()
    }
}
impl Debug for OpenAIKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", "x".repeat(self.0.len()))
    }
}
impl Display for OpenAIKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", "x".repeat(self.0.len()))
    }
}

#[derive(Debug, Clone, serde::Serialize, PartialEq, Eq)]
pub struct ChatRequest {
    model: OpenAIModel,
    messages: Vec<Message>,
    stream: bool,
}
impl ChatRequest {
    pub fn new(model: OpenAIModel, messages: Vec<Message>) -> Self {
        Self {
            model,
            messages,
            stream: true,
        }
    }
    pub fn model(&self) -> OpenAIModel {
        self.model
    }
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }
}

#[derive(Debug, Clone, serde::Serialize, PartialEq, Eq)]
pub struct Message {
    role: Role,
    content: String,
}
impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
    pub fn role(&self) -> Role {
        self.role
    }
    pub fn content(&self) -> &str {
        &self.content
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}
impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}
impl serde::Serialize for Role {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let role: &str = self.as_str();
        serializer.serialize_str(role)
    }
}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenAIModel {
    #[default]
    Gpt3Dot5Turbo,
    Gpt4,
    Gpt4Turbo,
    Gpt4o,
    Gpt4oMini,
}
impl serde::Serialize for OpenAIModel {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl OpenAIModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gpt3Dot5Turbo => "gpt-3.5-turbo",
            Self::Gpt4 => "gpt-4",
            Self::Gpt4Turbo => "gpt-4-turbo",
            Self::Gpt4o => "gpt-4o",
            Self::Gpt4oMini => "gpt-4o-mini",
        }
    }
}
impl FromStr for OpenAIModel {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "gpt-3.5-turbo" | "gpt3" | "3" => Ok(Self::Gpt3Dot5Turbo),
            "gpt-4" | "gpt4" | "4" => Ok(Self::Gpt4),
            "gpt-4-turbo" => Ok(Self::Gpt4Turbo),
            "gpt-4o" => Ok(Self::Gpt4o),
            "gpt-4o-mini" => Ok(Self::Gpt4oMini),
            _ => Err(format!("{} is not supported", s)),
        }
    }
}
impl Display for OpenAIModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq, Clone, thiserror::Error)]
#[error("kind : {kind}\n message : {message}")]
pub struct GptClientError {
    message: String,
    pub kind: GptClientErrorKind,
}
impl GptClientError {
    pub fn new(message: String, kind: GptClientErrorKind) -> Self {
        Self { message, kind }
    }
    fn from_error_body(status: u16, body: &str) -> Self {
        let message = serde_json::from_str::<ApiErrorResponse>(body)
            .map(|res| res.error.message)
            .unwrap_or_else(|_| body.to_string());
        Self {
            message: "Cause Error at GptClient::send".to_string(),
            kind: GptClientErrorKind::ResponseError(status, message),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, thiserror::Error)]
pub enum GptClientErrorKind {
    #[error("Not found CA File. File is : {0}")]
    NotFoundCAFile(String),
    #[error("Invalid Url. Url is : {0}")]
    InvalidUrl(String),
    #[error("Parse Error. Error is : {0}")]
    ParseError(String),
    #[error("Not found OPENAI_API_KEY in env")]
    NotFoundEnvAPIKey,
    #[error("Not Read Stream. Error is : {0}")]
    ReadStreamError(String),
    #[error("Request Error to {0}")]
    RequestError(String),
    #[error("Response Error. Status is : {0}, Error is : {1}")]
    ResponseError(u16, String),
}
pub type Result<T> = std::result::Result<T, GptClientError>;

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::fakes::*;
    use super::*;

    fn client_for(server: &mockito::Server) -> GptClient {
        GptClient::new(OpenAIKey::new("test-key"), GptClientOption::default())
            .unwrap()
            .with_url(format!("{}/v1/chat/completions", server.url()))
    }

    #[test]
    #[ignore = "実際に通信するので、CIでのテストは行わない"]
    fn gptと実際の通信を行うことが可能() {
        let mut client = GptClient::from_env().unwrap();
        let mut responses = Vec::new();

        client
            .request_mut_fn(
                ChatRequest::new(
                    OpenAIModel::Gpt3Dot5Turbo,
                    vec![Message::new(Role::User, "hello")],
                ),
                |res| {
                    responses.push(res.delta_content().to_string());
                    HandleResult::from(res)
                },
            )
            .unwrap();

        assert!(!responses.join("").is_empty());
    }
    #[test]
    fn gptのストリームをmock_serverから受信できる() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer test-key")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "model": "gpt-3.5-turbo",
                "stream": true,
                "messages": [{ "role": "user", "content": "hello" }],
            })))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(make_sse_body(&["Hello", " World"]))
            .create();
        let mut client = client_for(&server);
        let mut responses = Vec::new();

        client
            .request_mut_fn(
                ChatRequest::new(
                    OpenAIModel::Gpt3Dot5Turbo,
                    vec![Message::new(Role::User, "hello")],
                ),
                |res| {
                    responses.push(res.clone());
                    HandleResult::from(res)
                },
            )
            .unwrap();

        mock.assert();
        assert_eq!(
            responses,
            vec![
                ChatResponse::from("Hello"),
                ChatResponse::from(" World"),
                ChatResponse::Done,
            ]
        );
    }
    #[test]
    fn rate_limitのレスポンスはapiのエラーメッセージを持つエラーになる() {
        let mut server = mockito::Server::new();
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(429)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":{"message":"Rate limit reached","type":"requests"}}"#)
            .create();
        let mut client = client_for(&server);

        let err = client
            .request_mut_fn(
                ChatRequest::new(OpenAIModel::Gpt4, vec![Message::new(Role::User, "hi")]),
                |res| HandleResult::from(res),
            )
            .unwrap_err();

        assert_eq!(
            err.kind,
            GptClientErrorKind::ResponseError(429, "Rate limit reached".to_string())
        );
    }
    #[test]
    fn 接続できない場合はrequest_errorになる() {
        let mut client = GptClient::new(OpenAIKey::new("k"), GptClientOption::default())
            .unwrap()
            .with_url("http://127.0.0.1:1/v1/chat/completions");

        let err = client
            .request_mut_fn(
                ChatRequest::new(OpenAIModel::Gpt4, vec![Message::new(Role::User, "hi")]),
                |res| HandleResult::from(res),
            )
            .unwrap_err();

        assert!(matches!(err.kind, GptClientErrorKind::RequestError(_)));
    }
    #[test]
    fn sseのdataはdoneを受け取るまでhandlerに渡される() {
        let body = format!("{}data: {}\n\n", make_sse_body(&["a"]), chunk_json("ignored"));
        let mut called = Vec::new();

        read_stream(Cursor::new(body), &mut |res: &ChatResponse| {
            called.push(res.clone());
            HandleResult::from(res)
        })
        .unwrap();

        assert_eq!(called, vec![ChatResponse::from("a"), ChatResponse::Done]);
    }
    #[test]
    fn sseのdata以外の行は無視される() {
        let body = format!(
            ": keep-alive\n\nevent: message\ndata: {}\n\n",
            chunk_json("hi")
        );
        let mut called = Vec::new();

        read_stream(Cursor::new(body), &mut |res: &ChatResponse| {
            called.push(res.clone());
            HandleResult::from(res)
        })
        .unwrap();

        assert_eq!(called, vec![ChatResponse::from("hi")]);
    }
    #[test]
    fn handlerがdoneを返すとそこで読み込みを止める() {
        let mut called = 0;

        let result = read_stream(Cursor::new(make_sse_body(&["a", "b"])), &mut |_: &ChatResponse| {
            called += 1;
            HandleResult::Done
        });

        assert_eq!(result, Ok(()));
        assert_eq!(called, 1);
    }
    #[test]
    fn dataの行を一つも含まないbodyはparse_errorになる() {
        let result = read_stream(
            Cursor::new("\n<html>proxy login page</html>\n"),
            &mut |res: &ChatResponse| HandleResult::from(res),
        );

        assert_eq!(
            result.unwrap_err().kind,
            GptClientErrorKind::ParseError("<html>proxy login page</html>".to_string())
        );
    }
    #[test]
    fn 途中で切れたstreamはそれまでの内容で終わる() {
        let body = format!("data: {}\n\n", chunk_json("partial"));
        let mut called = Vec::new();

        read_stream(Cursor::new(body), &mut |res: &ChatResponse| {
            called.push(res.clone());
            HandleResult::from(res)
        })
        .unwrap();

        assert_eq!(called, vec![ChatResponse::from("partial")]);
    }
    #[test]
    fn event_streamでない成功レスポンスはサービスのエラーになる() {
        let mut server = mockito::Server::new();
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body("<html>proxy login page</html>")
            .create();
        let mut client = client_for(&server);
        let mut called = 0;

        let err = client
            .request_mut_fn(
                ChatRequest::new(OpenAIModel::Gpt4, vec![Message::new(Role::User, "hi")]),
                |res| {
                    called += 1;
                    HandleResult::from(res)
                },
            )
            .unwrap_err();

        assert!(matches!(err.kind, GptClientErrorKind::ParseError(_)));
        assert_eq!(called, 0);
    }
    #[test]
    fn 環境変数にapi_keyがなければnot_found_env_api_keyになる() {
        let name = "PROMPTCHAT_TEST_UNSET_OPENAI_API_KEY";
        std::env::remove_var(name);

        let err = OpenAIKey::from_env_var(name).unwrap_err();

        assert_eq!(err.kind, GptClientErrorKind::NotFoundEnvAPIKey);
    }
    #[test]
    fn 環境変数のapi_keyを読み込める() {
        let name = "PROMPTCHAT_TEST_SET_OPENAI_API_KEY";
        std::env::set_var(name, "sk-from-env");

        let key = OpenAIKey::from_env_var(name).unwrap();
        std::env::remove_var(name);

        assert_eq!(key.key(), "sk-from-env");
    }
    #[test]
    fn 不正なproxyはinvalid_urlになる() {
        let result = GptClient::new(
            OpenAIKey::new("k"),
            GptClientOption {
                proxy: Some("http://[::1".to_string()),
                ca_path: None,
            },
        );

        assert_eq!(
            result.err().map(|e| e.kind),
            Some(GptClientErrorKind::InvalidUrl("http://[::1".to_string()))
        );
    }
    #[test]
    fn 不正なjsonはparse_errorになる() {
        let result = read_stream(Cursor::new("data: {not json}\n\n"), &mut |res: &ChatResponse| {
            HandleResult::from(res)
        });

        assert!(matches!(
            result.unwrap_err().kind,
            GptClientErrorKind::ParseError(_)
        ));
    }
    #[test]
    #[allow(non_snake_case)]
    fn gptのsseレスポンスをChatResponseに変換可能() {
        assert_eq!(
            ChatResponse::from_data(&chunk_json("Hello World"))
                .unwrap()
                .delta_content(),
            "Hello World"
        );
        assert_eq!(ChatResponse::from_data("[DONE]").unwrap(), ChatResponse::Done);
    }
    #[test]
    #[allow(non_snake_case)]
    fn contentを持たないdeltaは空のDeltaContentになる() {
        let data = r#"{"choices":[{"index":0,"delta":{"role":"assistant"},"finish_reason":null}]}"#;
        assert_eq!(
            ChatResponse::from_data(data).unwrap(),
            ChatResponse::DeltaContent(String::new())
        );
    }
    #[test]
    fn requestはopenaiの形式でシリアライズされる() {
        let request = ChatRequest::new(
            OpenAIModel::Gpt4o,
            vec![
                Message::new(Role::User, "hello"),
                Message::new(Role::Assistant, "hi"),
            ],
        );

        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            serde_json::json!({
                "model": "gpt-4o",
                "messages": [
                    { "role": "user", "content": "hello" },
                    { "role": "assistant", "content": "hi" },
                ],
                "stream": true,
            })
        );
    }
    #[test]
    fn modelは名前と短縮名から生成できる() {
        assert_eq!(
            "gpt3".parse::<OpenAIModel>(),
            Ok(OpenAIModel::Gpt3Dot5Turbo)
        );
        assert_eq!("4".parse::<OpenAIModel>(), Ok(OpenAIModel::Gpt4));
        assert_eq!(
            "gpt-4o-mini".parse::<OpenAIModel>(),
            Ok(OpenAIModel::Gpt4oMini)
        );
        assert!("gpt-5".parse::<OpenAIModel>().is_err());
    }
    #[test]
    fn api_keyは表示時に隠される() {
        let key = OpenAIKey::new("sk-secret");
        assert_eq!(key.to_string(), "xxxxxxxxx");
        assert_eq!(format!("{:?}", key), "xxxxxxxxx");
    }
    #[test]
    fn 存在しないca_fileはエラーになる() {
        let result = GptClient::new(
            OpenAIKey::new("k"),
            GptClientOption {
                proxy: None,
                ca_path: Some("/not/found/ca.pem".to_string()),
            },
        );

        assert_eq!(
            result.err().map(|e| e.kind),
            Some(GptClientErrorKind::NotFoundCAFile(
                "/not/found/ca.pem".to_string()
            ))
        );
    }
}
