//! Streaming inference support
//!
//! Generation runs to completion first; the finished output is then replayed
//! word by word, yielding to the scheduler between words.

use futures::Stream;
use serde::Serialize;

use crate::inference::dispatch::Generator;
use crate::inference::prompt::build_prompt;
use crate::types::{GenerationRequest, SamplingParams};

/// Wire marker sent after the last token
pub const DONE_SENTINEL: &str = "[DONE]";

/// Represents a token emitted during streaming inference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "text", rename_all = "snake_case")]
pub enum StreamToken {
    /// A generated token string
    Token(String),
    /// Generation completed successfully
    Done,
    /// An error occurred during generation
    Error(String),
}

impl StreamToken {
    /// Extracts the token string if this is a Token variant
    pub fn as_token(&self) -> Option<&str> {
        match self {
            StreamToken::Token(s) => Some(s),
            _ => None,
        }
    }

    /// Extracts the error message if this is an Error variant
    pub fn as_error(&self) -> Option<&str> {
        match self {
            StreamToken::Error(s) => Some(s),
            _ => None,
        }
    }

    /// Text frame sent to a line- or message-oriented client
    pub fn into_wire(self) -> String {
        match self {
            StreamToken::Token(text) => text,
            StreamToken::Done => DONE_SENTINEL.to_string(),
            StreamToken::Error(message) => format!("[ERROR] {message}"),
        }
    }
}

/// Streams the output for `prompt` one whitespace-delimited word at a time.
///
/// Ends with exactly one [`StreamToken::Done`], or with a single
/// [`StreamToken::Error`] and no tokens when generation fails.
pub fn stream(
    generator: Generator,
    prompt: String,
    params: SamplingParams,
    backend: Option<String>,
    model_ref: Option<String>,
) -> impl Stream<Item = StreamToken> + Send + 'static {
    async_stream::stream! {
        let result = generator
            .generate(&prompt, params, backend.as_deref(), model_ref.as_deref())
            .await;

        match result {
            Ok(result) => {
                for word in result.output.split_whitespace() {
                    yield StreamToken::Token(word.to_string());
                    tokio::task::yield_now().await;
                }
                yield StreamToken::Done;
            }
            Err(e) => {
                tracing::warn!("Streaming generation failed: {e}");
                yield StreamToken::Error(e.to_string());
            }
        }
    }
}

/// [`stream`] for a conversation, with parameters resolved like
/// [`Generator::generate_request`].
pub fn stream_request(
    generator: Generator,
    request: GenerationRequest,
) -> impl Stream<Item = StreamToken> + Send + 'static {
    let prompt = build_prompt(&request.messages);
    let params = request.sampling(generator.settings());
    stream(generator, prompt, params, request.backend, request.model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::inference::testing::{
        stub_generator, DenseReply, StubDense, StubLoader, StubNative,
    };
    use crate::types::Message;
    use futures::StreamExt;
    use std::sync::Arc;

    fn generator(reply: DenseReply) -> Generator {
        let loader = StubLoader::with_engines(StubDense::new(reply), StubNative::new(&[]));
        stub_generator(Arc::new(loader), Settings::default())
    }

    fn params() -> SamplingParams {
        SamplingParams {
            max_tokens: 16,
            temperature: 0.7,
            top_p: 0.9,
        }
    }

    #[test]
    fn test_wire_frames() {
        let token = StreamToken::Token("hi".into());
        assert_eq!(token.as_token(), Some("hi"));
        assert_eq!(token.as_error(), None);
        assert_eq!(token.into_wire(), "hi");
        assert_eq!(StreamToken::Done.into_wire(), "[DONE]");
        assert_eq!(StreamToken::Error("boom".into()).into_wire(), "[ERROR] boom");
    }

    #[tokio::test]
    async fn test_stream_splits_words_then_done() {
        let generator = generator(DenseReply::Echo(" hello world  foo\n".to_string()));
        let items: Vec<StreamToken> =
            stream(generator, "p:".to_string(), params(), None, None)
                .collect()
                .await;

        assert_eq!(
            items,
            vec![
                StreamToken::Token("hello".into()),
                StreamToken::Token("world".into()),
                StreamToken::Token("foo".into()),
                StreamToken::Done,
            ]
        );
        let joined: Vec<&str> = items.iter().filter_map(|t| t.as_token()).collect();
        assert_eq!(joined.join(" "), "hello world foo");
    }

    #[tokio::test]
    async fn test_empty_output_is_just_done() {
        let generator = generator(DenseReply::Echo("   ".to_string()));
        let items: Vec<StreamToken> =
            stream(generator, "p:".to_string(), params(), None, None)
                .collect()
                .await;
        assert_eq!(items, vec![StreamToken::Done]);
    }

    #[tokio::test]
    async fn test_failure_yields_single_error() {
        let failing = generator(DenseReply::Fail("boom".to_string()));
        let items: Vec<StreamToken> =
            stream(failing, "p:".to_string(), params(), None, None)
                .collect()
                .await;
        assert_eq!(items.len(), 1);
        assert!(items[0].as_error().is_some_and(|e| e.contains("boom")));

        let unsupported = generator(DenseReply::Echo(" never".to_string()));
        let items: Vec<StreamToken> = stream(
            unsupported,
            "p:".to_string(),
            params(),
            Some("onnx".to_string()),
            None,
        )
        .collect()
        .await;
        assert_eq!(items.len(), 1);
        assert!(items[0].as_error().is_some_and(|e| e.contains("onnx")));
    }

    #[tokio::test]
    async fn test_stream_request_uses_conversation() {
        let generator = generator(DenseReply::Echo(" fine thanks".to_string()));
        let request = GenerationRequest::new(vec![Message::user("how are you")]);
        let items: Vec<String> = stream_request(generator, request)
            .map(StreamToken::into_wire)
            .collect()
            .await;
        assert_eq!(items, vec!["fine", "thanks", "[DONE]"]);
    }
}
