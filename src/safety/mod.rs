//! Safety gate
//!
//! Classifies a user utterance as SAFE or UNSAFE with a short greedy
//! generation and turns the verdict into a reply. Anything the model says
//! that is not clearly safe counts as unsafe.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::inference::{BackendKind, GenerationError, Generator};
use crate::types::{last_user_message, ChatError, GenerationRequest, Message, Role};

/// Keywords that mark an unsafe verdict; checked before the safe ones
const UNSAFE_KEYWORDS: [&str; 3] = ["UNSAFE", "NOT SAFE", "BAD"];

const SAFE_KEYWORDS: [&str; 2] = ["SAFE", "OK"];

/// Reply sent when a message is judged safe under [`ReplyPolicy::Acknowledge`]
pub const SAFE_NOTICE: &str = "이 메시지는 필터 기준으로 안전한 표현으로 판단되었습니다.";

/// Reply sent when a message is blocked
pub const BLOCKED_NOTICE: &str = "부적절한 표현이 감지되어 메시지가 차단되었습니다.";

/// Builds the classification instruction around `text`.
pub fn instruction_prompt(text: &str) -> String {
    format!(
        "다음 사용자의 발화가 부적절한 표현인지 판별하십시오. \
         부적절한 경우에는 'UNSAFE', 문제가 없으면 'SAFE' 라는 단어 하나만 출력하세요.\n\n\
         사용자: {text}\n\
         판단:"
    )
}

/// What the gate answers once a message is judged safe
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyPolicy {
    /// A fixed notice that the message passed the filter
    #[default]
    Acknowledge,
    /// A model reply to the full conversation
    Generate,
}

#[derive(Debug, Error)]
#[error("unknown reply policy '{0}' (expected 'acknowledge' or 'generate')")]
pub struct UnknownReplyPolicy(String);

impl FromStr for ReplyPolicy {
    type Err = UnknownReplyPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "acknowledge" => Ok(ReplyPolicy::Acknowledge),
            "generate" => Ok(ReplyPolicy::Generate),
            _ => Err(UnknownReplyPolicy(s.to_string())),
        }
    }
}

impl fmt::Display for ReplyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyPolicy::Acknowledge => f.write_str("acknowledge"),
            ReplyPolicy::Generate => f.write_str("generate"),
        }
    }
}

/// Outcome of one classification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub is_safe: bool,
    /// Model output, trimmed
    pub raw_decision: String,
    /// `raw_decision` upper-cased
    pub normalized_decision: String,
}

/// Turns raw classifier output into a verdict.
///
/// Unsafe keywords win over safe ones; output with neither is unsafe.
pub fn decide(raw: &str) -> SafetyVerdict {
    let raw_decision = raw.trim().to_string();
    let normalized_decision = raw_decision.to_uppercase();

    let is_safe = if UNSAFE_KEYWORDS
        .iter()
        .any(|kw| normalized_decision.contains(kw))
    {
        false
    } else {
        SAFE_KEYWORDS
            .iter()
            .any(|kw| normalized_decision.contains(kw))
    };

    SafetyVerdict {
        is_safe,
        raw_decision,
        normalized_decision,
    }
}

/// Errors raised by [`SafetyGate::respond`]
#[derive(Debug, Error)]
pub enum SafetyError {
    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error(transparent)]
    Generation(#[from] GenerationError),
}

#[derive(Clone)]
pub struct SafetyClassifier {
    generator: Generator,
    backend: Option<BackendKind>,
}

impl SafetyClassifier {
    /// Classifies on the generator's default backend
    pub fn new(generator: Generator) -> Self {
        Self {
            generator,
            backend: None,
        }
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = Some(backend);
        self
    }

    pub async fn classify(&self, text: &str) -> Result<SafetyVerdict, GenerationError> {
        let prompt = instruction_prompt(text);
        let result = self
            .generator
            .generate_constrained(&prompt, self.backend.map(|kind| kind.as_str()))
            .await?;

        let verdict = decide(&result.output);
        debug!(
            "Classified {} chars as {} (raw {:?})",
            text.chars().count(),
            if verdict.is_safe { "safe" } else { "unsafe" },
            verdict.raw_decision
        );
        Ok(verdict)
    }
}

/// Reply produced by the gate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatedReply {
    pub role: Role,
    pub content: String,
    pub is_safe: bool,
    pub raw_decision: String,
}

/// Classifies the latest user message before anything is answered
#[derive(Clone)]
pub struct SafetyGate {
    classifier: SafetyClassifier,
    policy: ReplyPolicy,
}

impl SafetyGate {
    pub fn new(classifier: SafetyClassifier, policy: ReplyPolicy) -> Self {
        Self { classifier, policy }
    }

    pub fn policy(&self) -> ReplyPolicy {
        self.policy
    }

    pub async fn respond(&self, messages: &[Message]) -> Result<GatedReply, SafetyError> {
        let last = last_user_message(messages)?;
        let verdict = self.classifier.classify(&last.content).await?;

        let content = if !verdict.is_safe {
            info!("Blocked message (raw decision {:?})", verdict.raw_decision);
            BLOCKED_NOTICE.to_string()
        } else {
            match self.policy {
                ReplyPolicy::Acknowledge => SAFE_NOTICE.to_string(),
                ReplyPolicy::Generate => {
                    let request = GenerationRequest::new(messages.to_vec());
                    self.classifier
                        .generator
                        .generate_request(&request)
                        .await?
                        .output
                }
            }
        };

        Ok(GatedReply {
            role: Role::Assistant,
            content,
            is_safe: verdict.is_safe,
            raw_decision: verdict.raw_decision,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::inference::dispatch::CONSTRAINED_MAX_TOKENS;
    use crate::inference::testing::{
        stub_generator, DenseReply, StubDense, StubLoader, StubNative,
    };
    use std::sync::Arc;

    fn loader(dense: DenseReply, native: &[&str]) -> Arc<StubLoader> {
        Arc::new(StubLoader::with_engines(
            StubDense::new(dense),
            StubNative::new(native),
        ))
    }

    fn classifier(loader: Arc<StubLoader>) -> SafetyClassifier {
        SafetyClassifier::new(stub_generator(loader, Settings::default()))
    }

    #[test]
    fn test_decide_fails_closed() {
        for raw in ["", "   ", "MAYBE", "잘 모르겠습니다", "neutral"] {
            let verdict = decide(raw);
            assert!(!verdict.is_safe, "{raw:?} should be unsafe");
        }
    }

    #[test]
    fn test_decide_unsafe_wins() {
        assert!(!decide("SAFE UNSAFE").is_safe);
        assert!(!decide("unsafe").is_safe);
        assert!(!decide("Not safe").is_safe);
        assert!(!decide("bad").is_safe);
    }

    #[test]
    fn test_decide_safe_keywords() {
        let verdict = decide("  safe\n");
        assert!(verdict.is_safe);
        assert_eq!(verdict.raw_decision, "safe");
        assert_eq!(verdict.normalized_decision, "SAFE");
        assert!(decide("ok").is_safe);
    }

    #[test]
    fn test_instruction_prompt_embeds_text() {
        let prompt = instruction_prompt("안녕하세요");
        assert!(prompt.contains("'UNSAFE'"));
        assert!(prompt.contains("'SAFE'"));
        assert!(prompt.contains("\n\n사용자: 안녕하세요\n"));
        assert!(prompt.ends_with("판단:"));
    }

    #[test]
    fn test_reply_policy_parsing() {
        assert_eq!("Generate".parse::<ReplyPolicy>().unwrap(), ReplyPolicy::Generate);
        assert_eq!(
            " acknowledge ".parse::<ReplyPolicy>().unwrap(),
            ReplyPolicy::Acknowledge
        );
        assert!("echo".parse::<ReplyPolicy>().is_err());
        assert_eq!(ReplyPolicy::default(), ReplyPolicy::Acknowledge);
        assert_eq!(
            serde_json::to_string(&ReplyPolicy::Generate).unwrap(),
            "\"generate\""
        );
    }

    #[tokio::test]
    async fn test_classify_greeting_round_trip() {
        let loader = loader(DenseReply::Echo(" SAFE".to_string()), &[]);
        let verdict = classifier(loader.clone())
            .classify("안녕하세요")
            .await
            .unwrap();

        assert_eq!(
            verdict,
            SafetyVerdict {
                is_safe: true,
                raw_decision: "SAFE".to_string(),
                normalized_decision: "SAFE".to_string(),
            }
        );

        let (prompt, options) = &loader.dense.calls()[0];
        assert_eq!(prompt, &instruction_prompt("안녕하세요"));
        assert!(!options.do_sample);
        assert_eq!(options.max_new_tokens, CONSTRAINED_MAX_TOKENS as usize);
    }

    #[tokio::test]
    async fn test_classify_on_configured_backend() {
        let loader = loader(DenseReply::Echo(" SAFE".to_string()), &[" UNSAFE"]);
        let verdict = classifier(loader.clone())
            .with_backend(BackendKind::QuantizedNative)
            .classify("something rude")
            .await
            .unwrap();

        assert!(!verdict.is_safe);
        assert!(loader.dense.calls().is_empty());
        assert_eq!(loader.native.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_gate_rejects_bad_conversations() {
        let gate = SafetyGate::new(
            classifier(Arc::new(StubLoader::new())),
            ReplyPolicy::Acknowledge,
        );

        let err = gate.respond(&[]).await.unwrap_err();
        assert!(matches!(err, SafetyError::Chat(ChatError::EmptyConversation)));

        let err = gate
            .respond(&[Message::assistant("hello")])
            .await
            .unwrap_err();
        assert!(matches!(err, SafetyError::Chat(ChatError::NoUserMessage)));
    }

    #[tokio::test]
    async fn test_gate_blocks_unsafe() {
        let loader = loader(DenseReply::Echo(" UNSAFE".to_string()), &[]);
        let gate = SafetyGate::new(classifier(loader), ReplyPolicy::Generate);

        let reply = gate.respond(&[Message::user("욕설")]).await.unwrap();
        assert_eq!(reply.role, Role::Assistant);
        assert_eq!(reply.content, BLOCKED_NOTICE);
        assert!(!reply.is_safe);
        assert_eq!(reply.raw_decision, "UNSAFE");
    }

    #[tokio::test]
    async fn test_gate_acknowledges_last_user_message() {
        let loader = loader(DenseReply::Echo(" SAFE".to_string()), &[]);
        let gate = SafetyGate::new(classifier(loader.clone()), ReplyPolicy::Acknowledge);

        let messages = vec![
            Message::user("first"),
            Message::assistant("reply"),
            Message::user("second"),
        ];
        let reply = gate.respond(&messages).await.unwrap();
        assert_eq!(reply.content, SAFE_NOTICE);
        assert!(reply.is_safe);

        let calls = loader.dense.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].0.contains("사용자: second\n"));
    }

    #[tokio::test]
    async fn test_gate_generates_reply_when_configured() {
        let loader = loader(DenseReply::Echo(" 반가워요".to_string()), &["SAFE"]);
        let classifier = classifier(loader.clone()).with_backend(BackendKind::QuantizedNative);
        let gate = SafetyGate::new(classifier, ReplyPolicy::Generate);

        let reply = gate.respond(&[Message::user("안녕")]).await.unwrap();
        assert!(reply.is_safe);
        assert_eq!(reply.content, "반가워요");

        let calls = loader.dense.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "user: 안녕\nassistant:");
        assert!(calls[0].1.do_sample);
    }
}
