//! Lifecycle messages posted by the embedded exam browser.

use serde::Deserialize;
use serde_json::Value;

/// Exam identifiers carried by `start-exam`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExamRef {
    pub exam_id: Option<String>,
    pub student_exam_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StartExam(ExamRef),
    SubmitExam,
    Cancel,
    /// Authentication token for the backend; carried through but not used by the engine.
    Token(String),
}

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("malformed session event: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown session event '{0}'")]
    Unknown(String),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEvent {
    #[serde(alias = "type")]
    event: String,
    #[serde(default, alias = "exam_id")]
    exam_id: Option<Value>,
    #[serde(default, alias = "student_exam_id")]
    student_exam_id: Option<Value>,
    #[serde(default)]
    token: Option<String>,
}

/// IDs arrive as numbers or strings depending on the backend version.
fn id_string(value: Option<Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl SessionEvent {
    /// Parse `{"event": "startExam", "examId": 12, ...}`. Event names may be
    /// kebab-case, snake_case or camelCase.
    pub fn from_json(line: &str) -> Result<Self, EventError> {
        let raw: RawEvent = serde_json::from_str(line)?;
        let name: String = raw
            .event
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();

        match name.as_str() {
            "startexam" => Ok(Self::StartExam(ExamRef {
                exam_id: id_string(raw.exam_id),
                student_exam_id: id_string(raw.student_exam_id),
            })),
            "submitexam" => Ok(Self::SubmitExam),
            "cancel" | "cancelexam" => Ok(Self::Cancel),
            "token" => Ok(Self::Token(raw.token.unwrap_or_default())),
            _ => Err(EventError::Unknown(raw.event)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_camel_and_kebab_names() {
        let start = SessionEvent::from_json(
            r#"{"event":"startExam","examId":42,"studentExamId":"se-9"}"#,
        )
        .unwrap();
        assert_eq!(
            start,
            SessionEvent::StartExam(ExamRef {
                exam_id: Some("42".into()),
                student_exam_id: Some("se-9".into()),
            })
        );
        assert_eq!(
            SessionEvent::from_json(r#"{"event":"submit-exam"}"#).unwrap(),
            SessionEvent::SubmitExam
        );
        assert_eq!(
            SessionEvent::from_json(r#"{"type":"cancel"}"#).unwrap(),
            SessionEvent::Cancel
        );
    }

    #[test]
    fn start_without_ids_is_accepted() {
        let event = SessionEvent::from_json(r#"{"event":"start_exam"}"#).unwrap();
        assert_eq!(event, SessionEvent::StartExam(ExamRef::default()));
    }

    #[test]
    fn token_keeps_its_value() {
        let event = SessionEvent::from_json(r#"{"event":"token","token":"abc"}"#).unwrap();
        assert_eq!(event, SessionEvent::Token("abc".into()));
    }

    #[test]
    fn rejects_unknown_and_malformed() {
        assert!(matches!(
            SessionEvent::from_json(r#"{"event":"openDevTools"}"#),
            Err(EventError::Unknown(name)) if name == "openDevTools"
        ));
        assert!(matches!(
            SessionEvent::from_json("start-exam"),
            Err(EventError::Json(_))
        ));
    }
}
