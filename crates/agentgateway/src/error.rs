//! Structured error taxonomy shared by adapters, the backend client, the
//! router and the fallback executor. Adapters classify; the executor trusts
//! the classification and only annotates with backend name and attempt count.

use agent_core::prelude::*;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
	Client,
	Validation,
	Backend,
	RateLimit,
	Concurrency,
	Protocol,
	Config,
	Internal,
}

impl ErrorType {
	/// Default HTTP status for this type, used when a code doesn't carry a
	/// more specific one.
	pub fn default_status(self) -> u16 {
		match self {
			ErrorType::Client | ErrorType::Validation => 400,
			ErrorType::RateLimit => 429,
			ErrorType::Concurrency => 503,
			ErrorType::Backend => 502,
			ErrorType::Protocol | ErrorType::Config | ErrorType::Internal => 500,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
	BadRequest,
	Unauthorized,
	UnknownModel,
	NoBackend,
	BackendTimeout,
	BackendError,
	RateLimited,
	ConcurrencyLimit,
	InvalidJson,
	ProtocolConversion,
	Internal,
	Unknown,
}

/// Truncate an upstream-derived message to a safe length before it reaches
/// a client response; the full text still goes to the body-log sink.
pub const MESSAGE_TRUNCATE_LEN: usize = 200;

#[derive(Debug, Clone)]
pub struct Error {
	pub error_type: ErrorType,
	pub code: ErrorCode,
	pub status: u16,
	pub message: Strng,
	pub provider: Option<Strng>,
	pub retryable: bool,
	pub backend: Option<Strng>,
	pub attempt: Option<u32>,
}

impl Error {
	pub fn new(error_type: ErrorType, code: ErrorCode, message: impl Into<Strng>) -> Self {
		let status = error_type.default_status();
		Self {
			error_type,
			code,
			status,
			message: message.into(),
			provider: None,
			retryable: false,
			backend: None,
			attempt: None,
		}
	}

	pub fn with_status(mut self, status: u16) -> Self {
		self.status = status;
		self
	}

	pub fn retryable(mut self, retryable: bool) -> Self {
		self.retryable = retryable;
		self
	}

	pub fn with_provider(mut self, provider: impl Into<Strng>) -> Self {
		self.provider = Some(provider.into());
		self
	}

	pub fn with_backend(mut self, backend: impl Into<Strng>) -> Self {
		self.backend = Some(backend.into());
		self
	}

	pub fn with_attempt(mut self, attempt: u32) -> Self {
		self.attempt = Some(attempt);
		self
	}

	pub fn unknown_model(alias: impl std::fmt::Display) -> Self {
		Self::new(
			ErrorType::Validation,
			ErrorCode::UnknownModel,
			strng::new(format!("unknown model alias: {alias}")),
		)
	}

	pub fn no_backend(reason: impl std::fmt::Display) -> Self {
		Self::new(
			ErrorType::Backend,
			ErrorCode::NoBackend,
			strng::new(format!("no eligible backend: {reason}")),
		)
		.with_status(502)
	}

	pub fn unauthorized(message: impl Into<Strng>) -> Self {
		Self::new(ErrorType::Client, ErrorCode::Unauthorized, message).with_status(401)
	}

	pub fn bad_request(message: impl Into<Strng>) -> Self {
		Self::new(ErrorType::Client, ErrorCode::BadRequest, message)
	}

	pub fn invalid_json(message: impl Into<Strng>) -> Self {
		Self::new(ErrorType::Validation, ErrorCode::InvalidJson, message)
	}

	pub fn internal(message: impl Into<Strng>) -> Self {
		Self::new(ErrorType::Internal, ErrorCode::Internal, message)
	}

	pub fn concurrency_limit(backend: impl Into<Strng>) -> Self {
		Self::new(
			ErrorType::Concurrency,
			ErrorCode::ConcurrencyLimit,
			"backend in-flight limit reached",
		)
		.with_backend(backend)
	}

	/// Map an upstream HTTP status to an Error via the convert-error table.
	/// Retryability: 429 and 5xx, plus Groq's 498.
	pub fn from_backend_status(status: u16, provider: impl Into<Strng>, message: impl Into<Strng>) -> Self {
		let code = match status {
			400 => ErrorCode::BadRequest,
			401 => ErrorCode::Unauthorized,
			403 | 404 => ErrorCode::BadRequest,
			429 => ErrorCode::RateLimited,
			s if s >= 500 => ErrorCode::BackendError,
			_ => ErrorCode::Unknown,
		};
		let error_type = match code {
			ErrorCode::Unauthorized | ErrorCode::BadRequest => ErrorType::Client,
			ErrorCode::RateLimited => ErrorType::RateLimit,
			_ => ErrorType::Backend,
		};
		let retryable = matches!(status, 429 | 500 | 502 | 503 | 504 | 498);
		Self::new(error_type, code, message).retryable(retryable).with_provider(provider)
	}

	pub fn truncated_message(&self) -> String {
		let s = self.message.as_str();
		if s.len() <= MESSAGE_TRUNCATE_LEN {
			s.to_string()
		} else {
			let mut end = MESSAGE_TRUNCATE_LEN;
			while !s.is_char_boundary(end) {
				end -= 1;
			}
			format!("{}...", &s[..end])
		}
	}
}

impl std::fmt::Display for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{:?}/{:?}: {}", self.error_type, self.code, self.message)
	}
}

impl std::error::Error for Error {}

/// Wire shape for `{"error": {...}}` sent to clients on every error path.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
	pub error: ErrorBodyInner,
}

#[derive(Debug, Serialize)]
pub struct ErrorBodyInner {
	pub code: ErrorCode,
	pub message: String,
	#[serde(rename = "type")]
	pub error_type: ErrorType,
	pub req_id: String,
	pub backend: Option<String>,
}

impl Error {
	pub fn to_body(&self, req_id: impl Into<String>) -> ErrorBody {
		ErrorBody {
			error: ErrorBodyInner {
				code: self.code,
				message: self.truncated_message(),
				error_type: self.error_type,
				req_id: req_id.into(),
				backend: self.backend.as_ref().map(|b| b.to_string()),
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn status_table() {
		assert_eq!(ErrorType::Validation.default_status(), 400);
		assert_eq!(ErrorType::RateLimit.default_status(), 429);
		assert_eq!(ErrorType::Concurrency.default_status(), 503);
		assert_eq!(ErrorType::Backend.default_status(), 502);
		assert_eq!(ErrorType::Internal.default_status(), 500);
	}

	#[test]
	fn backend_status_retryable() {
		let e = Error::from_backend_status(500, "openai", "boom");
		assert!(e.retryable);
		assert_matches::assert_matches!(e.error_type, ErrorType::Backend);
		let e = Error::from_backend_status(401, "openai", "nope");
		assert!(!e.retryable);
		assert_matches::assert_matches!(e.error_type, ErrorType::Client);
	}

	/// Client-facing status must stay in the closed set regardless of the
	/// raw upstream code: both 503s from two different backends still
	/// surface as 502, not 503, since the error is `ErrorType::Backend`.
	#[test]
	fn backend_status_clamped_to_closed_set() {
		let e = Error::from_backend_status(503, "openai", "unavailable");
		assert_eq!(e.status, 502);
		let e = Error::from_backend_status(504, "openai", "timeout");
		assert_eq!(e.status, 502);
		let e = Error::from_backend_status(401, "openai", "nope");
		assert_eq!(e.status, 401);
		let e = Error::from_backend_status(429, "openai", "slow down");
		assert_eq!(e.status, 429);
	}

	#[test]
	fn message_truncation() {
		let long = "x".repeat(300);
		let e = Error::internal(strng::new(long));
		assert_eq!(e.truncated_message().len(), MESSAGE_TRUNCATE_LEN + 3);
	}
}
