//! Renders the canonical `Response`/`StreamChunk` back into the *client's*
//! dialect — the mirror image of what `crate::llm` adapters do for the
//! backend side. This is what lets an Anthropic client talking to an
//! OpenAI backend get an Anthropic-shaped reply even though the backend
//! adapter produced an OpenAI-shaped one.

use serde_json::{Value, json};

use crate::types::Response;

pub fn to_openai_json(resp: &Response) -> Value {
	let choices: Vec<Value> = resp
		.choices
		.iter()
		.map(|c| {
			json!({
				"index": c.index,
				"message": {
					"role": c.message.role.as_str(),
					"content": c.message.content,
					"tool_calls": c.message.tool_calls,
				},
				"finish_reason": c.finish_reason.as_ref().map(|s| s.as_str()),
			})
		})
		.collect();

	json!({
		"id": resp.id.as_str(),
		"object": "chat.completion",
		"model": resp.model.as_str(),
		"choices": choices,
		"usage": {
			"prompt_tokens": resp.usage.prompt_tokens,
			"completion_tokens": resp.usage.completion_tokens,
			"total_tokens": resp.usage.total_tokens,
		},
	})
}

pub fn to_anthropic_json(resp: &Response) -> Value {
	let first = resp.choices.first();
	let text = first.map(|c| c.message.text()).unwrap_or_default();
	let tool_use_blocks: Vec<Value> = first
		.and_then(|c| c.message.tool_calls.as_ref())
		.and_then(Value::as_array)
		.map(|calls| {
			calls
				.iter()
				.filter_map(|call| {
					let func = call.get("function")?;
					Some(json!({
						"type": "tool_use",
						"id": call.get("id").cloned().unwrap_or(Value::Null),
						"name": func.get("name").cloned().unwrap_or(Value::Null),
						"input": func.get("arguments").cloned().unwrap_or(Value::Null),
					}))
				})
				.collect()
		})
		.unwrap_or_default();

	let mut content = Vec::new();
	if !text.is_empty() {
		content.push(json!({"type": "text", "text": text}));
	}
	content.extend(tool_use_blocks);

	let stop_reason = first.and_then(|c| c.finish_reason.as_ref()).map(|s| match s.as_str() {
		"stop" => "end_turn",
		"length" => "max_tokens",
		"content_filter" => "refusal",
		other => other,
	});

	json!({
		"id": resp.id.as_str(),
		"type": "message",
		"role": "assistant",
		"model": resp.model.as_str(),
		"content": content,
		"stop_reason": stop_reason,
		"usage": {
			"input_tokens": resp.usage.prompt_tokens,
			"output_tokens": resp.usage.completion_tokens,
		},
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::message::Message;
	use crate::types::response::{Choice, Usage};

	fn sample_response() -> Response {
		Response {
			id: agent_core::strng::literal("x"),
			model: agent_core::strng::literal("gpt-4o"),
			choices: vec![Choice {
				index: 0,
				message: Message {
					role: agent_core::strng::literal("assistant"),
					content: Value::String("hi".to_string()),
					tool_calls: None,
					tool_call_id: None,
					cache_control: None,
					extra: serde_json::Map::new(),
				},
				finish_reason: Some(agent_core::strng::literal("stop")),
			}],
			usage: Usage {
				prompt_tokens: Some(3),
				completion_tokens: Some(1),
				total_tokens: Some(4),
			},
			headers: Vec::new(),
			extra: serde_json::Map::new(),
		}
	}

	#[test]
	fn openai_shape_has_choices_array() {
		let v = to_openai_json(&sample_response());
		assert_eq!(v["choices"][0]["message"]["content"], json!("hi"));
		assert_eq!(v["usage"]["total_tokens"], json!(4));
	}

	#[test]
	fn anthropic_shape_has_content_blocks_and_stop_reason() {
		let v = to_anthropic_json(&sample_response());
		assert_eq!(v["content"][0]["type"], json!("text"));
		assert_eq!(v["content"][0]["text"], json!("hi"));
		assert_eq!(v["stop_reason"], json!("end_turn"));
	}
}
