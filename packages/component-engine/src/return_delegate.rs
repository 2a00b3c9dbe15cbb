//! Merging an executor's output into the outgoing event.
//!
//! | Output | Payload | Attributes |
//! |--------|---------|------------|
//! | `Void` | unchanged | unchanged |
//! | `Value(v)` | `v` | unchanged |
//! | `Result { output, attributes: None }` | `output` | cleared to `Null` |
//! | `Result { output, attributes: Some(a) }` | `output` | `a` |
//! | any, with a target | unchanged | unchanged (result stored in the target variable) |
//!
//! Streams entering the event are registered with the
//! [`StreamingManager`] under the event's context.

use std::fmt;

use crate::error::EngineError;
use crate::event::{Event, Message, TypedValue};
use crate::executor::{ComponentOutput, OutputResult};
use crate::streaming::StreamingManager;

pub const MESSAGE_EXPRESSION: &str = "#[message]";
pub const PAYLOAD_EXPRESSION: &str = "#[payload]";
pub const ATTRIBUTES_EXPRESSION: &str = "#[attributes]";

/// True if `value` is written in expression syntax, `#[...]`.
pub fn is_expression(value: &str) -> bool {
    let value = value.trim();
    value.starts_with("#[") && value.ends_with(']')
}

/// Turns an executor's output into the event passed downstream.
pub trait ReturnDelegate: Send + Sync + 'static {
    fn to_event(&self, output: ComponentOutput, event: &Event) -> anyhow::Result<Event>;
}

/// For components that return nothing: the event passes through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct VoidReturnDelegate;

impl ReturnDelegate for VoidReturnDelegate {
    fn to_event(&self, _output: ComponentOutput, event: &Event) -> anyhow::Result<Event> {
        Ok(event.clone())
    }
}

/// Replaces the message with the output.
#[derive(Debug, Clone)]
pub struct ValueReturnDelegate {
    streaming: StreamingManager,
}

impl ValueReturnDelegate {
    pub fn new(streaming: StreamingManager) -> Self {
        Self { streaming }
    }
}

impl ReturnDelegate for ValueReturnDelegate {
    fn to_event(&self, output: ComponentOutput, event: &Event) -> anyhow::Result<Event> {
        let message = output_message(output, event.message());
        manage_streams(&self.streaming, &message, event);
        Ok(event.clone().with_message(message))
    }
}

/// What a target variable receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetValue {
    /// The whole resulting message.
    Message,
    /// Only the resulting payload.
    Payload,
    /// Only the resulting attributes.
    Attributes,
}

impl TargetValue {
    /// Parse a target value expression.
    pub fn parse(expression: &str) -> Option<Self> {
        match expression.trim() {
            MESSAGE_EXPRESSION => Some(TargetValue::Message),
            PAYLOAD_EXPRESSION => Some(TargetValue::Payload),
            ATTRIBUTES_EXPRESSION => Some(TargetValue::Attributes),
            _ => None,
        }
    }
}

/// Stores the result in a variable and leaves the message untouched.
#[derive(Clone)]
pub struct TargetReturnDelegate {
    target: String,
    value: TargetValue,
    streaming: StreamingManager,
}

impl TargetReturnDelegate {
    /// Validate `target` and `target_value` for `component`.
    ///
    /// The target is a literal variable name; the target value must be one
    /// of the supported expressions.
    pub fn new(
        component: &str,
        target: &str,
        target_value: &str,
        streaming: StreamingManager,
    ) -> Result<Self, EngineError> {
        let invalid = |message: String| EngineError::Validation {
            component: component.to_string(),
            message,
        };
        if target.trim().is_empty() {
            return Err(invalid("target must not be empty".to_string()));
        }
        if is_expression(target) {
            return Err(invalid(format!(
                "target '{target}' is an expression; a literal variable name is required"
            )));
        }
        if !is_expression(target_value) {
            return Err(invalid(format!(
                "target value '{target_value}' must be an expression"
            )));
        }
        let value = TargetValue::parse(target_value).ok_or_else(|| {
            invalid(format!(
                "unsupported target value '{target_value}', expected one of \
                 {MESSAGE_EXPRESSION}, {PAYLOAD_EXPRESSION}, {ATTRIBUTES_EXPRESSION}"
            ))
        })?;
        Ok(Self {
            target: target.trim().to_string(),
            value,
            streaming,
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn target_value(&self) -> TargetValue {
        self.value
    }

    /// Store an already-built message in the target variable.
    pub fn store(&self, message: Message, event: &Event) -> Event {
        manage_streams(&self.streaming, &message, event);
        let value = match self.value {
            TargetValue::Message => TypedValue::Message(Box::new(message)),
            TargetValue::Payload => message.payload().clone(),
            TargetValue::Attributes => message.attributes().clone(),
        };
        event.clone().with_variable(self.target.clone(), value)
    }
}

impl ReturnDelegate for TargetReturnDelegate {
    fn to_event(&self, output: ComponentOutput, event: &Event) -> anyhow::Result<Event> {
        let message = match output {
            ComponentOutput::Void => Message::default(),
            other => output_message(other, event.message()),
        };
        Ok(self.store(message, event))
    }
}

impl fmt::Debug for TargetReturnDelegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetReturnDelegate")
            .field("target", &self.target)
            .field("value", &self.value)
            .finish()
    }
}

fn output_message(output: ComponentOutput, current: &Message) -> Message {
    match output {
        ComponentOutput::Void => current.clone(),
        ComponentOutput::Value(value) => current.clone().with_payload(value),
        ComponentOutput::Result(OutputResult {
            output,
            attributes: None,
        }) => Message::new(output, TypedValue::Null),
        ComponentOutput::Result(OutputResult {
            output,
            attributes: Some(attributes),
        }) => Message::new(output, attributes),
    }
}

fn manage_streams(streaming: &StreamingManager, message: &Message, event: &Event) {
    for value in [message.payload(), message.attributes()] {
        if let TypedValue::Stream(provider) = value {
            streaming.manage(provider.clone(), event.context());
        }
    }
}
