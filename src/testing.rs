//! Test doubles shared by the module tests.

use std::{collections::VecDeque, sync::Mutex};

use async_trait::async_trait;

use crate::{
    error::{PanelError, PanelResult, ProviderFailure},
    types::TemplateRef,
    whatsapp::{MessagingApi, ProviderReceipt},
};

#[derive(Debug, Clone)]
pub enum Reply {
    Accept(String),
    Reject(ProviderFailure),
    Unconfigured,
}

impl Reply {
    pub fn window_expired() -> Self {
        Reply::Reject(ProviderFailure::from_response(
            400,
            r#"{"error":{"message":"(#131047) Re-engagement message","code":131047,"error_data":{"details":"Message failed to send because more than 24 hours have passed since the customer last replied to this number."}}}"#
                .to_string(),
        ))
    }

    pub fn rejected(code: i64, message: &str) -> Self {
        Reply::Reject(ProviderFailure::from_response(
            400,
            serde_json::json!({ "error": { "message": message, "code": code } }).to_string(),
        ))
    }

    fn into_result(self) -> PanelResult<ProviderReceipt> {
        match self {
            Reply::Accept(message_id) => Ok(ProviderReceipt { message_id }),
            Reply::Reject(failure) => Err(PanelError::Provider(failure)),
            Reply::Unconfigured => Err(PanelError::Unconfigured("test".to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Text { to: String, text: String },
    Template { to: String, template: TemplateRef },
}

/// Scripted `MessagingApi` that records every call.
#[derive(Default)]
pub struct FakeApi {
    text_replies: Mutex<VecDeque<Reply>>,
    template_replies: Mutex<VecDeque<Reply>>,
    calls: Mutex<Vec<Call>>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_text(self, reply: Reply) -> Self {
        self.text_replies.lock().unwrap().push_back(reply);
        self
    }

    pub fn on_template(self, reply: Reply) -> Self {
        self.template_replies.lock().unwrap().push_back(reply);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn template_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Template { .. }))
            .count()
    }
}

#[async_trait]
impl MessagingApi for FakeApi {
    async fn send_text(&self, to: &str, text: &str) -> PanelResult<ProviderReceipt> {
        self.calls.lock().unwrap().push(Call::Text {
            to: to.to_string(),
            text: text.to_string(),
        });
        let reply = self
            .text_replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Reply::Accept("wamid.default".to_string()));
        reply.into_result()
    }

    async fn send_template(&self, to: &str, template: &TemplateRef) -> PanelResult<ProviderReceipt> {
        self.calls.lock().unwrap().push(Call::Template {
            to: to.to_string(),
            template: template.clone(),
        });
        let reply = self
            .template_replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Reply::Accept("wamid.template".to_string()));
        reply.into_result()
    }
}
