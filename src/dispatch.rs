use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    config::Config,
    error::{PanelError, PanelResult, ProviderFailure},
    phone::canonical_wa_id,
    store::ConversationStore,
    types::{
        now_iso, DeliveryStatus, Direction, Message, NewMessage, SendOutcome, TemplateOutcome,
        TemplateRef,
    },
    whatsapp::{MessagingApi, ProviderReceipt},
    window::{FailureKind, WindowClassifier},
};

/// Sends operator messages, falling back to the approved template once the
/// provider's 24-hour window has closed.
pub struct Dispatcher {
    store: Arc<dyn ConversationStore>,
    api: Arc<dyn MessagingApi>,
    classifier: WindowClassifier,
    template: TemplateRef,
    country_code: String,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        api: Arc<dyn MessagingApi>,
        classifier: WindowClassifier,
        template: TemplateRef,
        country_code: impl Into<String>,
    ) -> Self {
        Self {
            store,
            api,
            classifier,
            template,
            country_code: country_code.into(),
        }
    }

    pub fn from_config(
        config: &Config,
        store: Arc<dyn ConversationStore>,
        api: Arc<dyn MessagingApi>,
    ) -> Self {
        Self::new(
            store,
            api,
            WindowClassifier::from_config(config),
            config.fallback_template.clone(),
            config.country_code.clone(),
        )
    }

    pub fn default_template(&self) -> &TemplateRef {
        &self.template
    }

    /// Sends free-form text, retrying once with the default template when the
    /// provider reports the session window as expired.
    pub async fn send(&self, raw_id: &str, text: &str) -> PanelResult<SendOutcome> {
        let wa_id = canonical_wa_id(raw_id, &self.country_code)?;
        let text = text.trim();
        if text.is_empty() {
            return Err(PanelError::InvalidInput("text is required".to_string()));
        }

        match self.api.send_text(&wa_id, text).await {
            Ok(receipt) => {
                info!(%wa_id, provider_id = %receipt.message_id, "text message sent");
                let message = self.record(&wa_id, text.to_string(), &receipt, None).await?;
                Ok(SendOutcome {
                    used_template: false,
                    provider_message_id: receipt.message_id,
                    template: None,
                    message,
                })
            }
            Err(PanelError::Provider(failure))
                if self.classifier.classify_failure(&failure) == FailureKind::WindowExpired =>
            {
                info!(
                    %wa_id,
                    code = ?failure.code,
                    template = %self.template.name,
                    dropped_text = %text,
                    "session window expired, falling back to template"
                );
                let (receipt, message) = self.send_default_template(&wa_id).await?;
                Ok(SendOutcome {
                    used_template: true,
                    provider_message_id: receipt.message_id,
                    template: Some(self.template.clone()),
                    message,
                })
            }
            Err(err) => {
                warn!(%wa_id, error = %err, "text send failed");
                Err(err)
            }
        }
    }

    /// Sends the default template without trying text first.
    pub async fn send_template(&self, raw_id: &str) -> PanelResult<TemplateOutcome> {
        let wa_id = canonical_wa_id(raw_id, &self.country_code)?;
        let (receipt, message) = self.send_default_template(&wa_id).await?;
        Ok(TemplateOutcome {
            provider_message_id: receipt.message_id,
            template: self.template.clone(),
            message,
        })
    }

    async fn send_default_template(&self, wa_id: &str) -> PanelResult<(ProviderReceipt, Message)> {
        let receipt = match self.api.send_template(wa_id, &self.template).await {
            Ok(receipt) => receipt,
            Err(err) => {
                warn!(%wa_id, template = %self.template.name, error = %err, "template send failed");
                return Err(err);
            }
        };
        info!(%wa_id, provider_id = %receipt.message_id, template = %self.template.name, "template sent");
        let message = self
            .record(
                wa_id,
                format!("Template: {}", self.template.name),
                &receipt,
                Some(self.template.name.clone()),
            )
            .await?;
        Ok((receipt, message))
    }

    async fn record(
        &self,
        wa_id: &str,
        text: String,
        receipt: &ProviderReceipt,
        template_name: Option<String>,
    ) -> PanelResult<Message> {
        let at = now_iso();
        self.store.upsert_conversation(wa_id, None, &at).await?;
        let inserted = self
            .store
            .insert_message(NewMessage {
                wa_id: wa_id.to_string(),
                direction: Direction::Out,
                text,
                at: at.clone(),
                status: DeliveryStatus::Sent,
                provider_message_id: Some(receipt.message_id.clone()),
                template_name,
            })
            .await?;
        let Some(message) = inserted else {
            return Err(PanelError::Provider(ProviderFailure {
                status_code: 200,
                code: None,
                subcode: None,
                message: format!("provider reused message id {}", receipt.message_id),
                details: None,
                raw_body: String::new(),
            }));
        };
        self.store.touch_conversation(wa_id, &at).await?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        store::MemoryStore,
        testing::{Call, FakeApi, Reply},
    };

    fn dispatcher(api: Arc<FakeApi>) -> (Dispatcher, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Dispatcher::from_config(&Config::default(), store.clone(), api);
        (dispatcher, store)
    }

    #[tokio::test]
    async fn successful_text_never_tries_template() {
        let api = Arc::new(FakeApi::new().on_text(Reply::Accept("wamid.T".into())));
        let (dispatcher, store) = dispatcher(api.clone());

        let outcome = dispatcher.send("5511999990000", "  Hello ").await.unwrap();
        assert!(!outcome.used_template);
        assert_eq!(outcome.provider_message_id, "wamid.T");
        assert!(outcome.template.is_none());
        assert_eq!(
            api.calls(),
            vec![Call::Text {
                to: "5511999990000".into(),
                text: "Hello".into()
            }]
        );

        let history = store.list_messages("5511999990000").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].direction, Direction::Out);
        assert_eq!(history[0].text, "Hello");
        assert_eq!(history[0].template_name, None);
        assert_eq!(history[0].status, DeliveryStatus::Sent);
        let conversation = store.get_conversation("5511999990000").await.unwrap().unwrap();
        assert_eq!(conversation.last_message_at.as_deref(), Some(history[0].at.as_str()));
    }

    #[tokio::test]
    async fn window_expiry_falls_back_to_template_once() {
        let api = Arc::new(
            FakeApi::new()
                .on_text(Reply::window_expired())
                .on_template(Reply::Accept("wamid.TPL".into())),
        );
        let (dispatcher, store) = dispatcher(api.clone());

        let outcome = dispatcher.send("5511999990000", "Hello").await.unwrap();
        assert!(outcome.used_template);
        assert_eq!(outcome.provider_message_id, "wamid.TPL");
        assert_eq!(
            outcome.template,
            Some(TemplateRef {
                name: "hello_world".into(),
                language: "en_US".into()
            })
        );
        assert_eq!(api.template_calls(), 1);

        let history = store.list_messages("5511999990000").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].template_name.as_deref(), Some("hello_world"));
        assert_eq!(history[0].provider_message_id.as_deref(), Some("wamid.TPL"));
    }

    #[tokio::test]
    async fn other_failures_surface_without_fallback() {
        let api = Arc::new(FakeApi::new().on_text(Reply::rejected(131026, "Message undeliverable")));
        let (dispatcher, store) = dispatcher(api.clone());

        let err = dispatcher.send("5511999990000", "Hello").await.unwrap_err();
        match err {
            PanelError::Provider(failure) => assert_eq!(failure.code, Some(131026)),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(api.template_calls(), 0);
        assert!(store.list_messages("5511999990000").await.unwrap().is_empty());
        assert!(store.get_conversation("5511999990000").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failing_template_surfaces_its_own_detail() {
        let api = Arc::new(
            FakeApi::new()
                .on_text(Reply::window_expired())
                .on_template(Reply::rejected(132001, "Template name does not exist")),
        );
        let (dispatcher, store) = dispatcher(api.clone());

        let err = dispatcher.send("5511999990000", "Hello").await.unwrap_err();
        match err {
            PanelError::Provider(failure) => {
                assert_eq!(failure.code, Some(132001));
                assert_eq!(failure.message, "Template name does not exist");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(api.template_calls(), 1);
        assert!(store.list_messages("5511999990000").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_invalid_input_before_calling_provider() {
        let api = Arc::new(FakeApi::new());
        let (dispatcher, _store) = dispatcher(api.clone());

        assert!(matches!(
            dispatcher.send("not a number", "Hello").await,
            Err(PanelError::InvalidInput(_))
        ));
        assert!(matches!(
            dispatcher.send("5511999990000", "   ").await,
            Err(PanelError::InvalidInput(_))
        ));
        assert!(matches!(
            dispatcher.send_template("@c.us").await,
            Err(PanelError::InvalidInput(_))
        ));
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn unconfigured_is_not_retried() {
        let api = Arc::new(FakeApi::new().on_text(Reply::Unconfigured));
        let (dispatcher, _store) = dispatcher(api.clone());

        assert!(matches!(
            dispatcher.send("5511999990000", "Hello").await,
            Err(PanelError::Unconfigured(_))
        ));
        assert_eq!(api.calls().len(), 1);
    }

    #[tokio::test]
    async fn forced_template_skips_text() {
        let api = Arc::new(FakeApi::new().on_template(Reply::Accept("wamid.F".into())));
        let (dispatcher, store) = dispatcher(api.clone());

        let outcome = dispatcher.send_template("11 99999-0000").await.unwrap();
        assert_eq!(outcome.provider_message_id, "wamid.F");
        assert_eq!(outcome.template.name, "hello_world");
        assert_eq!(api.calls().len(), 1);
        assert_eq!(api.template_calls(), 1);

        let history = store.list_messages("5511999990000").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].text, "Template: hello_world");
    }

    #[tokio::test]
    async fn normalizes_formatted_ids() {
        let api = Arc::new(FakeApi::new().on_text(Reply::Accept("wamid.N".into())));
        let (dispatcher, store) = dispatcher(api.clone());

        dispatcher.send("5511999990000@c.us", "Oi").await.unwrap();
        assert_eq!(store.list_messages("5511999990000").await.unwrap().len(), 1);
    }
}
