//! Wiring from configuration to a running gateway.
//!
//! [`Gateway::build`] assembles the component, dispatcher, pipeline, event
//! processor and delivery client, and registers every metric family. The
//! component is loaded separately by [`Gateway::load_component`] so
//! listeners can come up (and report not-ready) first.

use std::sync::Arc;

use modelgate_core::components::{StateStore, build_component};
use modelgate_core::config::GatewayConfig;
use modelgate_core::dispatch::Dispatcher;
use modelgate_core::error::GatewayError;
use modelgate_core::gateway::{
    Delivery, DeliveryClient, EventProcessor, GatewayService, ReplyIdentity, ServiceSettings,
};
use modelgate_core::lifecycle::LifecycleManager;
use modelgate_core::telemetry::{CustomMetrics, GatewayMetrics};
use prometheus_client::registry::Registry;
use tracing::info;

use crate::error::StartupError;

/// Everything the surfaces share.
#[derive(Clone)]
pub struct Gateway {
    pub config: Arc<GatewayConfig>,
    pub lifecycle: Arc<LifecycleManager>,
    pub registry: Arc<Registry>,
    pub metrics: Arc<GatewayMetrics>,
    pub service: Arc<GatewayService>,
    pub events: Arc<EventProcessor>,
    pub delivery: Arc<dyn Delivery>,
}

impl Gateway {
    /// # Errors
    ///
    /// Fails when the component cannot be built from `config` or the
    /// delivery client rejects the reply URL.
    pub fn build(
        config: GatewayConfig,
        lifecycle: Arc<LifecycleManager>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self, StartupError> {
        let mut registry = Registry::default();
        let metrics = Arc::new(GatewayMetrics::new(&mut registry));
        let custom = CustomMetrics::new(config.metric_labels(), config.metrics.max_custom_keys);
        registry.register_collector(Box::new(custom.clone()));
        lifecycle.set_metrics(metrics.clone());

        let component = build_component(&config.component, &config.unit, store)?;
        let dispatcher = Arc::new(Dispatcher::register(component));

        let service = Arc::new(
            GatewayService::new(dispatcher, ServiceSettings::from_config(&config), custom)
                .with_metrics(metrics.clone()),
        );
        let events = Arc::new(
            EventProcessor::new(
                service.clone(),
                config.event_method(),
                config.events.drift_batch_size,
                ReplyIdentity {
                    source: config.events.source.clone(),
                    event_type: config.events.event_type.clone(),
                },
            )
            .with_metrics(metrics.clone()),
        );
        let delivery = DeliveryClient::new(config.delivery.to_delivery_config())?
            .with_metrics(metrics.clone());

        Ok(Self {
            config: Arc::new(config),
            lifecycle,
            registry: Arc::new(registry),
            metrics,
            service,
            events,
            delivery: Arc::new(delivery),
        })
    }

    /// Replaces the outbound delivery seam.
    pub fn with_delivery(mut self, delivery: Arc<dyn Delivery>) -> Self {
        self.delivery = delivery;
        self
    }

    /// Runs the component loader off the async runtime and flips the
    /// readiness check.
    pub async fn load_component(&self) -> Result<(), GatewayError> {
        let service = self.service.clone();
        tokio::task::spawn_blocking(move || service.dispatcher().load())
            .await
            .map_err(|e| GatewayError::InternalError {
                details: format!("component load task failed: {e}"),
            })??;
        self.lifecycle.mark_component_loaded();
        info!(component = self.service.dispatcher().name(), "Component ready");
        Ok(())
    }

    /// Reply target recorded on inbound events.
    pub fn reply_url(&self) -> Option<String> {
        self.config.delivery.reply_url.clone()
    }
}
