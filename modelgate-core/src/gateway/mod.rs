//! Event gateway: the synchronous pipeline, event-push processing with
//! batching, and outbound reply delivery.

pub mod batching;
pub mod cloudevents;
pub mod delivery;
pub mod derived;
pub mod processor;
pub mod service;

pub use batching::{Accumulated, AccumulationState, Accumulators};
pub use cloudevents::DeliveryContext;
pub use delivery::{Delivery, DeliveryClient, DeliveryConfig, OutboundEvent};
pub use processor::{EventProcessor, EventResult, ReplyIdentity};
pub use service::{GatewayService, ResponseTemplate, ServiceSettings, parse_message_list};
