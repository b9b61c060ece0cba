pub mod batch;
pub mod broker;
pub mod channel;
pub mod connection;
pub mod consumer;
pub mod handler;
pub mod middleware;
pub mod processor;
pub mod registry;

#[cfg(test)]
pub(crate) mod testing;

pub use batch::{BatchDrainRunner, BatchSummary};
pub use broker::{AmqpChannel, BrokerChannel, BrokerError, InboundMessage, Topology};
pub use channel::{ChannelError, ChannelProvider};
pub use connection::{ConnectionError, RabbitMqConnection};
pub use consumer::{Consumer, ConsumerError, WorkerExit, wait_for_exit};
pub use handler::{EventHandler, HandlerContext, HandlerError};
pub use middleware::logged;
pub use processor::{
    DownstreamFailurePolicy, MessageProcessor, ProcessorPolicy, UnknownRoutingKeyPolicy,
};
pub use registry::HandlerRegistry;
