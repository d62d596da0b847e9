pub mod address;
pub mod consumer;
pub mod distributor;
pub mod error;
pub mod executor;
pub mod filter;
pub mod flow;
pub mod id_generator;
pub mod message;
pub mod outbound;
pub mod pipeline;
pub mod postoffice;
pub mod queue;
pub mod reference;
pub mod session;
pub mod settings;
pub mod transaction;
