//! Ordered interceptor chain in front of the session.
//!
//! Interceptors are composed once at startup. Each one sees the packet,
//! may rewrite or reject it, and decides whether to call the rest of the
//! chain through [`Next::run`].

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tracing::trace;

use crate::core::error::Result;
use crate::core::session::ServerSession;
use crate::wire::Packet;

pub trait Interceptor: Send + Sync + fmt::Debug {
    fn intercept(&self, packet: Packet, session: &ServerSession, next: Next<'_>) -> Result<Option<Packet>>;
}

/// The remainder of the chain after the current interceptor.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Interceptor>],
}

impl<'a> Next<'a> {
    pub fn run(self, packet: Packet, session: &ServerSession) -> Result<Option<Packet>> {
        match self.rest.split_first() {
            Some((head, rest)) => head.intercept(packet, session, Next { rest }),
            None => session.handle_packet(packet),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct Pipeline {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn dispatch(&self, packet: Packet, session: &ServerSession) -> Result<Option<Packet>> {
        Next {
            rest: &self.interceptors,
        }
        .run(packet, session)
    }
}

/// Traces every packet with how long the rest of the chain took.
#[derive(Debug, Default)]
pub struct LoggingInterceptor;

impl Interceptor for LoggingInterceptor {
    fn intercept(&self, packet: Packet, session: &ServerSession, next: Next<'_>) -> Result<Option<Packet>> {
        let packet_type = packet.type_byte();
        let started = Instant::now();
        let outcome = next.run(packet, session);
        trace!(
            parent: session.span(),
            packet_type,
            ok = outcome.is_ok(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "packet handled"
        );
        outcome
    }
}
