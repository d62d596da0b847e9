//! Server engine for the RelayMQ broker.
//!
//! Every connection carries length-prefixed packet frames. The first
//! frame must be `CreateSession`; everything after it is dispatched
//! through the broker's interceptor pipeline to that session. Deliveries
//! and producer credits reach the socket through the session's outbound
//! channel, merged with responses by a single writer task.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio::task;
use tracing::{debug, error, info, warn, Instrument};

use crate::broker::Broker;
use crate::config::Config;
use crate::core::executor::TokioExecutor;
use crate::core::outbound::{self, Outbound, OutboundReceiver};
use crate::core::session::{ServerSession, SessionOptions};
use crate::wire::Packet;

/// Initial capacity of the per-connection read buffer.
const INBUF_INIT: usize = 64 * 1024;
const OUTBUF_INIT: usize = 16 * 1024;

/// Starts a broker from `config` and serves it until the listener fails.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind_addr.clone();
    let broker = Broker::start(config, Arc::new(TokioExecutor::current()))
        .context("failed to start broker")?;

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!(parent: broker.span(), %bind_addr, "listening");

    let outcome = serve_with(broker.clone(), listener).await;
    if let Err(e) = broker.stop() {
        error!(parent: broker.span(), error = %e, "broker stop failed");
    }
    outcome
}

/// Accepts connections for an already started broker. Also runs the
/// periodic expiry scan.
pub async fn serve_with(broker: Arc<Broker>, listener: TcpListener) -> anyhow::Result<()> {
    let period = broker.config().delivery.expiry_scan_period_ms;
    if period > 0 {
        let scanner = broker.clone();
        task::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(period));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if scanner.is_stopped() {
                    break;
                }
                let broker = scanner.clone();
                if let Err(e) = task::spawn_blocking(move || broker.expire_messages()).await {
                    error!(parent: scanner.span(), error = %e, "expiry scan panicked");
                }
            }
        });
    }

    let limit = Arc::new(Semaphore::new(broker.config().server.max_connections));
    loop {
        let permit = limit.clone().acquire_owned().await?;
        let (socket, peer_addr) = listener.accept().await?;
        socket.set_nodelay(true)?;
        debug!(parent: broker.span(), %peer_addr, "client connected");

        let broker = broker.clone();
        let span = tracing::info_span!(parent: broker.span(), "connection", peer = %peer_addr);
        task::spawn(
            async move {
                if let Err(e) = handle_connection(socket, broker).await {
                    warn!(error = %e, "connection ended with error");
                }
                drop(permit);
            }
            .instrument(span),
        );
    }
}

/// Runs one client connection to completion.
pub async fn handle_connection(stream: TcpStream, broker: Arc<Broker>) -> anyhow::Result<()> {
    let (reader_half, writer_half) = stream.into_split();
    let mut reader = BufReader::new(reader_half);
    let mut inbuf = BytesMut::with_capacity(INBUF_INIT);

    let (responses, response_rx) = mpsc::unbounded_channel::<Packet>();
    let (outbound_tx, outbound_rx) = outbound::channel();
    let writer = task::spawn(
        write_loop(BufWriter::new(writer_half), response_rx, outbound_rx).in_current_span(),
    );

    let mut outbound_tx = Some(outbound_tx);
    let mut session: Option<Arc<ServerSession>> = None;

    let outcome: anyhow::Result<()> = async {
        'io: loop {
            let n = reader.read_buf(&mut inbuf).await?;
            if n == 0 {
                break 'io;
            }

            while let Some(packet) = Packet::decode_frame(&mut inbuf)? {
                let closing = matches!(packet, Packet::Close);
                let response = match packet {
                    Packet::CreateSession { kind, transacted } => {
                        match (session.is_some(), outbound_tx.take()) {
                            (false, Some(tx)) => {
                                let options = SessionOptions {
                                    kind,
                                    transacted,
                                    ..broker.session_options()
                                };
                                let created = broker.create_session(options, tx);
                                info!(session = %created.id(), "session opened");
                                session = Some(created);
                                Packet::ok()
                            }
                            _ => Packet::error("connection already has a session"),
                        }
                    }
                    packet => match &session {
                        None => Packet::error(format!(
                            "packet type {} sent before CreateSession",
                            packet.type_byte()
                        )),
                        Some(current) => {
                            let current = current.clone();
                            let broker = broker.clone();
                            let outcome = task::spawn_blocking(move || {
                                broker.pipeline().dispatch(packet, &current)
                            })
                            .await?;
                            match outcome {
                                Ok(Some(response)) => response,
                                Ok(None) => continue,
                                Err(e) => Packet::error(e.to_string()),
                            }
                        }
                    },
                };
                if responses.send(response).is_err() {
                    break 'io;
                }
                if closing && session.is_some() {
                    break 'io;
                }
            }
        }
        Ok(())
    }
    .await;

    if let Some(session) = session.take() {
        let closing = session.clone();
        match task::spawn_blocking(move || closing.close()).await {
            Ok(Err(e)) => warn!(session = %session.id(), error = %e, "session close failed"),
            Err(e) => error!(session = %session.id(), error = %e, "session close panicked"),
            Ok(Ok(())) => {}
        }
    }
    drop(responses);
    drop(outbound_tx);
    match writer.await {
        Ok(Err(e)) => debug!(error = %e, "writer stopped"),
        Err(e) => error!(error = %e, "writer panicked"),
        Ok(Ok(())) => {}
    }
    debug!("client disconnected");
    outcome
}

/// Turns responses and outbound events into frames. Stops once the
/// connection has no more responses to send.
async fn write_loop<W>(
    mut writer: BufWriter<W>,
    mut responses: mpsc::UnboundedReceiver<Packet>,
    mut outbound: OutboundReceiver,
) -> anyhow::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut frame_buf = BytesMut::with_capacity(OUTBUF_INIT);
    let mut outbound_open = true;
    loop {
        let packet = tokio::select! {
            response = responses.recv() => match response {
                Some(packet) => packet,
                None => break,
            },
            event = outbound.recv(), if outbound_open => match event {
                Some(event) => outbound_packet(event),
                None => {
                    outbound_open = false;
                    continue;
                }
            },
        };

        frame_buf.clear();
        packet.encode_frame(&mut frame_buf)?;
        writer.write_all(&frame_buf).await?;
        if responses.is_empty() && outbound.is_empty() {
            writer.flush().await?;
        }
    }
    writer.flush().await?;
    Ok(())
}

fn outbound_packet(event: Outbound) -> Packet {
    match event {
        Outbound::Deliver {
            consumer_id,
            reference,
        } => Packet::Deliver {
            consumer_id,
            delivery_count: reference.delivery_count(),
            message: reference.message().clone(),
        },
        Outbound::ProducerCredits {
            producer_id,
            credits,
        } => Packet::ProducerCredits {
            producer_id,
            credits,
        },
    }
}
