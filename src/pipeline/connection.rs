//! Per-connection driver: read, decode, dispatch, write back.

use super::sink::{CloseReason, MessageSink};
use super::stages::{Stages, Step};
use crate::config::Protocol;
use crate::metrics::{Direction, MetricsCollector};
use crate::util::{ConnectionId, DrainSignal};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, instrument, warn};

/// Everything a connection needs besides its socket and pipeline.
#[derive(Clone)]
pub struct ConnectionContext {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub protocol: Protocol,
    pub signal: DrainSignal,
    pub metrics: MetricsCollector,
}

/// A codec, its stages, and the sink they dispatch to.
pub struct Chain<S: Stages> {
    pub(crate) codec: S::Codec,
    pub(crate) stages: S,
    pub(crate) sink: Arc<dyn MessageSink<S::Message>>,
}

impl<S: Stages> Chain<S> {
    pub fn new(codec: S::Codec, stages: S, sink: Arc<dyn MessageSink<S::Message>>) -> Self {
        Self {
            codec,
            stages,
            sink,
        }
    }
}

/// Run one connection to completion.
#[instrument(
    name = "connection",
    skip_all,
    fields(protocol = %ctx.protocol, connection = %ctx.id, peer = %ctx.peer)
)]
pub(crate) async fn drive<S, IO>(chain: Chain<S>, io: IO, ctx: ConnectionContext) -> CloseReason
where
    S: Stages,
    IO: AsyncRead + AsyncWrite + Unpin + Send,
{
    let Chain {
        codec,
        mut stages,
        sink,
    } = chain;
    let mut framed = Framed::new(io, codec);

    ctx.metrics.connection_opened(ctx.protocol);
    debug!("connection opened");

    let reason = tokio::select! {
        biased;
        _ = ctx.signal.forced() => CloseReason::ForceClosed,
        reason = serve(&mut framed, &mut stages, sink.as_ref(), &ctx) => reason,
    };

    if reason.is_error() {
        warn!(reason = %reason, kind = reason.kind(), "connection closed");
        ctx.metrics
            .connection_closed(ctx.protocol, Some(reason.kind()));
    } else {
        debug!(reason = %reason, "connection closed");
        ctx.metrics.connection_closed(ctx.protocol, None);
    }

    sink.on_connection_closed(ctx.id, &reason);
    reason
}

async fn serve<S, IO>(
    framed: &mut Framed<IO, S::Codec>,
    stages: &mut S,
    sink: &dyn MessageSink<S::Message>,
    ctx: &ConnectionContext,
) -> CloseReason
where
    S: Stages,
    IO: AsyncRead + AsyncWrite + Unpin + Send,
{
    loop {
        // A drain stops further reads; whatever was dispatched last has
        // already completed.
        let next = tokio::select! {
            biased;
            _ = ctx.signal.draining() => return CloseReason::Drained,
            next = framed.next() => next,
        };

        let frame = match next {
            None => return CloseReason::PeerClosed,
            Some(Ok(frame)) => frame,
            Some(Err(error)) => {
                if let Some(frame) = S::rejection(framed.codec(), &error) {
                    if let Err(e) = framed.send(frame).await {
                        debug!(error = %e, "failed to send rejection");
                    }
                }
                return CloseReason::from_frame_error(error);
            }
        };

        match stages.interpret(frame) {
            Step::Deliver(message) => {
                ctx.metrics.record_message(ctx.protocol, Direction::Inbound);
                match sink.on_message(ctx.id, message) {
                    Ok(Some(reply)) => {
                        if let Err(e) = framed.send(stages.outbound(reply)).await {
                            return CloseReason::from_frame_error(e);
                        }
                        ctx.metrics.record_message(ctx.protocol, Direction::Outbound);
                    }
                    Ok(None) => {}
                    Err(e) => return CloseReason::Sink(e),
                }
            }
            Step::Respond(frame) => {
                if let Err(e) = framed.send(frame).await {
                    return CloseReason::from_frame_error(e);
                }
            }
            Step::Ignore => {}
            Step::Finish(frame) => {
                if let Some(frame) = frame {
                    if let Err(e) = framed.send(frame).await {
                        debug!(error = %e, "failed to send final frame");
                    }
                }
                return CloseReason::ProtocolClose;
            }
        }
    }
}
