//! OpenFlow listener. The datapath connects in; one connection is served at
//! a time since baseboxd drives a single logical switch.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use basebox_ofdpa::{CodecResult, DatapathChannel, OfCodec, OfFrame, OfMessage, QueuedChannel};
use futures::{SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::context::BaseboxContext;
use crate::error::Result;
use crate::session::SwitchSession;

/// Echo requests that may go unanswered before the connection is dropped.
const ECHO_MISSES: u32 = 3;

/// Accepts datapath connections until `shutdown` fires.
pub async fn serve(
    ctx: Arc<BaseboxContext>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "waiting for datapath");
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };
        stream.set_nodelay(true)?;

        match run_connection(Arc::clone(&ctx), stream, peer, shutdown.clone()).await {
            Ok(()) => info!(%peer, "datapath connection closed"),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => e.log("datapath connection"),
        }
    }
}

async fn tick(interval: &mut Option<Interval>) -> Instant {
    match interval {
        Some(interval) => interval.tick().await,
        None => std::future::pending().await,
    }
}

/// Runs one session over `io` until the peer disconnects, a fatal error
/// occurs or `shutdown` fires. The session is detached on every exit.
#[instrument(skip(ctx, io, shutdown))]
pub async fn run_connection<T>(
    ctx: Arc<BaseboxContext>,
    io: T,
    peer: SocketAddr,
    shutdown: CancellationToken,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    info!("datapath connected");
    let (mut sink, mut stream) = Framed::new(io, OfCodec::new()).split();

    let (channel, mut outbound) = QueuedChannel::bounded(ctx.config.controller.queue_depth);
    let channel = Arc::new(channel);
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            sink.send(frame).await?;
        }
        Ok::<_, basebox_ofdpa::CodecError>(())
    });

    let mut session = ctx.session(channel.clone() as Arc<dyn DatapathChannel>);
    let result = drive(
        &mut session,
        channel.as_ref(),
        &mut stream,
        ctx.config.echo_interval(),
        &shutdown,
    )
    .await;

    session.detach();
    drop(session);
    writer.abort();
    result
}

async fn drive<S>(
    session: &mut SwitchSession,
    channel: &dyn DatapathChannel,
    stream: &mut S,
    echo_interval: Option<Duration>,
    shutdown: &CancellationToken,
) -> Result<()>
where
    S: Stream<Item = CodecResult<OfFrame>> + Unpin,
{
    let mut echo = echo_interval.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });
    let echo_timeout = echo_interval.map(|period| period * ECHO_MISSES);
    let mut last_seen = Instant::now();

    session.start()?;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tick(&mut echo) => {
                if echo_timeout.is_some_and(|timeout| last_seen.elapsed() > timeout) {
                    warn!(silent_for = ?last_seen.elapsed(), "datapath stopped answering");
                    return Ok(());
                }
                if let Err(e) = channel.send(OfMessage::EchoRequest(Vec::new())) {
                    debug!(error = %e, "echo request not queued");
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(frame)) => {
                    last_seen = Instant::now();
                    session.handle(frame)?;
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(()),
            },
        }
    }
}
