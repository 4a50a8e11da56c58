//! Daemon lifecycle: kernel mirroring, the OpenFlow listener and shutdown.

pub mod bridge;

pub use bridge::{BridgeAgent, PortVlans};

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::context::BaseboxContext;
use crate::error::{BaseboxError, Result};
use crate::netlink::KernelSource;
use crate::session::serve;

/// Runs `ctx` against `source` and `listener` until ctrl-c or a fatal error.
/// Kernel mirroring stopping on its own also stops the daemon, with its
/// error.
pub async fn run_until_shutdown<S>(
    ctx: Arc<BaseboxContext>,
    mut source: S,
    listener: TcpListener,
) -> Result<()>
where
    S: KernelSource + 'static,
{
    let token = ctx.shutdown.token();

    let links = Arc::clone(&ctx.links);
    let resync_interval = ctx.config.resync_interval();
    let kernel_token = token.clone();
    let mut kernel_task = tokio::spawn(async move {
        links.run(&mut source, resync_interval, kernel_token).await
    });

    let server_task = tokio::spawn(serve(Arc::clone(&ctx), listener, token.clone()));

    let mut kernel_exit = None;
    tokio::select! {
        _ = token.cancelled() => {}
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("interrupted"),
                Err(e) => warn!(error = %e, "signal handler failed"),
            }
        }
        joined = &mut kernel_task => {
            error!("kernel mirroring stopped");
            kernel_exit = Some(joined);
        }
    }
    ctx.shutdown.shutdown();

    let kernel = match kernel_exit {
        Some(joined) => joined,
        None => kernel_task.await,
    };
    let mut failure = None;
    match kernel {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_fatal() => ctx.shutdown.report("kernel", e),
        Ok(Err(e)) => {
            e.log("kernel");
            failure = Some(e);
        }
        Err(e) => warn!(task = "kernel", error = %e, "task aborted"),
    }
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => ctx.shutdown.report("server", e),
        Err(e) => warn!(task = "server", error = %e, "task aborted"),
    }

    if let Some(reason) = ctx.shutdown.fatal() {
        return Err(BaseboxError::InvariantViolation(reason));
    }
    match failure {
        Some(e) => Err(e),
        None => {
            info!("baseboxd stopped");
            Ok(())
        }
    }
}

/// Wires the netlink and tap backends and runs until shutdown.
#[cfg(target_os = "linux")]
pub async fn run(config: crate::config::BaseboxConfig) -> Result<()> {
    use crate::lag::OfdpaLagBackend;
    use crate::netlink::{NetlinkSource, NetlinkWriter};
    use crate::ports::LinuxTapManager;

    let listener = TcpListener::bind(config.controller.listen_addr).await?;
    let source = NetlinkSource::new()?;
    let taps = Arc::new(LinuxTapManager::new(config.dispatch.buffer_size));
    let ctx = BaseboxContext::new(
        config,
        taps,
        Arc::new(NetlinkWriter::new()?),
        Arc::new(OfdpaLagBackend::new()),
    );
    run_until_shutdown(ctx, source, listener).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BaseboxConfig;
    use crate::netlink::{KernelEvent, KernelSnapshot, LinkState};
    use crate::testing::{scripted_kernel, TestBed};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    async fn listener() -> TcpListener {
        TcpListener::bind("127.0.0.1:0").await.unwrap()
    }

    #[tokio::test]
    async fn test_orderly_shutdown() {
        let bed = TestBed::new(BaseboxConfig::default());
        let mut snapshot = KernelSnapshot::new();
        snapshot.insert(3, LinkState::new(3, "port1"));
        let (script, source) = scripted_kernel(snapshot);

        let ctx = Arc::clone(&bed.ctx);
        let daemon = tokio::spawn(run_until_shutdown(ctx, source, listener().await));

        script.push(vec![KernelEvent::NewLink(LinkState::new(4, "port2"))]);
        tokio::time::timeout(Duration::from_secs(5), async {
            while bed.ctx.links.len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        bed.ctx.shutdown.shutdown();
        daemon.await.unwrap().unwrap();
        assert_eq!(script.dumps(), 1);
        assert_eq!(bed.ctx.links.get_link(4).unwrap().devname, "port2");
    }

    #[tokio::test]
    async fn test_lost_kernel_source_stops_the_daemon() {
        let bed = TestBed::new(BaseboxConfig::default());
        let (script, source) = scripted_kernel(KernelSnapshot::new());

        let daemon = tokio::spawn(run_until_shutdown(
            Arc::clone(&bed.ctx),
            source,
            listener().await,
        ));
        tokio::time::timeout(Duration::from_secs(5), async {
            while script.dumps() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        // the receive fails and so does the recovery dump
        script.fail_dumps(Some("socket closed"));
        script.push_error(BaseboxError::Netlink("recv: No buffer space available".to_string()));

        let err = tokio::time::timeout(Duration::from_secs(5), daemon)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, BaseboxError::Netlink(ref reason) if reason == "socket closed"));
        assert!(bed.ctx.shutdown.token().is_cancelled());
        assert!(!bed.ctx.shutdown.is_halted());
    }

    #[tokio::test]
    async fn test_fatal_error_fails_the_daemon() {
        let bed = TestBed::new(BaseboxConfig::default());
        let (_script, source) = scripted_kernel(KernelSnapshot::new());

        let daemon = tokio::spawn(run_until_shutdown(
            Arc::clone(&bed.ctx),
            source,
            listener().await,
        ));
        bed.ctx.shutdown.report(
            "lag",
            BaseboxError::InvariantViolation("bond 9 has no lag".to_string()),
        );

        let err = daemon.await.unwrap().unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("bond 9 has no lag"));
    }
}
