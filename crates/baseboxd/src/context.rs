//! Wiring of the long-lived components.

use std::sync::Arc;

use basebox_ofdpa::DatapathChannel;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::config::BaseboxConfig;
use crate::daemon::BridgeAgent;
use crate::dispatch::{PacketDispatcher, PacketPool};
use crate::error::BaseboxError;
use crate::flow::FlowTableProgrammer;
use crate::lag::{LagAggregator, LagBackend};
use crate::netlink::{KernelWriter, LinkStateCache};
use crate::ports::{PortIdentityMap, TapManager};
use crate::session::{SwitchConnection, SwitchSession};

/// Shutdown token plus the first fatal error that caused it.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
    fatal: Mutex<Option<String>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Orderly shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Logs `err`; a fatal error additionally stops the daemon.
    pub fn report(&self, op: &str, err: BaseboxError) {
        err.log(op);
        if err.is_fatal() {
            let mut fatal = self.fatal.lock();
            if fatal.is_none() {
                error!(op, error = %err, "halting");
                *fatal = Some(format!("{}: {}", op, err));
            }
            self.token.cancel();
        }
    }

    pub fn is_halted(&self) -> bool {
        self.fatal.lock().is_some()
    }

    /// Reason of a fatal halt, `None` after an orderly shutdown.
    pub fn fatal(&self) -> Option<String> {
        self.fatal.lock().clone()
    }
}

/// Every component of one baseboxd instance, created once at startup.
pub struct BaseboxContext {
    pub config: Arc<BaseboxConfig>,
    pub links: Arc<LinkStateCache>,
    pub ports: Arc<PortIdentityMap>,
    pub lags: Arc<LagAggregator>,
    pub connection: Arc<SwitchConnection>,
    pub programmer: Arc<FlowTableProgrammer>,
    pub dispatcher: Arc<PacketDispatcher>,
    pub bridge: Arc<BridgeAgent>,
    pub taps: Arc<dyn TapManager>,
    pub kernel: Arc<dyn KernelWriter>,
    pub shutdown: Arc<ShutdownSignal>,
}

impl BaseboxContext {
    pub fn new(
        config: BaseboxConfig,
        taps: Arc<dyn TapManager>,
        kernel: Arc<dyn KernelWriter>,
        lag_backend: Arc<dyn LagBackend>,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let shutdown = Arc::new(ShutdownSignal::new());
        let links = Arc::new(LinkStateCache::new());
        let ports = Arc::new(PortIdentityMap::new());
        let connection = Arc::new(SwitchConnection::new());

        let lags = Arc::new(LagAggregator::new(
            Arc::clone(&ports),
            Arc::clone(&links),
            lag_backend,
        ));
        let programmer = Arc::new(FlowTableProgrammer::new(
            Arc::clone(&connection),
            Arc::clone(&ports),
        ));
        let dispatcher = Arc::new(PacketDispatcher::new(
            Arc::clone(&connection),
            Arc::clone(&ports),
            Arc::clone(&taps),
            Arc::clone(&programmer),
            PacketPool::new(config.dispatch.pool_size, config.dispatch.buffer_size),
            #[cfg(feature = "mac-learning")]
            Arc::clone(&kernel),
        ));
        taps.set_frame_handler(dispatcher.frame_handler());

        let bridge = Arc::new(BridgeAgent::new(
            Arc::clone(&config),
            Arc::clone(&links),
            Arc::clone(&ports),
            Arc::clone(&lags),
            Arc::clone(&connection),
            Arc::clone(&programmer),
            Arc::clone(&shutdown),
        ));
        let agent = Arc::downgrade(&bridge);
        links.subscribe(move |event| {
            if let Some(agent) = agent.upgrade() {
                agent.handle(event);
            }
        });

        Arc::new(Self {
            config,
            links,
            ports,
            lags,
            connection,
            programmer,
            dispatcher,
            bridge,
            taps,
            kernel,
            shutdown,
        })
    }

    /// Session state machine for a new datapath connection.
    pub fn session(self: &Arc<Self>, channel: Arc<dyn DatapathChannel>) -> SwitchSession {
        SwitchSession::new(Arc::clone(self), channel)
    }
}
